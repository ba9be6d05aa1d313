/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! Abstract signing/verification seam plus concrete Ed25519, ECDSA and RSA keys.
//!
//! ring covers every modern scheme. The `rsa` and `p256` crates fill in what ring leaves
//! out for SSL 3.0 through TLS 1.1: RSA key transport, the MD5 || SHA-1 RSA signature
//! and SHA-1 ECDSA.
//!
//! **Boundary:**
//! Certificate parsing and trust policy stay outside the engine. A `CertificateVerifier`
//! turns a DER chain into a `PeerKey`; a `SigningKey` signs (and, for RSA key transport,
//! decrypts) on behalf of a local certificate.

use std::{fmt, sync::Arc};

use md5::{Digest, Md5};
use p256::ecdsa::{
    signature::hazmat::{PrehashSigner, PrehashVerifier},
    Signature as P256Signature, SigningKey as P256SigningKey, VerifyingKey as P256VerifyingKey,
};
use rand::rngs::OsRng;
use ring::{
    digest,
    rand::SystemRandom,
    signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair},
};
use rsa::{
    pkcs1::DecodeRsaPublicKey, pkcs8::DecodePrivateKey, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey,
    RsaPublicKey,
};

use crate::{
    tls::{groups::NamedGroup, suites::ProtocolVersion},
    utils::{TlsError, TlsResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureScheme {
    RsaPkcs1Sha1,
    EcdsaSha1,
    RsaPkcs1Sha256,
    EcdsaSecp256r1Sha256,
    RsaPkcs1Sha384,
    EcdsaSecp384r1Sha384,
    RsaPkcs1Sha512,
    RsaPssRsaeSha256,
    RsaPssRsaeSha384,
    Ed25519,
    Ed448,
    /// TLS 1.0/1.1 RSA signature over MD5 || SHA-1; never appears on the wire.
    RsaPkcs1Md5Sha1,
    Unknown(u16),
}

impl SignatureScheme {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0201 => Self::RsaPkcs1Sha1,
            0x0203 => Self::EcdsaSha1,
            0x0401 => Self::RsaPkcs1Sha256,
            0x0403 => Self::EcdsaSecp256r1Sha256,
            0x0501 => Self::RsaPkcs1Sha384,
            0x0503 => Self::EcdsaSecp384r1Sha384,
            0x0601 => Self::RsaPkcs1Sha512,
            0x0804 => Self::RsaPssRsaeSha256,
            0x0805 => Self::RsaPssRsaeSha384,
            0x0807 => Self::Ed25519,
            0x0808 => Self::Ed448,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::RsaPkcs1Sha1 => 0x0201,
            Self::EcdsaSha1 => 0x0203,
            Self::RsaPkcs1Sha256 => 0x0401,
            Self::EcdsaSecp256r1Sha256 => 0x0403,
            Self::RsaPkcs1Sha384 => 0x0501,
            Self::EcdsaSecp384r1Sha384 => 0x0503,
            Self::RsaPkcs1Sha512 => 0x0601,
            Self::RsaPssRsaeSha256 => 0x0804,
            Self::RsaPssRsaeSha384 => 0x0805,
            Self::Ed25519 => 0x0807,
            Self::Ed448 => 0x0808,
            Self::RsaPkcs1Md5Sha1 => 0x0000,
            Self::Unknown(v) => v,
        }
    }

    /// Key type able to produce this signature.
    pub fn key_kind(self) -> Option<KeyKind> {
        match self {
            Self::RsaPkcs1Sha1
            | Self::RsaPkcs1Sha256
            | Self::RsaPkcs1Sha384
            | Self::RsaPkcs1Sha512
            | Self::RsaPssRsaeSha256
            | Self::RsaPssRsaeSha384
            | Self::RsaPkcs1Md5Sha1 => Some(KeyKind::Rsa),
            Self::EcdsaSha1 | Self::EcdsaSecp256r1Sha256 | Self::EcdsaSecp384r1Sha384 => {
                Some(KeyKind::Ecdsa)
            }
            Self::Ed25519 => Some(KeyKind::Ed25519),
            Self::Ed448 => Some(KeyKind::Ed448),
            Self::Unknown(_) => None,
        }
    }

    /// TLS 1.3 forbids PKCS#1 v1.5 and SHA-1 in CertificateVerify.
    pub fn allowed_in_tls13(self) -> bool {
        matches!(
            self,
            Self::EcdsaSecp256r1Sha256
                | Self::EcdsaSecp384r1Sha384
                | Self::RsaPssRsaeSha256
                | Self::RsaPssRsaeSha384
                | Self::Ed25519
                | Self::Ed448
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Rsa,
    Ecdsa,
    Ed25519,
    Ed448,
}

/// Key type of a certificate, including the ECDSA curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Rsa,
    Ecdsa(NamedGroup),
    Ed25519,
    Ed448,
}

impl KeyType {
    pub fn kind(self) -> KeyKind {
        match self {
            KeyType::Rsa => KeyKind::Rsa,
            KeyType::Ecdsa(_) => KeyKind::Ecdsa,
            KeyType::Ed25519 => KeyKind::Ed25519,
            KeyType::Ed448 => KeyKind::Ed448,
        }
    }
}

/// Private half of a local certificate.
pub trait SigningKey: Send + Sync {
    fn key_type(&self) -> KeyType;

    /// Schemes this key can sign with, in preference order.
    fn schemes(&self) -> Vec<SignatureScheme>;

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> TlsResult<Vec<u8>>;

    /// RSA key transport; `None` when decryption fails or the key cannot decrypt.
    fn decrypt(&self, _ciphertext: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Public half of the peer's leaf certificate.
pub trait PeerKey: Send + Sync {
    fn key_type(&self) -> KeyType;

    fn verify(&self, scheme: SignatureScheme, message: &[u8], signature: &[u8]) -> TlsResult<()>;

    /// RSA key transport (PKCS#1 v1.5 encryption of the premaster secret).
    fn encrypt(&self, _plaintext: &[u8]) -> TlsResult<Vec<u8>> {
        Err(TlsError::alert(
            crate::tls::alert::AlertDescription::UnsupportedCertificate,
            "peer key cannot encrypt",
        ))
    }
}

/// Chain validation policy supplied by the embedding application.
pub trait CertificateVerifier: Send + Sync {
    fn verify_server_chain(
        &self,
        chain: &[Vec<u8>],
        server_name: Option<&str>,
    ) -> TlsResult<Arc<dyn PeerKey>>;

    fn verify_client_chain(&self, chain: &[Vec<u8>]) -> TlsResult<Arc<dyn PeerKey>> {
        self.verify_server_chain(chain, None)
    }
}

/// A certificate chain with its private key, as offered by a server or client.
#[derive(Clone)]
pub struct CertifiedKey {
    pub chain: Vec<Vec<u8>>,
    pub key: Arc<dyn SigningKey>,
    /// Algorithms the issuers used to sign each chain element (leaf first).
    pub chain_schemes: Vec<SignatureScheme>,
    /// Virtual-host names this pair answers for; empty for the primary pair.
    pub hostnames: Vec<String>,
}

impl fmt::Debug for CertifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertifiedKey")
            .field("chain_len", &self.chain.len())
            .field("key_type", &self.key.key_type())
            .field("hostnames", &self.hostnames)
            .finish()
    }
}

impl CertifiedKey {
    pub fn new(chain: Vec<Vec<u8>>, key: Arc<dyn SigningKey>) -> Self {
        Self {
            chain,
            key,
            chain_schemes: Vec::new(),
            hostnames: Vec::new(),
        }
    }

    pub fn with_chain_schemes(mut self, schemes: Vec<SignatureScheme>) -> Self {
        self.chain_schemes = schemes;
        self
    }

    pub fn for_hosts(mut self, hostnames: Vec<String>) -> Self {
        self.hostnames = hostnames
            .into_iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        self
    }

    /// Exact or single-label wildcard (`*.example.com`) match.
    pub fn matches_host(&self, server_name: &str) -> bool {
        let name = server_name.trim().to_ascii_lowercase();
        self.hostnames.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                name.split_once('.')
                    .map(|(_, rest)| rest == suffix)
                    .unwrap_or(false)
            } else {
                *pattern == name
            }
        })
    }
}

/// Picks the signature scheme for a handshake signature by `key`.
///
/// **Rules:**
/// - TLS 1.3: first key scheme the peer listed that TLS 1.3 permits.
/// - TLS 1.2: first key scheme the peer listed; without a list, the RFC 5246 SHA-1 default.
/// - Older: MD5/SHA-1 for RSA, SHA-1 for ECDSA.
pub fn select_scheme(
    version: ProtocolVersion,
    key: &dyn SigningKey,
    peer_schemes: &[SignatureScheme],
) -> Option<SignatureScheme> {
    let ours = key.schemes();
    if version.is_tls13() {
        return ours
            .into_iter()
            .find(|s| s.allowed_in_tls13() && peer_schemes.contains(s));
    }
    if version == ProtocolVersion::TLS12 {
        if peer_schemes.is_empty() {
            let fallback = match key.key_type().kind() {
                KeyKind::Rsa => SignatureScheme::RsaPkcs1Sha1,
                KeyKind::Ecdsa => SignatureScheme::EcdsaSha1,
                _ => return None,
            };
            return ours.contains(&fallback).then_some(fallback);
        }
        return ours.into_iter().find(|s| {
            *s != SignatureScheme::RsaPkcs1Md5Sha1 && peer_schemes.contains(s)
        });
    }
    let legacy = match key.key_type().kind() {
        KeyKind::Rsa => SignatureScheme::RsaPkcs1Md5Sha1,
        KeyKind::Ecdsa => SignatureScheme::EcdsaSha1,
        _ => return None,
    };
    ours.contains(&legacy).then_some(legacy)
}

/// Content signed by a TLS 1.3 CertificateVerify (RFC 8446 §4.4.3).
pub fn tls13_signed_content(server: bool, transcript_hash: &[u8]) -> Vec<u8> {
    let context: &[u8] = if server {
        b"TLS 1.3, server CertificateVerify"
    } else {
        b"TLS 1.3, client CertificateVerify"
    };
    let mut out = vec![0x20u8; 64];
    out.extend_from_slice(context);
    out.push(0);
    out.extend_from_slice(transcript_hash);
    out
}

/// Ed25519 signing key backed by ring.
pub struct Ed25519Key {
    pair: Ed25519KeyPair,
}

impl Ed25519Key {
    pub fn from_pkcs8(pkcs8: &[u8]) -> TlsResult<Self> {
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|err| TlsError::internal(format!("bad Ed25519 key: {err}")))?;
        Ok(Self { pair })
    }

    pub fn generate() -> TlsResult<Self> {
        let rng = SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| TlsError::internal("Ed25519 key generation failed"))?;
        Self::from_pkcs8(doc.as_ref())
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.pair.public_key().as_ref().to_vec()
    }
}

impl SigningKey for Ed25519Key {
    fn key_type(&self) -> KeyType {
        KeyType::Ed25519
    }

    fn schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::Ed25519]
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> TlsResult<Vec<u8>> {
        if scheme != SignatureScheme::Ed25519 {
            return Err(TlsError::internal(format!("Ed25519 key cannot sign {scheme:?}")));
        }
        Ok(self.pair.sign(message).as_ref().to_vec())
    }
}

/// ECDSA P-256 signing key: SHA-256 through ring, SHA-1 through `p256` for TLS 1.1 and older.
pub struct EcdsaP256Key {
    pair: EcdsaKeyPair,
    legacy: P256SigningKey,
    rng: SystemRandom,
}

impl EcdsaP256Key {
    pub fn from_pkcs8(pkcs8: &[u8]) -> TlsResult<Self> {
        let rng = SystemRandom::new();
        let pair = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
            .map_err(|err| TlsError::internal(format!("bad ECDSA key: {err}")))?;
        let legacy = P256SigningKey::from_pkcs8_der(pkcs8)
            .map_err(|err| TlsError::internal(format!("bad ECDSA key: {err}")))?;
        Ok(Self { pair, legacy, rng })
    }

    pub fn generate() -> TlsResult<Self> {
        let rng = SystemRandom::new();
        let doc = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|_| TlsError::internal("ECDSA key generation failed"))?;
        Self::from_pkcs8(doc.as_ref())
    }

    /// Uncompressed SEC1 point.
    pub fn public_key(&self) -> Vec<u8> {
        self.pair.public_key().as_ref().to_vec()
    }
}

impl SigningKey for EcdsaP256Key {
    fn key_type(&self) -> KeyType {
        KeyType::Ecdsa(NamedGroup::Secp256r1)
    }

    fn schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::EcdsaSecp256r1Sha256, SignatureScheme::EcdsaSha1]
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> TlsResult<Vec<u8>> {
        match scheme {
            SignatureScheme::EcdsaSecp256r1Sha256 => self
                .pair
                .sign(&self.rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| TlsError::internal("ECDSA signing failed")),
            SignatureScheme::EcdsaSha1 => {
                let prehash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, message);
                let sig: P256Signature = self
                    .legacy
                    .sign_prehash(prehash.as_ref())
                    .map_err(|_| TlsError::internal("ECDSA signing failed"))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            _ => Err(TlsError::internal(format!("P-256 key cannot sign {scheme:?}"))),
        }
    }
}

/// DER `DigestInfo` header for SHA-1 (RFC 8017 §9.2).
const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

/// MD5 || SHA-1 of `message`, the digest TLS 1.1 and older sign with RSA.
fn md5_sha1(message: &[u8]) -> Vec<u8> {
    let mut out = Md5::digest(message).to_vec();
    out.extend_from_slice(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, message).as_ref());
    out
}

/// Encoded digest for schemes ring cannot produce, signed with unprefixed PKCS#1 v1.5.
fn legacy_rsa_digest(scheme: SignatureScheme, message: &[u8]) -> Option<Vec<u8>> {
    match scheme {
        SignatureScheme::RsaPkcs1Md5Sha1 => Some(md5_sha1(message)),
        SignatureScheme::RsaPkcs1Sha1 => {
            let mut out = SHA1_DIGEST_INFO.to_vec();
            out.extend_from_slice(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, message).as_ref());
            Some(out)
        }
        _ => None,
    }
}

/// RSA key: ring signs the PSS and SHA-2 schemes, `rsa` handles SHA-1 signatures and key
/// transport decryption.
pub struct RsaKey {
    pair: RsaKeyPair,
    private: RsaPrivateKey,
    rng: SystemRandom,
}

impl RsaKey {
    pub fn from_pkcs8(pkcs8: &[u8]) -> TlsResult<Self> {
        let pair = RsaKeyPair::from_pkcs8(pkcs8)
            .map_err(|err| TlsError::internal(format!("bad RSA key: {err}")))?;
        let private = RsaPrivateKey::from_pkcs8_der(pkcs8)
            .map_err(|err| TlsError::internal(format!("bad RSA key: {err}")))?;
        Ok(Self {
            pair,
            private,
            rng: SystemRandom::new(),
        })
    }

    /// DER `RSAPublicKey`.
    pub fn public_key(&self) -> Vec<u8> {
        self.pair.public_key().as_ref().to_vec()
    }
}

impl SigningKey for RsaKey {
    fn key_type(&self) -> KeyType {
        KeyType::Rsa
    }

    fn schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RsaPssRsaeSha256,
            SignatureScheme::RsaPssRsaeSha384,
            SignatureScheme::RsaPkcs1Sha256,
            SignatureScheme::RsaPkcs1Sha384,
            SignatureScheme::RsaPkcs1Sha1,
            SignatureScheme::RsaPkcs1Md5Sha1,
        ]
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> TlsResult<Vec<u8>> {
        if let Some(hashed) = legacy_rsa_digest(scheme, message) {
            return self
                .private
                .sign_with_rng(&mut OsRng, Pkcs1v15Sign::new_unprefixed(), &hashed)
                .map_err(|err| TlsError::internal(format!("RSA signing failed: {err}")));
        }
        let encoding: &'static dyn signature::RsaEncoding = match scheme {
            SignatureScheme::RsaPssRsaeSha256 => &signature::RSA_PSS_SHA256,
            SignatureScheme::RsaPssRsaeSha384 => &signature::RSA_PSS_SHA384,
            SignatureScheme::RsaPkcs1Sha256 => &signature::RSA_PKCS1_SHA256,
            SignatureScheme::RsaPkcs1Sha384 => &signature::RSA_PKCS1_SHA384,
            _ => return Err(TlsError::internal(format!("RSA key cannot sign {scheme:?}"))),
        };
        let mut sig = vec![0u8; self.pair.public().modulus_len()];
        self.pair
            .sign(encoding, &self.rng, message, &mut sig)
            .map_err(|_| TlsError::internal("RSA signing failed"))?;
        Ok(sig)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        self.private
            .decrypt_blinded(&mut OsRng, Pkcs1v15Encrypt, ciphertext)
            .ok()
    }
}

/// Verifies with ring given a raw public key (SEC1 point, Ed25519 bytes or DER RSAPublicKey).
#[derive(Debug, Clone)]
pub struct RingPeerKey {
    key_type: KeyType,
    public: Vec<u8>,
}

impl RingPeerKey {
    pub fn new(key_type: KeyType, public: Vec<u8>) -> Self {
        Self { key_type, public }
    }
}

impl PeerKey for RingPeerKey {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn verify(&self, scheme: SignatureScheme, message: &[u8], sig: &[u8]) -> TlsResult<()> {
        let failed = || {
            TlsError::alert(
                crate::tls::alert::AlertDescription::DecryptError,
                "signature verification failed",
            )
        };
        match (self.key_type, scheme) {
            (KeyType::Rsa, SignatureScheme::RsaPkcs1Md5Sha1) => {
                let public = self.rsa_public()?;
                return public
                    .verify(Pkcs1v15Sign::new_unprefixed(), &md5_sha1(message), sig)
                    .map_err(|_| failed());
            }
            (KeyType::Ecdsa(NamedGroup::Secp256r1), SignatureScheme::EcdsaSha1) => {
                let public = P256VerifyingKey::from_sec1_bytes(&self.public).map_err(|_| {
                    TlsError::alert(crate::tls::alert::AlertDescription::BadCertificate, "bad P-256 public key")
                })?;
                let sig = P256Signature::from_der(sig).map_err(|_| TlsError::decode("malformed ECDSA signature"))?;
                let prehash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, message);
                return public.verify_prehash(prehash.as_ref(), &sig).map_err(|_| failed());
            }
            _ => {}
        }
        let alg: &dyn signature::VerificationAlgorithm = match (self.key_type, scheme) {
            (KeyType::Ed25519, SignatureScheme::Ed25519) => &signature::ED25519,
            (KeyType::Ecdsa(NamedGroup::Secp256r1), SignatureScheme::EcdsaSecp256r1Sha256) => {
                &signature::ECDSA_P256_SHA256_ASN1
            }
            (KeyType::Ecdsa(NamedGroup::Secp384r1), SignatureScheme::EcdsaSecp384r1Sha384) => {
                &signature::ECDSA_P384_SHA384_ASN1
            }
            (KeyType::Rsa, SignatureScheme::RsaPkcs1Sha256) => {
                &signature::RSA_PKCS1_2048_8192_SHA256
            }
            (KeyType::Rsa, SignatureScheme::RsaPkcs1Sha384) => {
                &signature::RSA_PKCS1_2048_8192_SHA384
            }
            (KeyType::Rsa, SignatureScheme::RsaPkcs1Sha1) => {
                &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY
            }
            (KeyType::Rsa, SignatureScheme::RsaPssRsaeSha256) => &signature::RSA_PSS_2048_8192_SHA256,
            (KeyType::Rsa, SignatureScheme::RsaPssRsaeSha384) => &signature::RSA_PSS_2048_8192_SHA384,
            _ => {
                return Err(TlsError::alert(
                    crate::tls::alert::AlertDescription::IllegalParameter,
                    format!("{scheme:?} does not match {:?} key", self.key_type),
                ))
            }
        };
        signature::UnparsedPublicKey::new(alg, &self.public)
            .verify(message, sig)
            .map_err(|_| failed())
    }

    fn encrypt(&self, plaintext: &[u8]) -> TlsResult<Vec<u8>> {
        if self.key_type != KeyType::Rsa {
            return Err(TlsError::alert(
                crate::tls::alert::AlertDescription::UnsupportedCertificate,
                "peer key cannot encrypt",
            ));
        }
        self.rsa_public()?
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
            .map_err(|err| TlsError::internal(format!("RSA encryption failed: {err}")))
    }
}

impl RingPeerKey {
    fn rsa_public(&self) -> TlsResult<RsaPublicKey> {
        RsaPublicKey::from_pkcs1_der(&self.public).map_err(|_| {
            TlsError::alert(crate::tls::alert::AlertDescription::BadCertificate, "bad RSA public key")
        })
    }
}

/// Accepts a leaf whose SHA-256 fingerprint was pinned ahead of time.
///
/// Fronts are reached by IP with a known certificate set, so the probe pins leaves
/// instead of building chains.
#[derive(Debug, Clone, Default)]
pub struct PinnedVerifier {
    pins: Vec<([u8; 32], RingPeerKey)>,
}

impl PinnedVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(mut self, leaf_sha256: [u8; 32], key: RingPeerKey) -> Self {
        self.pins.push((leaf_sha256, key));
        self
    }

    pub fn fingerprint(leaf: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(ring::digest::digest(&ring::digest::SHA256, leaf).as_ref());
        out
    }
}

impl CertificateVerifier for PinnedVerifier {
    fn verify_server_chain(
        &self,
        chain: &[Vec<u8>],
        server_name: Option<&str>,
    ) -> TlsResult<Arc<dyn PeerKey>> {
        let leaf = chain.first().ok_or_else(|| {
            TlsError::alert(
                crate::tls::alert::AlertDescription::BadCertificate,
                "empty certificate chain",
            )
        })?;
        let fingerprint = Self::fingerprint(leaf);
        self.pins
            .iter()
            .find(|(pinned, _)| *pinned == fingerprint)
            .map(|(_, key)| Arc::new(key.clone()) as Arc<dyn PeerKey>)
            .ok_or_else(|| {
                tracing::warn!(server_name = ?server_name, "certificate not pinned");
                TlsError::alert(
                    crate::tls::alert::AlertDescription::UnknownCa,
                    "leaf certificate is not pinned",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSA_PKCS8: &[u8] = include_bytes!("../../tests/unit/fixtures/rsa2048.der");

    #[test]
    fn ring_keys_round_trip_signatures() {
        let ed = Ed25519Key::generate().unwrap();
        let sig = ed.sign(SignatureScheme::Ed25519, b"hello").unwrap();
        let peer = RingPeerKey::new(KeyType::Ed25519, ed.public_key());
        peer.verify(SignatureScheme::Ed25519, b"hello", &sig).unwrap();
        assert!(peer.verify(SignatureScheme::Ed25519, b"hellO", &sig).is_err());

        let ec = EcdsaP256Key::generate().unwrap();
        let sig = ec.sign(SignatureScheme::EcdsaSecp256r1Sha256, b"msg").unwrap();
        let peer = RingPeerKey::new(KeyType::Ecdsa(NamedGroup::Secp256r1), ec.public_key());
        peer.verify(SignatureScheme::EcdsaSecp256r1Sha256, b"msg", &sig).unwrap();
    }

    #[test]
    fn scheme_selection_respects_version() {
        let ec = EcdsaP256Key::generate().unwrap();
        let offered = [SignatureScheme::Ed25519, SignatureScheme::EcdsaSecp256r1Sha256];
        assert_eq!(
            select_scheme(ProtocolVersion::TLS13, &ec, &offered),
            Some(SignatureScheme::EcdsaSecp256r1Sha256)
        );
        assert_eq!(
            select_scheme(ProtocolVersion::TLS11, &ec, &offered),
            Some(SignatureScheme::EcdsaSha1)
        );
        assert_eq!(select_scheme(ProtocolVersion::TLS12, &ec, &[]), Some(SignatureScheme::EcdsaSha1));

        let rsa = RsaKey::from_pkcs8(RSA_PKCS8).unwrap();
        assert_eq!(
            select_scheme(ProtocolVersion::TLS10, &rsa, &[]),
            Some(SignatureScheme::RsaPkcs1Md5Sha1)
        );
        assert_eq!(
            select_scheme(ProtocolVersion::TLS13, &rsa, &[SignatureScheme::RsaPkcs1Sha256, SignatureScheme::RsaPssRsaeSha256]),
            Some(SignatureScheme::RsaPssRsaeSha256)
        );
    }

    #[test]
    fn p256_signs_sha1_for_legacy_versions() {
        let ec = EcdsaP256Key::generate().unwrap();
        let peer = RingPeerKey::new(KeyType::Ecdsa(NamedGroup::Secp256r1), ec.public_key());
        let sig = ec.sign(SignatureScheme::EcdsaSha1, b"server params").unwrap();
        peer.verify(SignatureScheme::EcdsaSha1, b"server params", &sig).unwrap();
        assert!(peer.verify(SignatureScheme::EcdsaSha1, b"server paramz", &sig).is_err());
        assert!(peer.verify(SignatureScheme::EcdsaSecp256r1Sha256, b"server params", &sig).is_err());
    }

    #[test]
    fn rsa_key_signs_every_scheme_and_decrypts() {
        let rsa = RsaKey::from_pkcs8(RSA_PKCS8).unwrap();
        let peer = RingPeerKey::new(KeyType::Rsa, rsa.public_key());
        for scheme in rsa.schemes() {
            let sig = rsa.sign(scheme, b"transcript").unwrap();
            peer.verify(scheme, b"transcript", &sig).unwrap();
            assert!(peer.verify(scheme, b"transcripT", &sig).is_err(), "{scheme:?}");
        }

        let premaster = [0x03u8; 48];
        let ciphertext = peer.encrypt(&premaster).unwrap();
        assert_eq!(ciphertext.len(), 256);
        assert_eq!(rsa.decrypt(&ciphertext).as_deref(), Some(premaster.as_slice()));
        assert_eq!(rsa.decrypt(&[0u8; 256]), None);
    }

    #[test]
    fn virtual_host_patterns_match() {
        let key = CertifiedKey::new(vec![], Arc::new(Ed25519Key::generate().unwrap()))
            .for_hosts(vec!["*.Example.com".into(), "front.test".into()]);
        assert!(key.matches_host("www.example.com"));
        assert!(key.matches_host("FRONT.test"));
        assert!(!key.matches_host("a.b.example.com"));
        assert!(!key.matches_host("example.com"));
    }

    #[test]
    fn pinned_verifier_matches_leaf_fingerprint() {
        let ed = Ed25519Key::generate().unwrap();
        let leaf = b"leaf-der".to_vec();
        let verifier = PinnedVerifier::new().pin(
            PinnedVerifier::fingerprint(&leaf),
            RingPeerKey::new(KeyType::Ed25519, ed.public_key()),
        );
        let key = verifier.verify_server_chain(&[leaf], Some("front.test")).unwrap();
        assert_eq!(key.key_type(), KeyType::Ed25519);
        assert!(verifier.verify_server_chain(&[b"other".to_vec()], None).is_err());
        assert!(verifier.verify_server_chain(&[], None).is_err());
    }
}
