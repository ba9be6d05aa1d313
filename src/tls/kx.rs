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

//! TLS ≤1.2 key exchange, one variant per algorithm family.
//!
//! **Shape:**
//! - `ServerKx`: built once the suite is chosen; `server_message` produces the
//!   ServerKeyExchange body (if any), `process_client_message` yields the premaster secret.
//! - `ClientKx`: built from the server's ServerKeyExchange (`from_server_message`);
//!   `client_message` yields the ClientKeyExchange body and premaster secret.
//!
//! Signing and verification of the server's parameters are free functions shared by
//! every authenticated variant.

use std::sync::Arc;

use bytes::BufMut;
use rand::RngCore;
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

use crate::{
    tls::{
        alert::AlertDescription,
        codec::{put_vec_u16, put_vec_u8, Reader},
        credentials::{select_scheme, KeyKind, PeerKey, SignatureScheme, SigningKey},
        groups::{DhKey, DhParams, EphemeralKey, NamedGroup},
        srp::{client_exchange, SrpGroup, SrpServer, SrpVerifier},
        suites::{CipherSuite, KeyExchangeAlgorithm, ProtocolVersion},
    },
    utils::{TlsError, TlsResult},
};

const NAMED_CURVE: u8 = 3;

/// Shared inputs of every signed ServerKeyExchange.
#[derive(Debug, Clone, Copy)]
pub struct Randoms<'a> {
    pub client: &'a [u8; 32],
    pub server: &'a [u8; 32],
}

fn signed_content(randoms: Randoms<'_>, params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + params.len());
    out.extend_from_slice(randoms.client);
    out.extend_from_slice(randoms.server);
    out.extend_from_slice(params);
    out
}

/// Appends `[scheme] signature` over the randoms and `params`.
pub fn sign_params(
    version: ProtocolVersion,
    key: &dyn SigningKey,
    peer_schemes: &[SignatureScheme],
    randoms: Randoms<'_>,
    params: &[u8],
    out: &mut Vec<u8>,
) -> TlsResult<()> {
    let scheme = select_scheme(version, key, peer_schemes).ok_or_else(|| {
        TlsError::alert(AlertDescription::HandshakeFailure, "no common signature scheme")
    })?;
    let signature = key.sign(scheme, &signed_content(randoms, params))?;
    if version >= ProtocolVersion::TLS12 {
        out.put_u16(scheme.to_u16());
    }
    put_vec_u16(out, &signature);
    Ok(())
}

/// Checks the signature trailing the server's parameters.
pub fn verify_params(
    version: ProtocolVersion,
    peer: &dyn PeerKey,
    our_schemes: &[SignatureScheme],
    randoms: Randoms<'_>,
    params: &[u8],
    r: &mut Reader<'_>,
) -> TlsResult<()> {
    let scheme = if version >= ProtocolVersion::TLS12 {
        let scheme = SignatureScheme::from_u16(r.u16()?);
        if !our_schemes.contains(&scheme) {
            return Err(TlsError::illegal(format!("server signed with unoffered {scheme:?}")));
        }
        scheme
    } else {
        match peer.key_type().kind() {
            KeyKind::Rsa => SignatureScheme::RsaPkcs1Md5Sha1,
            KeyKind::Ecdsa => SignatureScheme::EcdsaSha1,
            other => return Err(TlsError::illegal(format!("{other:?} key before TLS 1.2"))),
        }
    };
    let signature = r.vec_u16()?;
    r.expect_empty("ServerKeyExchange")?;
    peer.verify(scheme, &signed_content(randoms, params), signature)
}

/// Server inputs for building its key exchange.
pub struct ServerKxInput<'a> {
    pub version: ProtocolVersion,
    pub randoms: Randoms<'a>,
    pub signing_key: Option<&'a Arc<dyn SigningKey>>,
    pub peer_schemes: &'a [SignatureScheme],
    pub group: Option<NamedGroup>,
    pub dh_params: &'a DhParams,
    pub srp_record: Option<SrpVerifier>,
}

pub enum ServerKx {
    Rsa { key: Arc<dyn SigningKey> },
    Dhe { key: DhKey },
    Ecdhe { key: EphemeralKey },
    Srp { server: SrpServer },
}

impl ServerKx {
    /// Builds the server side and its ServerKeyExchange body (`None` for RSA transport).
    pub fn start(suite: &CipherSuite, input: ServerKxInput<'_>) -> TlsResult<(Self, Option<Vec<u8>>)> {
        let signer = |params: Vec<u8>| -> TlsResult<Vec<u8>> {
            let mut out = params.clone();
            let key = input
                .signing_key
                .ok_or_else(|| TlsError::internal("authenticated suite without a key"))?;
            sign_params(input.version, key.as_ref(), input.peer_schemes, input.randoms, &params, &mut out)?;
            Ok(out)
        };
        match suite.kx {
            KeyExchangeAlgorithm::Rsa => {
                let key = input
                    .signing_key
                    .cloned()
                    .ok_or_else(|| TlsError::internal("RSA suite without a key"))?;
                Ok((ServerKx::Rsa { key }, None))
            }
            KeyExchangeAlgorithm::Dhe | KeyExchangeAlgorithm::DhAnon => {
                let key = DhKey::generate(input.dh_params);
                let mut params = Vec::new();
                put_vec_u16(&mut params, &key.params().p.to_bytes_be());
                put_vec_u16(&mut params, &key.params().g.to_bytes_be());
                put_vec_u16(&mut params, &key.public_bytes());
                let body = if suite.kx == KeyExchangeAlgorithm::Dhe {
                    signer(params)?
                } else {
                    params
                };
                Ok((ServerKx::Dhe { key }, Some(body)))
            }
            KeyExchangeAlgorithm::Ecdhe | KeyExchangeAlgorithm::EcdhAnon => {
                let group = input.group.ok_or_else(|| {
                    TlsError::alert(AlertDescription::HandshakeFailure, "no common curve")
                })?;
                let key = EphemeralKey::generate(group)?;
                let mut params = vec![NAMED_CURVE];
                params.put_u16(group.to_u16());
                put_vec_u8(&mut params, key.public_key());
                let body = if suite.kx == KeyExchangeAlgorithm::Ecdhe {
                    signer(params)?
                } else {
                    params
                };
                Ok((ServerKx::Ecdhe { key }, Some(body)))
            }
            KeyExchangeAlgorithm::Srp => {
                let record = input.srp_record.ok_or_else(|| {
                    TlsError::alert(AlertDescription::UnknownPskIdentity, "unknown SRP user")
                })?;
                let server = SrpServer::new(record);
                let mut params = Vec::new();
                put_vec_u16(&mut params, &server.group().n.to_bytes_be());
                put_vec_u16(&mut params, &server.group().g.to_bytes_be());
                put_vec_u8(&mut params, server.salt());
                put_vec_u16(&mut params, &server.public_bytes());
                let body = if suite.needs_certificate() {
                    signer(params)?
                } else {
                    params
                };
                Ok((ServerKx::Srp { server }, Some(body)))
            }
            KeyExchangeAlgorithm::Tls13 => Err(TlsError::internal("TLS 1.3 suite in legacy key exchange")),
        }
    }

    /// Premaster secret from the ClientKeyExchange body.
    ///
    /// `client_version` is the version from the ClientHello, used for the RSA rollback check.
    pub fn process_client_message(
        self,
        version: ProtocolVersion,
        client_version: ProtocolVersion,
        body: &[u8],
    ) -> TlsResult<Vec<u8>> {
        let mut r = Reader::new(body);
        let premaster = match self {
            ServerKx::Rsa { key } => {
                let ciphertext = if version.is_ssl3() { r.rest() } else { r.vec_u16()? };
                rsa_premaster(key.as_ref(), client_version, ciphertext)
            }
            ServerKx::Dhe { key } => key.agree(r.vec_u16()?)?,
            ServerKx::Ecdhe { key } => key.agree(r.vec_u8()?)?,
            ServerKx::Srp { server } => server.premaster(r.vec_u16()?)?,
        };
        r.expect_empty("ClientKeyExchange")?;
        Ok(premaster)
    }
}

/// Decrypts an RSA-transported premaster secret without revealing why it was bad.
///
/// A wrong length, a failed decryption and a version mismatch all yield the same
/// random 48-byte substitute, selected in constant time.
pub fn rsa_premaster(key: &dyn SigningKey, client_version: ProtocolVersion, ciphertext: &[u8]) -> Vec<u8> {
    let mut fallback = [0u8; 48];
    rand::rngs::OsRng.fill_bytes(&mut fallback);
    fallback[..2].copy_from_slice(&client_version.0.to_be_bytes());

    let decrypted = key.decrypt(ciphertext);
    let length_ok = Choice::from(u8::from(decrypted.as_ref().map(|p| p.len() == 48).unwrap_or(false)));
    let mut candidate = [0u8; 48];
    if let Some(plain) = decrypted.as_ref() {
        let n = plain.len().min(48);
        candidate[..n].copy_from_slice(&plain[..n]);
    }
    let version_ok = candidate[..2].ct_eq(&fallback[..2]);
    let accept = length_ok & version_ok;

    let mut out = [0u8; 48];
    for i in 0..48 {
        out[i] = u8::conditional_select(&fallback[i], &candidate[i], accept);
    }
    out.to_vec()
}

/// Client inputs for processing the server's key exchange.
pub struct ClientKxInput<'a> {
    pub version: ProtocolVersion,
    pub randoms: Randoms<'a>,
    pub peer_key: Option<Arc<dyn PeerKey>>,
    pub our_schemes: &'a [SignatureScheme],
    pub our_groups: &'a [NamedGroup],
    pub min_dh_bits: u64,
    pub srp_credentials: Option<(&'a [u8], &'a [u8])>,
}

pub enum ClientKx {
    Rsa { peer: Arc<dyn PeerKey> },
    Dhe { params: DhParams, server_public: Vec<u8> },
    Ecdhe { group: NamedGroup, server_public: Vec<u8> },
    Srp { premaster: Vec<u8>, client_public: Vec<u8> },
}

impl ClientKx {
    /// Parses (and, for authenticated suites, verifies) the ServerKeyExchange.
    pub fn from_server_message(
        suite: &CipherSuite,
        input: ClientKxInput<'_>,
        body: Option<&[u8]>,
    ) -> TlsResult<Self> {
        let need_body = || {
            body.ok_or_else(|| TlsError::unexpected("missing ServerKeyExchange"))
        };
        let verify = |params: &[u8], r: &mut Reader<'_>| -> TlsResult<()> {
            let peer = input
                .peer_key
                .as_ref()
                .ok_or_else(|| TlsError::unexpected("signed parameters without a certificate"))?;
            verify_params(input.version, peer.as_ref(), input.our_schemes, input.randoms, params, r)
        };
        match suite.kx {
            KeyExchangeAlgorithm::Rsa => {
                if body.is_some() {
                    return Err(TlsError::unexpected("ServerKeyExchange with RSA transport"));
                }
                let peer = input
                    .peer_key
                    .clone()
                    .ok_or_else(|| TlsError::unexpected("RSA transport without a certificate"))?;
                Ok(ClientKx::Rsa { peer })
            }
            KeyExchangeAlgorithm::Dhe | KeyExchangeAlgorithm::DhAnon => {
                let body = need_body()?;
                let mut r = Reader::new(body);
                let p = r.vec_u16()?;
                let g = r.vec_u16()?;
                let ys = r.vec_u16()?.to_vec();
                let params_len = r.position();
                let params = DhParams::from_bytes(p, g);
                if params.bits() < input.min_dh_bits {
                    return Err(TlsError::alert(
                        AlertDescription::InsufficientSecurity,
                        format!("{}-bit DH prime", params.bits()),
                    ));
                }
                if suite.kx == KeyExchangeAlgorithm::Dhe {
                    verify(&body[..params_len], &mut r)?;
                } else {
                    r.expect_empty("ServerKeyExchange")?;
                }
                Ok(ClientKx::Dhe {
                    params,
                    server_public: ys,
                })
            }
            KeyExchangeAlgorithm::Ecdhe | KeyExchangeAlgorithm::EcdhAnon => {
                let body = need_body()?;
                let mut r = Reader::new(body);
                if r.u8()? != NAMED_CURVE {
                    return Err(TlsError::illegal("only named curves are supported"));
                }
                let group = NamedGroup::from_u16(r.u16()?);
                if !input.our_groups.contains(&group) || !group.is_supported() {
                    return Err(TlsError::illegal(format!("server chose unoffered {group:?}")));
                }
                let point = r.vec_u8()?.to_vec();
                let params_len = r.position();
                if suite.kx == KeyExchangeAlgorithm::Ecdhe {
                    verify(&body[..params_len], &mut r)?;
                } else {
                    r.expect_empty("ServerKeyExchange")?;
                }
                Ok(ClientKx::Ecdhe {
                    group,
                    server_public: point,
                })
            }
            KeyExchangeAlgorithm::Srp => {
                let body = need_body()?;
                let (username, password) = input
                    .srp_credentials
                    .ok_or_else(|| TlsError::internal("SRP suite without credentials"))?;
                let mut r = Reader::new(body);
                let n = r.vec_u16()?;
                let g = r.vec_u16()?;
                let salt = r.vec_u8()?;
                let b = r.vec_u16()?;
                let params_len = r.position();
                if suite.needs_certificate() {
                    verify(&body[..params_len], &mut r)?;
                } else {
                    r.expect_empty("ServerKeyExchange")?;
                }
                let group = SrpGroup::from_bytes(n, g);
                let (client_public, premaster) =
                    client_exchange(&group, salt, b, username, password, input.min_dh_bits.min(1024))?;
                Ok(ClientKx::Srp {
                    premaster,
                    client_public,
                })
            }
            KeyExchangeAlgorithm::Tls13 => Err(TlsError::internal("TLS 1.3 suite in legacy key exchange")),
        }
    }

    /// ClientKeyExchange body and premaster secret.
    pub fn client_message(
        self,
        version: ProtocolVersion,
        client_version: ProtocolVersion,
    ) -> TlsResult<(Vec<u8>, Vec<u8>)> {
        let mut body = Vec::new();
        let premaster = match self {
            ClientKx::Rsa { peer } => {
                let mut pms = vec![0u8; 48];
                rand::rngs::OsRng.fill_bytes(&mut pms[2..]);
                pms[..2].copy_from_slice(&client_version.0.to_be_bytes());
                let encrypted = peer.encrypt(&pms)?;
                if version.is_ssl3() {
                    body.extend_from_slice(&encrypted);
                } else {
                    put_vec_u16(&mut body, &encrypted);
                }
                pms
            }
            ClientKx::Dhe {
                params,
                server_public,
            } => {
                let key = DhKey::generate(&params);
                put_vec_u16(&mut body, &key.public_bytes());
                key.agree(&server_public)?
            }
            ClientKx::Ecdhe {
                group,
                server_public,
            } => {
                let key = EphemeralKey::generate(group)?;
                put_vec_u8(&mut body, key.public_key());
                key.agree(&server_public)?
            }
            ClientKx::Srp {
                premaster,
                client_public,
            } => {
                put_vec_u16(&mut body, &client_public);
                premaster
            }
        };
        Ok((body, premaster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{credentials::KeyType, suites::lookup_suite};

    /// Toy RSA stand-in: "encryption" is XOR with 0x5a.
    struct XorKey;

    impl SigningKey for XorKey {
        fn key_type(&self) -> KeyType {
            KeyType::Rsa
        }
        fn schemes(&self) -> Vec<SignatureScheme> {
            vec![SignatureScheme::RsaPkcs1Sha256]
        }
        fn sign(&self, _: SignatureScheme, _: &[u8]) -> TlsResult<Vec<u8>> {
            Ok(vec![1])
        }
        fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
            Some(ciphertext.iter().map(|b| b ^ 0x5a).collect())
        }
    }

    fn xor(data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ 0x5a).collect()
    }

    #[test]
    fn rsa_premaster_accepts_well_formed_secret() {
        let mut pms = vec![0x03, 0x03];
        pms.extend([7u8; 46]);
        assert_eq!(rsa_premaster(&XorKey, ProtocolVersion::TLS12, &xor(&pms)), pms);
    }

    #[test]
    fn rsa_premaster_substitutes_on_bad_length_and_version() {
        let short = xor(&[3, 3, 1, 2, 3]);
        let out = rsa_premaster(&XorKey, ProtocolVersion::TLS12, &short);
        assert_eq!(out.len(), 48);
        assert_eq!(&out[..2], &[3, 3]);

        let mut wrong_version = vec![0x03, 0x01];
        wrong_version.extend([7u8; 46]);
        let out = rsa_premaster(&XorKey, ProtocolVersion::TLS12, &xor(&wrong_version));
        assert_eq!(out.len(), 48);
        assert_ne!(out, wrong_version);
        assert_eq!(&out[..2], &[3, 3]);
    }

    #[test]
    fn anonymous_ecdh_agrees() {
        let suite = lookup_suite(0xc018).unwrap();
        let cr = [1u8; 32];
        let sr = [2u8; 32];
        let randoms = Randoms {
            client: &cr,
            server: &sr,
        };
        let params = DhParams::default();
        let (server, ske) = ServerKx::start(
            suite,
            ServerKxInput {
                version: ProtocolVersion::TLS12,
                randoms,
                signing_key: None,
                peer_schemes: &[],
                group: Some(NamedGroup::X25519),
                dh_params: &params,
                srp_record: None,
            },
        )
        .unwrap();
        let client = ClientKx::from_server_message(
            suite,
            ClientKxInput {
                version: ProtocolVersion::TLS12,
                randoms,
                peer_key: None,
                our_schemes: &[],
                our_groups: &[NamedGroup::X25519],
                min_dh_bits: 1024,
                srp_credentials: None,
            },
            ske.as_deref(),
        )
        .unwrap();
        let (cke, client_pms) = client
            .client_message(ProtocolVersion::TLS12, ProtocolVersion::TLS12)
            .unwrap();
        let server_pms = server
            .process_client_message(ProtocolVersion::TLS12, ProtocolVersion::TLS12, &cke)
            .unwrap();
        assert_eq!(client_pms, server_pms);
    }

    #[test]
    fn small_dh_prime_is_insufficient_security() {
        let suite = lookup_suite(0x0034).unwrap();
        let cr = [1u8; 32];
        let sr = [2u8; 32];
        let mut ske = Vec::new();
        put_vec_u16(&mut ske, &[0xff; 64]);
        put_vec_u16(&mut ske, &[2]);
        put_vec_u16(&mut ske, &[5; 64]);
        let err = ClientKx::from_server_message(
            suite,
            ClientKxInput {
                version: ProtocolVersion::TLS12,
                randoms: Randoms {
                    client: &cr,
                    server: &sr,
                },
                peer_key: None,
                our_schemes: &[],
                our_groups: &[],
                min_dh_bits: 1024,
                srp_credentials: None,
            },
            Some(&ske),
        )
        .err()
        .unwrap();
        assert_eq!(err.local_alert(), Some(AlertDescription::InsufficientSecurity));
    }
}
