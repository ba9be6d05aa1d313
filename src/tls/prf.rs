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

//! Hashes, HMACs and the SSL 3.0 / TLS 1.0-1.2 pseudo-random functions.
//!
//! **Version map:**
//! - SSL 3.0: MD5/SHA-1 nested construction for master secret, key block and Finished.
//! - TLS 1.0/1.1: `P_MD5(S1) XOR P_SHA1(S2)` over the split secret.
//! - TLS 1.2: `P_<hash>` with the suite's PRF hash.

use ::hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use ring::{digest, hmac};

use crate::tls::suites::ProtocolVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    fn digest_algorithm(self) -> &'static digest::Algorithm {
        match self {
            HashAlgorithm::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            HashAlgorithm::Sha256 => &digest::SHA256,
            HashAlgorithm::Sha384 => &digest::SHA384,
        }
    }

    fn hmac_algorithm(self) -> hmac::Algorithm {
        match self {
            HashAlgorithm::Sha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            HashAlgorithm::Sha256 => hmac::HMAC_SHA256,
            HashAlgorithm::Sha384 => hmac::HMAC_SHA384,
        }
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        digest::digest(self.digest_algorithm(), data).as_ref().to_vec()
    }

    pub fn hash_parts(self, parts: &[&[u8]]) -> Vec<u8> {
        let mut ctx = digest::Context::new(self.digest_algorithm());
        for part in parts {
            ctx.update(part);
        }
        ctx.finish().as_ref().to_vec()
    }

    pub fn hmac(self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        let key = hmac::Key::new(self.hmac_algorithm(), key);
        let mut ctx = hmac::Context::with_key(&key);
        for part in parts {
            ctx.update(part);
        }
        ctx.sign().as_ref().to_vec()
    }
}

pub fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// HMAC-MD5 (RFC 2104); ring does not ship MD5.
pub fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = match Hmac::<Md5>::new_from_slice(key) {
        Ok(mac) => mac,
        // Same result as the long key: HMAC hashes it down first.
        Err(_) => return hmac_md5(&md5(&[key]), parts),
    };
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn p_hash(mac: impl Fn(&[&[u8]]) -> Vec<u8>, seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut a = mac(&[seed]);
    while out.len() < len {
        let chunk = mac(&[&a, seed]);
        let take = (len - out.len()).min(chunk.len());
        out.extend_from_slice(&chunk[..take]);
        a = mac(&[&a]);
    }
    out
}

/// TLS 1.2 PRF (RFC 5246 §5).
pub fn prf12(hash: HashAlgorithm, secret: &[u8], label: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label);
    full_seed.extend_from_slice(seed);
    p_hash(|parts| hash.hmac(secret, parts), &full_seed, len)
}

/// TLS 1.0/1.1 PRF (RFC 2246 §5).
pub fn prf10(secret: &[u8], label: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label);
    full_seed.extend_from_slice(seed);

    let half = secret.len().div_ceil(2);
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    let md5_stream = p_hash(|parts| hmac_md5(s1, parts).to_vec(), &full_seed, len);
    let sha_stream = p_hash(
        |parts| HashAlgorithm::Sha1.hmac(s2, parts),
        &full_seed,
        len,
    );
    md5_stream
        .iter()
        .zip(sha_stream.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Version-dispatching PRF for TLS 1.0 through 1.2.
pub fn prf(
    version: ProtocolVersion,
    hash: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    len: usize,
) -> Vec<u8> {
    if version >= ProtocolVersion::TLS12 {
        prf12(hash, secret, label, seed, len)
    } else {
        prf10(secret, label, seed, len)
    }
}

/// SSL 3.0 key derivation: `MD5(secret + SHA1("A" + secret + seed)) + ...`.
pub fn ssl3_derive(secret: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 16);
    let mut round = 0usize;
    while out.len() < len {
        let salt = vec![b'A' + round as u8; round + 1];
        let inner = HashAlgorithm::Sha1.hash_parts(&[&salt, secret, seed]);
        out.extend_from_slice(&md5(&[secret, &inner]));
        round += 1;
    }
    out.truncate(len);
    out
}

/// Master secret for SSL 3.0 - TLS 1.2; `session_hash` switches to RFC 7627 derivation.
pub fn master_secret(
    version: ProtocolVersion,
    hash: HashAlgorithm,
    premaster: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    session_hash: Option<&[u8]>,
) -> Vec<u8> {
    let mut randoms = Vec::with_capacity(64);
    randoms.extend_from_slice(client_random);
    randoms.extend_from_slice(server_random);

    if version.is_ssl3() {
        return ssl3_derive(premaster, &randoms, 48);
    }
    match session_hash {
        Some(session_hash) => prf(
            version,
            hash,
            premaster,
            b"extended master secret",
            session_hash,
            48,
        ),
        None => prf(version, hash, premaster, b"master secret", &randoms, 48),
    }
}

pub fn key_block(
    version: ProtocolVersion,
    hash: HashAlgorithm,
    master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    len: usize,
) -> Vec<u8> {
    let mut randoms = Vec::with_capacity(64);
    randoms.extend_from_slice(server_random);
    randoms.extend_from_slice(client_random);

    if version.is_ssl3() {
        ssl3_derive(master, &randoms, len)
    } else {
        prf(version, hash, master, b"key expansion", &randoms, len)
    }
}

/// Running record of every handshake message, hashed on demand.
///
/// The hash is only known once the suite is chosen, so raw bytes are kept instead of
/// per-algorithm contexts.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    data: Vec<u8>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message: &[u8]) {
        self.data.extend_from_slice(message);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn hash(&self, alg: HashAlgorithm) -> Vec<u8> {
        alg.hash(&self.data)
    }

    pub fn md5_sha1(&self) -> Vec<u8> {
        let mut out = md5(&[&self.data]).to_vec();
        out.extend(HashAlgorithm::Sha1.hash(&self.data));
        out
    }

    /// Handshake hash in the form TLS 1.0-1.2 feed into the PRF.
    pub fn prf_hash(&self, version: ProtocolVersion, alg: HashAlgorithm) -> Vec<u8> {
        if version >= ProtocolVersion::TLS12 {
            self.hash(alg)
        } else {
            self.md5_sha1()
        }
    }

    /// Replaces ClientHello1 with the synthetic `message_hash` message (RFC 8446 §4.4.1).
    pub fn replace_with_message_hash(&mut self, alg: HashAlgorithm) {
        let digest = self.hash(alg);
        let mut synthetic = vec![254u8, 0, 0, digest.len() as u8];
        synthetic.extend_from_slice(&digest);
        self.data = synthetic;
    }

    pub fn fork(&self) -> Transcript {
        self.clone()
    }
}

const SSL3_PAD1: u8 = 0x36;
const SSL3_PAD2: u8 = 0x5c;

fn ssl3_finished(master: &[u8], transcript: &[u8], from_client: bool) -> Vec<u8> {
    let sender: &[u8] = if from_client { b"CLNT" } else { b"SRVR" };

    let md5_inner = md5(&[transcript, sender, master, &[SSL3_PAD1; 48]]);
    let md5_outer = md5(&[master, &[SSL3_PAD2; 48], &md5_inner]);

    let sha = HashAlgorithm::Sha1;
    let sha_inner = sha.hash_parts(&[transcript, sender, master, &[SSL3_PAD1; 40]]);
    let sha_outer = sha.hash_parts(&[master, &[SSL3_PAD2; 40], &sha_inner]);

    let mut out = md5_outer.to_vec();
    out.extend(sha_outer);
    out
}

/// verify_data of a Finished message for SSL 3.0 through TLS 1.2.
pub fn finished_verify_data(
    version: ProtocolVersion,
    hash: HashAlgorithm,
    master: &[u8],
    transcript: &Transcript,
    from_client: bool,
) -> Vec<u8> {
    if version.is_ssl3() {
        return ssl3_finished(master, transcript.bytes(), from_client);
    }
    let label: &[u8] = if from_client {
        b"client finished"
    } else {
        b"server finished"
    };
    prf(
        version,
        hash,
        master,
        label,
        &transcript.prf_hash(version, hash),
        12,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_md5_matches_rfc2202_case_two() {
        let mac = hmac_md5(b"Jefe", &[b"what do ya want ", b"for nothing?"]);
        let hex: String = mac.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, "750c783e6ab0b503eaa86e310a5db738");
    }

    #[test]
    fn hmac_md5_hashes_keys_longer_than_a_block() {
        let mac = hmac_md5(&[0xaa; 80], &[b"Test Using Larger Than Block-Size Key - Hash Key First"]);
        let hex: String = mac.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, "6b1ab7fe4bd7bf8f0b62e6ce61b9d0cd");
    }

    #[test]
    fn prf_outputs_requested_length_and_is_deterministic() {
        let a = prf12(HashAlgorithm::Sha256, b"secret", b"label", b"seed", 100);
        let b = prf12(HashAlgorithm::Sha256, b"secret", b"label", b"seed", 100);
        assert_eq!(a.len(), 100);
        assert_eq!(a, b);
        let c = prf10(b"secret", b"label", b"seed", 37);
        assert_eq!(c.len(), 37);
        assert_ne!(&a[..37], &c[..]);
    }

    #[test]
    fn tls10_prf_uses_overlapping_halves_for_odd_secrets() {
        // With a one-byte secret both halves are the whole secret.
        let out = prf10(b"k", b"l", b"s", 16);
        let md5_stream = p_hash(|p| hmac_md5(b"k", p).to_vec(), b"ls", 16);
        let sha_stream = p_hash(|p| HashAlgorithm::Sha1.hmac(b"k", p), b"ls", 16);
        let expected: Vec<u8> = md5_stream.iter().zip(&sha_stream).map(|(a, b)| a ^ b).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn message_hash_replaces_transcript() {
        let mut transcript = Transcript::new();
        transcript.add(b"client hello bytes");
        let digest = transcript.hash(HashAlgorithm::Sha256);
        transcript.replace_with_message_hash(HashAlgorithm::Sha256);
        assert_eq!(&transcript.bytes()[..4], &[254, 0, 0, 32]);
        assert_eq!(&transcript.bytes()[4..], &digest[..]);
    }

    #[test]
    fn finished_lengths_follow_version() {
        let mut transcript = Transcript::new();
        transcript.add(b"messages");
        let ms = [7u8; 48];
        let ssl3 = finished_verify_data(ProtocolVersion::SSL3, HashAlgorithm::Sha256, &ms, &transcript, true);
        assert_eq!(ssl3.len(), 36);
        let tls12 = finished_verify_data(ProtocolVersion::TLS12, HashAlgorithm::Sha256, &ms, &transcript, true);
        assert_eq!(tls12.len(), 12);
        let server = finished_verify_data(ProtocolVersion::TLS12, HashAlgorithm::Sha256, &ms, &transcript, false);
        assert_ne!(tls12, server);
    }
}
