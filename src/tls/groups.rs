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

//! Key-agreement groups: ring-backed X25519/P-256/P-384, X448 through the `x448` crate, and
//! finite-field Diffie-Hellman for the TLS ≤1.2 DHE suites.

use std::fmt;

use num_bigint::BigUint;
use rand::RngCore;
use ring::{agreement, rand::SystemRandom};
use subtle::ConstantTimeEq;

use crate::utils::{TlsError, TlsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedGroup {
    Secp256r1,
    Secp384r1,
    X25519,
    X448,
    Unknown(u16),
}

impl NamedGroup {
    pub fn from_u16(value: u16) -> Self {
        match value {
            23 => NamedGroup::Secp256r1,
            24 => NamedGroup::Secp384r1,
            29 => NamedGroup::X25519,
            30 => NamedGroup::X448,
            other => NamedGroup::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            NamedGroup::Secp256r1 => 23,
            NamedGroup::Secp384r1 => 24,
            NamedGroup::X25519 => 29,
            NamedGroup::X448 => 30,
            NamedGroup::Unknown(v) => v,
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, NamedGroup::Unknown(_))
    }

    fn ring_algorithm(self) -> Option<&'static agreement::Algorithm> {
        match self {
            NamedGroup::X25519 => Some(&agreement::X25519),
            NamedGroup::Secp256r1 => Some(&agreement::ECDH_P256),
            NamedGroup::Secp384r1 => Some(&agreement::ECDH_P384),
            _ => None,
        }
    }

    fn is_montgomery(self) -> bool {
        matches!(self, NamedGroup::X25519 | NamedGroup::X448)
    }
}

pub fn lookup_group(name: &str) -> Option<NamedGroup> {
    match name.trim().to_ascii_lowercase().as_str() {
        "x25519" => Some(NamedGroup::X25519),
        "x448" => Some(NamedGroup::X448),
        "secp256r1" | "p-256" | "p256" => Some(NamedGroup::Secp256r1),
        "secp384r1" | "p-384" | "p384" => Some(NamedGroup::Secp384r1),
        _ => None,
    }
}

pub fn default_groups() -> Vec<NamedGroup> {
    vec![
        NamedGroup::X25519,
        NamedGroup::Secp256r1,
        NamedGroup::Secp384r1,
        NamedGroup::X448,
    ]
}

/// One side's ephemeral key for an (EC)DHE exchange; consumed by `agree`.
pub enum EphemeralKey {
    Ring {
        group: NamedGroup,
        private: agreement::EphemeralPrivateKey,
        public: Vec<u8>,
    },
    X448 {
        private: x448::Secret,
        public: Vec<u8>,
    },
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("group", &self.group())
            .finish_non_exhaustive()
    }
}

impl EphemeralKey {
    pub fn generate(group: NamedGroup) -> TlsResult<Self> {
        if group == NamedGroup::X448 {
            let mut raw = [0u8; 56];
            rand::rngs::OsRng.fill_bytes(&mut raw);
            let private = x448::Secret::from_bytes(&raw)
                .ok_or_else(|| TlsError::internal("X448 key generation failed"))?;
            let public = x448::PublicKey::from(&private).as_bytes().to_vec();
            return Ok(EphemeralKey::X448 { private, public });
        }

        let alg = group
            .ring_algorithm()
            .ok_or_else(|| TlsError::internal(format!("unsupported group {group:?}")))?;
        let rng = SystemRandom::new();
        let private = agreement::EphemeralPrivateKey::generate(alg, &rng)
            .map_err(|_| TlsError::internal("ephemeral key generation failed"))?;
        let public = private
            .compute_public_key()
            .map_err(|_| TlsError::internal("public key computation failed"))?
            .as_ref()
            .to_vec();
        Ok(EphemeralKey::Ring {
            group,
            private,
            public,
        })
    }

    pub fn group(&self) -> NamedGroup {
        match self {
            EphemeralKey::Ring { group, .. } => *group,
            EphemeralKey::X448 { .. } => NamedGroup::X448,
        }
    }

    pub fn public_key(&self) -> &[u8] {
        match self {
            EphemeralKey::Ring { public, .. } => public,
            EphemeralKey::X448 { public, .. } => public,
        }
    }

    /// Computes the shared secret; a malformed point or an all-zero Montgomery
    /// output is `illegal_parameter`.
    pub fn agree(self, peer_public: &[u8]) -> TlsResult<Vec<u8>> {
        let group = self.group();
        let shared = match self {
            EphemeralKey::Ring { private, .. } => {
                let alg = group
                    .ring_algorithm()
                    .ok_or_else(|| TlsError::internal("group lost its algorithm"))?;
                let peer = agreement::UnparsedPublicKey::new(alg, peer_public);
                agreement::agree_ephemeral(private, &peer, |secret| secret.to_vec())
                    .map_err(|_| TlsError::illegal(format!("invalid {group:?} key share")))?
            }
            EphemeralKey::X448 { private, .. } => {
                let peer = x448::PublicKey::from_bytes(peer_public)
                    .ok_or_else(|| TlsError::illegal("invalid X448 key share"))?;
                private
                    .as_diffie_hellman(&peer)
                    .ok_or_else(|| TlsError::illegal("all-zero shared secret"))?
                    .as_bytes()
                    .to_vec()
            }
        };

        if group.is_montgomery() {
            let zero = vec![0u8; shared.len()];
            if bool::from(shared.ct_eq(&zero)) {
                return Err(TlsError::illegal("all-zero shared secret"));
            }
        }
        Ok(shared)
    }
}

/// RFC 3526 group 14 (2048-bit MODP), generator 2.
const MODP_2048_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// Finite-field group parameters as sent in a DHE ServerKeyExchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParams {
    pub p: BigUint,
    pub g: BigUint,
}

impl DhParams {
    pub fn modp2048() -> Self {
        Self {
            p: parse_hex(MODP_2048_HEX),
            g: BigUint::from(2u8),
        }
    }

    pub fn from_bytes(p: &[u8], g: &[u8]) -> Self {
        Self {
            p: BigUint::from_bytes_be(p),
            g: BigUint::from_bytes_be(g),
        }
    }

    pub fn bits(&self) -> u64 {
        self.p.bits()
    }
}

impl Default for DhParams {
    fn default() -> Self {
        Self::modp2048()
    }
}

pub(crate) fn parse_hex(hex: &str) -> BigUint {
    BigUint::parse_bytes(hex.as_bytes(), 16).unwrap_or_default()
}

/// Random exponent of `bytes` length, forced to be at least 2.
pub(crate) fn random_exponent(bytes: usize) -> BigUint {
    let mut raw = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let value = BigUint::from_bytes_be(&raw);
    if value < BigUint::from(2u8) {
        BigUint::from(2u8)
    } else {
        value
    }
}

/// Ephemeral finite-field DH key.
#[derive(Debug, Clone)]
pub struct DhKey {
    params: DhParams,
    private: BigUint,
    public: BigUint,
}

impl DhKey {
    pub fn generate(params: &DhParams) -> Self {
        let private = random_exponent(32);
        let public = params.g.modpow(&private, &params.p);
        Self {
            params: params.clone(),
            private,
            public,
        }
    }

    pub fn params(&self) -> &DhParams {
        &self.params
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Shared secret with leading zeros stripped (RFC 5246 §8.1.2).
    pub fn agree(&self, peer_public: &[u8]) -> TlsResult<Vec<u8>> {
        let one = BigUint::from(1u8);
        let p_minus_one = &self.params.p - &one;
        let y = BigUint::from_bytes_be(peer_public);
        if y <= one || y >= p_minus_one {
            return Err(TlsError::illegal("DH public value out of range"));
        }
        let shared = y.modpow(&self.private, &self.params.p);
        if shared == one || shared == p_minus_one {
            return Err(TlsError::illegal("DH small subgroup capture"));
        }
        Ok(shared.to_bytes_be())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_groups_agree() {
        for group in [NamedGroup::X25519, NamedGroup::Secp256r1, NamedGroup::Secp384r1] {
            let a = EphemeralKey::generate(group).unwrap();
            let b = EphemeralKey::generate(group).unwrap();
            let a_pub = a.public_key().to_vec();
            let b_pub = b.public_key().to_vec();
            assert_eq!(a.agree(&b_pub).unwrap(), b.agree(&a_pub).unwrap());
        }
    }

    #[test]
    fn x448_agrees_and_rejects_zero_point() {
        let a = EphemeralKey::generate(NamedGroup::X448).unwrap();
        let b = EphemeralKey::generate(NamedGroup::X448).unwrap();
        let a_pub = a.public_key().to_vec();
        let b_pub = b.public_key().to_vec();
        assert_eq!(a_pub.len(), 56);
        assert_eq!(a.agree(&b_pub).unwrap(), b.agree(&a_pub).unwrap());

        let c = EphemeralKey::generate(NamedGroup::X448).unwrap();
        assert!(c.agree(&[0u8; 56]).is_err());
        let d = EphemeralKey::generate(NamedGroup::X448).unwrap();
        assert!(d.agree(&[9u8; 32]).is_err());
    }

    #[test]
    fn dh_rejects_degenerate_peer_values() {
        let params = DhParams::modp2048();
        assert_eq!(params.bits(), 2048);
        let key = DhKey::generate(&params);
        assert!(key.agree(&[1]).is_err());
        let p_minus_one = (&params.p - BigUint::from(1u8)).to_bytes_be();
        assert!(key.agree(&p_minus_one).is_err());

        let peer = DhKey::generate(&params);
        assert_eq!(
            key.agree(&peer.public_bytes()).unwrap(),
            peer.agree(&key.public_bytes()).unwrap()
        );
    }

    #[test]
    fn group_names_resolve() {
        assert_eq!(lookup_group("X25519"), Some(NamedGroup::X25519));
        assert_eq!(lookup_group("p-256"), Some(NamedGroup::Secp256r1));
        assert_eq!(lookup_group("ffdhe9999"), None);
    }
}
