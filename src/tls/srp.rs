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

//! SRP-6a password key exchange for the TLS SRP suites (RFC 5054), SHA-1 based.

use num_bigint::BigUint;

use crate::{
    tls::{
        alert::AlertDescription,
        groups::{parse_hex, random_exponent},
        prf::HashAlgorithm,
    },
    utils::{TlsError, TlsResult},
};

const RFC5054_1024_N: &str = concat!(
    "EEAF0AB9ADB38DD69C33F80AFA8FC5E86072618775FF3C0B9EA2314C",
    "9C256576D674DF7496EA81D3383B4813D692C6E0E0D5D8E250B98BE4",
    "8E495C1D6089DAD15DC7D7B46154D6B6CE8EF4AD69B15D4982559B29",
    "7BCF1885C529F566660E57EC68EDBC3C05726CC02FD4CBF4976EAA9A",
    "FD5138FE8376435B9FC61D2FC0EB06E3",
);

/// SRP group `(N, g)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrpGroup {
    pub n: BigUint,
    pub g: BigUint,
}

impl SrpGroup {
    pub fn rfc5054_1024() -> Self {
        Self {
            n: parse_hex(RFC5054_1024_N),
            g: BigUint::from(2u8),
        }
    }

    pub fn from_bytes(n: &[u8], g: &[u8]) -> Self {
        Self {
            n: BigUint::from_bytes_be(n),
            g: BigUint::from_bytes_be(g),
        }
    }

    pub fn bits(&self) -> u64 {
        self.n.bits()
    }

    fn pad(&self, value: &BigUint) -> Vec<u8> {
        let len = self.n.to_bytes_be().len();
        let raw = value.to_bytes_be();
        let mut out = vec![0u8; len.saturating_sub(raw.len())];
        out.extend_from_slice(&raw);
        out
    }

    /// `k = H(N | PAD(g))`
    fn multiplier(&self) -> BigUint {
        let n = self.n.to_bytes_be();
        BigUint::from_bytes_be(&HashAlgorithm::Sha1.hash_parts(&[&n, &self.pad(&self.g)]))
    }

    /// `u = H(PAD(A) | PAD(B))`
    fn scrambler(&self, a: &BigUint, b: &BigUint) -> BigUint {
        BigUint::from_bytes_be(&HashAlgorithm::Sha1.hash_parts(&[&self.pad(a), &self.pad(b)]))
    }

    fn check_public(&self, value: &BigUint) -> TlsResult<()> {
        if (value % &self.n) == BigUint::from(0u8) {
            return Err(TlsError::illegal("SRP public value is 0 mod N"));
        }
        Ok(())
    }
}

impl Default for SrpGroup {
    fn default() -> Self {
        Self::rfc5054_1024()
    }
}

/// `x = H(s | H(I ":" P))`
fn private_x(salt: &[u8], username: &[u8], password: &[u8]) -> BigUint {
    let inner = HashAlgorithm::Sha1.hash_parts(&[username, b":", password]);
    BigUint::from_bytes_be(&HashAlgorithm::Sha1.hash_parts(&[salt, &inner]))
}

/// Server-side record for one SRP user.
#[derive(Debug, Clone)]
pub struct SrpVerifier {
    pub group: SrpGroup,
    pub salt: Vec<u8>,
    pub verifier: BigUint,
}

impl SrpVerifier {
    /// `v = g^x mod N` for a fresh 16-byte salt.
    pub fn derive(group: SrpGroup, username: &[u8], password: &[u8]) -> Self {
        let salt = random_exponent(16).to_bytes_be();
        Self::derive_with_salt(group, salt, username, password)
    }

    pub fn derive_with_salt(group: SrpGroup, salt: Vec<u8>, username: &[u8], password: &[u8]) -> Self {
        let x = private_x(&salt, username, password);
        let verifier = group.g.modpow(&x, &group.n);
        Self {
            group,
            salt,
            verifier,
        }
    }
}

/// Server half of one SRP exchange.
#[derive(Debug, Clone)]
pub struct SrpServer {
    record: SrpVerifier,
    private_b: BigUint,
    public_b: BigUint,
}

impl SrpServer {
    /// `B = (k*v + g^b) mod N`
    pub fn new(record: SrpVerifier) -> Self {
        let group = &record.group;
        let private_b = random_exponent(32);
        let k = group.multiplier();
        let public_b = (&k * &record.verifier + group.g.modpow(&private_b, &group.n)) % &group.n;
        Self {
            record,
            private_b,
            public_b,
        }
    }

    pub fn group(&self) -> &SrpGroup {
        &self.record.group
    }

    pub fn salt(&self) -> &[u8] {
        &self.record.salt
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.public_b.to_bytes_be()
    }

    /// `S = (A * v^u) ^ b mod N`
    pub fn premaster(&self, client_public: &[u8]) -> TlsResult<Vec<u8>> {
        let group = &self.record.group;
        let a = BigUint::from_bytes_be(client_public);
        group.check_public(&a)?;
        let u = group.scrambler(&a, &self.public_b);
        let base = (&a * self.record.verifier.modpow(&u, &group.n)) % &group.n;
        Ok(base.modpow(&self.private_b, &group.n).to_bytes_be())
    }
}

/// Client half of one SRP exchange; returns `(A, premaster)`.
pub fn client_exchange(
    group: &SrpGroup,
    salt: &[u8],
    server_public: &[u8],
    username: &[u8],
    password: &[u8],
    min_bits: u64,
) -> TlsResult<(Vec<u8>, Vec<u8>)> {
    if group.bits() < min_bits {
        return Err(TlsError::alert(
            AlertDescription::InsufficientSecurity,
            format!("SRP group of {} bits", group.bits()),
        ));
    }
    let b = BigUint::from_bytes_be(server_public);
    group.check_public(&b)?;

    let private_a = random_exponent(32);
    let public_a = group.g.modpow(&private_a, &group.n);
    let u = group.scrambler(&public_a, &b);
    let x = private_x(salt, username, password);
    let k = group.multiplier();

    let kgx = (&k * group.g.modpow(&x, &group.n)) % &group.n;
    let base = (&b + &group.n - kgx) % &group.n;
    let exponent = &private_a + &u * &x;
    let premaster = base.modpow(&exponent, &group.n);
    Ok((public_a.to_bytes_be(), premaster.to_bytes_be()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_and_server_agree() {
        let record = SrpVerifier::derive(SrpGroup::rfc5054_1024(), b"alice", b"password123");
        let server = SrpServer::new(record);
        let (a, client_pms) = client_exchange(
            server.group(),
            server.salt(),
            &server.public_bytes(),
            b"alice",
            b"password123",
            1024,
        )
        .unwrap();
        assert_eq!(server.premaster(&a).unwrap(), client_pms);
    }

    #[test]
    fn wrong_password_diverges() {
        let record = SrpVerifier::derive(SrpGroup::default(), b"alice", b"right");
        let server = SrpServer::new(record);
        let (a, client_pms) =
            client_exchange(server.group(), server.salt(), &server.public_bytes(), b"alice", b"wrong", 1024)
                .unwrap();
        assert_ne!(server.premaster(&a).unwrap(), client_pms);
    }

    #[test]
    fn zero_public_values_are_illegal() {
        let group = SrpGroup::rfc5054_1024();
        let record = SrpVerifier::derive(group.clone(), b"u", b"p");
        let server = SrpServer::new(record);
        let n = group.n.to_bytes_be();
        assert!(server.premaster(&n).is_err());
        assert!(client_exchange(&group, b"salt", &[0], b"u", b"p", 1024).is_err());
    }
}
