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

//! Protocol versions and the static cipher-suite catalog.

use std::fmt;

use crate::tls::prf::HashAlgorithm;

/// Wire protocol version (`major.minor` packed into a u16).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const SSL3: ProtocolVersion = ProtocolVersion(0x0300);
    pub const TLS10: ProtocolVersion = ProtocolVersion(0x0301);
    pub const TLS11: ProtocolVersion = ProtocolVersion(0x0302);
    pub const TLS12: ProtocolVersion = ProtocolVersion(0x0303);
    pub const TLS13: ProtocolVersion = ProtocolVersion(0x0304);

    pub const ALL: [ProtocolVersion; 5] = [
        Self::SSL3,
        Self::TLS10,
        Self::TLS11,
        Self::TLS12,
        Self::TLS13,
    ];

    pub fn is_known(self) -> bool {
        Self::ALL.contains(&self)
    }

    pub fn is_tls13(self) -> bool {
        self == Self::TLS13
    }

    pub fn is_ssl3(self) -> bool {
        self == Self::SSL3
    }

    /// Name accepted in configuration files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ssl3" | "sslv3" => Some(Self::SSL3),
            "tls10" | "tls1.0" => Some(Self::TLS10),
            "tls11" | "tls1.1" => Some(Self::TLS11),
            "tls12" | "tls1.2" => Some(Self::TLS12),
            "tls13" | "tls1.3" => Some(Self::TLS13),
            _ => None,
        }
    }
}

impl fmt::Debug for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SSL3 => f.write_str("SSLv3"),
            Self::TLS10 => f.write_str("TLSv1.0"),
            Self::TLS11 => f.write_str("TLSv1.1"),
            Self::TLS12 => f.write_str("TLSv1.2"),
            Self::TLS13 => f.write_str("TLSv1.3"),
            ProtocolVersion(other) => write!(f, "0x{other:04x}"),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Key exchange family of a suite; TLS 1.3 suites leave it to extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeAlgorithm {
    Rsa,
    Dhe,
    Ecdhe,
    DhAnon,
    EcdhAnon,
    Srp,
    Tls13,
}

/// Which certificate key (if any) authenticates the key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlgorithm {
    Rsa,
    Ecdsa,
    Anonymous,
    /// Password-only SRP.
    Srp,
    /// SRP with an RSA-signed ServerKeyExchange.
    SrpRsa,
    /// TLS 1.3: any certificate key type, or PSK.
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCipher {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    Aes128Cbc,
    Aes256Cbc,
}

impl BulkCipher {
    pub fn key_len(self) -> usize {
        match self {
            BulkCipher::Aes128Gcm | BulkCipher::Aes128Cbc => 16,
            BulkCipher::Aes256Gcm | BulkCipher::Aes256Cbc | BulkCipher::ChaCha20Poly1305 => 32,
        }
    }

    pub fn is_aead(self) -> bool {
        !matches!(self, BulkCipher::Aes128Cbc | BulkCipher::Aes256Cbc)
    }

    /// Bytes of IV material taken from the TLS ≤1.2 key block.
    pub fn fixed_iv_len(self) -> usize {
        match self {
            BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm => 4,
            BulkCipher::ChaCha20Poly1305 => 12,
            BulkCipher::Aes128Cbc | BulkCipher::Aes256Cbc => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    Aead,
    Sha1,
    Sha256,
}

impl MacAlgorithm {
    pub fn key_len(self) -> usize {
        match self {
            MacAlgorithm::Aead => 0,
            MacAlgorithm::Sha1 => 20,
            MacAlgorithm::Sha256 => 32,
        }
    }
}

/// One row of the cipher-suite catalog.
#[derive(Debug, PartialEq, Eq)]
pub struct CipherSuite {
    pub id: u16,
    pub name: &'static str,
    pub kx: KeyExchangeAlgorithm,
    pub auth: AuthAlgorithm,
    pub bulk: BulkCipher,
    pub mac: MacAlgorithm,
    /// PRF hash for TLS 1.2, HKDF hash for TLS 1.3.
    pub hash: HashAlgorithm,
    pub min_version: ProtocolVersion,
    pub max_version: ProtocolVersion,
}

impl CipherSuite {
    pub fn usable_in(&self, version: ProtocolVersion) -> bool {
        version >= self.min_version && version <= self.max_version
    }

    pub fn is_tls13(&self) -> bool {
        self.kx == KeyExchangeAlgorithm::Tls13
    }

    pub fn is_cbc(&self) -> bool {
        !self.bulk.is_aead()
    }

    /// True when the suite needs a certificate from the server.
    pub fn needs_certificate(&self) -> bool {
        matches!(
            self.auth,
            AuthAlgorithm::Rsa | AuthAlgorithm::Ecdsa | AuthAlgorithm::SrpRsa
        )
    }
}

macro_rules! suite {
    ($id:expr, $name:expr, $kx:ident, $auth:ident, $bulk:ident, $mac:ident, $hash:ident, $min:ident, $max:ident) => {
        CipherSuite {
            id: $id,
            name: $name,
            kx: KeyExchangeAlgorithm::$kx,
            auth: AuthAlgorithm::$auth,
            bulk: BulkCipher::$bulk,
            mac: MacAlgorithm::$mac,
            hash: HashAlgorithm::$hash,
            min_version: ProtocolVersion::$min,
            max_version: ProtocolVersion::$max,
        }
    };
}

pub const TLS_EMPTY_RENEGOTIATION_INFO_SCSV: u16 = 0x00ff;
pub const TLS_FALLBACK_SCSV: u16 = 0x5600;

/// Every suite this engine implements, in default preference order.
pub static ALL_SUITES: &[CipherSuite] = &[
    suite!(0x1301, "TLS_AES_128_GCM_SHA256", Tls13, Any, Aes128Gcm, Aead, Sha256, TLS13, TLS13),
    suite!(0x1303, "TLS_CHACHA20_POLY1305_SHA256", Tls13, Any, ChaCha20Poly1305, Aead, Sha256, TLS13, TLS13),
    suite!(0x1302, "TLS_AES_256_GCM_SHA384", Tls13, Any, Aes256Gcm, Aead, Sha384, TLS13, TLS13),
    suite!(0xc02b, "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256", Ecdhe, Ecdsa, Aes128Gcm, Aead, Sha256, TLS12, TLS12),
    suite!(0xc02f, "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256", Ecdhe, Rsa, Aes128Gcm, Aead, Sha256, TLS12, TLS12),
    suite!(0xcca9, "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256", Ecdhe, Ecdsa, ChaCha20Poly1305, Aead, Sha256, TLS12, TLS12),
    suite!(0xcca8, "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256", Ecdhe, Rsa, ChaCha20Poly1305, Aead, Sha256, TLS12, TLS12),
    suite!(0xc02c, "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384", Ecdhe, Ecdsa, Aes256Gcm, Aead, Sha384, TLS12, TLS12),
    suite!(0xc030, "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384", Ecdhe, Rsa, Aes256Gcm, Aead, Sha384, TLS12, TLS12),
    suite!(0x009e, "TLS_DHE_RSA_WITH_AES_128_GCM_SHA256", Dhe, Rsa, Aes128Gcm, Aead, Sha256, TLS12, TLS12),
    suite!(0x009c, "TLS_RSA_WITH_AES_128_GCM_SHA256", Rsa, Rsa, Aes128Gcm, Aead, Sha256, TLS12, TLS12),
    suite!(0x009d, "TLS_RSA_WITH_AES_256_GCM_SHA384", Rsa, Rsa, Aes256Gcm, Aead, Sha384, TLS12, TLS12),
    suite!(0xc009, "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA", Ecdhe, Ecdsa, Aes128Cbc, Sha1, Sha256, TLS10, TLS12),
    suite!(0xc013, "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA", Ecdhe, Rsa, Aes128Cbc, Sha1, Sha256, TLS10, TLS12),
    suite!(0x0033, "TLS_DHE_RSA_WITH_AES_128_CBC_SHA", Dhe, Rsa, Aes128Cbc, Sha1, Sha256, SSL3, TLS12),
    suite!(0x003c, "TLS_RSA_WITH_AES_128_CBC_SHA256", Rsa, Rsa, Aes128Cbc, Sha256, Sha256, TLS12, TLS12),
    suite!(0x002f, "TLS_RSA_WITH_AES_128_CBC_SHA", Rsa, Rsa, Aes128Cbc, Sha1, Sha256, SSL3, TLS12),
    suite!(0x0035, "TLS_RSA_WITH_AES_256_CBC_SHA", Rsa, Rsa, Aes256Cbc, Sha1, Sha256, SSL3, TLS12),
    suite!(0xc01d, "TLS_SRP_SHA_WITH_AES_128_CBC_SHA", Srp, Srp, Aes128Cbc, Sha1, Sha256, TLS10, TLS12),
    suite!(0xc01e, "TLS_SRP_SHA_RSA_WITH_AES_128_CBC_SHA", Srp, SrpRsa, Aes128Cbc, Sha1, Sha256, TLS10, TLS12),
    suite!(0xc018, "TLS_ECDH_anon_WITH_AES_128_CBC_SHA", EcdhAnon, Anonymous, Aes128Cbc, Sha1, Sha256, TLS10, TLS12),
    suite!(0x0034, "TLS_DH_anon_WITH_AES_128_CBC_SHA", DhAnon, Anonymous, Aes128Cbc, Sha1, Sha256, SSL3, TLS12),
];

pub fn lookup_suite(id: u16) -> Option<&'static CipherSuite> {
    ALL_SUITES.iter().find(|suite| suite.id == id)
}

/// Resolves a configured cipher name (IANA spelling, case-insensitive).
pub fn lookup_cipher(name: &str) -> Option<&'static CipherSuite> {
    let wanted = name.trim();
    ALL_SUITES
        .iter()
        .find(|suite| suite.name.eq_ignore_ascii_case(wanted))
}

/// Suites enabled when nothing is configured: everything authenticated.
pub fn default_suites() -> Vec<&'static CipherSuite> {
    ALL_SUITES
        .iter()
        .filter(|suite| {
            !matches!(
                suite.auth,
                AuthAlgorithm::Anonymous | AuthAlgorithm::Srp | AuthAlgorithm::SrpRsa
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_case_insensitively() {
        let suite = lookup_cipher("tls_ecdhe_rsa_with_aes_128_gcm_sha256").unwrap();
        assert_eq!(suite.id, 0xc02f);
        assert!(lookup_cipher("TLS_NULL_WITH_NULL_NULL").is_none());
    }

    #[test]
    fn version_windows_gate_suites() {
        let gcm = lookup_suite(0xc02f).unwrap();
        assert!(gcm.usable_in(ProtocolVersion::TLS12));
        assert!(!gcm.usable_in(ProtocolVersion::TLS11));
        let cbc = lookup_suite(0x002f).unwrap();
        assert!(cbc.usable_in(ProtocolVersion::SSL3));
        assert!(!lookup_suite(0x1301).unwrap().usable_in(ProtocolVersion::TLS12));
    }

    #[test]
    fn defaults_exclude_anonymous_and_srp() {
        let defaults = default_suites();
        assert!(defaults.iter().all(|s| s.auth != AuthAlgorithm::Anonymous));
        assert!(defaults.iter().any(|s| s.id == 0x1301));
    }
}
