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

//! Runtime TLS settings for each role.
//!
//! These are the resolved, typed forms of the `[tls]` configuration section: cipher and
//! group names have already been looked up in the static catalogs.

use std::{collections::HashMap, fmt, sync::Arc};

use crate::tls::{
    credentials::{CertificateVerifier, CertifiedKey, SignatureScheme},
    groups::{default_groups, DhParams, NamedGroup},
    prf::HashAlgorithm,
    session::{ClientSessionStore, SessionCache, TicketSealer},
    srp::SrpVerifier,
    suites::{default_suites, CipherSuite, ProtocolVersion},
};

pub fn default_signature_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::Ed25519,
        SignatureScheme::EcdsaSecp256r1Sha256,
        SignatureScheme::EcdsaSecp384r1Sha384,
        SignatureScheme::RsaPssRsaeSha256,
        SignatureScheme::RsaPssRsaeSha384,
        SignatureScheme::RsaPkcs1Sha256,
        SignatureScheme::RsaPkcs1Sha384,
        SignatureScheme::RsaPkcs1Sha1,
        SignatureScheme::EcdsaSha1,
    ]
}

/// Out-of-band TLS 1.3 PSK.
#[derive(Clone)]
pub struct ExternalPsk {
    pub identity: Vec<u8>,
    pub secret: Vec<u8>,
    pub hash: HashAlgorithm,
}

impl fmt::Debug for ExternalPsk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalPsk")
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .field("hash", &self.hash)
            .finish()
    }
}

/// Version bounds shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: ProtocolVersion,
    pub max: ProtocolVersion,
}

impl VersionRange {
    pub fn contains(&self, version: ProtocolVersion) -> bool {
        version >= self.min && version <= self.max
    }

    /// Highest first, as listed in supported_versions.
    pub fn descending(&self) -> Vec<ProtocolVersion> {
        ProtocolVersion::ALL
            .iter()
            .rev()
            .copied()
            .filter(|v| self.contains(*v))
            .collect()
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self {
            min: ProtocolVersion::TLS12,
            max: ProtocolVersion::TLS13,
        }
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub versions: VersionRange,
    pub cipher_suites: Vec<&'static CipherSuite>,
    pub groups: Vec<NamedGroup>,
    /// Groups that get a key share in the first ClientHello.
    pub key_share_groups: Vec<NamedGroup>,
    pub signature_schemes: Vec<SignatureScheme>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub extended_master_secret: bool,
    pub encrypt_then_mac: bool,
    pub heartbeat: bool,
    pub record_size_limit: Option<u16>,
    pub min_dh_bits: u64,
    pub send_fallback_scsv: bool,
    pub post_handshake_auth: bool,
    pub verifier: Arc<dyn CertificateVerifier>,
    pub client_cert: Option<CertifiedKey>,
    pub srp: Option<(String, String)>,
    pub external_psks: Vec<ExternalPsk>,
    pub sessions: Option<Arc<ClientSessionStore>>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("versions", &self.versions)
            .field("cipher_suites", &self.cipher_suites.iter().map(|s| s.name).collect::<Vec<_>>())
            .field("groups", &self.groups)
            .field("alpn", &self.alpn_protocols.len())
            .finish()
    }
}

impl ClientConfig {
    pub fn new(verifier: Arc<dyn CertificateVerifier>) -> Self {
        Self {
            versions: VersionRange::default(),
            cipher_suites: default_suites(),
            groups: default_groups(),
            key_share_groups: vec![NamedGroup::X25519],
            signature_schemes: default_signature_schemes(),
            alpn_protocols: Vec::new(),
            extended_master_secret: true,
            encrypt_then_mac: true,
            heartbeat: false,
            record_size_limit: None,
            min_dh_bits: 2048,
            send_fallback_scsv: false,
            post_handshake_auth: false,
            verifier,
            client_cert: None,
            srp: None,
            external_psks: Vec::new(),
            sessions: None,
        }
    }

    /// Suites usable for at least one enabled version.
    pub fn offered_suites(&self) -> Vec<&'static CipherSuite> {
        self.cipher_suites
            .iter()
            .copied()
            .filter(|s| self.versions.descending().iter().any(|v| s.usable_in(*v)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    #[default]
    None,
    Optional,
    Required,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub versions: VersionRange,
    pub cipher_suites: Vec<&'static CipherSuite>,
    pub groups: Vec<NamedGroup>,
    pub signature_schemes: Vec<SignatureScheme>,
    /// Primary pair first, then virtual-host alternates.
    pub certificates: Vec<CertifiedKey>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub extended_master_secret: bool,
    pub encrypt_then_mac: bool,
    pub heartbeat: bool,
    pub record_size_limit: Option<u16>,
    pub dh_params: DhParams,
    pub session_cache: Option<Arc<SessionCache>>,
    pub ticket_sealer: Option<Arc<TicketSealer>>,
    pub tickets_to_send: usize,
    pub external_psks: Vec<ExternalPsk>,
    pub srp_users: HashMap<String, SrpVerifier>,
    pub client_auth: ClientAuth,
    pub client_verifier: Option<Arc<dyn CertificateVerifier>>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("versions", &self.versions)
            .field("cipher_suites", &self.cipher_suites.iter().map(|s| s.name).collect::<Vec<_>>())
            .field("certificates", &self.certificates)
            .field("client_auth", &self.client_auth)
            .finish()
    }
}

impl ServerConfig {
    pub fn new(certificates: Vec<CertifiedKey>) -> Self {
        Self {
            versions: VersionRange::default(),
            cipher_suites: default_suites(),
            groups: default_groups(),
            signature_schemes: default_signature_schemes(),
            certificates,
            alpn_protocols: Vec::new(),
            extended_master_secret: true,
            encrypt_then_mac: true,
            heartbeat: false,
            record_size_limit: None,
            dh_params: DhParams::default(),
            session_cache: Some(Arc::new(SessionCache::default())),
            ticket_sealer: None,
            tickets_to_send: 1,
            external_psks: Vec::new(),
            srp_users: HashMap::new(),
            client_auth: ClientAuth::None,
            client_verifier: None,
        }
    }
}
