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

//! Hello/EncryptedExtensions/CertificateRequest extensions as a closed enum.
//!
//! Decoding is context-sensitive: several extensions share a type code but carry a
//! different body depending on which message they appear in (`key_share`,
//! `supported_versions`, `pre_shared_key`, `server_name`).

use std::collections::HashSet;

use bytes::BufMut;

use crate::{
    tls::{
        codec::{put_u16_prefixed, put_u8_prefixed, put_vec_u16, put_vec_u8, Reader},
        credentials::SignatureScheme,
        groups::NamedGroup,
        suites::ProtocolVersion,
    },
    utils::{TlsError, TlsResult},
};

pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
pub const EXT_EC_POINT_FORMATS: u16 = 11;
pub const EXT_SRP: u16 = 12;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
pub const EXT_HEARTBEAT: u16 = 15;
pub const EXT_ALPN: u16 = 16;
pub const EXT_ENCRYPT_THEN_MAC: u16 = 22;
pub const EXT_EXTENDED_MASTER_SECRET: u16 = 23;
pub const EXT_RECORD_SIZE_LIMIT: u16 = 28;
pub const EXT_SESSION_TICKET: u16 = 35;
pub const EXT_PRE_SHARED_KEY: u16 = 41;
pub const EXT_EARLY_DATA: u16 = 42;
pub const EXT_SUPPORTED_VERSIONS: u16 = 43;
pub const EXT_COOKIE: u16 = 44;
pub const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 45;
pub const EXT_POST_HANDSHAKE_AUTH: u16 = 49;
pub const EXT_SIGNATURE_ALGORITHMS_CERT: u16 = 50;
pub const EXT_KEY_SHARE: u16 = 51;
pub const EXT_RENEGOTIATION_INFO: u16 = 0xff01;

/// Message an extension block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionContext {
    ClientHello,
    ServerHello,
    HelloRetryRequest,
    EncryptedExtensions,
    CertificateRequest,
    NewSessionTicket,
    Certificate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    PeerAllowedToSend,
    PeerNotAllowedToSend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PskKeyExchangeMode {
    PskKe,
    PskDheKe,
    Unknown(u8),
}

impl PskKeyExchangeMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::PskKe,
            1 => Self::PskDheKe,
            other => Self::Unknown(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::PskKe => 0,
            Self::PskDheKe => 1,
            Self::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShareEntry {
    pub group: NamedGroup,
    pub key_exchange: Vec<u8>,
}

impl KeyShareEntry {
    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.group.to_u16());
        put_vec_u16(out, &self.key_exchange);
    }

    fn decode(r: &mut Reader<'_>) -> TlsResult<Self> {
        let group = NamedGroup::from_u16(r.u16()?);
        let key_exchange = r.vec_u16()?.to_vec();
        if key_exchange.is_empty() {
            return Err(TlsError::decode("empty key_share entry"));
        }
        Ok(Self {
            group,
            key_exchange,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskIdentity {
    pub identity: Vec<u8>,
    pub obfuscated_ticket_age: u32,
}

/// Client `pre_shared_key` offer; always the last ClientHello extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskOffer {
    pub identities: Vec<PskIdentity>,
    pub binders: Vec<Vec<u8>>,
}

impl PskOffer {
    /// Encoded size of the binders list, including its u16 length.
    pub fn binders_len(&self) -> usize {
        2 + self.binders.iter().map(|b| 1 + b.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// Host name from the client, or the empty acknowledgement from the server.
    ServerName(Option<String>),
    SupportedGroups(Vec<NamedGroup>),
    EcPointFormats(Vec<u8>),
    Srp(Vec<u8>),
    SignatureAlgorithms(Vec<SignatureScheme>),
    SignatureAlgorithmsCert(Vec<SignatureScheme>),
    Heartbeat(HeartbeatMode),
    Alpn(Vec<Vec<u8>>),
    EncryptThenMac,
    ExtendedMasterSecret,
    RecordSizeLimit(u16),
    SessionTicket(Vec<u8>),
    PreSharedKeyOffer(PskOffer),
    PreSharedKeySelected(u16),
    EarlyData,
    SupportedVersionsOffer(Vec<ProtocolVersion>),
    SupportedVersionSelected(ProtocolVersion),
    Cookie(Vec<u8>),
    PskKeyExchangeModes(Vec<PskKeyExchangeMode>),
    PostHandshakeAuth,
    KeyShareOffer(Vec<KeyShareEntry>),
    KeyShareSelected(KeyShareEntry),
    KeyShareRetry(NamedGroup),
    RenegotiationInfo(Vec<u8>),
    Unknown { typ: u16, data: Vec<u8> },
}

fn schemes_from(list: Vec<u16>) -> Vec<SignatureScheme> {
    list.into_iter().map(SignatureScheme::from_u16).collect()
}

fn put_schemes(out: &mut Vec<u8>, schemes: &[SignatureScheme]) {
    put_u16_prefixed(out, |w| {
        for s in schemes {
            w.put_u16(s.to_u16());
        }
    });
}

impl Extension {
    pub fn typ(&self) -> u16 {
        match self {
            Extension::ServerName(_) => EXT_SERVER_NAME,
            Extension::SupportedGroups(_) => EXT_SUPPORTED_GROUPS,
            Extension::EcPointFormats(_) => EXT_EC_POINT_FORMATS,
            Extension::Srp(_) => EXT_SRP,
            Extension::SignatureAlgorithms(_) => EXT_SIGNATURE_ALGORITHMS,
            Extension::SignatureAlgorithmsCert(_) => EXT_SIGNATURE_ALGORITHMS_CERT,
            Extension::Heartbeat(_) => EXT_HEARTBEAT,
            Extension::Alpn(_) => EXT_ALPN,
            Extension::EncryptThenMac => EXT_ENCRYPT_THEN_MAC,
            Extension::ExtendedMasterSecret => EXT_EXTENDED_MASTER_SECRET,
            Extension::RecordSizeLimit(_) => EXT_RECORD_SIZE_LIMIT,
            Extension::SessionTicket(_) => EXT_SESSION_TICKET,
            Extension::PreSharedKeyOffer(_) | Extension::PreSharedKeySelected(_) => EXT_PRE_SHARED_KEY,
            Extension::EarlyData => EXT_EARLY_DATA,
            Extension::SupportedVersionsOffer(_) | Extension::SupportedVersionSelected(_) => {
                EXT_SUPPORTED_VERSIONS
            }
            Extension::Cookie(_) => EXT_COOKIE,
            Extension::PskKeyExchangeModes(_) => EXT_PSK_KEY_EXCHANGE_MODES,
            Extension::PostHandshakeAuth => EXT_POST_HANDSHAKE_AUTH,
            Extension::KeyShareOffer(_) | Extension::KeyShareSelected(_) | Extension::KeyShareRetry(_) => {
                EXT_KEY_SHARE
            }
            Extension::RenegotiationInfo(_) => EXT_RENEGOTIATION_INFO,
            Extension::Unknown { typ, .. } => *typ,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Extension::ServerName(Some(name)) => put_u16_prefixed(out, |w| {
                w.put_u8(0);
                put_vec_u16(w, name.as_bytes());
            }),
            Extension::ServerName(None)
            | Extension::EncryptThenMac
            | Extension::ExtendedMasterSecret
            | Extension::EarlyData
            | Extension::PostHandshakeAuth => {}
            Extension::SupportedGroups(groups) => put_u16_prefixed(out, |w| {
                for g in groups {
                    w.put_u16(g.to_u16());
                }
            }),
            Extension::EcPointFormats(formats) => put_vec_u8(out, formats),
            Extension::Srp(identity) => put_vec_u8(out, identity),
            Extension::SignatureAlgorithms(schemes) | Extension::SignatureAlgorithmsCert(schemes) => {
                put_schemes(out, schemes)
            }
            Extension::Heartbeat(mode) => out.put_u8(match mode {
                HeartbeatMode::PeerAllowedToSend => 1,
                HeartbeatMode::PeerNotAllowedToSend => 2,
            }),
            Extension::Alpn(protocols) => put_u16_prefixed(out, |w| {
                for p in protocols {
                    put_vec_u8(w, p);
                }
            }),
            Extension::RecordSizeLimit(limit) => out.put_u16(*limit),
            Extension::SessionTicket(ticket) => out.extend_from_slice(ticket),
            Extension::PreSharedKeyOffer(offer) => {
                put_u16_prefixed(out, |w| {
                    for id in &offer.identities {
                        put_vec_u16(w, &id.identity);
                        w.put_u32(id.obfuscated_ticket_age);
                    }
                });
                put_u16_prefixed(out, |w| {
                    for binder in &offer.binders {
                        put_vec_u8(w, binder);
                    }
                });
            }
            Extension::PreSharedKeySelected(index) => out.put_u16(*index),
            Extension::SupportedVersionsOffer(versions) => put_u8_prefixed(out, |w| {
                for v in versions {
                    w.put_u16(v.0);
                }
            }),
            Extension::SupportedVersionSelected(version) => out.put_u16(version.0),
            Extension::Cookie(cookie) => put_vec_u16(out, cookie),
            Extension::PskKeyExchangeModes(modes) => put_u8_prefixed(out, |w| {
                for m in modes {
                    w.put_u8(m.to_u8());
                }
            }),
            Extension::KeyShareOffer(entries) => put_u16_prefixed(out, |w| {
                for e in entries {
                    e.encode(w);
                }
            }),
            Extension::KeyShareSelected(entry) => entry.encode(out),
            Extension::KeyShareRetry(group) => out.put_u16(group.to_u16()),
            Extension::RenegotiationInfo(data) => put_vec_u8(out, data),
            Extension::Unknown { data, .. } => out.extend_from_slice(data),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.typ());
        put_u16_prefixed(out, |w| self.encode_body(w));
    }

    pub fn decode(typ: u16, data: &[u8], ctx: ExtensionContext) -> TlsResult<Extension> {
        let mut r = Reader::new(data);
        let ext = match typ {
            EXT_SERVER_NAME if r.is_empty() => Extension::ServerName(None),
            EXT_SERVER_NAME => {
                let mut list = r.sub_u16()?;
                let mut host = None;
                while !list.is_empty() {
                    let kind = list.u8()?;
                    let name = list.vec_u16()?;
                    if kind == 0 && host.is_none() {
                        let name = std::str::from_utf8(name)
                            .map_err(|_| TlsError::decode("server_name is not UTF-8"))?;
                        host = Some(name.to_owned());
                    }
                }
                Extension::ServerName(host)
            }
            EXT_SUPPORTED_GROUPS => Extension::SupportedGroups(
                r.list_u16()?.into_iter().map(NamedGroup::from_u16).collect(),
            ),
            EXT_EC_POINT_FORMATS => Extension::EcPointFormats(r.vec_u8()?.to_vec()),
            EXT_SRP => Extension::Srp(r.vec_u8()?.to_vec()),
            EXT_SIGNATURE_ALGORITHMS => Extension::SignatureAlgorithms(schemes_from(r.list_u16()?)),
            EXT_SIGNATURE_ALGORITHMS_CERT => {
                Extension::SignatureAlgorithmsCert(schemes_from(r.list_u16()?))
            }
            EXT_HEARTBEAT => Extension::Heartbeat(match r.u8()? {
                1 => HeartbeatMode::PeerAllowedToSend,
                2 => HeartbeatMode::PeerNotAllowedToSend,
                other => return Err(TlsError::illegal(format!("heartbeat mode {other}"))),
            }),
            EXT_ALPN => {
                let mut list = r.sub_u16()?;
                let mut protocols = Vec::new();
                while !list.is_empty() {
                    let name = list.vec_u8()?;
                    if name.is_empty() {
                        return Err(TlsError::decode("empty ALPN protocol name"));
                    }
                    protocols.push(name.to_vec());
                }
                if protocols.is_empty() {
                    return Err(TlsError::decode("empty ALPN list"));
                }
                Extension::Alpn(protocols)
            }
            EXT_ENCRYPT_THEN_MAC => Extension::EncryptThenMac,
            EXT_EXTENDED_MASTER_SECRET => Extension::ExtendedMasterSecret,
            EXT_RECORD_SIZE_LIMIT => {
                let limit = r.u16()?;
                if limit < 64 {
                    return Err(TlsError::illegal(format!("record_size_limit {limit}")));
                }
                Extension::RecordSizeLimit(limit)
            }
            EXT_SESSION_TICKET => Extension::SessionTicket(r.rest().to_vec()),
            EXT_PRE_SHARED_KEY if ctx == ExtensionContext::ClientHello => {
                let mut ids = r.sub_u16()?;
                let mut identities = Vec::new();
                while !ids.is_empty() {
                    identities.push(PskIdentity {
                        identity: ids.vec_u16()?.to_vec(),
                        obfuscated_ticket_age: ids.u32()?,
                    });
                }
                let mut list = r.sub_u16()?;
                let mut binders = Vec::new();
                while !list.is_empty() {
                    binders.push(list.vec_u8()?.to_vec());
                }
                if identities.is_empty() || identities.len() != binders.len() {
                    return Err(TlsError::illegal("PSK identities and binders mismatch"));
                }
                Extension::PreSharedKeyOffer(PskOffer {
                    identities,
                    binders,
                })
            }
            EXT_PRE_SHARED_KEY => Extension::PreSharedKeySelected(r.u16()?),
            EXT_EARLY_DATA => {
                r.rest();
                Extension::EarlyData
            }
            EXT_SUPPORTED_VERSIONS if ctx == ExtensionContext::ClientHello => {
                let mut list = r.sub_u8()?;
                let mut versions = Vec::new();
                while !list.is_empty() {
                    versions.push(ProtocolVersion(list.u16()?));
                }
                Extension::SupportedVersionsOffer(versions)
            }
            EXT_SUPPORTED_VERSIONS => Extension::SupportedVersionSelected(ProtocolVersion(r.u16()?)),
            EXT_COOKIE => Extension::Cookie(r.vec_u16()?.to_vec()),
            EXT_PSK_KEY_EXCHANGE_MODES => Extension::PskKeyExchangeModes(
                r.vec_u8()?
                    .iter()
                    .map(|m| PskKeyExchangeMode::from_u8(*m))
                    .collect(),
            ),
            EXT_POST_HANDSHAKE_AUTH => Extension::PostHandshakeAuth,
            EXT_KEY_SHARE => match ctx {
                ExtensionContext::ClientHello => {
                    let mut list = r.sub_u16()?;
                    let mut entries = Vec::new();
                    while !list.is_empty() {
                        entries.push(KeyShareEntry::decode(&mut list)?);
                    }
                    Extension::KeyShareOffer(entries)
                }
                ExtensionContext::HelloRetryRequest => {
                    Extension::KeyShareRetry(NamedGroup::from_u16(r.u16()?))
                }
                _ => Extension::KeyShareSelected(KeyShareEntry::decode(&mut r)?),
            },
            EXT_RENEGOTIATION_INFO => Extension::RenegotiationInfo(r.vec_u8()?.to_vec()),
            _ => {
                return Ok(Extension::Unknown {
                    typ,
                    data: data.to_vec(),
                })
            }
        };
        r.expect_empty("extension body")?;
        Ok(ext)
    }
}

/// Reads an optional extension block; absent (end of message) means no extensions.
pub fn decode_extensions(r: &mut Reader<'_>, ctx: ExtensionContext) -> TlsResult<Vec<Extension>> {
    if r.is_empty() {
        return Ok(Vec::new());
    }
    let mut block = r.sub_u16()?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    while !block.is_empty() {
        let typ = block.u16()?;
        let data = block.vec_u16()?;
        if !seen.insert(typ) {
            return Err(TlsError::illegal(format!("duplicate extension {typ}")));
        }
        if ctx == ExtensionContext::ClientHello
            && typ != EXT_PRE_SHARED_KEY
            && seen.contains(&EXT_PRE_SHARED_KEY)
        {
            return Err(TlsError::illegal("pre_shared_key is not the last extension"));
        }
        out.push(Extension::decode(typ, data, ctx)?);
    }
    Ok(out)
}

pub fn encode_extensions(out: &mut Vec<u8>, extensions: &[Extension]) {
    put_u16_prefixed(out, |w| {
        for ext in extensions {
            ext.encode(w);
        }
    });
}

/// Lookup helpers over a decoded extension block.
pub trait ExtensionList {
    fn find_ext(&self, typ: u16) -> Option<&Extension>;

    fn has_ext(&self, typ: u16) -> bool {
        self.find_ext(typ).is_some()
    }
}

impl ExtensionList for [Extension] {
    fn find_ext(&self, typ: u16) -> Option<&Extension> {
        self.iter().find(|e| e.typ() == typ)
    }
}

impl ExtensionList for Vec<Extension> {
    fn find_ext(&self, typ: u16) -> Option<&Extension> {
        self.as_slice().find_ext(typ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(ext: &Extension, ctx: ExtensionContext) -> Extension {
        let mut out = Vec::new();
        encode_extensions(&mut out, std::slice::from_ref(ext));
        let mut r = Reader::new(&out);
        decode_extensions(&mut r, ctx).unwrap().remove(0)
    }

    #[test]
    fn key_share_shape_depends_on_message() {
        let offer = Extension::KeyShareOffer(vec![KeyShareEntry {
            group: NamedGroup::X25519,
            key_exchange: vec![9; 32],
        }]);
        assert_eq!(reparse(&offer, ExtensionContext::ClientHello), offer);

        let retry = Extension::KeyShareRetry(NamedGroup::Secp256r1);
        assert_eq!(reparse(&retry, ExtensionContext::HelloRetryRequest), retry);
    }

    #[test]
    fn psk_offer_must_be_last() {
        let psk = Extension::PreSharedKeyOffer(PskOffer {
            identities: vec![PskIdentity {
                identity: b"id".to_vec(),
                obfuscated_ticket_age: 7,
            }],
            binders: vec![vec![0; 32]],
        });
        let mut out = Vec::new();
        encode_extensions(&mut out, &[psk, Extension::EncryptThenMac]);
        let mut r = Reader::new(&out);
        assert!(decode_extensions(&mut r, ExtensionContext::ClientHello).is_err());
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut out = Vec::new();
        encode_extensions(&mut out, &[Extension::EncryptThenMac, Extension::EncryptThenMac]);
        let mut r = Reader::new(&out);
        let err = decode_extensions(&mut r, ExtensionContext::ServerHello).unwrap_err();
        assert!(err.is_security());
    }

    #[test]
    fn server_name_ack_is_empty() {
        let ack = Extension::ServerName(None);
        assert_eq!(reparse(&ack, ExtensionContext::ServerHello), ack);
        let name = Extension::ServerName(Some("front.example".into()));
        assert_eq!(reparse(&name, ExtensionContext::ClientHello), name);
    }
}
