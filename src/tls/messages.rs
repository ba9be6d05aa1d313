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

//! Handshake messages, decoded once into a closed enum.
//!
//! Every message keeps its raw encoding (`type || u24 length || body`) so the transcript
//! and PSK binders hash exactly the bytes that crossed the wire.

use bytes::BufMut;

use crate::{
    tls::{
        codec::{put_u16_prefixed, put_u24, put_u24_prefixed, put_vec_u16, put_vec_u24, put_vec_u8, Reader},
        credentials::SignatureScheme,
        extensions::{decode_extensions, encode_extensions, Extension, ExtensionContext, ExtensionList},
        suites::ProtocolVersion,
    },
    utils::{TlsError, TlsResult},
};

/// ServerHello.random of a HelloRetryRequest (SHA-256 of "HelloRetryRequest").
pub const HRR_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8, 0x91,
    0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8, 0x33, 0x9c,
];

/// Last eight bytes of ServerHello.random when a TLS 1.3 server negotiates TLS 1.2.
pub const DOWNGRADE_TLS12: [u8; 8] = *b"DOWNGRD\x01";
/// Same, for TLS 1.1 and below.
pub const DOWNGRADE_TLS11: [u8; 8] = *b"DOWNGRD\x00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeType {
    HelloRequest,
    ClientHello,
    ServerHello,
    NewSessionTicket,
    EndOfEarlyData,
    EncryptedExtensions,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    KeyUpdate,
    MessageHash,
    Unknown(u8),
}

impl HandshakeType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::HelloRequest,
            1 => Self::ClientHello,
            2 => Self::ServerHello,
            4 => Self::NewSessionTicket,
            5 => Self::EndOfEarlyData,
            8 => Self::EncryptedExtensions,
            11 => Self::Certificate,
            12 => Self::ServerKeyExchange,
            13 => Self::CertificateRequest,
            14 => Self::ServerHelloDone,
            15 => Self::CertificateVerify,
            16 => Self::ClientKeyExchange,
            20 => Self::Finished,
            24 => Self::KeyUpdate,
            254 => Self::MessageHash,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::HelloRequest => 0,
            Self::ClientHello => 1,
            Self::ServerHello => 2,
            Self::NewSessionTicket => 4,
            Self::EndOfEarlyData => 5,
            Self::EncryptedExtensions => 8,
            Self::Certificate => 11,
            Self::ServerKeyExchange => 12,
            Self::CertificateRequest => 13,
            Self::ServerHelloDone => 14,
            Self::CertificateVerify => 15,
            Self::ClientKeyExchange => 16,
            Self::Finished => 20,
            Self::KeyUpdate => 24,
            Self::MessageHash => 254,
            Self::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub legacy_version: ProtocolVersion,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl ClientHello {
    pub fn server_name(&self) -> Option<&str> {
        self.extensions.iter().find_map(|e| match e {
            Extension::ServerName(Some(name)) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn supported_versions(&self) -> Option<&[ProtocolVersion]> {
        self.extensions.iter().find_map(|e| match e {
            Extension::SupportedVersionsOffer(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    pub fn signature_schemes(&self) -> &[SignatureScheme] {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::SignatureAlgorithms(v) => Some(v.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn cert_signature_schemes(&self) -> &[SignatureScheme] {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::SignatureAlgorithmsCert(v) => Some(v.as_slice()),
                _ => None,
            })
            .unwrap_or_else(|| self.signature_schemes())
    }

    pub fn groups(&self) -> &[crate::tls::groups::NamedGroup] {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::SupportedGroups(v) => Some(v.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn alpn(&self) -> Option<&[Vec<u8>]> {
        self.extensions.iter().find_map(|e| match e {
            Extension::Alpn(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    /// Length of the encoded PSK binders list, zero without a PSK offer.
    pub fn binders_len(&self) -> usize {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::PreSharedKeyOffer(offer) => Some(offer.binders_len()),
                _ => None,
            })
            .unwrap_or(0)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.legacy_version.0);
        out.extend_from_slice(&self.random);
        put_vec_u8(out, &self.session_id);
        put_u16_prefixed(out, |w| {
            for suite in &self.cipher_suites {
                w.put_u16(*suite);
            }
        });
        put_vec_u8(out, &self.compression_methods);
        if !self.extensions.is_empty() {
            encode_extensions(out, &self.extensions);
        }
    }

    fn decode(r: &mut Reader<'_>) -> TlsResult<Self> {
        let legacy_version = ProtocolVersion(r.u16()?);
        let random = r.array::<32>()?;
        let session_id = r.vec_u8()?.to_vec();
        if session_id.len() > 32 {
            return Err(TlsError::decode("session_id longer than 32 bytes"));
        }
        let cipher_suites = r.list_u16()?;
        let compression_methods = r.vec_u8()?.to_vec();
        if cipher_suites.is_empty() || compression_methods.is_empty() {
            return Err(TlsError::decode("empty suite or compression list"));
        }
        let extensions = decode_extensions(r, ExtensionContext::ClientHello)?;
        Ok(Self {
            legacy_version,
            random,
            session_id,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub legacy_version: ProtocolVersion,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression_method: u8,
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    pub fn is_retry_request(&self) -> bool {
        self.random == HRR_RANDOM
    }

    /// `supported_versions` value, else the legacy field.
    pub fn version(&self) -> ProtocolVersion {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::SupportedVersionSelected(v) => Some(*v),
                _ => None,
            })
            .unwrap_or(self.legacy_version)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.legacy_version.0);
        out.extend_from_slice(&self.random);
        put_vec_u8(out, &self.session_id);
        out.put_u16(self.cipher_suite);
        out.put_u8(self.compression_method);
        if !self.extensions.is_empty() {
            encode_extensions(out, &self.extensions);
        }
    }

    fn decode(r: &mut Reader<'_>) -> TlsResult<Self> {
        let legacy_version = ProtocolVersion(r.u16()?);
        let random = r.array::<32>()?;
        let session_id = r.vec_u8()?.to_vec();
        if session_id.len() > 32 {
            return Err(TlsError::decode("session_id longer than 32 bytes"));
        }
        let cipher_suite = r.u16()?;
        let compression_method = r.u8()?;
        let ctx = if random == HRR_RANDOM {
            ExtensionContext::HelloRetryRequest
        } else {
            ExtensionContext::ServerHello
        };
        let extensions = decode_extensions(r, ctx)?;
        Ok(Self {
            legacy_version,
            random,
            session_id,
            cipher_suite,
            compression_method,
            extensions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateEntry {
    pub cert: Vec<u8>,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate13 {
    pub context: Vec<u8>,
    pub entries: Vec<CertificateEntry>,
}

impl Certificate13 {
    pub fn chain(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.cert.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest12 {
    pub certificate_types: Vec<u8>,
    pub schemes: Vec<SignatureScheme>,
    pub authorities: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest13 {
    pub context: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl CertificateRequest13 {
    pub fn schemes(&self) -> &[SignatureScheme] {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::SignatureAlgorithms(v) => Some(v.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    /// Absent before TLS 1.2.
    pub scheme: Option<SignatureScheme>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionTicket12 {
    pub lifetime: u32,
    pub ticket: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionTicket13 {
    pub lifetime: u32,
    pub age_add: u32,
    pub nonce: Vec<u8>,
    pub ticket: Vec<u8>,
    pub extensions: Vec<Extension>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakePayload {
    HelloRequest,
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    NewSessionTicket12(NewSessionTicket12),
    NewSessionTicket13(NewSessionTicket13),
    EncryptedExtensions(Vec<Extension>),
    Certificate12(Vec<Vec<u8>>),
    Certificate13(Certificate13),
    /// Opaque: its layout depends on the key exchange.
    ServerKeyExchange(Vec<u8>),
    CertificateRequest12(CertificateRequest12),
    CertificateRequest13(CertificateRequest13),
    ServerHelloDone,
    CertificateVerify(CertificateVerify),
    ClientKeyExchange(Vec<u8>),
    Finished(Vec<u8>),
    KeyUpdate { update_requested: bool },
    Unknown(u8, Vec<u8>),
}

impl HandshakePayload {
    pub fn typ(&self) -> HandshakeType {
        match self {
            Self::HelloRequest => HandshakeType::HelloRequest,
            Self::ClientHello(_) => HandshakeType::ClientHello,
            Self::ServerHello(_) => HandshakeType::ServerHello,
            Self::NewSessionTicket12(_) | Self::NewSessionTicket13(_) => HandshakeType::NewSessionTicket,
            Self::EncryptedExtensions(_) => HandshakeType::EncryptedExtensions,
            Self::Certificate12(_) | Self::Certificate13(_) => HandshakeType::Certificate,
            Self::ServerKeyExchange(_) => HandshakeType::ServerKeyExchange,
            Self::CertificateRequest12(_) | Self::CertificateRequest13(_) => {
                HandshakeType::CertificateRequest
            }
            Self::ServerHelloDone => HandshakeType::ServerHelloDone,
            Self::CertificateVerify(_) => HandshakeType::CertificateVerify,
            Self::ClientKeyExchange(_) => HandshakeType::ClientKeyExchange,
            Self::Finished(_) => HandshakeType::Finished,
            Self::KeyUpdate { .. } => HandshakeType::KeyUpdate,
            Self::Unknown(typ, _) => HandshakeType::Unknown(*typ),
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Self::HelloRequest | Self::ServerHelloDone => {}
            Self::ClientHello(ch) => ch.encode(out),
            Self::ServerHello(sh) => sh.encode(out),
            Self::NewSessionTicket12(nst) => {
                out.put_u32(nst.lifetime);
                put_vec_u16(out, &nst.ticket);
            }
            Self::NewSessionTicket13(nst) => {
                out.put_u32(nst.lifetime);
                out.put_u32(nst.age_add);
                put_vec_u8(out, &nst.nonce);
                put_vec_u16(out, &nst.ticket);
                encode_extensions(out, &nst.extensions);
            }
            Self::EncryptedExtensions(exts) => encode_extensions(out, exts),
            Self::Certificate12(chain) => put_u24_prefixed(out, |w| {
                for cert in chain {
                    put_vec_u24(w, cert);
                }
            }),
            Self::Certificate13(cert) => {
                put_vec_u8(out, &cert.context);
                put_u24_prefixed(out, |w| {
                    for entry in &cert.entries {
                        put_vec_u24(w, &entry.cert);
                        encode_extensions(w, &entry.extensions);
                    }
                });
            }
            Self::ServerKeyExchange(body) | Self::ClientKeyExchange(body) => out.extend_from_slice(body),
            Self::CertificateRequest12(req) => {
                put_vec_u8(out, &req.certificate_types);
                if !req.schemes.is_empty() {
                    put_u16_prefixed(out, |w| {
                        for s in &req.schemes {
                            w.put_u16(s.to_u16());
                        }
                    });
                }
                put_vec_u16(out, &req.authorities);
            }
            Self::CertificateRequest13(req) => {
                put_vec_u8(out, &req.context);
                encode_extensions(out, &req.extensions);
            }
            Self::CertificateVerify(cv) => {
                if let Some(scheme) = cv.scheme {
                    out.put_u16(scheme.to_u16());
                }
                put_vec_u16(out, &cv.signature);
            }
            Self::Finished(verify_data) => out.extend_from_slice(verify_data),
            Self::KeyUpdate { update_requested } => out.put_u8(u8::from(*update_requested)),
            Self::Unknown(_, body) => out.extend_from_slice(body),
        }
    }
}

/// A handshake message together with its exact wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub payload: HandshakePayload,
    pub raw: Vec<u8>,
}

impl HandshakeMessage {
    pub fn new(payload: HandshakePayload) -> Self {
        let mut body = Vec::new();
        payload.encode_body(&mut body);
        let mut raw = Vec::with_capacity(4 + body.len());
        raw.push(payload.typ().to_u8());
        put_u24(&mut raw, body.len() as u32);
        raw.extend_from_slice(&body);
        Self { payload, raw }
    }

    pub fn typ(&self) -> HandshakeType {
        self.payload.typ()
    }

    /// Decodes one complete message; `version` selects between the TLS 1.3 and legacy
    /// layouts of messages that share a type code.
    pub fn decode(raw: Vec<u8>, version: Option<ProtocolVersion>) -> TlsResult<Self> {
        if raw.len() < 4 {
            return Err(TlsError::decode("short handshake header"));
        }
        let typ = HandshakeType::from_u8(raw[0]);
        let tls13 = version.map(|v| v.is_tls13()).unwrap_or(false);
        let tls12 = version.map(|v| v >= ProtocolVersion::TLS12).unwrap_or(false);
        let mut r = Reader::new(&raw[4..]);
        let payload = match typ {
            HandshakeType::HelloRequest => HandshakePayload::HelloRequest,
            HandshakeType::ClientHello => HandshakePayload::ClientHello(ClientHello::decode(&mut r)?),
            HandshakeType::ServerHello => HandshakePayload::ServerHello(ServerHello::decode(&mut r)?),
            HandshakeType::NewSessionTicket if tls13 => {
                let lifetime = r.u32()?;
                let age_add = r.u32()?;
                let nonce = r.vec_u8()?.to_vec();
                let ticket = r.vec_u16()?.to_vec();
                if ticket.is_empty() {
                    return Err(TlsError::decode("empty session ticket"));
                }
                let mut exts = r.sub_u16()?;
                let mut extensions = Vec::new();
                while !exts.is_empty() {
                    let t = exts.u16()?;
                    let d = exts.vec_u16()?;
                    extensions.push(Extension::decode(t, d, ExtensionContext::NewSessionTicket)?);
                }
                HandshakePayload::NewSessionTicket13(NewSessionTicket13 {
                    lifetime,
                    age_add,
                    nonce,
                    ticket,
                    extensions,
                })
            }
            HandshakeType::NewSessionTicket => HandshakePayload::NewSessionTicket12(NewSessionTicket12 {
                lifetime: r.u32()?,
                ticket: r.vec_u16()?.to_vec(),
            }),
            HandshakeType::EncryptedExtensions => HandshakePayload::EncryptedExtensions(
                decode_required_block(&mut r, ExtensionContext::EncryptedExtensions)?,
            ),
            HandshakeType::Certificate if tls13 => {
                let context = r.vec_u8()?.to_vec();
                let mut list = r.sub_u24()?;
                let mut entries = Vec::new();
                while !list.is_empty() {
                    let cert = list.vec_u24()?.to_vec();
                    let extensions = decode_required_block(&mut list, ExtensionContext::Certificate)?;
                    entries.push(CertificateEntry { cert, extensions });
                }
                HandshakePayload::Certificate13(Certificate13 { context, entries })
            }
            HandshakeType::Certificate => {
                let mut list = r.sub_u24()?;
                let mut chain = Vec::new();
                while !list.is_empty() {
                    chain.push(list.vec_u24()?.to_vec());
                }
                HandshakePayload::Certificate12(chain)
            }
            HandshakeType::ServerKeyExchange => HandshakePayload::ServerKeyExchange(r.rest().to_vec()),
            HandshakeType::CertificateRequest if tls13 => {
                let context = r.vec_u8()?.to_vec();
                let extensions = decode_required_block(&mut r, ExtensionContext::CertificateRequest)?;
                HandshakePayload::CertificateRequest13(CertificateRequest13 { context, extensions })
            }
            HandshakeType::CertificateRequest => {
                let certificate_types = r.vec_u8()?.to_vec();
                let schemes = if tls12 {
                    r.list_u16()?.into_iter().map(SignatureScheme::from_u16).collect()
                } else {
                    Vec::new()
                };
                let authorities = r.vec_u16()?.to_vec();
                HandshakePayload::CertificateRequest12(CertificateRequest12 {
                    certificate_types,
                    schemes,
                    authorities,
                })
            }
            HandshakeType::ServerHelloDone => HandshakePayload::ServerHelloDone,
            HandshakeType::CertificateVerify => {
                let scheme = if tls12 {
                    Some(SignatureScheme::from_u16(r.u16()?))
                } else {
                    None
                };
                let signature = r.vec_u16()?.to_vec();
                HandshakePayload::CertificateVerify(CertificateVerify { scheme, signature })
            }
            HandshakeType::ClientKeyExchange => HandshakePayload::ClientKeyExchange(r.rest().to_vec()),
            HandshakeType::Finished => HandshakePayload::Finished(r.rest().to_vec()),
            HandshakeType::KeyUpdate => match r.u8()? {
                0 => HandshakePayload::KeyUpdate {
                    update_requested: false,
                },
                1 => HandshakePayload::KeyUpdate {
                    update_requested: true,
                },
                other => return Err(TlsError::illegal(format!("KeyUpdate request {other}"))),
            },
            HandshakeType::EndOfEarlyData | HandshakeType::MessageHash | HandshakeType::Unknown(_) => {
                HandshakePayload::Unknown(raw[0], r.rest().to_vec())
            }
        };
        r.expect_empty("handshake message")?;
        Ok(Self { payload, raw })
    }
}

fn decode_required_block(r: &mut Reader<'_>, ctx: ExtensionContext) -> TlsResult<Vec<Extension>> {
    let mut block = r.sub_u16()?;
    let mut out: Vec<Extension> = Vec::new();
    while !block.is_empty() {
        let typ = block.u16()?;
        let data = block.vec_u16()?;
        if out.has_ext(typ) {
            return Err(TlsError::illegal(format!("duplicate extension {typ}")));
        }
        out.push(Extension::decode(typ, data, ctx)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::extensions::{KeyShareEntry, EXT_KEY_SHARE};
    use crate::tls::groups::NamedGroup;

    fn hello() -> ClientHello {
        ClientHello {
            legacy_version: ProtocolVersion::TLS12,
            random: [7; 32],
            session_id: vec![1; 32],
            cipher_suites: vec![0x1301, 0xc02f],
            compression_methods: vec![0],
            extensions: vec![
                Extension::ServerName(Some("front.test".into())),
                Extension::SupportedVersionsOffer(vec![ProtocolVersion::TLS13, ProtocolVersion::TLS12]),
                Extension::KeyShareOffer(vec![KeyShareEntry {
                    group: NamedGroup::X25519,
                    key_exchange: vec![3; 32],
                }]),
            ],
        }
    }

    #[test]
    fn client_hello_keeps_raw_bytes() {
        let msg = HandshakeMessage::new(HandshakePayload::ClientHello(hello()));
        let decoded = HandshakeMessage::decode(msg.raw.clone(), None).unwrap();
        assert_eq!(decoded, msg);
        match decoded.payload {
            HandshakePayload::ClientHello(ch) => {
                assert_eq!(ch.server_name(), Some("front.test"));
                assert!(ch.extensions.has_ext(EXT_KEY_SHARE));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn retry_request_is_detected_by_random() {
        let hrr = ServerHello {
            legacy_version: ProtocolVersion::TLS12,
            random: HRR_RANDOM,
            session_id: vec![],
            cipher_suite: 0x1301,
            compression_method: 0,
            extensions: vec![
                Extension::SupportedVersionSelected(ProtocolVersion::TLS13),
                Extension::KeyShareRetry(NamedGroup::Secp256r1),
            ],
        };
        let msg = HandshakeMessage::new(HandshakePayload::ServerHello(hrr));
        let decoded = HandshakeMessage::decode(msg.raw, None).unwrap();
        match decoded.payload {
            HandshakePayload::ServerHello(sh) => {
                assert!(sh.is_retry_request());
                assert_eq!(sh.version(), ProtocolVersion::TLS13);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn certificate_verify_layout_follows_version() {
        let cv = HandshakePayload::CertificateVerify(CertificateVerify {
            scheme: None,
            signature: vec![1, 2, 3],
        });
        let msg = HandshakeMessage::new(cv);
        assert!(HandshakeMessage::decode(msg.raw.clone(), Some(ProtocolVersion::TLS11)).is_ok());
        assert!(HandshakeMessage::decode(msg.raw, Some(ProtocolVersion::TLS12)).is_err());
    }
}
