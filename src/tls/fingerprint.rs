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

use md5::{Digest, Md5};

use crate::tls::{extensions::Extension, messages::ClientHello};

/// GREASE values (RFC 8701) are `0x?a?a` with both bytes equal.
fn is_grease(value: u16) -> bool {
    (value & 0x0f0f) == 0x0a0a && (value >> 8) == (value & 0xff)
}

/// JA3 component string (version,ciphers,extensions,curves,formats).
pub fn ja3_string(hello: &ClientHello) -> String {
    let ciphers: Vec<u16> = hello
        .cipher_suites
        .iter()
        .copied()
        .filter(|c| !is_grease(*c))
        .collect();
    let extensions: Vec<u16> = hello
        .extensions
        .iter()
        .map(Extension::typ)
        .filter(|t| !is_grease(*t))
        .collect();
    let curves: Vec<u16> = hello
        .groups()
        .iter()
        .map(|g| g.to_u16())
        .filter(|g| !is_grease(*g))
        .collect();
    let formats = hello
        .extensions
        .iter()
        .find_map(|e| match e {
            Extension::EcPointFormats(f) => Some(f.as_slice()),
            _ => None,
        })
        .unwrap_or(&[]);

    format!(
        "{},{},{},{},{}",
        hello.legacy_version.0,
        join_u16(&ciphers),
        join_u16(&extensions),
        join_u16(&curves),
        join_u8(formats),
    )
}

/// JA3 hash of the ClientHello this side puts on the wire.
pub fn calculate_ja3(hello: &ClientHello) -> String {
    let mut hasher = Md5::new();
    hasher.update(ja3_string(hello).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn join_u16(values: &[u16]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

fn join_u8(values: &[u8]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn validate_profile(hello: &ClientHello, expected: &str) -> bool {
    calculate_ja3(hello).eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{groups::NamedGroup, suites::ProtocolVersion};

    fn hello() -> ClientHello {
        ClientHello {
            legacy_version: ProtocolVersion::TLS12,
            random: [0; 32],
            session_id: vec![],
            cipher_suites: vec![0x0a0a, 0x1301, 0xc02f],
            compression_methods: vec![0],
            extensions: vec![
                Extension::Unknown {
                    typ: 0x1a1a,
                    data: vec![],
                },
                Extension::ServerName(Some("a.test".into())),
                Extension::SupportedGroups(vec![NamedGroup::Unknown(0x2a2a), NamedGroup::X25519]),
                Extension::EcPointFormats(vec![0]),
            ],
        }
    }

    #[test]
    fn grease_values_are_skipped() {
        assert_eq!(ja3_string(&hello()), "771,4865-49199,0-10-11,29,0");
    }

    #[test]
    fn profile_validation_compares_hashes() {
        let hash = calculate_ja3(&hello());
        assert_eq!(hash.len(), 32);
        assert!(validate_profile(&hello(), &hash.to_uppercase()));
        assert!(!validate_profile(&hello(), "00000000000000000000000000000000"));
    }
}
