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

use std::{fs, net::IpAddr, sync::Arc};

use front_transport::{
    config::FrontConfig,
    tls::{ClientSessionStore, ProtocolVersion},
};

const FRONT: &str = r#"
[front]
sni = ["a.front.test", "b.front.test"]
host = "origin.test"
"#;

#[test]
fn load_resolves_ip_list_beside_config() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("ips.txt"),
        "# fleet\n192.0.2.7\n\n192.0.2.3  # secondary\n192.0.2.7\n",
    )
    .unwrap();
    let cfg_path = dir.path().join("front.toml");
    fs::write(&cfg_path, format!("{FRONT}ips = [\"192.0.2.1\"]\nip_list_path = \"ips.txt\"\n")).unwrap();

    let cfg = FrontConfig::load(&cfg_path).unwrap();
    assert_eq!(cfg.front.ip_list_path.as_deref(), Some(dir.path().join("ips.txt").as_path()));

    let ips = cfg.candidate_ips().unwrap();
    let expected: Vec<IpAddr> = ["192.0.2.1", "192.0.2.3", "192.0.2.7"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
    assert_eq!(ips, expected);
}

#[test]
fn defaults_and_legacy_key_names() {
    let cfg: FrontConfig = toml::from_str(&format!(
        "{FRONT}ips = [\"192.0.2.1\"]\n[dispatcher]\ndispather_max_workers = 12\ndispather_work_max_score = 4.5\n"
    ))
    .unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.dispatcher.max_workers, 12);
    assert_eq!(cfg.dispatcher.work_max_score, 4.5);
    assert_eq!(cfg.front.port, 443);
    assert!(cfg.tls.tls12 && cfg.tls.tls13);
    assert!(!cfg.tls.ssl3);
}

#[test]
fn validate_rejects_inconsistent_settings() {
    let missing_ips: FrontConfig = toml::from_str(FRONT).unwrap();
    assert!(missing_ips.validate().is_err());

    let inverted: FrontConfig = toml::from_str(&format!(
        "{FRONT}ips = [\"192.0.2.1\"]\n[dispatcher]\nmin_workers = 9\nmax_workers = 3\n"
    ))
    .unwrap();
    let err = inverted.validate().unwrap_err().to_string();
    assert!(err.contains("min_workers"), "{err}");

    let bad_fraction: FrontConfig = toml::from_str(&format!(
        "{FRONT}ips = [\"192.0.2.1\"]\n[http2]\nwindow_update_fraction = 0.0\n"
    ))
    .unwrap();
    assert!(bad_fraction.validate().is_err());
}

#[test]
fn malformed_candidate_is_reported() {
    let cfg: FrontConfig = toml::from_str(&format!("{FRONT}ips = [\"not-an-ip\"]\n")).unwrap();
    let err = format!("{:#}", cfg.candidate_ips().unwrap_err());
    assert!(err.contains("not-an-ip"), "{err}");
}

#[test]
fn tls_settings_build_client_config() {
    let cfg: FrontConfig = toml::from_str(&format!(
        "{FRONT}ips = [\"192.0.2.1\"]\n[tls]\ntls13 = false\nciphers = [\"TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256\"]\ngroups = [\"x25519\"]\n"
    ))
    .unwrap();
    let client = cfg
        .tls
        .client_config(&cfg.front.alpn, Arc::new(ClientSessionStore::new()))
        .unwrap();
    assert_eq!(client.versions.max, ProtocolVersion::TLS12);
    assert_eq!(client.cipher_suites.len(), 1);
    assert!(client.sessions.is_some());
}

#[test]
fn unknown_names_and_empty_version_set_fail() {
    let unknown: FrontConfig = toml::from_str(&format!(
        "{FRONT}ips = [\"192.0.2.1\"]\n[tls]\nciphers = [\"TLS_MADE_UP\"]\n"
    ))
    .unwrap();
    let err = format!(
        "{:#}",
        unknown
            .tls
            .client_config(&[], Arc::new(ClientSessionStore::new()))
            .unwrap_err()
    );
    assert!(err.contains("TLS_MADE_UP"), "{err}");

    let none: FrontConfig = toml::from_str(&format!(
        "{FRONT}ips = [\"192.0.2.1\"]\n[tls]\ntls12 = false\ntls13 = false\n"
    ))
    .unwrap();
    assert!(none.tls.version_range().is_err());

    let bad_pin: FrontConfig = toml::from_str(&format!(
        "{FRONT}ips = [\"192.0.2.1\"]\n[[tls.pins]]\nsha256 = \"abcd\"\nkey_type = \"ed25519\"\npublic_key = \"00\"\n"
    ))
    .unwrap();
    assert!(bad_pin.tls.verifier().is_err());
}
