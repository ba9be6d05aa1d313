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

//! TLS 1.3 key schedule (RFC 8446 §7): HKDF-Extract/Expand chained from the early
//! secret through the handshake and master secrets.

use crate::tls::prf::HashAlgorithm;

pub fn hkdf_extract(alg: HashAlgorithm, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    alg.hmac(salt, &[ikm])
}

pub fn hkdf_expand(alg: HashAlgorithm, prk: &[u8], info: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut previous: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while out.len() < len {
        previous = alg.hmac(prk, &[&previous, info, &[counter]]);
        let take = (len - out.len()).min(previous.len());
        out.extend_from_slice(&previous[..take]);
        counter = counter.wrapping_add(1);
    }
    out
}

pub fn hkdf_expand_label(
    alg: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    len: usize,
) -> Vec<u8> {
    let mut info = Vec::with_capacity(4 + 6 + label.len() + context.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    hkdf_expand(alg, secret, &info, len)
}

pub fn derive_secret(alg: HashAlgorithm, secret: &[u8], label: &[u8], transcript_hash: &[u8]) -> Vec<u8> {
    hkdf_expand_label(alg, secret, label, transcript_hash, alg.output_len())
}

/// Stage of the schedule currently held in `KeySchedule::secret`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Early,
    Handshake,
    Master,
}

/// Walks early → handshake → master exactly once per handshake.
#[derive(Debug, Clone)]
pub struct KeySchedule {
    alg: HashAlgorithm,
    secret: Vec<u8>,
    stage: Stage,
}

impl KeySchedule {
    pub fn new(alg: HashAlgorithm, psk: Option<&[u8]>) -> Self {
        let zeros = vec![0u8; alg.output_len()];
        let ikm = psk.unwrap_or(&zeros);
        Self {
            alg,
            secret: hkdf_extract(alg, &zeros, ikm),
            stage: Stage::Early,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.alg
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Key used to compute PSK binders (external vs resumption label).
    pub fn binder_key(&self, external: bool) -> Vec<u8> {
        let label: &[u8] = if external { b"ext binder" } else { b"res binder" };
        derive_secret(self.alg, &self.secret, label, &self.alg.hash(&[]))
    }

    fn advance(&mut self, ikm: Option<&[u8]>) {
        let derived = derive_secret(self.alg, &self.secret, b"derived", &self.alg.hash(&[]));
        let zeros = vec![0u8; self.alg.output_len()];
        self.secret = hkdf_extract(self.alg, &derived, ikm.unwrap_or(&zeros));
    }

    /// Mixes in the (EC)DHE shared secret; PSK-only handshakes pass `None`.
    pub fn enter_handshake(&mut self, shared_secret: Option<&[u8]>) {
        debug_assert_eq!(self.stage, Stage::Early);
        self.advance(shared_secret);
        self.stage = Stage::Handshake;
    }

    pub fn enter_master(&mut self) {
        debug_assert_eq!(self.stage, Stage::Handshake);
        self.advance(None);
        self.stage = Stage::Master;
    }

    pub fn derive(&self, label: &[u8], transcript_hash: &[u8]) -> Vec<u8> {
        derive_secret(self.alg, &self.secret, label, transcript_hash)
    }
}

/// Client and server traffic secrets for one epoch.
#[derive(Clone)]
pub struct TrafficSecrets {
    pub client: Vec<u8>,
    pub server: Vec<u8>,
}

impl std::fmt::Debug for TrafficSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TrafficSecrets { .. }")
    }
}

pub fn traffic_key_iv(alg: HashAlgorithm, secret: &[u8], key_len: usize) -> (Vec<u8>, Vec<u8>) {
    (
        hkdf_expand_label(alg, secret, b"key", &[], key_len),
        hkdf_expand_label(alg, secret, b"iv", &[], 12),
    )
}

pub fn finished_verify_data(alg: HashAlgorithm, base_secret: &[u8], transcript_hash: &[u8]) -> Vec<u8> {
    let key = hkdf_expand_label(alg, base_secret, b"finished", &[], alg.output_len());
    alg.hmac(&key, &[transcript_hash])
}

/// `application_traffic_secret_N+1` for KeyUpdate.
pub fn next_traffic_secret(alg: HashAlgorithm, secret: &[u8]) -> Vec<u8> {
    hkdf_expand_label(alg, secret, b"traffic upd", &[], alg.output_len())
}

/// PSK carried by a NewSessionTicket.
pub fn resumption_psk(alg: HashAlgorithm, resumption_master: &[u8], nonce: &[u8]) -> Vec<u8> {
    hkdf_expand_label(alg, resumption_master, b"resumption", nonce, alg.output_len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(data: &[u8]) -> String {
        data.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn early_secret_without_psk_matches_rfc8448() {
        let schedule = KeySchedule::new(HashAlgorithm::Sha256, None);
        assert_eq!(
            hex(&schedule.secret),
            "33ad0a1c607ec03b09e6cd9893680ce210adf300aa1f2660e1b22e10f170f92a"
        );
    }

    #[test]
    fn derived_secret_matches_rfc8448() {
        let schedule = KeySchedule::new(HashAlgorithm::Sha256, None);
        let derived = schedule.derive(b"derived", &HashAlgorithm::Sha256.hash(&[]));
        assert_eq!(
            hex(&derived),
            "6f2615a108c702c5678f54fc9dbab69716c076189c48250cebeac3576c3611ba"
        );
    }

    #[test]
    fn stages_advance_once() {
        let mut schedule = KeySchedule::new(HashAlgorithm::Sha384, Some(&[1u8; 48]));
        let early = schedule.secret.clone();
        schedule.enter_handshake(Some(&[2u8; 32]));
        assert_eq!(schedule.stage(), Stage::Handshake);
        assert_ne!(schedule.secret, early);
        schedule.enter_master();
        assert_eq!(schedule.stage(), Stage::Master);
        assert_eq!(schedule.secret.len(), 48);
    }
}
