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

//! Per-direction record protection: AEAD for TLS 1.2/1.3, AES-CBC with HMAC (or the
//! SSL 3.0 MAC) for the legacy suites.
//!
//! **Failure mode:**
//! Every authentication failure (tag, MAC, padding, length) collapses to a single
//! `bad_record_mac` so a peer cannot tell which check tripped.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use subtle::ConstantTimeEq;

use crate::{
    tls::{
        alert::AlertDescription,
        prf::HashAlgorithm,
        schedule::traffic_key_iv,
        suites::{BulkCipher, CipherSuite, MacAlgorithm, ProtocolVersion},
    },
    utils::{TlsError, TlsResult},
};

const CONTENT_APPLICATION_DATA: u8 = 23;
const AES_BLOCK: usize = 16;

fn bad_record_mac() -> TlsError {
    TlsError::alert(AlertDescription::BadRecordMac, "record authentication failed")
}

fn aead_algorithm(bulk: BulkCipher) -> TlsResult<&'static aead::Algorithm> {
    match bulk {
        BulkCipher::Aes128Gcm => Ok(&aead::AES_128_GCM),
        BulkCipher::Aes256Gcm => Ok(&aead::AES_256_GCM),
        BulkCipher::ChaCha20Poly1305 => Ok(&aead::CHACHA20_POLY1305),
        other => Err(TlsError::internal(format!("{other:?} is not an AEAD"))),
    }
}

fn aead_key(bulk: BulkCipher, key: &[u8]) -> TlsResult<LessSafeKey> {
    let unbound = UnboundKey::new(aead_algorithm(bulk)?, key)
        .map_err(|_| TlsError::internal("bad AEAD key length"))?;
    Ok(LessSafeKey::new(unbound))
}

fn xor_nonce(iv: &[u8], seq: u64) -> TlsResult<Nonce> {
    let mut nonce = [0u8; 12];
    if iv.len() != 12 {
        return Err(TlsError::internal("AEAD IV must be 12 bytes"));
    }
    nonce.copy_from_slice(iv);
    for (n, s) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
        *n ^= s;
    }
    Ok(Nonce::assume_unique_for_key(nonce))
}

/// Key material for one direction, cut from the TLS ≤1.2 key block.
#[derive(Clone)]
pub struct DirectionKeys {
    pub mac_key: Vec<u8>,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DirectionKeys { .. }")
    }
}

/// Splits a key block into `(client_write, server_write)` keys.
pub fn split_key_block(suite: &CipherSuite, block: &[u8]) -> TlsResult<(DirectionKeys, DirectionKeys)> {
    let mac = suite.mac.key_len();
    let key = suite.bulk.key_len();
    let iv = suite.bulk.fixed_iv_len();
    if block.len() < 2 * (mac + key + iv) {
        return Err(TlsError::internal("key block too short"));
    }
    let mut at = 0;
    let mut cut = |len: usize| {
        let out = block[at..at + len].to_vec();
        at += len;
        out
    };
    let client_mac = cut(mac);
    let server_mac = cut(mac);
    let client_key = cut(key);
    let server_key = cut(key);
    let client_iv = cut(iv);
    let server_iv = cut(iv);
    Ok((
        DirectionKeys {
            mac_key: client_mac,
            key: client_key,
            iv: client_iv,
        },
        DirectionKeys {
            mac_key: server_mac,
            key: server_key,
            iv: server_iv,
        },
    ))
}

pub fn key_block_len(suite: &CipherSuite) -> usize {
    2 * (suite.mac.key_len() + suite.bulk.key_len() + suite.bulk.fixed_iv_len())
}

pub struct Aead12 {
    bulk: BulkCipher,
    key: LessSafeKey,
    iv: Vec<u8>,
    seq: u64,
}

pub struct Aead13 {
    key: LessSafeKey,
    iv: Vec<u8>,
    seq: u64,
}

pub struct Cbc {
    bulk: BulkCipher,
    mac: MacAlgorithm,
    mac_key: Vec<u8>,
    key: Vec<u8>,
    /// Chained IV for SSL 3.0 / TLS 1.0; unused with explicit IVs.
    iv: Vec<u8>,
    encrypt_then_mac: bool,
    seq: u64,
}

/// Protection state of one traffic direction.
pub enum RecordProtection {
    Null,
    Aead12(Aead12),
    Aead13(Aead13),
    Cbc(Cbc),
}

impl std::fmt::Debug for RecordProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordProtection::Null => "Null",
            RecordProtection::Aead12(_) => "Aead12",
            RecordProtection::Aead13(_) => "Aead13",
            RecordProtection::Cbc(_) => "Cbc",
        };
        write!(f, "RecordProtection::{name}")
    }
}

fn next_seq(seq: &mut u64) -> TlsResult<u64> {
    let current = *seq;
    *seq = seq
        .checked_add(1)
        .ok_or_else(|| TlsError::internal("record sequence number exhausted"))?;
    Ok(current)
}

impl RecordProtection {
    /// TLS 1.3 traffic protection derived from a traffic secret.
    pub fn tls13(suite: &CipherSuite, secret: &[u8]) -> TlsResult<Self> {
        let (key, iv) = traffic_key_iv(suite.hash, secret, suite.bulk.key_len());
        Ok(RecordProtection::Aead13(Aead13 {
            key: aead_key(suite.bulk, &key)?,
            iv,
            seq: 0,
        }))
    }

    /// TLS ≤1.2 protection for one direction of the key block.
    pub fn legacy(suite: &CipherSuite, keys: &DirectionKeys, encrypt_then_mac: bool) -> TlsResult<Self> {
        if suite.bulk.is_aead() {
            return Ok(RecordProtection::Aead12(Aead12 {
                bulk: suite.bulk,
                key: aead_key(suite.bulk, &keys.key)?,
                iv: keys.iv.clone(),
                seq: 0,
            }));
        }
        Ok(RecordProtection::Cbc(Cbc {
            bulk: suite.bulk,
            mac: suite.mac,
            mac_key: keys.mac_key.clone(),
            key: keys.key.clone(),
            iv: keys.iv.clone(),
            encrypt_then_mac,
            seq: 0,
        }))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RecordProtection::Null)
    }

    /// Upper bound on bytes added to a plaintext fragment.
    pub fn overhead(&self) -> usize {
        match self {
            RecordProtection::Null => 0,
            RecordProtection::Aead12(a) => match a.bulk {
                BulkCipher::ChaCha20Poly1305 => 16,
                _ => 8 + 16,
            },
            RecordProtection::Aead13(_) => 1 + 16,
            RecordProtection::Cbc(c) => AES_BLOCK + c.mac.key_len() + AES_BLOCK,
        }
    }

    /// Protects one fragment; returns the outer content type and record body.
    pub fn encrypt(&mut self, typ: u8, version: ProtocolVersion, plain: &[u8]) -> TlsResult<(u8, Vec<u8>)> {
        match self {
            RecordProtection::Null => Ok((typ, plain.to_vec())),
            RecordProtection::Aead12(state) => {
                let seq = next_seq(&mut state.seq)?;
                let aad = aad12(seq, typ, version, plain.len());
                let (nonce, mut out) = match state.bulk {
                    BulkCipher::ChaCha20Poly1305 => (xor_nonce(&state.iv, seq)?, Vec::new()),
                    _ => {
                        let mut n = [0u8; 12];
                        n[..4].copy_from_slice(&state.iv[..4]);
                        n[4..].copy_from_slice(&seq.to_be_bytes());
                        (Nonce::assume_unique_for_key(n), seq.to_be_bytes().to_vec())
                    }
                };
                let mut sealed = plain.to_vec();
                state
                    .key
                    .seal_in_place_append_tag(nonce, Aad::from(aad), &mut sealed)
                    .map_err(|_| TlsError::internal("AEAD seal failed"))?;
                out.extend_from_slice(&sealed);
                Ok((typ, out))
            }
            RecordProtection::Aead13(state) => {
                let seq = next_seq(&mut state.seq)?;
                let mut inner = Vec::with_capacity(plain.len() + 17);
                inner.extend_from_slice(plain);
                inner.push(typ);
                let total = inner.len() + 16;
                let aad = [
                    CONTENT_APPLICATION_DATA,
                    0x03,
                    0x03,
                    (total >> 8) as u8,
                    total as u8,
                ];
                state
                    .key
                    .seal_in_place_append_tag(xor_nonce(&state.iv, seq)?, Aad::from(aad), &mut inner)
                    .map_err(|_| TlsError::internal("AEAD seal failed"))?;
                Ok((CONTENT_APPLICATION_DATA, inner))
            }
            RecordProtection::Cbc(state) => state.encrypt(typ, version, plain).map(|out| (typ, out)),
        }
    }

    /// Removes protection; returns the inner content type and plaintext.
    pub fn decrypt(&mut self, typ: u8, version: ProtocolVersion, body: &[u8]) -> TlsResult<(u8, Vec<u8>)> {
        match self {
            RecordProtection::Null => Ok((typ, body.to_vec())),
            RecordProtection::Aead12(state) => {
                let seq = next_seq(&mut state.seq)?;
                let (nonce, sealed) = match state.bulk {
                    BulkCipher::ChaCha20Poly1305 => (xor_nonce(&state.iv, seq)?, body),
                    _ => {
                        if body.len() < 8 + 16 {
                            return Err(bad_record_mac());
                        }
                        let mut n = [0u8; 12];
                        n[..4].copy_from_slice(&state.iv[..4]);
                        n[4..].copy_from_slice(&body[..8]);
                        (Nonce::assume_unique_for_key(n), &body[8..])
                    }
                };
                if sealed.len() < 16 {
                    return Err(bad_record_mac());
                }
                let aad = aad12(seq, typ, version, sealed.len() - 16);
                let mut buf = sealed.to_vec();
                let len = state
                    .key
                    .open_in_place(nonce, Aad::from(aad), &mut buf)
                    .map_err(|_| bad_record_mac())?
                    .len();
                buf.truncate(len);
                Ok((typ, buf))
            }
            RecordProtection::Aead13(state) => {
                if typ != CONTENT_APPLICATION_DATA {
                    return Err(TlsError::unexpected(format!(
                        "protected record with outer type {typ}"
                    )));
                }
                let seq = next_seq(&mut state.seq)?;
                let total = body.len();
                let aad = [
                    CONTENT_APPLICATION_DATA,
                    0x03,
                    0x03,
                    (total >> 8) as u8,
                    total as u8,
                ];
                let mut buf = body.to_vec();
                let len = state
                    .key
                    .open_in_place(xor_nonce(&state.iv, seq)?, Aad::from(aad), &mut buf)
                    .map_err(|_| bad_record_mac())?
                    .len();
                buf.truncate(len);
                while buf.last() == Some(&0) {
                    buf.pop();
                }
                let inner = buf
                    .pop()
                    .ok_or_else(|| TlsError::unexpected("protected record without content type"))?;
                Ok((inner, buf))
            }
            RecordProtection::Cbc(state) => state.decrypt(typ, version, body).map(|out| (typ, out)),
        }
    }
}

fn aad12(seq: u64, typ: u8, version: ProtocolVersion, len: usize) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&seq.to_be_bytes());
    aad[8] = typ;
    aad[9..11].copy_from_slice(&version.0.to_be_bytes());
    aad[11..13].copy_from_slice(&(len as u16).to_be_bytes());
    aad
}

impl Cbc {
    fn hash(&self) -> HashAlgorithm {
        match self.mac {
            MacAlgorithm::Sha256 => HashAlgorithm::Sha256,
            _ => HashAlgorithm::Sha1,
        }
    }

    fn mac(&self, seq: u64, typ: u8, version: ProtocolVersion, data: &[u8]) -> Vec<u8> {
        let hash = self.hash();
        let seq = seq.to_be_bytes();
        let len = (data.len() as u16).to_be_bytes();
        if version.is_ssl3() {
            let pad_len = if hash == HashAlgorithm::Sha1 { 40 } else { 48 };
            let inner = hash.hash_parts(&[
                &self.mac_key,
                &vec![0x36u8; pad_len],
                &seq,
                &[typ],
                &len,
                data,
            ]);
            return hash.hash_parts(&[&self.mac_key, &vec![0x5cu8; pad_len], &inner]);
        }
        let ver = version.0.to_be_bytes();
        hash.hmac(&self.mac_key, &[&seq, &[typ], &ver, &len, data])
    }

    fn explicit_iv(version: ProtocolVersion) -> bool {
        version >= ProtocolVersion::TLS11
    }

    fn pad(&self, version: ProtocolVersion, data: &mut Vec<u8>) {
        let pad_len = AES_BLOCK - 1 - (data.len() % AES_BLOCK);
        if version.is_ssl3() {
            let mut filler = vec![0u8; pad_len];
            rand::thread_rng().fill_bytes(&mut filler);
            data.extend_from_slice(&filler);
        } else {
            data.extend(std::iter::repeat(pad_len as u8).take(pad_len));
        }
        data.push(pad_len as u8);
    }

    fn block_encrypt(&self, iv: &[u8], data: &[u8]) -> TlsResult<Vec<u8>> {
        let out = match self.bulk {
            BulkCipher::Aes128Cbc => cbc::Encryptor::<aes::Aes128>::new_from_slices(&self.key, iv)
                .map_err(|_| TlsError::internal("bad CBC key"))?
                .encrypt_padded_vec_mut::<NoPadding>(data),
            _ => cbc::Encryptor::<aes::Aes256>::new_from_slices(&self.key, iv)
                .map_err(|_| TlsError::internal("bad CBC key"))?
                .encrypt_padded_vec_mut::<NoPadding>(data),
        };
        Ok(out)
    }

    fn block_decrypt(&self, iv: &[u8], data: &[u8]) -> TlsResult<Vec<u8>> {
        match self.bulk {
            BulkCipher::Aes128Cbc => cbc::Decryptor::<aes::Aes128>::new_from_slices(&self.key, iv)
                .map_err(|_| TlsError::internal("bad CBC key"))?
                .decrypt_padded_vec_mut::<NoPadding>(data)
                .map_err(|_| bad_record_mac()),
            _ => cbc::Decryptor::<aes::Aes256>::new_from_slices(&self.key, iv)
                .map_err(|_| TlsError::internal("bad CBC key"))?
                .decrypt_padded_vec_mut::<NoPadding>(data)
                .map_err(|_| bad_record_mac()),
        }
    }

    /// Encrypts with the next IV: fresh random (explicit) or the chained one.
    fn encrypt_blocks(&mut self, version: ProtocolVersion, data: &[u8]) -> TlsResult<Vec<u8>> {
        if Self::explicit_iv(version) {
            let mut iv = [0u8; AES_BLOCK];
            rand::thread_rng().fill_bytes(&mut iv);
            let mut out = iv.to_vec();
            out.extend(self.block_encrypt(&iv, data)?);
            Ok(out)
        } else {
            let iv = self.iv.clone();
            let out = self.block_encrypt(&iv, data)?;
            self.iv = out[out.len() - AES_BLOCK..].to_vec();
            Ok(out)
        }
    }

    fn decrypt_blocks(&mut self, version: ProtocolVersion, body: &[u8]) -> TlsResult<Vec<u8>> {
        if body.is_empty() || body.len() % AES_BLOCK != 0 {
            return Err(bad_record_mac());
        }
        if Self::explicit_iv(version) {
            if body.len() < 2 * AES_BLOCK {
                return Err(bad_record_mac());
            }
            self.block_decrypt(&body[..AES_BLOCK], &body[AES_BLOCK..])
        } else {
            let iv = std::mem::replace(&mut self.iv, body[body.len() - AES_BLOCK..].to_vec());
            self.block_decrypt(&iv, body)
        }
    }

    /// Strips padding; returns the unpadded length and whether the padding was valid.
    fn unpad(version: ProtocolVersion, data: &[u8], min_len: usize) -> (usize, bool) {
        let Some(&last) = data.last() else {
            return (0, false);
        };
        let pad_len = last as usize + 1;
        if pad_len + min_len > data.len() {
            return (data.len().saturating_sub(1), false);
        }
        if version.is_ssl3() {
            return (data.len() - pad_len, pad_len <= AES_BLOCK);
        }
        let mut good = 1u8;
        for b in &data[data.len() - pad_len..] {
            good &= b.ct_eq(&last).unwrap_u8();
        }
        (data.len() - pad_len, good == 1)
    }

    fn encrypt(&mut self, typ: u8, version: ProtocolVersion, plain: &[u8]) -> TlsResult<Vec<u8>> {
        let seq = next_seq(&mut self.seq)?;
        if self.encrypt_then_mac {
            let mut data = plain.to_vec();
            self.pad(version, &mut data);
            let mut out = self.encrypt_blocks(version, &data)?;
            let tag = self.mac(seq, typ, version, &out);
            out.extend(tag);
            return Ok(out);
        }
        let mut data = plain.to_vec();
        data.extend(self.mac(seq, typ, version, plain));
        self.pad(version, &mut data);
        self.encrypt_blocks(version, &data)
    }

    fn decrypt(&mut self, typ: u8, version: ProtocolVersion, body: &[u8]) -> TlsResult<Vec<u8>> {
        let seq = next_seq(&mut self.seq)?;
        let mac_len = self.hash().output_len();
        if self.encrypt_then_mac {
            if body.len() < mac_len {
                return Err(bad_record_mac());
            }
            let (cipher, tag) = body.split_at(body.len() - mac_len);
            let expected = self.mac(seq, typ, version, cipher);
            if expected.ct_eq(tag).unwrap_u8() != 1 {
                return Err(bad_record_mac());
            }
            let data = self.decrypt_blocks(version, cipher)?;
            let (len, ok) = Self::unpad(version, &data, 0);
            if !ok {
                return Err(bad_record_mac());
            }
            return Ok(data[..len].to_vec());
        }
        let data = self.decrypt_blocks(version, body)?;
        let (len, pad_ok) = Self::unpad(version, &data, mac_len);
        // Compute the MAC even when padding is bad to keep timing uniform.
        let content_len = len.saturating_sub(mac_len);
        let (content, tag) = data[..len.max(content_len)].split_at(content_len);
        let expected = self.mac(seq, typ, version, content);
        let mac_ok = tag.len() == mac_len && expected.ct_eq(tag).unwrap_u8() == 1;
        if !(pad_ok & mac_ok) {
            return Err(bad_record_mac());
        }
        Ok(content.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::suites::lookup_suite;

    fn pair(suite_id: u16, version: ProtocolVersion, etm: bool) -> (RecordProtection, RecordProtection) {
        let suite = lookup_suite(suite_id).unwrap();
        if suite.is_tls13() {
            let secret = vec![5u8; suite.hash.output_len()];
            return (
                RecordProtection::tls13(suite, &secret).unwrap(),
                RecordProtection::tls13(suite, &secret).unwrap(),
            );
        }
        let block: Vec<u8> = (0..key_block_len(suite)).map(|i| i as u8).collect();
        let (client, _) = split_key_block(suite, &block).unwrap();
        let _ = version;
        (
            RecordProtection::legacy(suite, &client, etm).unwrap(),
            RecordProtection::legacy(suite, &client, etm).unwrap(),
        )
    }

    #[test]
    fn every_protection_round_trips() {
        let cases = [
            (0x1301, ProtocolVersion::TLS13, false),
            (0x1303, ProtocolVersion::TLS13, false),
            (0xc02f, ProtocolVersion::TLS12, false),
            (0xcca8, ProtocolVersion::TLS12, false),
            (0x002f, ProtocolVersion::TLS12, false),
            (0x002f, ProtocolVersion::TLS12, true),
            (0x0035, ProtocolVersion::TLS10, false),
            (0x002f, ProtocolVersion::SSL3, false),
        ];
        for (id, version, etm) in cases {
            let (mut tx, mut rx) = pair(id, version, etm);
            for msg in [&b"first record"[..], b"", &[0xab; 300]] {
                let (outer, body) = tx.encrypt(22, version, msg).unwrap();
                let (inner, plain) = rx.decrypt(outer, version, &body).unwrap();
                assert_eq!(inner, 22, "suite {id:04x}");
                assert_eq!(plain, msg, "suite {id:04x}");
            }
        }
    }

    #[test]
    fn tampering_is_bad_record_mac() {
        for (id, version, etm) in [
            (0x1301, ProtocolVersion::TLS13, false),
            (0xc02f, ProtocolVersion::TLS12, false),
            (0x002f, ProtocolVersion::TLS11, false),
            (0x002f, ProtocolVersion::TLS12, true),
        ] {
            let (mut tx, mut rx) = pair(id, version, etm);
            let (outer, mut body) = tx.encrypt(23, version, b"payload bytes").unwrap();
            let last = body.len() - 1;
            body[last] ^= 1;
            let err = rx.decrypt(outer, version, &body).unwrap_err();
            assert_eq!(err.local_alert(), Some(AlertDescription::BadRecordMac), "suite {id:04x}");
        }
    }

    #[test]
    fn tls13_hides_inner_type() {
        let (mut tx, _) = pair(0x1301, ProtocolVersion::TLS13, false);
        let (outer, _) = tx.encrypt(21, ProtocolVersion::TLS13, &[1, 0]).unwrap();
        assert_eq!(outer, CONTENT_APPLICATION_DATA);
    }
}
