/*
 * crypto.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Splintermail, an end-to-end encrypted email service.
 *
 * Splintermail is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Splintermail is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Splintermail.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Device keypair (RSA, PKCS#8 PEM on disk), SHA-256 fingerprints, and the
//! streaming multi-recipient message envelope (RSA-wrapped AES-256-CBC).
//!
//! Envelope format, line oriented:
//!
//! ```text
//! -----BEGIN SPLINTERMAIL MESSAGE-----
//! V:1
//! R:<64-hex fingerprint>:<base64 wrapped key>     (one per recipient)
//! IV:<base64 16 bytes>
//! M:<base64 ciphertext>                           (one or more)
//! -----END SPLINTERMAIL MESSAGE-----
//! ```
//!
//! The decrypter discloses the full recipient list before touching the
//! payload, so peer reconciliation can run even when decryption fails.

use std::fs;
use std::path::Path;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorKind, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of a binary key fingerprint (SHA-256).
pub const FINGERPRINT_LEN: usize = 32;

const BLOCK: usize = 16;
const KEY_LEN: usize = 32;

pub const ENC_HEADER: &str = "-----BEGIN SPLINTERMAIL MESSAGE-----";
const ENC_FOOTER: &str = "-----END SPLINTERMAIL MESSAGE-----";
const ENC_VERSION: &str = "V:1";

/// Fill a buffer with cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// SHA-256 fingerprint of a public key's SPKI DER encoding.
fn fingerprint_of(public: &RsaPublicKey) -> Result<Vec<u8>> {
    let der = public
        .to_public_key_der()
        .map_err(|e| Error::new(ErrorKind::Ssl, format!("encoding public key: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(der.as_bytes());
    Ok(hasher.finalize().to_vec())
}

/// A device keypair with its precomputed fingerprint.
#[derive(Debug)]
pub struct Keypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    pub fingerprint: Vec<u8>,
}

impl Keypair {
    fn from_private(private: RsaPrivateKey) -> Result<Self> {
        let public = RsaPublicKey::from(&private);
        let fingerprint = fingerprint_of(&public)?;
        Ok(Self {
            private,
            public,
            fingerprint,
        })
    }

    /// Load a PKCS#8 PEM private key. `Open` when the file cannot be read,
    /// `Ssl` when the PEM is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let pem = fs::read_to_string(path)
            .map_err(|e| Error::new(ErrorKind::Open, format!("{}: {}", path.display(), e)))?;
        let private = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| Error::new(ErrorKind::Ssl, format!("bad private key PEM: {}", e)))?;
        Self::from_private(private)
    }

    /// Generate a fresh key and write it to `path` (mode 0600 on unix).
    /// `Open` when the file cannot be written.
    pub fn generate(bits: usize, path: &Path) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::new(ErrorKind::Ssl, format!("key generation: {}", e)))?;
        let pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::new(ErrorKind::Ssl, format!("encoding private key: {}", e)))?;
        fs::write(path, pem.as_bytes())
            .map_err(|e| Error::new(ErrorKind::Open, format!("{}: {}", path.display(), e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        }
        Self::from_private(private)
    }

    /// Public half as SPKI PEM, for device registration.
    pub fn public_pem(&self) -> Result<String> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::new(ErrorKind::Ssl, format!("encoding public key: {}", e)))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn hex_fingerprint(&self) -> String {
        hex::encode(&self.fingerprint)
    }
}

/// Streaming envelope encrypter. One instance per message.
pub struct Encrypter {
    enc: Option<Aes256CbcEnc>,
    partial: Vec<u8>,
}

impl Encrypter {
    /// Write the armour header, recipient lines, and IV; ready the cipher.
    pub fn new(recipients: &[(&[u8], &RsaPublicKey)], out: &mut Vec<u8>) -> Result<Self> {
        if recipients.is_empty() {
            return Err(Error::new(ErrorKind::NoKeys, "no recipients"));
        }
        let key = random_bytes(KEY_LEN);
        let iv = random_bytes(BLOCK);

        out.extend_from_slice(ENC_HEADER.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(ENC_VERSION.as_bytes());
        out.push(b'\n');
        for (fpr, public) in recipients {
            let wrapped = public
                .encrypt(&mut OsRng, Pkcs1v15Encrypt, &key)
                .map_err(|e| Error::new(ErrorKind::Ssl, format!("wrapping key: {}", e)))?;
            out.extend_from_slice(
                format!("R:{}:{}\n", hex::encode(fpr), B64.encode(&wrapped)).as_bytes(),
            );
        }
        out.extend_from_slice(format!("IV:{}\n", B64.encode(&iv)).as_bytes());

        let enc = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|_| Error::new(ErrorKind::Internal, "bad cipher key or iv length"))?;
        Ok(Self {
            enc: Some(enc),
            partial: Vec::new(),
        })
    }

    /// Encrypt a chunk of plaintext, emitting an `M:` line for the full
    /// blocks available so far.
    pub fn update(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let enc = self
            .enc
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Internal, "encrypter already finished"))?;
        self.partial.extend_from_slice(chunk);
        let full = self.partial.len() - self.partial.len() % BLOCK;
        if full == 0 {
            return Ok(());
        }
        let mut cipher: Vec<u8> = self.partial.drain(..full).collect();
        for block in cipher.chunks_mut(BLOCK) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(format!("M:{}\n", B64.encode(&cipher)).as_bytes());
        Ok(())
    }

    /// Pad and emit the final block plus the armour footer.
    pub fn finish(mut self, out: &mut Vec<u8>) -> Result<()> {
        let enc = self
            .enc
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Internal, "encrypter already finished"))?;
        let msg_len = self.partial.len();
        let mut buf = vec![0u8; BLOCK];
        buf[..msg_len].copy_from_slice(&self.partial);
        let cipher = enc
            .encrypt_padded_mut::<Pkcs7>(&mut buf, msg_len)
            .map_err(|e| Error::new(ErrorKind::Internal, format!("padding: {}", e)))?;
        out.extend_from_slice(format!("M:{}\n", B64.encode(cipher)).as_bytes());
        out.extend_from_slice(ENC_FOOTER.as_bytes());
        out.push(b'\n');
        Ok(())
    }
}

#[derive(PartialEq)]
enum DecState {
    Header,
    Meta,
    Payload,
    Done,
}

/// Streaming envelope decrypter. Reusable: call `start` per message, then
/// `update` with arbitrary chunks, then `finish`.
///
/// The recipient list survives errors so callers can reconcile peers even
/// for messages that fail to decrypt.
pub struct Decrypter {
    state: DecState,
    private: Option<RsaPrivateKey>,
    fingerprint: Vec<u8>,
    line: Vec<u8>,
    recips: Vec<Vec<u8>>,
    wrapped_for_me: Option<Vec<u8>>,
    dec: Option<Aes256CbcDec>,
    held: Vec<u8>,
}

impl Decrypter {
    pub fn new() -> Self {
        Self {
            state: DecState::Done,
            private: None,
            fingerprint: Vec::new(),
            line: Vec::new(),
            recips: Vec::new(),
            wrapped_for_me: None,
            dec: None,
            held: Vec::new(),
        }
    }

    /// Reset for a new message addressed to `keypair`.
    pub fn start(&mut self, keypair: &Keypair) {
        self.state = DecState::Header;
        self.private = Some(keypair.private.clone());
        self.fingerprint = keypair.fingerprint.clone();
        self.line.clear();
        self.recips.clear();
        self.wrapped_for_me = None;
        self.dec = None;
        self.held.clear();
    }

    /// Recipient fingerprints disclosed by the envelope so far.
    pub fn recipients(&self) -> &[Vec<u8>] {
        &self.recips
    }

    /// Feed a chunk of the armoured message; decrypted plaintext is
    /// appended to `out` as blocks become available.
    pub fn update(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.private.is_none() {
            return Err(Error::new(ErrorKind::NoKeys, "decrypter not started"));
        }
        for &b in chunk {
            if b != b'\n' {
                self.line.push(b);
                continue;
            }
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            let line = std::mem::take(&mut self.line);
            self.handle_line(&line, out)?;
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let text = std::str::from_utf8(line)
            .map_err(|_| Error::new(ErrorKind::Ssl, "non-ascii line in envelope"))?;
        match self.state {
            DecState::Header => {
                if text != ENC_HEADER {
                    return Err(Error::new(ErrorKind::Ssl, "missing envelope header"));
                }
                self.state = DecState::Meta;
                Ok(())
            }
            DecState::Meta => {
                if text == ENC_VERSION {
                    return Ok(());
                }
                if let Some(rest) = text.strip_prefix("R:") {
                    let (hexfpr, wrapped_b64) = rest
                        .split_once(':')
                        .ok_or_else(|| Error::new(ErrorKind::Ssl, "malformed recipient line"))?;
                    let fpr = hex::decode(hexfpr)
                        .map_err(|_| Error::new(ErrorKind::Ssl, "bad fingerprint hex"))?;
                    if fpr.len() != FINGERPRINT_LEN {
                        return Err(Error::new(ErrorKind::Ssl, "wrong-sized fingerprint"));
                    }
                    if fpr == self.fingerprint {
                        let wrapped = B64
                            .decode(wrapped_b64)
                            .map_err(|_| Error::new(ErrorKind::Ssl, "bad wrapped-key base64"))?;
                        self.wrapped_for_me = Some(wrapped);
                    }
                    self.recips.push(fpr);
                    return Ok(());
                }
                if let Some(iv_b64) = text.strip_prefix("IV:") {
                    // recipient list is complete here, before any payload
                    let wrapped = self
                        .wrapped_for_me
                        .take()
                        .ok_or_else(|| Error::new(ErrorKind::Not4Me, "message not for this device"))?;
                    let private = self.private.as_ref().unwrap();
                    let key = private
                        .decrypt(Pkcs1v15Encrypt, &wrapped)
                        .map_err(|_| Error::new(ErrorKind::Ssl, "unwrapping message key"))?;
                    if key.len() != KEY_LEN {
                        return Err(Error::new(ErrorKind::Ssl, "wrong-sized message key"));
                    }
                    let iv = B64
                        .decode(iv_b64)
                        .map_err(|_| Error::new(ErrorKind::Ssl, "bad IV base64"))?;
                    if iv.len() != BLOCK {
                        return Err(Error::new(ErrorKind::Ssl, "wrong-sized IV"));
                    }
                    let dec = Aes256CbcDec::new_from_slices(&key, &iv)
                        .map_err(|_| Error::new(ErrorKind::Ssl, "bad cipher key or iv"))?;
                    self.dec = Some(dec);
                    self.state = DecState::Payload;
                    return Ok(());
                }
                Err(Error::new(ErrorKind::Ssl, "unexpected envelope line"))
            }
            DecState::Payload => {
                if let Some(m_b64) = text.strip_prefix("M:") {
                    let cipher = B64
                        .decode(m_b64)
                        .map_err(|_| Error::new(ErrorKind::Ssl, "bad payload base64"))?;
                    self.held.extend_from_slice(&cipher);
                    // decrypt all full blocks except the last, which may
                    // carry padding and must wait for finish()
                    let full = self.held.len() - self.held.len() % BLOCK;
                    let decryptable = full.saturating_sub(BLOCK);
                    if decryptable > 0 {
                        let dec = self.dec.as_mut().unwrap();
                        let mut plain: Vec<u8> = self.held.drain(..decryptable).collect();
                        for block in plain.chunks_mut(BLOCK) {
                            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
                        }
                        out.extend_from_slice(&plain);
                    }
                    return Ok(());
                }
                if text == ENC_FOOTER {
                    self.state = DecState::Done;
                    return Ok(());
                }
                Err(Error::new(ErrorKind::Ssl, "unexpected payload line"))
            }
            DecState::Done => {
                if text.is_empty() {
                    Ok(())
                } else {
                    Err(Error::new(ErrorKind::Ssl, "data after envelope footer"))
                }
            }
        }
    }

    /// Decrypt the held-back final block, strip padding, verify the
    /// envelope was complete.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.state != DecState::Done {
            return Err(Error::new(ErrorKind::Ssl, "truncated envelope"));
        }
        let dec = self
            .dec
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Ssl, "envelope had no payload"))?;
        if self.held.is_empty() || self.held.len() % BLOCK != 0 {
            return Err(Error::new(ErrorKind::Ssl, "ciphertext not block-aligned"));
        }
        let mut tail = std::mem::take(&mut self.held);
        let plain = dec
            .decrypt_padded_mut::<Pkcs7>(&mut tail)
            .map_err(|_| Error::new(ErrorKind::Ssl, "bad message padding"))?;
        out.extend_from_slice(plain);
        self.private = None;
        Ok(())
    }
}

impl Default for Decrypter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair(dir: &Path, name: &str) -> Keypair {
        Keypair::generate(512, &dir.join(name)).unwrap()
    }

    fn encrypt_to(recips: &[&Keypair], plain: &[u8]) -> Vec<u8> {
        let pairs: Vec<(&[u8], &RsaPublicKey)> = recips
            .iter()
            .map(|k| (k.fingerprint.as_slice(), k.public_key()))
            .collect();
        let mut out = Vec::new();
        let mut enc = Encrypter::new(&pairs, &mut out).unwrap();
        for chunk in plain.chunks(100) {
            enc.update(chunk, &mut out).unwrap();
        }
        enc.finish(&mut out).unwrap();
        out
    }

    fn decrypt_with(kp: &Keypair, wire: &[u8]) -> Result<Vec<u8>> {
        let mut dc = Decrypter::new();
        dc.start(kp);
        let mut out = Vec::new();
        for chunk in wire.chunks(7) {
            dc.update(chunk, &mut out)?;
        }
        dc.finish(&mut out)?;
        Ok(out)
    }

    #[test]
    fn keypair_load_generate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.pem");
        let kp = Keypair::generate(512, &path).unwrap();
        let kp2 = Keypair::load(&path).unwrap();
        assert_eq!(kp.fingerprint, kp2.fingerprint);
        assert_eq!(kp.fingerprint.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn load_missing_key_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let e = Keypair::load(&dir.path().join("nope.pem")).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Open);
    }

    #[test]
    fn load_garbage_key_is_ssl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.pem");
        fs::write(&path, "not a pem").unwrap();
        let e = Keypair::load(&path).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Ssl);
    }

    #[test]
    fn envelope_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kp = test_keypair(dir.path(), "a.pem");
        let plain = b"Subject: hello\r\n\r\nsome body text that spans\r\nmore than one block of aes\r\n";
        let wire = encrypt_to(&[&kp], plain);
        assert!(wire.starts_with(ENC_HEADER.as_bytes()));
        let got = decrypt_with(&kp, &wire).unwrap();
        assert_eq!(got, plain);
    }

    #[test]
    fn envelope_multi_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let a = test_keypair(dir.path(), "a.pem");
        let b = test_keypair(dir.path(), "b.pem");
        let wire = encrypt_to(&[&a, &b], b"shared");
        assert_eq!(decrypt_with(&a, &wire).unwrap(), b"shared");
        assert_eq!(decrypt_with(&b, &wire).unwrap(), b"shared");
    }

    #[test]
    fn not_for_me_discloses_recipients() {
        let dir = tempfile::tempdir().unwrap();
        let theirs = test_keypair(dir.path(), "a.pem");
        let ours = test_keypair(dir.path(), "b.pem");
        let wire = encrypt_to(&[&theirs], b"secret");

        let mut dc = Decrypter::new();
        dc.start(&ours);
        let mut out = Vec::new();
        let err = dc.update(&wire, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Not4Me);
        assert_eq!(dc.recipients(), &[theirs.fingerprint.clone()]);
    }

    #[test]
    fn corrupted_envelope_is_ssl() {
        let dir = tempfile::tempdir().unwrap();
        let kp = test_keypair(dir.path(), "a.pem");
        let mut wire = Vec::new();
        wire.extend_from_slice(ENC_HEADER.as_bytes());
        wire.extend_from_slice(b"\nthis is garbage\n");

        let mut dc = Decrypter::new();
        dc.start(&kp);
        let mut out = Vec::new();
        let err = dc.update(&wire, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Ssl);
    }

    #[test]
    fn truncated_envelope_is_ssl() {
        let dir = tempfile::tempdir().unwrap();
        let kp = test_keypair(dir.path(), "a.pem");
        let wire = encrypt_to(&[&kp], b"cut short");
        let cut = &wire[..wire.len() / 2];

        let mut dc = Decrypter::new();
        dc.start(&kp);
        let mut out = Vec::new();
        let result = dc.update(cut, &mut out).and_then(|_| dc.finish(&mut out));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Ssl);
    }
}
