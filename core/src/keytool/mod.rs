/*
 * mod.rs
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

//! Device key and peer list lifecycle: load-or-generate the device
//! keypair, reconcile the local peer list against the account's device
//! list, and decrypt incoming envelopes while watching their recipient
//! sets for peers we have not seen (or peers that have disappeared).

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::api::ApiClient;
use crate::crypto::{Decrypter, Keypair, FINGERPRINT_LEN};
use crate::error::{Error, ErrorKind, Result};

pub const DEFAULT_KEY_BITS: usize = 4096;

const DEVICE_PEM: &str = "device.pem";
const PEER_LIST_JSON: &str = "peer_list.json";

const DECRYPT_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerListState {
    /// No peer list on file.
    New,
    /// Loaded from disk.
    Old,
}

pub struct KeyTool {
    dir: PathBuf,
    pub key: Keypair,
    pub peer_list: Vec<Vec<u8>>,
    pub peer_list_state: PeerListState,
    pub new_peers: Vec<Vec<u8>>,
    pub did_key_gen: bool,
    pub found_expired_peer: bool,
    decrypter: Decrypter,
}

fn load_peer_list(path: &Path) -> Result<Vec<Vec<u8>>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => return Err(Error::new(ErrorKind::Fs, format!("{}: {}", path.display(), e))),
    };
    let hexfprs: Vec<String> = serde_json::from_slice(&bytes)
        .map_err(|e| Error::new(ErrorKind::Param, format!("bad peer list: {}", e)))?;
    let mut out = Vec::with_capacity(hexfprs.len());
    for hexfpr in hexfprs {
        let fpr = hex::decode(&hexfpr)
            .map_err(|_| Error::new(ErrorKind::Param, "bad fingerprint hex in peer list"))?;
        if fpr.len() != FINGERPRINT_LEN {
            return Err(Error::new(ErrorKind::Param, "wrong-sized fingerprint in peer list"));
        }
        out.push(fpr);
    }
    Ok(out)
}

impl KeyTool {
    /// Load `<dir>/device.pem`, generating a fresh key when it is missing
    /// or malformed, then load `<dir>/peer_list.json` (missing or
    /// malformed means NEW).
    pub fn new(dir: &Path, key_bits: usize) -> Result<Self> {
        let key_path = dir.join(DEVICE_PEM);
        let (key, did_key_gen) = match Keypair::load(&key_path) {
            Ok(key) => {
                log::debug!("key tool loaded an old key");
                (key, false)
            }
            Err(e) if matches!(e.kind(), ErrorKind::Open | ErrorKind::Ssl) => {
                log::warn!("unable to load key, generating a new one");
                let key = Keypair::generate(key_bits, &key_path).map_err(|e| {
                    if e.kind() == ErrorKind::Open {
                        e.rethrow(ErrorKind::Fs)
                    } else {
                        e
                    }
                })?;
                log::info!("key tool generated a new key");
                (key, true)
            }
            Err(e) => return Err(e),
        };

        let (peer_list, peer_list_state) = match load_peer_list(&dir.join(PEER_LIST_JSON)) {
            Ok(list) => (list, PeerListState::Old),
            Err(e) if matches!(e.kind(), ErrorKind::Fs | ErrorKind::Param) => {
                (Vec::new(), PeerListState::New)
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            key,
            peer_list,
            peer_list_state,
            new_peers: Vec::new(),
            did_key_gen,
            found_expired_peer: false,
            decrypter: Decrypter::new(),
        })
    }

    fn write_peer_list(&self) -> Result<()> {
        let hexfprs: Vec<String> = self.peer_list.iter().map(hex::encode).collect();
        let json = serde_json::to_string(&hexfprs)
            .map_err(|e| Error::new(ErrorKind::Internal, format!("encoding peer list: {}", e)))?;
        let path = self.dir.join(PEER_LIST_JSON);
        std::fs::write(&path, json.as_bytes())
            .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn call_list_devices(
        &self,
        api: &ApiClient,
        user: &str,
        pass: &str,
    ) -> Result<Vec<Vec<u8>>> {
        log::info!("key tool calling list_devices");
        let resp = api
            .password_call("list_devices", None, user, pass)
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::FixedSize {
                    e.rethrow(ErrorKind::Response)
                } else {
                    e
                }
            })?;
        if !(200..300).contains(&resp.code) {
            return Err(Error::new(
                ErrorKind::Response,
                format!("API server responded with HTTP code {}: {}", resp.code, resp.reason),
            ));
        }
        if resp.status != "success" {
            log::error!("server said: {}", resp.contents);
            return Err(Error::new(
                ErrorKind::Response,
                "call to list_devices API endpoint failed",
            ));
        }
        let devices = resp
            .contents
            .get("devices")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::new(ErrorKind::Response, "failed to interpret json"))?;
        let mut fprs = Vec::with_capacity(devices.len());
        for device in devices {
            let hexfpr = device
                .as_str()
                .ok_or_else(|| Error::new(ErrorKind::Response, "invalid device entry"))?;
            if hexfpr.len() != 2 * FINGERPRINT_LEN {
                return Err(Error::new(
                    ErrorKind::Response,
                    "response contained a wrong-sized fingerprint",
                ));
            }
            let fpr = hex::decode(hexfpr)
                .map_err(|_| Error::new(ErrorKind::Response, "response contained bad hex string"))?;
            fprs.push(fpr);
        }
        Ok(fprs)
    }

    async fn register_key(&self, api: &ApiClient, user: &str, pass: &str) -> Result<()> {
        log::info!("key tool attempting to register key");
        let pem = self
            .key
            .public_pem()
            .map_err(|e| e.rethrow(ErrorKind::Internal))?;
        let arg = serde_json::Value::String(pem);
        let resp = api
            .password_call("add_device", Some(&arg), user, pass)
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::FixedSize {
                    e.rethrow(ErrorKind::Response)
                } else {
                    e
                }
            })?;
        if !(200..300).contains(&resp.code) {
            return Err(Error::new(
                ErrorKind::Response,
                format!("API server responded with HTTP code {}: {}", resp.code, resp.reason),
            ));
        }
        if resp.status != "success" {
            log::error!("server said: {}", resp.contents);
            return Err(Error::new(ErrorKind::Response, "add_device failed"));
        }
        Ok(())
    }

    /// Reconcile our device key and peer list with the account. Does
    /// nothing at all when the list was loaded from disk and this session
    /// observed nothing new.
    pub async fn update(&mut self, api: &ApiClient, user: &str, pass: &str) -> Result<()> {
        if self.peer_list_state == PeerListState::Old
            && self.new_peers.is_empty()
            && !self.found_expired_peer
            && !self.did_key_gen
        {
            log::debug!("skipping key tool update");
            return Ok(());
        }

        let mut our_key_missing = false;
        if self.peer_list_state == PeerListState::New
            || !self.new_peers.is_empty()
            || self.found_expired_peer
        {
            let srv_fprs = self.call_list_devices(api, user, pass).await?;

            // with a list on file, anything the server knows that we don't
            // is a new peer
            if self.peer_list_state == PeerListState::Old {
                for fpr in &srv_fprs {
                    if !self.peer_list.contains(fpr) && !self.new_peers.contains(fpr) {
                        self.new_peers.push(fpr.clone());
                    }
                }
            }

            if !self.did_key_gen && !srv_fprs.contains(&self.key.fingerprint) {
                our_key_missing = true;
            }

            self.peer_list = srv_fprs;
        }

        if self.did_key_gen || our_key_missing {
            self.register_key(api, user, pass).await?;
        }

        // the server may not reflect our registration yet
        if !self.peer_list.contains(&self.key.fingerprint) {
            self.peer_list.push(self.key.fingerprint.clone());
        }

        self.write_peer_list()?;
        log::info!("key tool update complete");
        Ok(())
    }

    /// Compare an observed recipient set against the peer list: a shorter
    /// set means some peer has expired; unknown recipients are new peers.
    pub fn check_recips(&mut self, recips: &[Vec<u8>]) {
        if self.peer_list_state == PeerListState::New {
            return;
        }
        if self.peer_list.len() > recips.len() {
            self.found_expired_peer = true;
        }
        for recip in recips {
            if !self.peer_list.contains(recip) && !self.new_peers.contains(recip) {
                self.new_peers.push(recip.clone());
            }
        }
    }

    /// Stream-decrypt an envelope from `input` into `output`, returning
    /// the plaintext length. The disclosed recipient set always feeds peer
    /// reconciliation, even when decryption fails. A cryptographically
    /// malformed envelope is a per-message content error (`Param`), not an
    /// SSL-layer failure.
    pub fn decrypt(&mut self, input: &mut impl Read, output: &mut impl Write) -> Result<u64> {
        self.decrypter.start(&self.key);
        let result = self.decrypt_inner(input, output);
        let recips: Vec<Vec<u8>> = self.decrypter.recipients().to_vec();
        self.check_recips(&recips);
        result
    }

    fn decrypt_inner(&mut self, input: &mut impl Read, output: &mut impl Write) -> Result<u64> {
        let mut outlen = 0u64;
        let mut inbuf = [0u8; DECRYPT_CHUNK];
        let mut outbuf = Vec::new();
        loop {
            let n = input
                .read(&mut inbuf)
                .map_err(|e| Error::new(ErrorKind::Os, format!("reading message: {}", e)))?;
            if n == 0 {
                break;
            }
            self.decrypter
                .update(&inbuf[..n], &mut outbuf)
                .map_err(remap_decrypt_err)?;
            output
                .write_all(&outbuf)
                .map_err(|e| Error::new(ErrorKind::Os, format!("writing message: {}", e)))?;
            outlen += outbuf.len() as u64;
            outbuf.clear();
        }
        self.decrypter
            .finish(&mut outbuf)
            .map_err(remap_decrypt_err)?;
        output
            .write_all(&outbuf)
            .map_err(|e| Error::new(ErrorKind::Os, format!("writing message: {}", e)))?;
        outlen += outbuf.len() as u64;
        Ok(outlen)
    }
}

fn remap_decrypt_err(e: Error) -> Error {
    match e.kind() {
        // our own buffer sizing is at fault
        ErrorKind::FixedSize => e.rethrow(ErrorKind::Internal),
        // a malformed envelope is bad content, not an SSL-layer failure
        ErrorKind::Ssl => e.rethrow(ErrorKind::Param),
        _ => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Encrypter;
    use std::io::Cursor;

    const TEST_BITS: usize = 512;

    fn encrypt_to_keys(keys: &[&Keypair], plain: &[u8]) -> Vec<u8> {
        let pairs: Vec<(&[u8], &rsa::RsaPublicKey)> = keys
            .iter()
            .map(|k| (k.fingerprint.as_slice(), k.public_key()))
            .collect();
        let mut out = Vec::new();
        let mut enc = Encrypter::new(&pairs, &mut out).unwrap();
        enc.update(plain, &mut out).unwrap();
        enc.finish(&mut out).unwrap();
        out
    }

    #[test]
    fn first_use_generates_key_and_new_state() {
        let dir = tempfile::tempdir().unwrap();
        let kt = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        assert!(kt.did_key_gen);
        assert_eq!(kt.peer_list_state, PeerListState::New);
        assert!(dir.path().join(DEVICE_PEM).exists());

        // second run loads the same key
        let kt2 = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        assert!(!kt2.did_key_gen);
        assert_eq!(kt2.key.fingerprint, kt.key.fingerprint);
    }

    #[test]
    fn malformed_key_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEVICE_PEM), "garbage").unwrap();
        let kt = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        assert!(kt.did_key_gen);
    }

    #[test]
    fn peer_list_loaded_when_valid() {
        let dir = tempfile::tempdir().unwrap();
        let fpr = "ab".repeat(FINGERPRINT_LEN);
        std::fs::write(
            dir.path().join(PEER_LIST_JSON),
            format!(r#"["{}"]"#, fpr),
        )
        .unwrap();
        let kt = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        assert_eq!(kt.peer_list_state, PeerListState::Old);
        assert_eq!(kt.peer_list.len(), 1);
    }

    #[test]
    fn corrupt_peer_list_is_new_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PEER_LIST_JSON), "[oops").unwrap();
        let kt = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        assert_eq!(kt.peer_list_state, PeerListState::New);
        assert!(kt.peer_list.is_empty());
    }

    #[test]
    fn decrypt_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut kt = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        let wire = encrypt_to_keys(&[&kt.key], b"hello there");
        let mut out = Vec::new();
        let len = kt.decrypt(&mut Cursor::new(wire), &mut out).unwrap();
        assert_eq!(out, b"hello there");
        assert_eq!(len, 11);
    }

    #[test]
    fn decrypt_not4me_feeds_check_recips() {
        let dir = tempfile::tempdir().unwrap();
        let other_dir = tempfile::tempdir().unwrap();
        let other = Keypair::generate(TEST_BITS, &other_dir.path().join("k.pem")).unwrap();

        let mut kt = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        // pretend we had a list on file containing only our own key
        kt.peer_list_state = PeerListState::Old;
        kt.peer_list = vec![kt.key.fingerprint.clone()];

        let wire = encrypt_to_keys(&[&other], b"not ours");
        let mut out = Vec::new();
        let err = kt.decrypt(&mut Cursor::new(wire), &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Not4Me);
        // the foreign recipient became a new peer
        assert_eq!(kt.new_peers, vec![other.fingerprint.clone()]);
    }

    #[test]
    fn corrupt_envelope_remapped_to_param() {
        let dir = tempfile::tempdir().unwrap();
        let mut kt = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        let wire = format!("{}\ngarbage lines\n", crate::crypto::ENC_HEADER);
        let mut out = Vec::new();
        let err = kt
            .decrypt(&mut Cursor::new(wire.into_bytes()), &mut out)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Param);
    }

    #[test]
    fn check_recips_finds_expired_and_new_peers() {
        let dir = tempfile::tempdir().unwrap();
        let mut kt = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        kt.peer_list_state = PeerListState::Old;
        kt.peer_list = vec![vec![1; FINGERPRINT_LEN], vec![2; FINGERPRINT_LEN]];

        // a shorter recipient set means someone expired
        kt.check_recips(&[vec![3; FINGERPRINT_LEN]]);
        assert!(kt.found_expired_peer);
        assert_eq!(kt.new_peers, vec![vec![3; FINGERPRINT_LEN]]);

        // new-state tools never reconcile from recipients
        let mut fresh = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        fresh.peer_list_state = PeerListState::New;
        fresh.check_recips(&[vec![9; FINGERPRINT_LEN]]);
        assert!(!fresh.found_expired_peer);
        assert!(fresh.new_peers.is_empty());
    }

    #[test]
    fn update_short_circuits_when_nothing_observed() {
        let dir = tempfile::tempdir().unwrap();
        let mut kt = KeyTool::new(dir.path(), TEST_BITS).unwrap();
        kt.peer_list_state = PeerListState::Old;
        kt.did_key_gen = false;
        // host is unroutable; the short circuit must prevent any call
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let api = ApiClient::new("invalid.invalid", 443);
        rt.block_on(kt.update(&api, "u", "p")).unwrap();
    }
}
