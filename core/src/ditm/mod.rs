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

//! The decrypter-in-the-middle session: terminate the MUA's POP3
//! connection, speak POP3 to the encrypted store, download and decrypt new
//! mail into the user's maildir, and replay it. Failures the user can act
//! on surface as locally-injected explanatory mail; the session then
//! continues in offline mode.

pub mod ignore;

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::api::ApiClient;
use crate::crypto;
use crate::error::{Error, ErrorKind, Result};
use crate::keytool::{KeyTool, DEFAULT_KEY_BITS};
use crate::maildir::Maildir;
use crate::net;
use crate::protocol::pop3::codec::pop3_encode;
use crate::protocol::pop3::{Pop3Client, Pop3Command, Pop3Server};
use ignore::IgnoreList;

pub const DITM_VERSION_MAJOR: u32 = 0;
pub const DITM_VERSION_MINOR: u32 = 2;
pub const DITM_VERSION_BUILD: u32 = 0;

const MSG_DNE: &[u8] = b"-ERR no such message\r\n";
const MSG_OK: &[u8] = b"+OK\r\n";
const MULTI_LINE_END: &[u8] = b".\r\n";

const CHUNK_SIZE: usize = 4096;
const LOCAL_UID_RANDOM_BYTES: usize = 16;

const UPDATE_SUBJ: &str = "Splintermail Software Update";
const UPDATE_BODY: &str = "The Splintermail software you are using is out of date.\r\n\r\n\
    Please see:\r\n\
    \x20   https://github.com/splintermail/splintermail-client\r\n\
    for upgrade instructions.\r\n";

const BADFS_SUBJ: &str = "File System Issue";
const BADFS_BODY: &str = "DITM (the Splintermail software running on your computer for decrypting\r\n\
    your Splintermail email) encountered a error reading or writing a file.\r\n\
    \r\n\
    This could be a file permissions issue, a full file system, or a bug.\r\n\
    Please correct the issue, or contact help@splintermail.com for help.\r\n";

const BADSRV_SUBJ: &str = "Invalid Server Response";
const BADSRV_BODY: &str = "DITM (the Splintermail software running on your computer for decrypting\r\n\
    your Splintermail email) encountered a error talking to the server\r\n\
    at Splintermail.com.\r\n\
    \r\n\
    This is probably a bug.  Please let us know at help@splintermail.com so\r\n\
    \x20we can fix it.\r\n";

const INTRN_ERR_SUBJ: &str = "DITM Internal Error";
const INTRN_ERR_BODY: &str = "DITM (the Splintermail software running on your computer for decrypting\r\n\
    your Splintermail email) encountered an internal error.\r\n\
    \r\n\
    This is definitely a bug.  Please let us know at help@splintermail.com so\r\n\
    \x20we can fix it.\r\n";

/// Session-independent DITM settings.
#[derive(Debug, Clone)]
pub struct DitmConfig {
    pub remote_host: String,
    pub remote_port: u16,
    pub ditm_dir: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    /// Plain TCP to the API exists only for in-process test servers.
    pub api_tls: bool,
    /// RSA size for freshly generated device keys.
    pub key_bits: usize,
}

impl DitmConfig {
    pub fn new(
        remote_host: impl Into<String>,
        remote_port: u16,
        ditm_dir: impl Into<PathBuf>,
        api_host: impl Into<String>,
        api_port: u16,
    ) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            ditm_dir: ditm_dir.into(),
            api_host: api_host.into(),
            api_port,
            api_tls: true,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

/// Parse the `DITMv<maj>[.<min>[.<bld>]]` token out of the upstream
/// banner; missing components default to 0.
pub fn parse_minversion(banner: &str) -> Result<(u32, u32, u32)> {
    let start = banner
        .find("DITMv")
        .ok_or_else(|| Error::new(ErrorKind::Io, "minimum version not found"))?
        + "DITMv".len();
    let rest = &banner[start..];
    let vstring = rest.split(' ').next().unwrap_or("");
    let parts: Vec<&str> = vstring.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(Error::new(ErrorKind::Value, "invalid minversion string"));
    }
    let parse = |s: &str| -> Result<u32> {
        s.parse()
            .map_err(|_| Error::new(ErrorKind::Param, format!("bad version component: {:?}", s)))
    };
    let maj = parse(parts[0])?;
    let min = if parts.len() > 1 { parse(parts[1])? } else { 0 };
    let bld = if parts.len() > 2 { parse(parts[2])? } else { 0 };
    Ok((maj, min, bld))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Longest strict prefix of `pattern` that `buf` ends with.
fn partial_suffix_len(buf: &[u8], pattern: &[u8]) -> usize {
    let max = pattern.len().saturating_sub(1).min(buf.len());
    for k in (1..=max).rev() {
        if buf.ends_with(&pattern[..k]) {
            return k;
        }
    }
    0
}

fn count_crlf(buf: &[u8]) -> u32 {
    let mut count = 0;
    let mut i = 0;
    while let Some(pos) = find(&buf[i..], b"\r\n") {
        count += 1;
        i += pos + 2;
    }
    count
}

fn rfc2822_date() -> String {
    chrono::Local::now()
        .format("%a, %d %b %Y %H:%M:%S %z")
        .to_string()
}

/// Rewrite an unencrypted message with `NOT ENCRYPTED:` in the Subject
/// line, synthesising one if the headers carry none.
pub fn mangle_unencrypted(input: &mut impl Read, output: &mut impl Write) -> Result<u64> {
    let mut raw = Vec::new();
    input
        .read_to_end(&mut raw)
        .map_err(|e| Error::new(ErrorKind::Os, format!("reading message: {}", e)))?;

    const SUBJ_PAT: &[u8] = b"\nSubject:";
    const CRLF2: &[u8] = b"\r\n\r\n";
    const LF2: &[u8] = b"\n\n";
    const SUBJ_ENTIRE: &[u8] = b"Subject: NOT ENCRYPTED: (no subject)";
    const MANGLE: &[u8] = b" NOT ENCRYPTED:";

    let subj = find(&raw, SUBJ_PAT);
    let crlf2 = find(&raw, CRLF2);
    let lf2 = find(&raw, LF2);

    // whichever pattern appears first in the stream decides
    let mut best: Option<(usize, u8)> = None;
    for (pos, which) in [(subj, 0u8), (crlf2, 1u8), (lf2, 2u8)] {
        if let Some(p) = pos {
            if best.map_or(true, |(bp, _)| p < bp) {
                best = Some((p, which));
            }
        }
    }

    let mut out = Vec::with_capacity(raw.len() + MANGLE.len());
    match best {
        Some((pos, 0)) => {
            let subj_end = pos + SUBJ_PAT.len();
            out.extend_from_slice(&raw[..subj_end]);
            out.extend_from_slice(MANGLE);
            out.extend_from_slice(&raw[subj_end..]);
        }
        Some((pos, which)) => {
            // end of headers with no subject; insert one, matching the
            // message's native line break
            let nlb: &[u8] = if which == 1 { b"\r\n" } else { b"\n" };
            out.extend_from_slice(&raw[..pos]);
            out.extend_from_slice(nlb);
            out.extend_from_slice(SUBJ_ENTIRE);
            out.extend_from_slice(&raw[pos..]);
        }
        None => out.extend_from_slice(&raw),
    }

    output
        .write_all(&out)
        .map_err(|e| Error::new(ErrorKind::Os, format!("writing message: {}", e)))?;
    Ok(out.len() as u64)
}

/// Prepend an explanation to a message that would not decrypt and copy the
/// original bytes verbatim.
pub fn mangle_corrupted(input: &mut impl Read, output: &mut impl Write) -> Result<u64> {
    let header = format!(
        "From: DITM <ditm@localhost>\r\n\
         To: Local User <email_user@localhost>\r\n\
         Date: {}\r\n\
         Subject: DITM failed to decrypt message\r\n\
         \r\n\
         The following message appears to be corrupted and cannot be decrypted:\r\n\
         \r\n",
        rfc2822_date()
    );
    output
        .write_all(header.as_bytes())
        .map_err(|e| Error::new(ErrorKind::Os, format!("writing message: {}", e)))?;
    let mut outlen = header.len() as u64;

    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = input
            .read(&mut chunk)
            .map_err(|e| Error::new(ErrorKind::Os, format!("reading message: {}", e)))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&chunk[..n])
            .map_err(|e| Error::new(ErrorKind::Os, format!("writing message: {}", e)))?;
        outlen += n as u64;
    }
    Ok(outlen)
}

enum DecryptionState {
    Unencrypted,
    Decrypted,
    Corrupted,
    NotForMe,
}

/// One MUA connection's interception state.
pub struct Ditm<M, U> {
    ps: Pop3Server<M>,
    pc: Pop3Client<U>,
    maildir: Option<Maildir>,
    deletions: Vec<bool>,
    minversion_met: bool,
    conn_is_live: bool,
    logged_in: bool,
    cfg: DitmConfig,
}

impl<M, U> Ditm<M, U>
where
    M: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    /// Complete the banner dance: the upstream greeting has already been
    /// consumed into `pc.banner`; `banner_ok` is its status.
    pub async fn new(
        mua: M,
        pc: Pop3Client<U>,
        banner_ok: bool,
        cfg: DitmConfig,
    ) -> Result<Ditm<M, U>> {
        let mut ps = Pop3Server::new(mua);

        if !banner_ok {
            ps.send_line("-ERR remote server greeted with error message")
                .await?;
            return Err(Error::new(ErrorKind::Value, "server greeted with error message"));
        }

        let (maj, min, bld) = match parse_minversion(&pc.banner) {
            Ok(v) => v,
            Err(e) => {
                ps.send_line("-ERR error parsing minimum version from server greeting")
                    .await?;
                return Err(e);
            }
        };

        let minversion_met =
            DITM_VERSION_MAJOR >= maj && DITM_VERSION_MINOR >= min && DITM_VERSION_BUILD >= bld;

        ps.send(b"+OK DITM ready.\r\n").await?;

        Ok(Ditm {
            ps,
            pc,
            maildir: None,
            deletions: Vec::new(),
            minversion_met,
            conn_is_live: true,
            logged_in: false,
            cfg,
        })
    }

    /// Serve commands until QUIT or a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let cmd = self.ps.read_command().await?;
            match cmd {
                Pop3Command::Login { user, pass } => self.loginhook(&user, &pass).await?,
                Pop3Command::Stat => self.stathook().await?,
                Pop3Command::List(index) => self.listhook(index).await?,
                Pop3Command::Retr(index) => self.retrhook(index).await?,
                Pop3Command::Dele(index) => self.delehook(index).await?,
                Pop3Command::Rset => self.rsethook().await?,
                Pop3Command::Top(index, lines) => self.tophook(index, lines).await?,
                Pop3Command::Uidl(index) => self.uidlhook(index).await?,
                Pop3Command::Quit => {
                    self.quithook().await?;
                    return Ok(());
                }
            }
        }
    }

    async fn loginhook(&mut self, user: &str, pass: &str) -> Result<()> {
        let (ok, message) = self.pc.username(user).await?;
        if !ok {
            let msg = if message.is_empty() { "authentication failed".to_string() } else { message };
            self.ps.send_line(&format!("-ERR {}", msg)).await?;
            return Ok(());
        }
        let (ok, message) = self.pc.password(pass).await?;
        if !ok {
            let msg = if message.is_empty() { "authentication failed".to_string() } else { message };
            self.ps.send_line(&format!("-ERR {}", msg)).await?;
            return Ok(());
        }

        self.logged_in = true;
        self.ps.send_line("+OK Logged in.").await?;
        self.ps.login_succeeded();

        let result = self.login_setup(user, pass).await;

        // errors the user can act on become injected mail and an offline
        // session; transport and host faults tear the session down
        if let Err(e) = result {
            match e.kind() {
                ErrorKind::Conn | ErrorKind::Sock | ErrorKind::Ssl | ErrorKind::Os | ErrorKind::Io => {
                    return Err(e);
                }
                ErrorKind::Param => {
                    // from the key tool update: host, username, or password
                    // too long, but credentials were just validated
                    log::error!("configured api server hostname is not usable: {}", e);
                }
                ErrorKind::Fs => {
                    log::warn!("filesystem issue during login: {}", e);
                    self.inject_message(BADFS_SUBJ, BADFS_BODY).await?;
                    self.conn_is_live = false;
                }
                ErrorKind::Response => {
                    log::warn!("invalid server response during login: {}", e);
                    self.conn_is_live = false;
                    self.inject_message(BADSRV_SUBJ, BADSRV_BODY).await?;
                }
                other => {
                    if other != ErrorKind::Internal {
                        log::error!("unexpected error kind during login: {}", e);
                    }
                    self.conn_is_live = false;
                    self.inject_message(INTRN_ERR_SUBJ, INTRN_ERR_BODY).await?;
                }
            }
        }

        if let Some(mdir) = &self.maildir {
            if self.deletions.len() != mdir.len() {
                self.deletions.resize(mdir.len(), false);
            }
        }
        self.ps.set_message_count(self.deletions.len());
        Ok(())
    }

    async fn login_setup(&mut self, user: &str, pass: &str) -> Result<()> {
        let userdir = self.cfg.ditm_dir.join(user);
        self.maildir = Some(Maildir::new(&userdir)?);

        // without the minimum version there is no point trying to decrypt;
        // tell the user to upgrade and go offline
        if !self.minversion_met {
            self.conn_is_live = false;
            self.inject_message(UPDATE_SUBJ, UPDATE_BODY).await?;
            return Ok(());
        }

        let mut kt = KeyTool::new(&userdir, self.cfg.key_bits)?;
        let mut il = IgnoreList::load(&userdir);

        let (_ok, _msg) = self.pc.uidl().await.map_err(|e| {
            // an oversized UIDL body means a bad server response
            if e.kind() == ErrorKind::FixedSize {
                e.rethrow(ErrorKind::Response)
            } else {
                e
            }
        })?;

        let uids = self.pc.uids.clone();
        let idxs = self.pc.idxs.clone();
        for (uid, idx) in uids.iter().zip(idxs) {
            if il.should_ignore(uid) {
                continue;
            }
            self.download_new_message(&mut kt, &mut il, uid, idx).await?;
        }

        self.deletions = vec![false; self.maildir.as_ref().unwrap().len()];

        il.write(&userdir)?;

        let api = ApiClient {
            host: self.cfg.api_host.clone(),
            port: self.cfg.api_port,
            use_tls: self.cfg.api_tls,
        };
        kt.update(&api, user, pass).await?;

        Ok(())
    }

    async fn download_new_message(
        &mut self,
        kt: &mut KeyTool,
        il: &mut IgnoreList,
        uid: &str,
        idx: u32,
    ) -> Result<()> {
        // don't do anything if we already have it
        if self.maildir.as_ref().unwrap().contains_uid(uid) {
            return Ok(());
        }

        let (ok, _msg) = self.pc.retrieve(idx).await.map_err(|e| {
            if e.kind() == ErrorKind::FixedSize {
                e.rethrow(ErrorKind::Response)
            } else {
                e
            }
        })?;
        if !ok {
            return Err(Error::new(ErrorKind::Response, "RETR command failed"));
        }

        let sentinel = crypto::ENC_HEADER.as_bytes();

        // t1 holds the raw download; t2 the decrypted/mangled file we keep
        let (t1path, mut t1) = self.maildir.as_mut().unwrap().new_tmp_file()?;

        let mut first_bytes: Vec<u8> = Vec::with_capacity(sentinel.len());
        let mut buffer: Vec<u8> = Vec::new();
        let mut first = true;
        let stream_result: Result<()> = loop {
            match self.pc.get_body(&mut buffer, first).await {
                Err(e) => break Err(e),
                Ok(end) => {
                    first = false;
                    if first_bytes.len() < sentinel.len() {
                        let need = sentinel.len() - first_bytes.len();
                        let take = need.min(buffer.len());
                        first_bytes.extend_from_slice(&buffer[..take]);
                    }
                    if let Err(e) = t1.write_all(&buffer) {
                        break Err(Error::new(ErrorKind::Os, format!("writing download: {}", e)));
                    }
                    buffer.clear();
                    if end {
                        break Ok(());
                    }
                }
            }
        };
        if let Err(e) = stream_result {
            drop(t1);
            let _ = fs::remove_file(&t1path);
            return Err(e);
        }

        let (t2path, mut t2) = match self.maildir.as_mut().unwrap().new_tmp_file() {
            Ok(x) => x,
            Err(e) => {
                drop(t1);
                let _ = fs::remove_file(&t1path);
                return Err(e);
            }
        };

        let outcome: Result<(DecryptionState, u64)> = (|| {
            t1.seek(SeekFrom::Start(0))
                .map_err(|e| Error::new(ErrorKind::Internal, format!("seek failed: {}", e)))?;

            if first_bytes == sentinel {
                match kt.decrypt(&mut t1, &mut t2) {
                    Ok(len) => Ok((DecryptionState::Decrypted, len)),
                    Err(e) if e.kind() == ErrorKind::Not4Me => Ok((DecryptionState::NotForMe, 0)),
                    Err(e) if e.kind() == ErrorKind::Param => {
                        // broken message; mangle the body and hand it over
                        t1.seek(SeekFrom::Start(0)).map_err(|e| {
                            Error::new(ErrorKind::Internal, format!("seek failed: {}", e))
                        })?;
                        t2.seek(SeekFrom::Start(0)).map_err(|e| {
                            Error::new(ErrorKind::Internal, format!("seek failed: {}", e))
                        })?;
                        t2.set_len(0).map_err(|e| {
                            Error::new(ErrorKind::Internal, format!("truncate failed: {}", e))
                        })?;
                        let len = mangle_corrupted(&mut t1, &mut t2)?;
                        Ok((DecryptionState::Corrupted, len))
                    }
                    Err(e) => Err(e),
                }
            } else {
                let len = mangle_unencrypted(&mut t1, &mut t2)?;
                // something reached us unencrypted: a sender was using an
                // expired peer list
                kt.found_expired_peer = true;
                Ok((DecryptionState::Unencrypted, len))
            }
        })();

        drop(t1);
        drop(t2);
        if let Err(e) = fs::remove_file(&t1path) {
            log::error!("failed to cleanup temporary file {}: {}", t1path.display(), e);
        }

        let (state, t2len) = match outcome {
            Ok(x) => x,
            Err(e) => {
                let _ = fs::remove_file(&t2path);
                return Err(e);
            }
        };

        match state {
            DecryptionState::Decrypted
            | DecryptionState::Corrupted
            | DecryptionState::Unencrypted => {
                self.maildir
                    .as_mut()
                    .unwrap()
                    .new_rename(&t2path, uid, t2len)?;
            }
            DecryptionState::NotForMe => {
                il.add(uid);
                if let Err(e) = fs::remove_file(&t2path) {
                    log::error!("failed to cleanup temporary file {}: {}", t2path.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Inject a local-only message into the mailbox.
    async fn inject_message(&mut self, subj: &str, body: &str) -> Result<()> {
        let header = format!(
            "From: DITM <ditm@localhost>\r\n\
             To: Local User <email_user@localhost>\r\n\
             Date: {}\r\n\
             Subject: {}\r\n\
             \r\n",
            rfc2822_date(),
            subj
        );

        let uid = format!(
            "LOCAL-{}",
            hex::encode(crypto::random_bytes(LOCAL_UID_RANDOM_BYTES))
        );

        let mdir = self.maildir.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::Internal, "injecting mail with no maildir open")
        })?;
        // the bitmap must cover every store index before we extend it,
        // even when login setup failed before sizing it
        if self.deletions.len() < mdir.len() {
            self.deletions.resize(mdir.len(), false);
        }
        let (tmp_path, mut tmp) = mdir.new_tmp_file()?;
        let write_result = tmp
            .write_all(header.as_bytes())
            .and_then(|_| tmp.write_all(body.as_bytes()));
        drop(tmp);
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::new(ErrorKind::Os, format!("writing injected mail: {}", e)));
        }
        let tlen = (header.len() + body.len()) as u64;

        self.deletions.push(false);
        if let Err(e) = mdir.new_rename(&tmp_path, &uid, tlen) {
            self.deletions.pop();
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        self.ps.set_message_count(self.deletions.len());
        Ok(())
    }

    fn visible_totals(&self) -> (usize, u64) {
        let mdir = self.maildir.as_ref().unwrap();
        let mut count = 0;
        let mut total = 0;
        for i in 0..mdir.len() {
            if !self.deletions[i] {
                count += 1;
                total += mdir.length(i);
            }
        }
        (count, total)
    }

    async fn stathook(&mut self) -> Result<()> {
        let (count, total) = self.visible_totals();
        self.ps
            .send_line(&format!("+OK {} {}", count, total))
            .await
    }

    async fn listhook(&mut self, index: Option<u32>) -> Result<()> {
        if let Some(index) = index {
            let internal = (index - 1) as usize;
            if self.deletions[internal] {
                return self.ps.send(MSG_DNE).await;
            }
            let length = self.maildir.as_ref().unwrap().length(internal);
            return self
                .ps
                .send_line(&format!("+OK {} {}", index, length))
                .await;
        }
        let (count, total) = self.visible_totals();
        let mut response = format!("+OK {} messages ({} octets)\r\n", count, total).into_bytes();
        let mdir = self.maildir.as_ref().unwrap();
        for i in 0..mdir.len() {
            if !self.deletions[i] {
                response.extend_from_slice(format!("{} {}\r\n", i + 1, mdir.length(i)).as_bytes());
            }
        }
        response.extend_from_slice(MULTI_LINE_END);
        self.ps.send(&response).await
    }

    async fn retrhook(&mut self, index: u32) -> Result<()> {
        let internal = (index - 1) as usize;
        if self.deletions[internal] {
            return self.ps.send(MSG_DNE).await;
        }
        let mdir = self.maildir.as_ref().unwrap();
        let length = mdir.length(internal);
        let mut f = mdir.open_message(internal)?;

        let mut raw: Vec<u8> = Vec::new();
        let mut response = format!("+OK {} octets\r\n", length).into_bytes();
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let n = f
                .read(&mut chunk)
                .map_err(|e| Error::new(ErrorKind::Os, format!("reading message: {}", e)))?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            if raw.len() > CHUNK_SIZE / 2 {
                pop3_encode(&mut raw, &mut response, false);
                self.ps.send(&response).await?;
                response.clear();
            }
        }
        pop3_encode(&mut raw, &mut response, true);
        response.extend_from_slice(MULTI_LINE_END);
        self.ps.send(&response).await
    }

    async fn delehook(&mut self, index: u32) -> Result<()> {
        let internal = (index - 1) as usize;
        if self.deletions[internal] {
            return self.ps.send(MSG_DNE).await;
        }

        let uid = self.maildir.as_ref().unwrap().uid(internal).to_string();
        // locally-injected mail is never coordinated with the server
        if !uid.starts_with("LOCAL-") {
            if !self.conn_is_live {
                return self
                    .ps
                    .send_line("-ERR not deleted; remote connection not live")
                    .await;
            }
            let r_idx = self
                .pc
                .uids
                .iter()
                .position(|u| u == &uid)
                .map(|pos| self.pc.idxs[pos]);
            match r_idx {
                None => log::warn!("did not find uid on remote server"),
                Some(r_idx) => {
                    let (ok, _msg) = self.pc.delete(r_idx).await?;
                    if !ok {
                        return Err(Error::new(ErrorKind::Value, "failed to delete on remote server"));
                    }
                }
            }
        }

        self.deletions[internal] = true;
        self.ps.send_line(&format!("+OK {} deleted", index)).await
    }

    async fn rsethook(&mut self) -> Result<()> {
        if self.conn_is_live {
            let (ok, message) = self.pc.reset().await?;
            // if the server puked we just pass that message on
            if !ok {
                return self.ps.send_line(&format!("-ERR {}", message)).await;
            }
        }
        for d in self.deletions.iter_mut() {
            *d = false;
        }
        self.ps.send(MSG_OK).await
    }

    async fn tophook(&mut self, index: u32, lines: u32) -> Result<()> {
        let internal = (index - 1) as usize;
        if self.deletions[internal] {
            return self.ps.send(MSG_DNE).await;
        }
        let mut f = self.maildir.as_ref().unwrap().open_message(internal)?;

        let mut response = MSG_OK.to_vec();
        // raw is what was read from the file; checked is what is approved
        // for the response given the requested line count
        let mut raw: Vec<u8> = Vec::new();
        let mut checked: Vec<u8> = Vec::new();
        let mut header_done = false;
        let mut lines_sent: u32 = 0;
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            let n = f
                .read(&mut chunk)
                .map_err(|e| Error::new(ErrorKind::Os, format!("reading message: {}", e)))?;
            raw.extend_from_slice(&chunk[..n]);

            if !header_done {
                if let Some(pos) = find(&raw, b"\r\n\r\n") {
                    let hlen = pos + 4;
                    checked.extend_from_slice(&raw[..hlen]);
                    raw.drain(..hlen);
                    header_done = true;
                } else {
                    // hold back a partial header terminator at the edge
                    let partial = partial_suffix_len(&raw, b"\r\n\r\n");
                    let take = raw.len() - partial;
                    checked.extend_from_slice(&raw[..take]);
                    raw.drain(..take);
                }
            }

            if header_done {
                if lines == 0 {
                    break;
                }
                let count = count_crlf(&raw);
                if count + lines_sent < lines {
                    // not enough lines buffered; forward all of it, but a
                    // trailing CR must wait so a split CRLF is never miscounted
                    let partial = usize::from(raw.last() == Some(&b'\r'));
                    let take = raw.len() - partial;
                    checked.extend_from_slice(&raw[..take]);
                    raw.drain(..take);
                    lines_sent += count;
                } else {
                    // enough buffered; take exactly the lines still owed
                    let mut taken = 0usize;
                    let mut need = lines - lines_sent;
                    while need > 0 {
                        let pos = find(&raw[taken..], b"\r\n")
                            .ok_or_else(|| Error::new(ErrorKind::Internal, "line count miscue"))?;
                        taken += pos + 2;
                        need -= 1;
                    }
                    checked.extend_from_slice(&raw[..taken]);
                    break;
                }
            }

            if n == 0 {
                if !header_done {
                    checked.append(&mut raw);
                }
                break;
            }

            if checked.len() >= CHUNK_SIZE {
                pop3_encode(&mut checked, &mut response, false);
                self.ps.send(&response).await?;
                response.clear();
            }
        }

        pop3_encode(&mut checked, &mut response, true);
        response.extend_from_slice(MULTI_LINE_END);
        self.ps.send(&response).await
    }

    async fn uidlhook(&mut self, index: Option<u32>) -> Result<()> {
        if let Some(index) = index {
            let internal = (index - 1) as usize;
            if self.deletions[internal] {
                return self.ps.send(MSG_DNE).await;
            }
            let uid = self.maildir.as_ref().unwrap().uid(internal).to_string();
            return self.ps.send_line(&format!("+OK {} {}", index, uid)).await;
        }
        let mut response = MSG_OK.to_vec();
        let mdir = self.maildir.as_ref().unwrap();
        for i in 0..mdir.len() {
            if !self.deletions[i] {
                response.extend_from_slice(format!("{} {}\r\n", i + 1, mdir.uid(i)).as_bytes());
            }
        }
        response.extend_from_slice(MULTI_LINE_END);
        self.ps.send(&response).await
    }

    async fn quithook(&mut self) -> Result<()> {
        let (update_ok, _msg) = self.pc.quit().await?;
        if self.logged_in && update_ok {
            // delete in reverse order so earlier indices stay valid
            for idx in (0..self.deletions.len()).rev() {
                if self.deletions[idx] {
                    self.maildir.as_mut().unwrap().delete_message(idx)?;
                }
            }
        }
        if self.logged_in && !update_ok {
            self.ps
                .send_line("-ERR remote server did not commit the transaction")
                .await
        } else {
            self.ps.send_line("+OK DITM signing off.").await
        }
    }
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Serve one accepted MUA connection end to end.
async fn serve_connection(mua: Box<dyn AsyncStream>, cfg: &DitmConfig) -> Result<()> {
    let (pc, banner_ok, _banner) =
        match Pop3Client::connect(&cfg.remote_host, cfg.remote_port).await {
            Ok(x) => x,
            Err(e) => {
                // a positive response so Thunderbird doesn't freak out: it
                // handles the dropped connection gracefully, but not -ERR
                let mut ps = Pop3Server::new(mua);
                ps.send_line("+OK error connecting to remote server").await?;
                return Err(e);
            }
        };
    let mut ditm = Ditm::new(mua, pc, banner_ok, cfg.clone()).await?;
    ditm.run().await
}

/// Listener settings for the DITM loop.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub port: u16,
    pub certpath: Option<PathBuf>,
    pub keypath: Option<PathBuf>,
}

fn build_acceptor(cfg: &DitmConfig, listen: &ListenConfig) -> Result<Option<tokio_rustls::TlsAcceptor>> {
    let explicit = listen.certpath.is_some() || listen.keypath.is_some();
    let certpath = listen
        .certpath
        .clone()
        .unwrap_or_else(|| cfg.ditm_dir.join("ditm-127.0.0.1-cert.pem"));
    let keypath = listen
        .keypath
        .clone()
        .unwrap_or_else(|| cfg.ditm_dir.join("ditm-127.0.0.1-key.pem"));
    match net::server_acceptor(&certpath, &keypath) {
        Ok(acceptor) => Ok(Some(acceptor)),
        Err(e) if explicit => Err(Error::new(
            ErrorKind::Fs,
            format!("failure to set up TLS with the given cert or key: {}", e),
        )),
        Err(e) => {
            log::warn!("no usable TLS certificate ({}); listening in plain TCP", e);
            Ok(None)
        }
    }
}

/// Accept MUA connections one at a time until SIGINT/SIGTERM.
pub async fn ditm_loop(cfg: DitmConfig, listen: ListenConfig) -> Result<()> {
    fs::create_dir_all(&cfg.ditm_dir).map_err(|e| {
        Error::new(
            ErrorKind::Fs,
            format!("failure to either create or access the ditm dir: {}", e),
        )
    })?;

    let acceptor = build_acceptor(&cfg, &listen)?;

    let listener = TcpListener::bind(("127.0.0.1", listen.port))
        .await
        .map_err(|e| Error::new(ErrorKind::Sock, format!("binding listener: {}", e)))?;
    log::info!("listening on 127.0.0.1:{}", listen.port);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| Error::new(ErrorKind::Os, format!("installing signal handler: {}", e)))?;

    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = tokio::signal::ctrl_c() => {
                log::info!("caught SIGINT, shutting down");
                return Ok(());
            }
            _ = sigterm.recv() => {
                log::info!("caught SIGTERM, shutting down");
                return Ok(());
            }
        };
        let (tcp, peer) = match accepted {
            Ok(x) => x,
            Err(e) => {
                log::error!("accept failed: {}", e);
                continue;
            }
        };
        log::debug!("connection from {}", peer);

        let mua: Box<dyn AsyncStream> = match &acceptor {
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(tls) => Box::new(tls),
                Err(e) => {
                    log::error!("TLS accept failed: {}", e);
                    continue;
                }
            },
            None => Box::new(tcp),
        };

        if let Err(e) = serve_connection(mua, &cfg).await {
            log::error!("session ended with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn minversion_full() {
        assert_eq!(
            parse_minversion("+OK Fake POP Server Ready DITMv0.2.0").unwrap(),
            (0, 2, 0)
        );
    }

    #[test]
    fn minversion_defaults() {
        assert_eq!(parse_minversion("+OK x DITMv1 y").unwrap(), (1, 0, 0));
        assert_eq!(parse_minversion("+OK x DITMv1.5 y").unwrap(), (1, 5, 0));
    }

    #[test]
    fn minversion_missing_is_io() {
        assert_eq!(
            parse_minversion("+OK plain server").unwrap_err().kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn minversion_malformed() {
        assert!(parse_minversion("+OK DITMv1.2.3.4 x").is_err());
        assert!(parse_minversion("+OK DITMvabc x").is_err());
    }

    #[test]
    fn mangle_subject_present() {
        let input = b"From: a@b\r\nSubject: hello\r\n\r\nbody\r\n";
        let mut out = Vec::new();
        let len = mangle_unencrypted(&mut Cursor::new(&input[..]), &mut out).unwrap();
        assert_eq!(
            out,
            b"From: a@b\r\nSubject: NOT ENCRYPTED: hello\r\n\r\nbody\r\n"
        );
        assert_eq!(len, out.len() as u64);
    }

    #[test]
    fn mangle_subject_missing() {
        let input = b"From: a@b\r\n\r\nbody\r\n";
        let mut out = Vec::new();
        mangle_unencrypted(&mut Cursor::new(&input[..]), &mut out).unwrap();
        assert_eq!(
            out,
            b"From: a@b\r\nSubject: NOT ENCRYPTED: (no subject)\r\n\r\nbody\r\n"
        );
    }

    #[test]
    fn mangle_subject_missing_bare_lf() {
        let input = b"From: a@b\n\nbody\n";
        let mut out = Vec::new();
        mangle_unencrypted(&mut Cursor::new(&input[..]), &mut out).unwrap();
        assert_eq!(out, b"From: a@b\nSubject: NOT ENCRYPTED: (no subject)\n\nbody\n");
    }

    #[test]
    fn mangle_corrupted_prepends_explanation() {
        let input = b"-----BEGIN SPLINTERMAIL MESSAGE-----\ngarbage";
        let mut out = Vec::new();
        let len = mangle_corrupted(&mut Cursor::new(&input[..]), &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("From: DITM <ditm@localhost>\r\n"));
        assert!(text.contains("Subject: DITM failed to decrypt message\r\n"));
        assert!(text.contains("appears to be corrupted"));
        assert!(text.ends_with("-----BEGIN SPLINTERMAIL MESSAGE-----\ngarbage"));
        assert_eq!(len, out.len() as u64);
    }

    #[test]
    fn partial_suffix_detection() {
        assert_eq!(partial_suffix_len(b"abc\r\n\r", b"\r\n\r\n"), 3);
        assert_eq!(partial_suffix_len(b"abc\r\n", b"\r\n\r\n"), 2);
        assert_eq!(partial_suffix_len(b"abc\r", b"\r\n\r\n"), 1);
        assert_eq!(partial_suffix_len(b"abc", b"\r\n\r\n"), 0);
    }

    #[test]
    fn crlf_counting() {
        assert_eq!(count_crlf(b"a\r\nb\r\nc"), 2);
        assert_eq!(count_crlf(b""), 0);
        assert_eq!(count_crlf(b"\r\n"), 1);
    }
}
