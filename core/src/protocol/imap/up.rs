/*
 * up.rs
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

//! Upstream IMAP connection driver. Commands go out through the transport
//! interface tagged `maildir_up<N>` with a FIFO of pending records; tagged
//! responses must match the FIFO head. The primary connection drives
//! SELECT (QRESYNC when the log knows enough), the initial UID SEARCH, the
//! download FETCH loop, and the one-shot synced signal.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::protocol::imap::maildir::Imaildir;
use crate::protocol::imap::types::{
    FetchResp, ImapCmd, ImapResp, OkCode, SeqSetBuilder, Status, TaggedCmd,
};

/// The transport interface an upstream connection supplies.
pub trait UpConn: Send + Sync {
    /// Serialize and send a command upstream.
    fn cmd(&self, cmd: TaggedCmd);
    /// The driver is done with this connection (None on clean shutdown).
    fn release(&self, err: Option<Error>);
    /// CLOSE completed; the mailbox is no longer selected.
    fn unselected(&self);
    /// The mailbox is fully synchronized with the upstream.
    fn synced(&self);
}

/// Tracks the highest modseq actually synced from the upstream. The
/// persisted value advances only when `step` observes progress, which the
/// driver calls after a command completes.
#[derive(Debug, Default)]
pub struct HiModSeq {
    base: u64,
    ok_code: u64,
    fetch_seen: u64,
}

impl HiModSeq {
    pub fn prep(start: u64) -> Self {
        Self {
            base: start,
            ok_code: 0,
            fetch_seen: 0,
        }
    }

    pub fn saw_ok_code(&mut self, v: u64) {
        self.ok_code = v;
    }

    pub fn saw_fetch(&mut self, v: u64) {
        self.fetch_seen = self.fetch_seen.max(v);
    }

    /// What we believe the upstream's highest modseq to be.
    pub fn now(&self) -> u64 {
        self.base.max(self.ok_code)
    }

    /// Advance the persisted base; true means the caller should persist.
    pub fn step(&mut self) -> bool {
        let candidate = self.ok_code.max(self.fetch_seen);
        if candidate > self.base {
            self.base = candidate;
            true
        } else {
            false
        }
    }
}

enum Cb {
    Select,
    InitialSearch,
    Fetch,
    Close,
}

/// One upstream connection's view of a shared maildir.
pub struct Up {
    m: Arc<Imaildir>,
    id: u64,
    conn: Arc<dyn UpConn>,
    primary: bool,
    selected: bool,
    synced: bool,
    close_sent: bool,
    searched: bool,
    hmsc: HiModSeq,
    uids_to_download: SeqSetBuilder,
    tag: u64,
    cbs: VecDeque<(String, Cb)>,
}

impl std::fmt::Debug for Up {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Up")
            .field("id", &self.id)
            .field("primary", &self.primary)
            .field("selected", &self.selected)
            .field("synced", &self.synced)
            .field("close_sent", &self.close_sent)
            .field("searched", &self.searched)
            .field("hmsc", &self.hmsc)
            .field("uids_to_download", &self.uids_to_download)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Up {
    pub(crate) fn new(m: Arc<Imaildir>, id: u64, conn: Arc<dyn UpConn>, primary: bool) -> Self {
        let hmsc = HiModSeq::prep(m.himodseq_up());
        Self {
            m,
            id,
            conn,
            primary,
            selected: false,
            synced: false,
            close_sent: false,
            searched: false,
            hmsc,
            uids_to_download: SeqSetBuilder::new(),
            tag: 0,
            cbs: VecDeque::new(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn selected(&self) -> bool {
        self.selected
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    fn send(&mut self, cmd: ImapCmd, cb: Cb) {
        self.tag += 1;
        let tag = format!("maildir_up{}", self.tag);
        self.cbs.push_back((tag.clone(), cb));
        self.conn.cmd(TaggedCmd { tag, cmd });
    }

    /// Issue the SELECT that makes this the driving connection. Called by
    /// the maildir when this registration is the primary.
    pub(crate) fn start(&mut self) {
        let uidvld = self.m.uidvld();
        let himodseq = self.m.himodseq_up();
        let qresync = if uidvld != 0 && himodseq != 0 {
            Some((uidvld, himodseq))
        } else {
            None
        };
        let cmd = ImapCmd::Select {
            mailbox: self.m.name().to_string(),
            qresync,
        };
        self.send(cmd, Cb::Select);
        // treat the connection as selected as soon as the SELECT is sent
        self.selected = true;
    }

    fn send_initial_search(&mut self) {
        self.send(ImapCmd::UidSearchAll, Cb::InitialSearch);
    }

    fn send_fetch(&mut self) {
        let set = self.uids_to_download.extract();
        self.send(ImapCmd::UidFetch(set), Cb::Fetch);
    }

    fn send_close(&mut self) {
        self.close_sent = true;
        self.send(ImapCmd::Close, Cb::Close);
    }

    /// Request unselection; answers immediately if nothing was selected.
    pub fn unselect(&mut self) {
        if !self.selected {
            self.conn.unselected();
            return;
        }
        if !self.close_sent {
            self.send_close();
        }
    }

    /// After every command, evaluate internal state to decide the next one.
    fn next_cmd(&mut self) -> Result<()> {
        if self.hmsc.step() {
            self.m.set_himodseq_up(self.hmsc.now())?;
        }

        // never send anything more after a close
        if self.close_sent {
            return Ok(());
        }

        if self.hmsc.now() == 0 && !self.searched {
            // no valid modseq known; enumerate everything explicitly
            self.send_initial_search();
        } else if !self.uids_to_download.is_empty() {
            self.send_fetch();
        } else if !self.synced {
            self.synced = true;
            self.m.broadcast_synced();
        }
        Ok(())
    }

    fn fetch_resp(&mut self, fetch: FetchResp) -> Result<()> {
        let uid = match fetch.uid {
            Some(u) => u,
            None => {
                log::warn!("detected fetch without UID, skipping");
                return Ok(());
            }
        };

        match self.m.lookup(uid) {
            None => {
                self.m.new_msg(uid, fetch.flags.unwrap_or_default())?;
                if fetch.content.is_none() {
                    self.uids_to_download.add(uid);
                }
            }
            Some(filled) => {
                if let Some(flags) = fetch.flags {
                    self.m.update_flags(uid, flags, fetch.modseq)?;
                }
                if filled && fetch.content.is_some() {
                    log::warn!("dropping unexpected content for filled uid {}", uid);
                }
            }
        }

        if let Some(content) = &fetch.content {
            if self.m.lookup(uid) == Some(false) {
                let intdate = fetch
                    .intdate
                    .ok_or_else(|| Error::new(ErrorKind::Response, "missing INTERNALDATE response"))?;
                self.m.fill_from_fetch(uid, intdate, content)?;
            }
        }

        if let Some(modseq) = fetch.modseq {
            if modseq > 0 {
                self.hmsc.saw_fetch(modseq);
            }
        }
        Ok(())
    }

    fn untagged_ok(&mut self, code: Option<OkCode>) -> Result<()> {
        match code {
            Some(OkCode::UidValidity(uidvld)) => {
                self.m.check_uidvld(uidvld)?;
                // the driver's view of the persisted modseq may be stale now
                if self.m.himodseq_up() == 0 {
                    self.hmsc = HiModSeq::prep(0);
                }
                Ok(())
            }
            Some(OkCode::HighestModSeq(v)) => {
                self.hmsc.saw_ok_code(v);
                Ok(())
            }
            Some(OkCode::ReadOnly) => Err(Error::new(
                ErrorKind::Internal,
                "unable to handle read-only boxes",
            )),
            Some(OkCode::NoModSeq) => Err(Error::new(
                ErrorKind::Response,
                "server mailbox does not support modseq numbers",
            )),
            Some(OkCode::ReadWrite)
            | Some(OkCode::UidNext(_))
            | Some(OkCode::PermanentFlags(_))
            | Some(OkCode::Unseen(_))
            | None => Ok(()),
            Some(OkCode::Other(code)) => {
                Err(Error::new(ErrorKind::Internal, format!("code not supported: {}", code)))
            }
        }
    }

    fn tagged(&mut self, tag: String, status: Status, text: String) -> Result<()> {
        let (expected, cb) = self.cbs.pop_front().ok_or_else(|| {
            Error::new(
                ErrorKind::Response,
                format!("got tag {} with no commands in flight", tag),
            )
        })?;
        if tag != expected {
            return Err(Error::new(
                ErrorKind::Response,
                format!("got tag {} but expected {}", tag, expected),
            ));
        }
        let ok = status == Status::Ok;
        match cb {
            Cb::Select => {
                if !ok {
                    return Err(Error::new(ErrorKind::Param, format!("select failed: {}", text)));
                }
                // pull the needs-download set exactly once, after becoming
                // primary and before the first next_cmd
                for uid in self.m.unfilled_uids() {
                    self.uids_to_download.add(uid);
                }
                if self.m.himodseq_up() == 0 {
                    // first-time sync: delay next_cmd, which would try to
                    // persist the highest modseq before any fetch ran
                    self.send_initial_search();
                } else {
                    self.next_cmd()?;
                }
                Ok(())
            }
            Cb::InitialSearch => {
                if !ok {
                    return Err(Error::new(ErrorKind::Param, format!("search failed: {}", text)));
                }
                self.searched = true;
                if !self.uids_to_download.is_empty() {
                    // skip next_cmd: the highest modseq cannot be stored
                    // until the first complete fetch
                    self.send_fetch();
                    Ok(())
                } else {
                    self.next_cmd()
                }
            }
            Cb::Fetch => {
                if !ok {
                    return Err(Error::new(ErrorKind::Param, format!("fetch failed: {}", text)));
                }
                self.next_cmd()
            }
            Cb::Close => {
                if !ok {
                    return Err(Error::new(ErrorKind::Param, format!("close failed: {}", text)));
                }
                self.selected = false;
                self.conn.unselected();
                Ok(())
            }
        }
    }

    /// Feed one upstream response into the driver.
    pub fn resp(&mut self, resp: ImapResp) -> Result<()> {
        match resp {
            ImapResp::Tagged { tag, status, text } => self.tagged(tag, status, text),
            ImapResp::UntaggedOk { code, .. } => self.untagged_ok(code),
            ImapResp::UntaggedNo(text) => Err(Error::new(
                ErrorKind::Internal,
                format!("unhandled * NO status message: {}", text),
            )),
            ImapResp::UntaggedBad(text) => Err(Error::new(
                ErrorKind::Internal,
                format!("unhandled * BAD status message: {}", text),
            )),
            ImapResp::Bye(text) => Err(Error::new(
                ErrorKind::Internal,
                format!("unhandled * BYE status message: {}", text),
            )),
            ImapResp::Fetch(f) => self.fetch_resp(f),
            ImapResp::Search(uids) => {
                for uid in uids {
                    self.uids_to_download.add(uid);
                }
                Ok(())
            }
            ImapResp::Exists(_) | ImapResp::Recent(_) | ImapResp::FlagsList(_) => Ok(()),
        }
    }
}

impl Drop for Up {
    fn drop(&mut self) {
        if self.m.unregister_up(self.id) {
            self.conn.release(None);
        }
    }
}
