/*
 * maildir.rs
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

//! The shared IMAP maildir: UID-keyed message trees (filled and
//! needs-download), expunge tombstones, a modseq ordering, and the
//! persistent log, all behind a readers/writer content lock. A separate
//! mutex guards the list of registered upstream connections. The log and
//! the trees are kept consistent under the same critical section, and the
//! log is journalled before any file rename it describes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::crypto::{Decrypter, Keypair};
use crate::error::{Error, ErrorKind, Result};
use crate::maildir::name::{mod_hostname_imap, Flags, ImapName};
use crate::maildir::{epoch_now, local_hostname};
use crate::protocol::imap::log::{LogMsg, MaildirLog, Subdir};
use crate::protocol::imap::up::{Up, UpConn};

/// One known message. `file` is None while the content still needs to be
/// downloaded.
#[derive(Debug, Clone)]
pub struct MsgBase {
    pub uid: u32,
    pub modseq: u64,
    pub intdate: i64,
    pub flags: Flags,
    pub length: u64,
    pub file: Option<(Subdir, String)>,
}

impl MsgBase {
    fn from_log(msg: &LogMsg) -> Self {
        Self {
            uid: msg.uid,
            modseq: msg.modseq,
            intdate: msg.intdate,
            flags: msg.flags,
            length: msg.length,
            // fill status comes from the files actually on disk, not the log
            file: None,
        }
    }

    fn to_log(&self) -> LogMsg {
        LogMsg {
            uid: self.uid,
            modseq: self.modseq,
            intdate: self.intdate,
            length: self.length,
            flags: self.flags,
            file: self.file.clone(),
        }
    }
}

pub(crate) struct Content {
    pub msgs: BTreeMap<u32, MsgBase>,
    pub msgs_empty: BTreeMap<u32, MsgBase>,
    pub expunged: BTreeSet<u32>,
    /// modseq -> uid, source of the highest modseq served downstream.
    pub mods: BTreeMap<u64, u32>,
    pub log: MaildirLog,
    tmp_count: u64,
}

struct Access {
    ups: Vec<(u64, Arc<dyn UpConn>)>,
    next_id: u64,
    failed: bool,
}

/// A mailbox shared by concurrent upstream connections.
pub struct Imaildir {
    path: PathBuf,
    name: String,
    keypair: Keypair,
    pub(crate) content: RwLock<Content>,
    access: Mutex<Access>,
}

impl Imaildir {
    /// Open the maildir, load the log, and reconcile it against the files
    /// under cur/ and new/. Log entries without a matching file become the
    /// needs-download set.
    pub fn init(path: impl Into<PathBuf>, name: &str, keypair: Keypair) -> Result<Arc<Self>> {
        let path = path.into();
        for sub in ["", "cur", "new", "tmp"] {
            let dir = if sub.is_empty() { path.clone() } else { path.join(sub) };
            fs::create_dir_all(&dir)
                .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", dir.display(), e)))?;
        }

        let log = MaildirLog::open(&path)?;
        let mut bases: BTreeMap<u32, MsgBase> = log
            .msgs()
            .values()
            .map(|m| (m.uid, MsgBase::from_log(m)))
            .collect();
        let expunged: BTreeSet<u32> = log.expunged().iter().copied().collect();

        // walk cur/ and new/, filling bases whose UID the log knows
        for subdir in [Subdir::Cur, Subdir::New] {
            let dir = path.join(subdir.as_str());
            let entries = fs::read_dir(&dir)
                .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", dir.display(), e)))?;
            for entry in entries {
                let entry =
                    entry.map_err(|e| Error::new(ErrorKind::Fs, format!("readdir: {}", e)))?;
                if !entry.path().is_file() {
                    continue;
                }
                let fname = entry.file_name().to_string_lossy().to_string();
                let parsed = match ImapName::parse(&fname) {
                    Ok(p) => p,
                    Err(_) => {
                        // needs to be sync'd; policy is to leave it alone
                        log::warn!("ignoring unparseable maildir file {:?}", fname);
                        continue;
                    }
                };
                let base = bases.get_mut(&parsed.uid).ok_or_else(|| {
                    Error::new(ErrorKind::Internal, format!("UID {} on file not in log", parsed.uid))
                })?;
                if base.file.is_some() {
                    return Err(Error::new(
                        ErrorKind::Internal,
                        format!("duplicate UID {} on file", parsed.uid),
                    ));
                }
                base.length = parsed.length;
                base.file = Some((subdir, fname));
            }
        }

        let mut msgs = BTreeMap::new();
        let mut msgs_empty = BTreeMap::new();
        let mut mods = BTreeMap::new();
        for (uid, base) in bases {
            if base.modseq > 0 {
                mods.insert(base.modseq, uid);
            }
            if base.file.is_some() {
                msgs.insert(uid, base);
            } else {
                msgs_empty.insert(uid, base);
            }
        }

        Ok(Arc::new(Self {
            path,
            name: name.to_string(),
            keypair,
            content: RwLock::new(Content {
                msgs,
                msgs_empty,
                expunged,
                mods,
                log,
                tmp_count: 0,
            }),
            access: Mutex::new(Access {
                ups: Vec::new(),
                next_id: 1,
                failed: false,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest modseq served downstream: the newest known modification, or
    /// 1 for an empty mailbox.
    fn himodseq_dn_locked(content: &Content) -> u64 {
        content
            .mods
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(1)
    }

    pub fn himodseq_dn(&self) -> u64 {
        let content = self.content.read().unwrap();
        Self::himodseq_dn_locked(&content)
    }

    pub fn himodseq_up(&self) -> u64 {
        self.content.read().unwrap().log.get_himodseq_up()
    }

    pub fn set_himodseq_up(&self, modseq: u64) -> Result<()> {
        self.content.write().unwrap().log.set_himodseq_up(modseq)
    }

    pub fn uidvld(&self) -> u32 {
        self.content.read().unwrap().log.get_uidvld()
    }

    /// Number of downloaded messages (snapshot).
    pub fn message_count(&self) -> usize {
        self.content.read().unwrap().msgs.len()
    }

    /// UIDs known but not yet downloaded (snapshot).
    pub fn unfilled_uids(&self) -> Vec<u32> {
        self.content
            .read()
            .unwrap()
            .msgs_empty
            .keys()
            .copied()
            .collect()
    }

    /// Whether a UID is known, and whether its content is on disk.
    pub(crate) fn lookup(&self, uid: u32) -> Option<bool> {
        let content = self.content.read().unwrap();
        if content.msgs.contains_key(&uid) {
            Some(true)
        } else if content.msgs_empty.contains_key(&uid) {
            Some(false)
        } else {
            None
        }
    }

    /// Record a newly-seen UID (no content yet). Journals before mutating
    /// the trees.
    pub(crate) fn new_msg(&self, uid: u32, flags: Flags) -> Result<()> {
        let mut content = self.content.write().unwrap();
        let modseq = Self::himodseq_dn_locked(&content) + 1;
        let base = MsgBase {
            uid,
            modseq,
            intdate: 0,
            flags,
            length: 0,
            file: None,
        };
        content.log.update_msg(base.to_log())?;
        content.mods.insert(modseq, uid);
        content.msgs_empty.insert(uid, base);
        Ok(())
    }

    /// Flags/modseq update for an already-known UID, journalled.
    pub(crate) fn update_flags(&self, uid: u32, flags: Flags, modseq: Option<u64>) -> Result<()> {
        let mut content = self.content.write().unwrap();
        let base = match content
            .msgs
            .get(&uid)
            .or_else(|| content.msgs_empty.get(&uid))
        {
            Some(b) => b.clone(),
            None => return Ok(()),
        };
        let mut updated = base.clone();
        updated.flags = flags;
        if let Some(m) = modseq {
            updated.modseq = m;
        }
        content.log.update_msg(updated.to_log())?;
        if updated.modseq != base.modseq {
            content.mods.remove(&base.modseq);
            content.mods.insert(updated.modseq, uid);
        }
        if content.msgs.contains_key(&uid) {
            content.msgs.insert(uid, updated);
        } else {
            content.msgs_empty.insert(uid, updated);
        }
        Ok(())
    }

    /// Decrypt fetched content into tmp/, journal the filled record, then
    /// rename into cur/ and move the base to the filled tree.
    pub(crate) fn fill_from_fetch(&self, uid: u32, intdate: i64, content_bytes: &[u8]) -> Result<()> {
        let mut content = self.content.write().unwrap();
        let mut base = match content.msgs_empty.get(&uid) {
            Some(b) => b.clone(),
            None => {
                log::warn!("dropping unexpected content for uid {}", uid);
                return Ok(());
            }
        };

        base.intdate = intdate;
        // save the internaldate before saving the file content, in case we
        // crash between the two
        content.log.update_msg(base.to_log())?;

        let tmp_id = content.tmp_count;
        content.tmp_count += 1;
        let tmp_path = self.path.join("tmp").join(tmp_id.to_string());

        let mut plain = Vec::new();
        let mut dc = Decrypter::new();
        dc.start(&self.keypair);
        dc.update(content_bytes, &mut plain)?;
        dc.finish(&mut plain)?;

        fs::write(&tmp_path, &plain)
            .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", tmp_path.display(), e)))?;

        base.length = plain.len() as u64;
        let cur_name = ImapName {
            epoch: epoch_now(),
            length: base.length,
            uid,
            flags: base.flags,
            host: mod_hostname_imap(&local_hostname()),
            info: None,
        }
        .write();
        base.file = Some((Subdir::Cur, cur_name.clone()));

        // journal before the rename so a crash never leaves an untracked file
        content.log.update_msg(base.to_log())?;

        let cur_path = self.path.join("cur").join(&cur_name);
        fs::rename(&tmp_path, &cur_path)
            .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", cur_path.display(), e)))?;

        content.msgs_empty.remove(&uid);
        content.msgs.insert(uid, base);
        Ok(())
    }

    /// Compare the advertised uid-validity against the log; on mismatch,
    /// drop the log, delete every message file, and start over.
    pub(crate) fn check_uidvld(&self, uidvld: u32) -> Result<()> {
        let mut content = self.content.write().unwrap();
        let old = content.log.get_uidvld();
        if old == uidvld {
            return Ok(());
        }
        if old != 0 {
            log::error!("detected change in UIDVALIDITY, dropping cache");
        } else {
            log::info!("detected first-time download");
        }
        content.log.drop_log()?;
        for sub in ["cur", "new", "tmp"] {
            let dir = self.path.join(sub);
            let entries = fs::read_dir(&dir)
                .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", dir.display(), e)))?;
            for entry in entries {
                let entry =
                    entry.map_err(|e| Error::new(ErrorKind::Fs, format!("readdir: {}", e)))?;
                if entry.path().is_file() {
                    fs::remove_file(entry.path()).map_err(|e| {
                        Error::new(ErrorKind::Fs, format!("{}: {}", entry.path().display(), e))
                    })?;
                }
            }
        }
        content.msgs.clear();
        content.msgs_empty.clear();
        content.expunged.clear();
        content.mods.clear();
        content.log.set_uidvld(uidvld)?;
        content.log.set_himodseq_up(0)?;
        Ok(())
    }

    /// Register an upstream connection. The first registrant becomes the
    /// primary and drives the sync state machine.
    pub fn register_up(self: &Arc<Self>, conn: Arc<dyn UpConn>) -> Result<Up> {
        let (id, primary) = {
            let mut access = self.access.lock().unwrap();
            if access.failed {
                return Err(Error::new(ErrorKind::Dead, "maildir in failed state"));
            }
            let id = access.next_id;
            access.next_id += 1;
            let primary = access.ups.is_empty();
            access.ups.push((id, conn.clone()));
            (id, primary)
        };
        let mut up = Up::new(self.clone(), id, conn, primary);
        if primary {
            up.start();
        }
        Ok(up)
    }

    /// Remove a registration; returns false if the maildir already failed
    /// (the failure broadcast owns the release in that case).
    pub(crate) fn unregister_up(&self, id: u64) -> bool {
        let mut access = self.access.lock().unwrap();
        if access.failed {
            return false;
        }
        let before = access.ups.len();
        access.ups.retain(|(i, _)| *i != id);
        access.ups.len() != before
    }

    /// Tell every registered connection the mailbox is synchronized.
    pub(crate) fn broadcast_synced(&self) {
        let conns: Vec<Arc<dyn UpConn>> = {
            let access = self.access.lock().unwrap();
            access.ups.iter().map(|(_, c)| c.clone()).collect()
        };
        for conn in conns {
            conn.synced();
        }
    }

    /// Broadcast a failure and release every registered connection; the
    /// maildir then rejects new registrations with `Dead`.
    pub fn fail(&self, err: Option<Error>) {
        let conns: Vec<Arc<dyn UpConn>> = {
            let mut access = self.access.lock().unwrap();
            if access.failed {
                return;
            }
            access.failed = true;
            access.ups.drain(..).map(|(_, c)| c).collect()
        };
        for conn in conns {
            conn.release(err.clone());
        }
    }

    /// Close an open maildir that needs to be deleted.
    pub fn forceclose(&self) {
        self.fail(None);
    }
}
