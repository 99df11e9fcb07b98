/*
 * log.rs
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

//! Persistent index for an IMAP maildir (.smlog): uid-validity, the
//! highest modseq synced from upstream, one record per known message and
//! one per expunged UID. Every mutation rewrites the file through a temp
//! file and rename, before any maildir file rename it describes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind, Result};
use crate::maildir::name::Flags;

const HEADER: &str = "# splintermail-imap-log v1";
const LOG_FILENAME: &str = ".smlog";

/// Which maildir subdirectory a downloaded message lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subdir {
    Cur,
    New,
}

impl Subdir {
    pub fn as_str(self) -> &'static str {
        match self {
            Subdir::Cur => "cur",
            Subdir::New => "new",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "cur" => Some(Subdir::Cur),
            "new" => Some(Subdir::New),
            _ => None,
        }
    }
}

/// One message record. `file` is None until the content is downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMsg {
    pub uid: u32,
    pub modseq: u64,
    /// INTERNALDATE as epoch seconds; 0 until known.
    pub intdate: i64,
    pub length: u64,
    pub flags: Flags,
    pub file: Option<(Subdir, String)>,
}

/// The log itself. All setters persist before returning.
pub struct MaildirLog {
    path: PathBuf,
    uidvld: u32,
    himodseq_up: u64,
    msgs: BTreeMap<u32, LogMsg>,
    expunged: BTreeSet<u32>,
}

impl MaildirLog {
    /// Open the log for a maildir root, loading any existing file. An
    /// unreadable or unrecognized file starts fresh (first-time download
    /// semantics); a present-but-corrupt record is a `Fs` error.
    pub fn open(maildir_path: &Path) -> Result<Self> {
        let path = maildir_path.join(LOG_FILENAME);
        let mut log = Self {
            path,
            uidvld: 0,
            himodseq_up: 0,
            msgs: BTreeMap::new(),
            expunged: BTreeSet::new(),
        };
        if !log.path.exists() {
            return Ok(log);
        }
        let f = File::open(&log.path)
            .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", log.path.display(), e)))?;
        let reader = BufReader::new(f);
        let mut lines = reader.lines();
        let first = match lines.next() {
            Some(l) => l.map_err(|e| Error::new(ErrorKind::Fs, format!("reading log: {}", e)))?,
            None => return Ok(log),
        };
        if first != HEADER {
            log::warn!("unrecognized log header, starting fresh");
            return Ok(log);
        }
        for line in lines {
            let line = line.map_err(|e| Error::new(ErrorKind::Fs, format!("reading log: {}", e)))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            log.parse_line(line)?;
        }
        Ok(log)
    }

    fn parse_line(&mut self, line: &str) -> Result<()> {
        let bad = || Error::new(ErrorKind::Fs, format!("corrupt log line: {}", line));
        if let Some(rest) = line.strip_prefix("uidvalidity ") {
            self.uidvld = rest.trim().parse().map_err(|_| bad())?;
        } else if let Some(rest) = line.strip_prefix("himodsequp ") {
            self.himodseq_up = rest.trim().parse().map_err(|_| bad())?;
        } else if let Some(rest) = line.strip_prefix("expunged ") {
            self.expunged.insert(rest.trim().parse().map_err(|_| bad())?);
        } else if let Some(rest) = line.strip_prefix("msg ") {
            // msg <uid> <modseq> <intdate> <length> <flags|-> <subdir|-> <filename>
            let mut it = rest.splitn(7, ' ');
            let uid: u32 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
            let modseq: u64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
            let intdate: i64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
            let length: u64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
            let flags_s = it.next().ok_or_else(bad)?;
            let flags = if flags_s == "-" {
                Flags::default()
            } else {
                Flags::parse(flags_s).map_err(|_| bad())?
            };
            let subdir_s = it.next().ok_or_else(bad)?;
            let file = if subdir_s == "-" {
                None
            } else {
                let subdir = Subdir::parse(subdir_s).ok_or_else(bad)?;
                let filename = it.next().ok_or_else(bad)?.to_string();
                Some((subdir, filename))
            };
            self.msgs.insert(
                uid,
                LogMsg {
                    uid,
                    modseq,
                    intdate,
                    length,
                    flags,
                    file,
                },
            );
        } else {
            return Err(bad());
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let f = File::create(&tmp)
            .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", tmp.display(), e)))?;
        let mut w = BufWriter::new(f);
        let io_err = |e: std::io::Error| Error::new(ErrorKind::Fs, format!("writing log: {}", e));
        writeln!(w, "{}", HEADER).map_err(io_err)?;
        writeln!(w, "uidvalidity {}", self.uidvld).map_err(io_err)?;
        writeln!(w, "himodsequp {}", self.himodseq_up).map_err(io_err)?;
        for msg in self.msgs.values() {
            let flags = msg.flags.write();
            let flags = if flags.is_empty() { "-".to_string() } else { flags };
            match &msg.file {
                Some((subdir, filename)) => writeln!(
                    w,
                    "msg {} {} {} {} {} {} {}",
                    msg.uid, msg.modseq, msg.intdate, msg.length, flags, subdir.as_str(), filename
                )
                .map_err(io_err)?,
                None => writeln!(
                    w,
                    "msg {} {} {} {} {} -",
                    msg.uid, msg.modseq, msg.intdate, msg.length, flags
                )
                .map_err(io_err)?,
            }
        }
        for uid in &self.expunged {
            writeln!(w, "expunged {}", uid).map_err(io_err)?;
        }
        w.flush().map_err(io_err)?;
        drop(w);
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::new(ErrorKind::Fs, format!("installing log: {}", e)))?;
        Ok(())
    }

    pub fn get_uidvld(&self) -> u32 {
        self.uidvld
    }

    pub fn set_uidvld(&mut self, uidvld: u32) -> Result<()> {
        self.uidvld = uidvld;
        self.save()
    }

    pub fn get_himodseq_up(&self) -> u64 {
        self.himodseq_up
    }

    pub fn set_himodseq_up(&mut self, modseq: u64) -> Result<()> {
        self.himodseq_up = modseq;
        self.save()
    }

    pub fn msgs(&self) -> &BTreeMap<u32, LogMsg> {
        &self.msgs
    }

    pub fn expunged(&self) -> &BTreeSet<u32> {
        &self.expunged
    }

    /// Journal a message record (insert or replace) and persist.
    pub fn update_msg(&mut self, msg: LogMsg) -> Result<()> {
        self.msgs.insert(msg.uid, msg);
        self.save()
    }

    /// Record a tombstone, dropping any message record, and persist.
    pub fn set_expunged(&mut self, uid: u32) -> Result<()> {
        self.msgs.remove(&uid);
        self.expunged.insert(uid);
        self.save()
    }

    /// Forget everything (uid-validity change); persists the empty state.
    pub fn drop_log(&mut self) -> Result<()> {
        self.uidvld = 0;
        self.himodseq_up = 0;
        self.msgs.clear();
        self.expunged.clear();
        self.save()
    }
}
