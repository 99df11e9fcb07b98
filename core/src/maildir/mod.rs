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

//! Maildir-backed message store for the POP path. Messages are written to
//! tmp/ and renamed into new/ under a UID-qualified name, so at most one
//! file per UID ever exists. `filenames`, `uids` and `lengths` stay
//! index-aligned; the session keeps its deletion bitmap aligned with them.

pub mod name;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, ErrorKind, Result};
use name::{mod_hostname, PopName};

const HOSTNAME_COMPONENT_MAX_LEN: usize = 32;
const TMP_FILE_ATTEMPTS: u32 = 1000;

pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn local_hostname() -> String {
    let host = gethostname::gethostname().to_string_lossy().to_string();
    let mut host: String = host.chars().take(HOSTNAME_COMPONENT_MAX_LEN).collect();
    if host.is_empty() {
        host.push_str("localhost");
    }
    host
}

/// One user's POP maildir: cur/, new/, tmp/ under a root directory.
pub struct Maildir {
    path: PathBuf,
    filenames: Vec<String>,
    uids: Vec<String>,
    lengths: Vec<u64>,
}

impl Maildir {
    /// Open (creating directories if needed) and discover existing
    /// messages under cur/ and new/. Files whose names fall outside the
    /// maildir grammar are never treated as messages.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        for sub in ["", "cur", "new", "tmp"] {
            let dir = if sub.is_empty() { path.clone() } else { path.join(sub) };
            fs::create_dir_all(&dir)
                .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", dir.display(), e)))?;
        }

        let mut found: Vec<(String, String, String, u64)> = Vec::new();
        for sub in ["cur", "new"] {
            let dir = path.join(sub);
            let entries = fs::read_dir(&dir)
                .map_err(|e| Error::new(ErrorKind::Os, format!("{}: {}", dir.display(), e)))?;
            for entry in entries {
                let entry =
                    entry.map_err(|e| Error::new(ErrorKind::Os, format!("readdir: {}", e)))?;
                if !entry.path().is_file() {
                    continue;
                }
                let fname = entry.file_name().to_string_lossy().to_string();
                let parsed = match PopName::parse(&fname) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                found.push((fname.clone(), format!("{}/{}", sub, fname), parsed.uid, parsed.length));
            }
        }
        // readdir order is arbitrary; sort so indices are stable across sessions
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut mdir = Self {
            path,
            filenames: Vec::new(),
            uids: Vec::new(),
            lengths: Vec::new(),
        };
        for (_, rel, uid, length) in found {
            mdir.register(rel, uid, length);
        }
        Ok(mdir)
    }

    fn register(&mut self, rel_filename: String, uid: String, length: u64) {
        self.filenames.push(rel_filename);
        self.uids.push(uid);
        self.lengths.push(length);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn uids(&self) -> &[String] {
        &self.uids
    }

    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }

    pub fn uid(&self, index: usize) -> &str {
        &self.uids[index]
    }

    pub fn length(&self, index: usize) -> u64 {
        self.lengths[index]
    }

    pub fn contains_uid(&self, uid: &str) -> bool {
        self.uids.iter().any(|u| u == uid)
    }

    /// Allocate a collision-free numbered file in tmp/.
    pub fn new_tmp_file(&self) -> Result<(PathBuf, File)> {
        for i in 1..=TMP_FILE_ATTEMPTS {
            let path = self.path.join("tmp").join(i.to_string());
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(f) => return Ok((path, f)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(Error::new(
                        ErrorKind::Fs,
                        format!("creating tmp message {}: {}", path.display(), e),
                    ))
                }
            }
        }
        Err(Error::new(
            ErrorKind::Internal,
            "unable to find an unused file in maildir/tmp",
        ))
    }

    /// Build the final `<epoch>.<length>,<uid>.<mod-hostname>` name and
    /// atomically move the temp file into new/, registering the message.
    pub fn new_rename(&mut self, tmp_path: &Path, uid: &str, length: u64) -> Result<()> {
        let host = mod_hostname(&local_hostname());
        let filename = format!("{}.{},{}.{}", epoch_now(), length, uid, host);
        let newpath = self.path.join("new").join(&filename);
        fs::rename(tmp_path, &newpath).map_err(|e| {
            Error::new(
                ErrorKind::Fs,
                format!(
                    "rename {} to {}: {}",
                    tmp_path.display(),
                    newpath.display(),
                    e
                ),
            )
        })?;
        self.register(format!("new/{}", filename), uid.to_string(), length);
        Ok(())
    }

    /// Open a message file read-only.
    pub fn open_message(&self, index: usize) -> Result<File> {
        if index >= self.uids.len() {
            return Err(Error::new(ErrorKind::BadIdx, "index too high"));
        }
        let path = self.path.join(&self.filenames[index]);
        File::open(&path)
            .map_err(|e| Error::new(ErrorKind::Os, format!("{}: {}", path.display(), e)))
    }

    /// Unlink a message and drop it from the registry; later indices shift
    /// down by one.
    pub fn delete_message(&mut self, index: usize) -> Result<()> {
        if index >= self.uids.len() {
            return Err(Error::new(ErrorKind::Value, "index too high"));
        }
        let path = self.path.join(&self.filenames[index]);
        fs::remove_file(&path)
            .map_err(|e| Error::new(ErrorKind::Os, format!("{}: {}", path.display(), e)))?;
        self.filenames.remove(index);
        self.uids.remove(index);
        self.lengths.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn install(mdir: &mut Maildir, uid: &str, body: &[u8]) {
        let (path, mut f) = mdir.new_tmp_file().unwrap();
        f.write_all(body).unwrap();
        drop(f);
        mdir.new_rename(&path, uid, body.len() as u64).unwrap();
    }

    #[test]
    fn discovery_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut mdir = Maildir::new(dir.path()).unwrap();
        install(&mut mdir, "alpha", b"first message");
        install(&mut mdir, "beta", b"second");
        assert_eq!(mdir.len(), 2);

        let reopened = Maildir::new(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.contains_uid("alpha"));
        assert!(reopened.contains_uid("beta"));
        let i = reopened.uids().iter().position(|u| u == "alpha").unwrap();
        assert_eq!(reopened.length(i), 13);
    }

    #[test]
    fn non_maildir_names_ignored() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _ = Maildir::new(dir.path()).unwrap();
        }
        std::fs::write(dir.path().join("new").join(".DS_Store"), b"junk").unwrap();
        std::fs::write(dir.path().join("new").join("README"), b"junk").unwrap();
        let mdir = Maildir::new(dir.path()).unwrap();
        assert_eq!(mdir.len(), 0);
    }

    #[test]
    fn delete_shifts_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut mdir = Maildir::new(dir.path()).unwrap();
        install(&mut mdir, "one", b"1");
        install(&mut mdir, "two", b"22");
        install(&mut mdir, "three", b"333");

        let i = mdir.uids().iter().position(|u| u == "two").unwrap();
        mdir.delete_message(i).unwrap();
        assert_eq!(mdir.len(), 2);
        assert!(!mdir.contains_uid("two"));
        assert_eq!(mdir.uids().len(), mdir.lengths().len());

        let reopened = Maildir::new(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn tmp_files_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let mdir = Maildir::new(dir.path()).unwrap();
        let (p1, _f1) = mdir.new_tmp_file().unwrap();
        let (p2, _f2) = mdir.new_tmp_file().unwrap();
        assert_ne!(p1, p2);
    }

    #[test]
    fn at_most_one_file_per_uid() {
        let dir = tempfile::tempdir().unwrap();
        let mut mdir = Maildir::new(dir.path()).unwrap();
        install(&mut mdir, "dup", b"payload");
        // a crashed download retried: same uid, new content
        let count = |d: &Path| {
            let mut n = 0;
            for sub in ["cur", "new"] {
                for e in std::fs::read_dir(d.join(sub)).unwrap() {
                    let name = e.unwrap().file_name().to_string_lossy().to_string();
                    if let Ok(p) = PopName::parse(&name) {
                        if p.uid == "dup" {
                            n += 1;
                        }
                    }
                }
            }
            n
        };
        assert_eq!(count(dir.path()), 1);
    }

    #[test]
    fn open_message_bad_index() {
        let dir = tempfile::tempdir().unwrap();
        let mdir = Maildir::new(dir.path()).unwrap();
        assert_eq!(
            mdir.open_message(0).unwrap_err().kind(),
            crate::error::ErrorKind::BadIdx
        );
    }
}
