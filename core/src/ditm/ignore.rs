/*
 * ignore.rs
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

//! Per-user set of upstream UIDs known not to be encrypted to this device.
//! Entries never observed in a UIDL are dropped on write; the server has
//! deleted those messages itself.

use std::fs;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

const IGNORE_FILENAME: &str = "ignore.json";

pub struct IgnoreList {
    uids: Vec<String>,
    seen: Vec<bool>,
}

impl IgnoreList {
    /// Load `<userdir>/ignore.json`. Every entry starts unseen. Any read
    /// or parse failure degrades silently to an empty list.
    pub fn load(userdir: &Path) -> Self {
        let path = userdir.join(IGNORE_FILENAME);
        let uids: Vec<String> = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(uids) => uids,
                Err(_) => {
                    log::warn!("unable to parse {}", IGNORE_FILENAME);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        let seen = vec![false; uids.len()];
        Self { uids, seen }
    }

    /// Linear search; a hit marks the entry as seen.
    pub fn should_ignore(&mut self, uid: &str) -> bool {
        if let Some(idx) = self.uids.iter().position(|u| u == uid) {
            self.seen[idx] = true;
            return true;
        }
        false
    }

    pub fn add(&mut self, uid: &str) {
        self.uids.push(uid.to_string());
        self.seen.push(true);
    }

    /// Persist only the entries observed this session.
    pub fn write(&self, userdir: &Path) -> Result<()> {
        let keep: Vec<&String> = self
            .uids
            .iter()
            .zip(&self.seen)
            .filter(|(_, &seen)| seen)
            .map(|(uid, _)| uid)
            .collect();
        let json = serde_json::to_string(&keep)
            .map_err(|e| Error::new(ErrorKind::Internal, format!("encoding ignore list: {}", e)))?;
        let path = userdir.join(IGNORE_FILENAME);
        fs::write(&path, json.as_bytes())
            .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    #[cfg(test)]
    pub fn uids(&self) -> &[String] {
        &self.uids
    }
}
