/*
 * name.rs
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

//! Maildir filename parse/generate. Two forms share the grammar
//! `EPOCH "." DELIV_ID "." MODHOST [":" INFO]`:
//!
//! - POP form: DELIV_ID = `LENGTH "," UID` with an opaque string UID; the
//!   hostname component has `/` `:` `.` escaped so the name splits strictly.
//! - IMAP form: DELIV_ID = `LENGTH "," UID "," FLAGSET` with a numeric UID
//!   and flags from {A,D,F,S,X}; the hostname may contain dots (soft split)
//!   and escapes only `/` and `:`.
//!
//! INFO is controlled by the MUA and preserved verbatim.

use crate::error::{Error, ErrorKind, Result};

/// Message flags as stored in the IMAP-form filename, written in
/// alphabetical order: Answered, Draft, Flagged, Seen, X (deleted).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub answered: bool,
    pub draft: bool,
    pub flagged: bool,
    pub seen: bool,
    pub deleted: bool,
}

impl Flags {
    pub fn parse(s: &str) -> Result<Self> {
        let mut flags = Flags::default();
        for c in s.chars() {
            match c {
                'A' => flags.answered = true,
                'D' => flags.draft = true,
                'F' => flags.flagged = true,
                'S' => flags.seen = true,
                'X' => flags.deleted = true,
                _ => return Err(Error::new(ErrorKind::Param, format!("invalid flag {:?}", c))),
            }
        }
        Ok(flags)
    }

    pub fn write(&self) -> String {
        let mut s = String::new();
        if self.answered {
            s.push('A');
        }
        if self.draft {
            s.push('D');
        }
        if self.flagged {
            s.push('F');
        }
        if self.seen {
            s.push('S');
        }
        if self.deleted {
            s.push('X');
        }
        s
    }
}

/// Escape a hostname for the POP name form: the result contains none of the
/// characters the parser splits on.
pub fn mod_hostname(host: &str) -> String {
    let mut out = String::with_capacity(host.len());
    for c in host.chars() {
        match c {
            '/' => out.push_str("057"),
            ':' => out.push_str("072"),
            '.' => out.push_str("056"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a hostname for the IMAP name form; dots are allowed there.
pub fn mod_hostname_imap(host: &str) -> String {
    let mut out = String::with_capacity(host.len());
    for c in host.chars() {
        match c {
            '/' => out.push_str("057"),
            ':' => out.push_str("072"),
            _ => out.push(c),
        }
    }
    out
}

/// Parsed POP-form filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopName {
    pub epoch: u64,
    pub length: u64,
    pub uid: String,
    pub host: String,
    pub info: Option<String>,
}

impl PopName {
    pub fn parse(name: &str) -> Result<Self> {
        if name.len() < 16 {
            return Err(Error::new(ErrorKind::Param, "name too short"));
        }
        let major: Vec<&str> = name.split(':').collect();
        if major.len() > 2 {
            return Err(Error::new(ErrorKind::Param, "too many major tokens"));
        }
        let info = major.get(1).map(|s| s.to_string());

        let minor: Vec<&str> = major[0].split('.').collect();
        if minor.len() != 3 {
            return Err(Error::new(ErrorKind::Param, "wrong number of minor tokens"));
        }
        let epoch: u64 = minor[0]
            .parse()
            .map_err(|_| Error::new(ErrorKind::Param, "bad epoch"))?;

        let fields: Vec<&str> = minor[1].split(',').collect();
        if fields.len() != 2 {
            return Err(Error::new(ErrorKind::Param, "wrong number of fields"));
        }
        let length: u64 = fields[0]
            .parse()
            .map_err(|_| Error::new(ErrorKind::Param, "bad length"))?;
        let uid = fields[1];
        if uid.is_empty() {
            return Err(Error::new(ErrorKind::Param, "empty uid"));
        }

        Ok(Self {
            epoch,
            length,
            uid: uid.to_string(),
            host: minor[2].to_string(),
            info,
        })
    }

    pub fn write(&self) -> String {
        let mut s = format!("{}.{},{}.{}", self.epoch, self.length, self.uid, self.host);
        if let Some(ref info) = self.info {
            s.push(':');
            s.push_str(info);
        }
        s
    }
}

/// Parsed IMAP-form filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapName {
    pub epoch: u64,
    pub length: u64,
    pub uid: u32,
    pub flags: Flags,
    pub host: String,
    pub info: Option<String>,
}

impl ImapName {
    pub fn parse(name: &str) -> Result<Self> {
        if name.len() < 16 {
            return Err(Error::new(ErrorKind::Param, "name too short"));
        }
        let major: Vec<&str> = name.split(':').collect();
        if major.len() > 2 {
            return Err(Error::new(ErrorKind::Param, "too many major tokens"));
        }
        let info = major.get(1).map(|s| s.to_string());

        // soft split: the hostname may itself contain dots
        let minor: Vec<&str> = major[0].split('.').collect();
        if minor.len() < 3 {
            return Err(Error::new(ErrorKind::Param, "wrong number of minor tokens"));
        }
        let epoch: u64 = minor[0]
            .parse()
            .map_err(|_| Error::new(ErrorKind::Param, "bad epoch"))?;
        let host = minor[2..].join(".");

        let fields: Vec<&str> = minor[1].split(',').collect();
        if fields.len() != 3 {
            return Err(Error::new(ErrorKind::Param, "wrong number of fields"));
        }
        let length: u64 = fields[0]
            .parse()
            .map_err(|_| Error::new(ErrorKind::Param, "bad length"))?;
        let uid: u32 = fields[1]
            .parse()
            .map_err(|_| Error::new(ErrorKind::Param, "bad uid"))?;
        let flags = Flags::parse(fields[2])?;

        Ok(Self {
            epoch,
            length,
            uid,
            flags,
            host,
            info,
        })
    }

    pub fn write(&self) -> String {
        let mut s = format!(
            "{}.{},{},{}.{}",
            self.epoch,
            self.length,
            self.uid,
            self.flags.write(),
            self.host
        );
        if let Some(ref info) = self.info {
            s.push(':');
            s.push_str(info);
        }
        s
    }
}
