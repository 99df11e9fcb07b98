/*
 * types.rs
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

//! Typed IMAP commands and responses for the upstream sync driver, plus a
//! sequence-set builder. Commands render to wire text for the transport;
//! responses are plain data the transport constructs after parsing.

use std::collections::BTreeSet;
use std::fmt;

pub use crate::maildir::name::Flags;

/// A set of UIDs expressed as coalesced ranges, e.g. `1:4,7,9:12`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqSet(Vec<(u32, u32)>);

impl SeqSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter_uids(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().flat_map(|&(a, b)| a..=b)
    }
}

impl fmt::Display for SeqSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &(a, b)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if a == b {
                write!(f, "{}", a)?;
            } else {
                write!(f, "{}:{}", a, b)?;
            }
        }
        Ok(())
    }
}

/// Accumulates UIDs to download; extraction coalesces them into ranges and
/// empties the builder.
#[derive(Debug, Default)]
pub struct SeqSetBuilder {
    vals: BTreeSet<u32>,
}

impl SeqSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, uid: u32) {
        self.vals.insert(uid);
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    pub fn extract(&mut self) -> SeqSet {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for &v in &self.vals {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == v => *end = v,
                _ => ranges.push((v, v)),
            }
        }
        self.vals.clear();
        SeqSet(ranges)
    }
}

/// Commands the sync driver issues upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImapCmd {
    Select {
        mailbox: String,
        /// (uid-validity, last known modseq); both must be known to QRESYNC.
        qresync: Option<(u32, u64)>,
    },
    /// `UID SEARCH UID 1:*`, enumerating every message.
    UidSearchAll,
    /// `UID FETCH <set> (UID FLAGS RFC822 INTERNALDATE MODSEQ)`.
    UidFetch(SeqSet),
    Close,
}

/// A command with its `maildir_up<N>` tag attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedCmd {
    pub tag: String,
    pub cmd: ImapCmd,
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

impl fmt::Display for TaggedCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.tag)?;
        match &self.cmd {
            ImapCmd::Select { mailbox, qresync } => {
                write!(f, "SELECT {}", quote(mailbox))?;
                if let Some((uidvld, modseq)) = qresync {
                    write!(f, " (QRESYNC ({} {}))", uidvld, modseq)?;
                }
                Ok(())
            }
            ImapCmd::UidSearchAll => write!(f, "UID SEARCH UID 1:*"),
            ImapCmd::UidFetch(set) => {
                write!(f, "UID FETCH {} (UID FLAGS RFC822 INTERNALDATE MODSEQ)", set)
            }
            ImapCmd::Close => write!(f, "CLOSE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
    Bye,
}

/// Status codes carried in bracketed response text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OkCode {
    UidValidity(u32),
    UidNext(u32),
    HighestModSeq(u64),
    PermanentFlags(Vec<String>),
    ReadOnly,
    ReadWrite,
    Unseen(u32),
    NoModSeq,
    Other(String),
}

/// One `* FETCH` response.
#[derive(Debug, Clone, Default)]
pub struct FetchResp {
    pub uid: Option<u32>,
    pub flags: Option<Flags>,
    /// INTERNALDATE as epoch seconds.
    pub intdate: Option<i64>,
    pub modseq: Option<u64>,
    /// RFC822 literal, when the fetch asked for content.
    pub content: Option<Vec<u8>>,
}

/// Responses the transport feeds into the sync driver.
#[derive(Debug, Clone)]
pub enum ImapResp {
    Tagged {
        tag: String,
        status: Status,
        text: String,
    },
    UntaggedOk {
        code: Option<OkCode>,
        text: String,
    },
    UntaggedNo(String),
    UntaggedBad(String),
    Bye(String),
    Fetch(FetchResp),
    Search(Vec<u32>),
    Exists(u32),
    Recent(u32),
    FlagsList(Vec<String>),
}
