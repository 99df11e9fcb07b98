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

//! The IMAP maildir subsystem: a persistent message/flag/expunge index, a
//! shared maildir for concurrent upstream connections, and the sync driver
//! the primary connection runs. Downwards IMAP connections toward the MUA
//! are reserved for future work.

pub mod log;
pub mod maildir;
pub mod types;
pub mod up;

pub use log::{LogMsg, MaildirLog, Subdir};
pub use maildir::{Imaildir, MsgBase};
pub use types::{FetchResp, ImapCmd, ImapResp, OkCode, SeqSet, SeqSetBuilder, Status, TaggedCmd};
pub use up::{HiModSeq, Up, UpConn};
