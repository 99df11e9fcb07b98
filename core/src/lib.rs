/*
 * lib.rs
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

//! Core for the Splintermail client. The DITM terminates a POP3 session
//! from the local MUA, proxies it over TLS to the encrypted store, and
//! transparently downloads and decrypts new mail into a local maildir. A
//! parallel IMAP maildir subsystem performs incremental QRESYNC-style
//! resynchronisation with persistent UID/MODSEQ tracking.

pub mod api;
pub mod crypto;
pub mod ditm;
pub mod error;
pub mod keytool;
pub mod maildir;
pub mod net;
pub mod protocol;

pub use error::{Error, ErrorKind, Result};
