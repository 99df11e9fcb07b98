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

//! POP3: dot-stuffing codec, client to the upstream store, and the command
//! machine facing the MUA.

pub mod client;
pub mod codec;
pub mod server;

pub use client::Pop3Client;
pub use codec::{pop3_encode, Pop3Decoder};
pub use server::{Pop3Command, Pop3Server};
