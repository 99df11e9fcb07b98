/*
 * error.rs
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

//! Tagged error kinds with an attached trace. Errors are values: callers
//! propagate with `?`, remap with `rethrow`, or match on `kind()`.

use std::fmt;
use std::io;

/// What went wrong, organised by what the caller can do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic I/O failure.
    Io,
    /// Broken or unestablishable connection.
    Conn,
    /// Socket-level failure (bind, listen).
    Sock,
    /// TLS-layer failure: handshake, certificate, or a cryptographically
    /// malformed input at the crypto layer.
    Ssl,
    /// A value did not meet expectations (bad banner, refused delete).
    Value,
    /// A bounded buffer filled up. Remapped to `Response` at wire
    /// boundaries, `Internal` where our own sizing is at fault.
    FixedSize,
    /// Host OS error reading or writing an already-open resource.
    Os,
    /// Index out of range.
    BadIdx,
    /// Envelope not addressed to this device.
    Not4Me,
    /// Failed to open a resource that may simply not exist.
    Open,
    /// Malformed input, including a malformed message body.
    Param,
    /// Programmer error.
    Internal,
    /// File system issue the user may be able to fix.
    Fs,
    /// The remote peer misbehaved.
    Response,
    /// No usable key material.
    NoKeys,
    /// Resource already terminated.
    Dead,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Io => "io",
            ErrorKind::Conn => "connection",
            ErrorKind::Sock => "socket",
            ErrorKind::Ssl => "ssl",
            ErrorKind::Value => "value",
            ErrorKind::FixedSize => "fixedsize",
            ErrorKind::Os => "os",
            ErrorKind::BadIdx => "badidx",
            ErrorKind::Not4Me => "not4me",
            ErrorKind::Open => "open",
            ErrorKind::Param => "param",
            ErrorKind::Internal => "internal",
            ErrorKind::Fs => "filesystem",
            ErrorKind::Response => "response",
            ErrorKind::NoKeys => "nokeys",
            ErrorKind::Dead => "dead",
        }
    }
}

/// An error kind plus the trace accumulated as it propagated.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    trace: Vec<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            trace: vec![msg.into()],
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Remap to another kind, preserving the trace.
    pub fn rethrow(mut self, kind: ErrorKind) -> Self {
        if kind != self.kind {
            self.trace
                .push(format!("rethrown {} as {}", self.kind.as_str(), kind.as_str()));
            self.kind = kind;
        }
        self
    }

    /// Append a line to the trace.
    pub fn note(mut self, msg: impl Into<String>) -> Self {
        self.trace.push(msg.into());
        self
    }

    pub fn trace(&self) -> &[String] {
        &self.trace
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        for line in &self.trace {
            write!(f, ": {}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorKind::Open,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::Conn,
            _ => ErrorKind::Io,
        };
        Self::new(kind, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
