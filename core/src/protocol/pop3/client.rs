/*
 * client.rs
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

//! POP3 protocol client for the upstream store: USER/PASS, UIDL, RETR with
//! streamed bodies, DELE, RSET, TOP, QUIT. A server `-ERR` is data, not an
//! error; the (status_ok, message) pair is handed back to the caller.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorKind, Result};
use crate::net::{connect_implicit_tls, TlsStreamWrapper};
use crate::protocol::pop3::codec::Pop3Decoder;

/// Cap on a single response line; exceeding it raises `FixedSize`, which
/// wire-boundary callers remap to `Response`.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Read size for streamed message bodies.
pub const BODY_CHUNK_SIZE: usize = 4096;

/// POP3 client over any ordered byte stream.
pub struct Pop3Client<S> {
    stream: S,
    line_buf: Vec<u8>,
    max_line: usize,
    /// The upstream greeting, verbatim (the DITM parses a minimum client
    /// version token out of it).
    pub banner: String,
    /// UIDs from the last UIDL, parallel to `idxs`.
    pub uids: Vec<String>,
    /// 1-based server-assigned message numbers, parallel to `uids`.
    pub idxs: Vec<u32>,
    decoder: Pop3Decoder,
}

impl Pop3Client<TlsStreamWrapper> {
    /// TLS-connect to the upstream store and consume the banner.
    /// `Conn` on transport failure, `Ssl` on handshake/certificate failure.
    /// `status_ok` is false when the banner is `-ERR`.
    pub async fn connect(host: &str, port: u16) -> Result<(Self, bool, String)> {
        let stream = connect_implicit_tls(host, port).await.map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::InvalidData {
                ErrorKind::Ssl
            } else {
                ErrorKind::Conn
            };
            Error::new(kind, format!("connecting to {}:{}: {}", host, port, e))
        })?;
        let mut client = Self::new(stream);
        let (ok, message) = client.read_greeting().await?;
        Ok((client, ok, message))
    }
}

impl<S> Pop3Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            line_buf: Vec::with_capacity(1024),
            max_line: DEFAULT_MAX_LINE,
            banner: String::new(),
            uids: Vec::new(),
            idxs: Vec::new(),
            decoder: Pop3Decoder::new(),
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        self.line_buf.clear();
        loop {
            let mut b = [0u8; 1];
            let n = self.stream.read(&mut b).await.map_err(Error::from)?;
            if n == 0 {
                return Err(Error::new(ErrorKind::Conn, "connection closed"));
            }
            self.line_buf.push(b[0]);
            if self.line_buf.len() > self.max_line {
                return Err(Error::new(ErrorKind::FixedSize, "response line too long"));
            }
            if self.line_buf.ends_with(b"\r\n") {
                break;
            }
        }
        let line = String::from_utf8_lossy(&self.line_buf[..self.line_buf.len() - 2]).to_string();
        Ok(line)
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream
            .write_all(line.as_bytes())
            .await
            .map_err(Error::from)?;
        self.stream.write_all(b"\r\n").await.map_err(Error::from)?;
        self.stream.flush().await.map_err(Error::from)?;
        Ok(())
    }

    /// Split a status line into (ok, text-after-status-word).
    fn parse_status(line: &str) -> Result<(bool, String)> {
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok((true, rest.trim_start().to_string()))
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            Ok((false, rest.trim_start().to_string()))
        } else {
            Err(Error::new(
                ErrorKind::Response,
                format!("bad status line: {}", line),
            ))
        }
    }

    /// Read the greeting and store its text for version sniffing.
    pub async fn read_greeting(&mut self) -> Result<(bool, String)> {
        let line = self.read_line().await?;
        self.banner = line.clone();
        Self::parse_status(&line)
    }

    async fn simple_command(&mut self, cmd: &str) -> Result<(bool, String)> {
        self.write_line(cmd).await?;
        let line = self.read_line().await?;
        Self::parse_status(&line)
    }

    pub async fn username(&mut self, user: &str) -> Result<(bool, String)> {
        self.simple_command(&format!("USER {}", user)).await
    }

    pub async fn password(&mut self, pass: &str) -> Result<(bool, String)> {
        self.simple_command(&format!("PASS {}", pass)).await
    }

    /// Issue UIDL and repopulate `uids`/`idxs`.
    pub async fn uidl(&mut self) -> Result<(bool, String)> {
        self.uids.clear();
        self.idxs.clear();
        let (ok, message) = self.simple_command("UIDL").await?;
        if !ok {
            return Ok((ok, message));
        }
        loop {
            let line = self.read_line().await?;
            if line == "." {
                break;
            }
            let mut sp = line.splitn(2, ' ');
            let idx: u32 = sp
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::new(ErrorKind::Response, format!("bad UIDL line: {}", line)))?;
            let uid = sp
                .next()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| Error::new(ErrorKind::Response, format!("bad UIDL line: {}", line)))?;
            self.idxs.push(idx);
            self.uids.push(uid.to_string());
        }
        Ok((ok, message))
    }

    /// Send `RETR`; on `+OK` the body follows, streamed with `get_body`.
    pub async fn retrieve(&mut self, index: u32) -> Result<(bool, String)> {
        self.simple_command(&format!("RETR {}", index)).await
    }

    /// Send `TOP`; on `+OK` the truncated body follows via `get_body`.
    pub async fn top(&mut self, index: u32, lines: u32) -> Result<(bool, String)> {
        self.simple_command(&format!("TOP {} {}", index, lines)).await
    }

    /// Stream one chunk of a RETR/TOP body, POP3-decoded, into `buf`.
    /// Pass `first=true` on the first call after the status line. Returns
    /// true when the terminator has been consumed.
    pub async fn get_body(&mut self, buf: &mut Vec<u8>, first: bool) -> Result<bool> {
        if first {
            self.decoder.reset();
        }
        let mut raw = [0u8; BODY_CHUNK_SIZE];
        let n = self.stream.read(&mut raw).await.map_err(Error::from)?;
        if n == 0 {
            return Err(Error::new(ErrorKind::Conn, "connection closed mid-body"));
        }
        let (_consumed, end) = self.decoder.decode(&raw[..n], buf);
        Ok(end)
    }

    pub async fn delete(&mut self, index: u32) -> Result<(bool, String)> {
        self.simple_command(&format!("DELE {}", index)).await
    }

    pub async fn reset(&mut self) -> Result<(bool, String)> {
        self.simple_command("RSET").await
    }

    /// QUIT; `update_ok` reports whether the server committed the
    /// transaction.
    pub async fn quit(&mut self) -> Result<(bool, String)> {
        self.simple_command("QUIT").await
    }
}
