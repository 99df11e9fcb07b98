/*
 * server.rs
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

//! POP3 toward the MUA: reads CRLF command lines, enforces the
//! AUTHORIZATION/TRANSACTION state machine and index bounds, answers
//! malformed input and CAPA/NOOP itself, and yields typed commands for the
//! session to act on. Exactly one status line goes out per command;
//! multi-line bodies are the session's to produce, terminated `.\r\n`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorKind, Result};

const MAX_COMMAND_LINE: usize = 4096;

/// A validated command from the MUA, ready for the session to handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Command {
    /// USER then PASS arrived; the session decides whether login succeeds.
    Login { user: String, pass: String },
    Stat,
    List(Option<u32>),
    Retr(u32),
    Dele(u32),
    Rset,
    Top(u32, u32),
    Uidl(Option<u32>),
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Authorization,
    Transaction,
}

/// The MUA-facing half of a DITM session.
pub struct Pop3Server<S> {
    stream: S,
    state: State,
    pending_user: Option<String>,
    message_count: usize,
    line_buf: Vec<u8>,
}

impl<S> Pop3Server<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: State::Authorization,
            pending_user: None,
            message_count: 0,
            line_buf: Vec::with_capacity(256),
        }
    }

    /// Total number of messages (deleted ones still occupy indices); used
    /// to bounds-check command arguments so handlers may assume validity.
    pub fn set_message_count(&mut self, count: usize) {
        self.message_count = count;
    }

    /// Move to TRANSACTION after the session accepted the credentials.
    pub fn login_succeeded(&mut self) {
        self.state = State::Transaction;
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(Error::from)?;
        self.stream.flush().await.map_err(Error::from)?;
        Ok(())
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stream
            .write_all(line.as_bytes())
            .await
            .map_err(Error::from)?;
        self.stream.write_all(b"\r\n").await.map_err(Error::from)?;
        self.stream.flush().await.map_err(Error::from)?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        self.line_buf.clear();
        loop {
            let mut b = [0u8; 1];
            let n = self.stream.read(&mut b).await.map_err(Error::from)?;
            if n == 0 {
                return Err(Error::new(ErrorKind::Conn, "client closed connection"));
            }
            self.line_buf.push(b[0]);
            if self.line_buf.len() > MAX_COMMAND_LINE {
                return Err(Error::new(ErrorKind::Response, "command line too long"));
            }
            if self.line_buf.ends_with(b"\r\n") {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&self.line_buf[..self.line_buf.len() - 2]).to_string())
    }

    fn parse_index(arg: Option<&str>) -> Option<u32> {
        let n: u32 = arg?.parse().ok()?;
        if n == 0 {
            return None;
        }
        Some(n)
    }

    /// Read until a complete, valid command arrives. Malformed input, bad
    /// state, out-of-range indices, CAPA and NOOP are all answered here.
    pub async fn read_command(&mut self) -> Result<Pop3Command> {
        loop {
            let line = self.read_line().await?;
            let mut words = line.splitn(2, ' ');
            let verb = words.next().unwrap_or("").to_ascii_uppercase();
            let rest = words.next();

            // commands legal in any state
            match verb.as_str() {
                "CAPA" => {
                    self.send(b"+OK Capability list follows\r\nUSER\r\nTOP\r\nUIDL\r\n.\r\n")
                        .await?;
                    continue;
                }
                "QUIT" => return Ok(Pop3Command::Quit),
                _ => {}
            }

            if self.state == State::Authorization {
                match verb.as_str() {
                    "USER" => match rest.map(|r| r.split_whitespace().next().unwrap_or("")) {
                        Some(user) if !user.is_empty() => {
                            self.pending_user = Some(user.to_string());
                            self.send_line("+OK").await?;
                        }
                        _ => self.send_line("-ERR missing username").await?,
                    },
                    "PASS" => match (self.pending_user.take(), rest) {
                        (Some(user), Some(pass)) => {
                            return Ok(Pop3Command::Login {
                                user,
                                pass: pass.to_string(),
                            });
                        }
                        (None, _) => self.send_line("-ERR no USER before PASS").await?,
                        (_, None) => self.send_line("-ERR missing password").await?,
                    },
                    _ => self.send_line("-ERR command not allowed before login").await?,
                }
                continue;
            }

            // TRANSACTION state
            let first_arg = rest.map(|r| r.split_whitespace().next().unwrap_or(""));
            match verb.as_str() {
                "NOOP" => {
                    self.send_line("+OK").await?;
                }
                "STAT" => return Ok(Pop3Command::Stat),
                "RSET" => return Ok(Pop3Command::Rset),
                "LIST" | "UIDL" => {
                    let index = match first_arg {
                        None | Some("") => None,
                        Some(a) => match Self::parse_index(Some(a)) {
                            Some(n) if (n as usize) <= self.message_count => Some(n),
                            _ => {
                                self.send_line("-ERR no such message").await?;
                                continue;
                            }
                        },
                    };
                    return Ok(if verb == "LIST" {
                        Pop3Command::List(index)
                    } else {
                        Pop3Command::Uidl(index)
                    });
                }
                "RETR" | "DELE" => {
                    match Self::parse_index(first_arg) {
                        Some(n) if (n as usize) <= self.message_count => {
                            return Ok(if verb == "RETR" {
                                Pop3Command::Retr(n)
                            } else {
                                Pop3Command::Dele(n)
                            });
                        }
                        _ => self.send_line("-ERR no such message").await?,
                    }
                }
                "TOP" => {
                    let mut args = rest.unwrap_or("").split_whitespace();
                    let index = Self::parse_index(args.next());
                    let lines: Option<u32> = args.next().and_then(|s| s.parse().ok());
                    match (index, lines) {
                        (Some(n), Some(l)) if (n as usize) <= self.message_count => {
                            return Ok(Pop3Command::Top(n, l));
                        }
                        (Some(_), Some(_)) => self.send_line("-ERR no such message").await?,
                        _ => self.send_line("-ERR bad arguments to TOP").await?,
                    }
                }
                _ => self.send_line("-ERR unrecognized command").await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn expect(mua: &mut tokio::io::DuplexStream, want: &str) {
        let mut buf = vec![0u8; 512];
        let n = mua.read(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&buf[..n]), want);
    }

    #[tokio::test]
    async fn login_flow_yields_credentials() {
        let (server_io, mut mua) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut ps = Pop3Server::new(server_io);
            let cmd = ps.read_command().await.unwrap();
            assert_eq!(
                cmd,
                Pop3Command::Login {
                    user: "alice".into(),
                    pass: "secret word".into()
                }
            );
        });
        mua.write_all(b"USER alice\r\n").await.unwrap();
        expect(&mut mua, "+OK\r\n").await;
        mua.write_all(b"PASS secret word\r\n").await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn transactional_commands_rejected_before_login() {
        let (server_io, mut mua) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut ps = Pop3Server::new(server_io);
            let cmd = ps.read_command().await.unwrap();
            assert_eq!(cmd, Pop3Command::Quit);
        });
        mua.write_all(b"STAT\r\n").await.unwrap();
        expect(&mut mua, "-ERR command not allowed before login\r\n").await;
        mua.write_all(b"QUIT\r\n").await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn index_bounds_enforced() {
        let (server_io, mut mua) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut ps = Pop3Server::new(server_io);
            ps.login_succeeded();
            ps.set_message_count(2);
            let cmd = ps.read_command().await.unwrap();
            assert_eq!(cmd, Pop3Command::Retr(2));
        });
        mua.write_all(b"RETR 0\r\n").await.unwrap();
        expect(&mut mua, "-ERR no such message\r\n").await;
        mua.write_all(b"RETR 3\r\n").await.unwrap();
        expect(&mut mua, "-ERR no such message\r\n").await;
        mua.write_all(b"RETR 2\r\n").await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn capa_and_noop_answered_internally() {
        let (server_io, mut mua) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut ps = Pop3Server::new(server_io);
            ps.login_succeeded();
            let cmd = ps.read_command().await.unwrap();
            assert_eq!(cmd, Pop3Command::Stat);
        });
        mua.write_all(b"CAPA\r\n").await.unwrap();
        expect(
            &mut mua,
            "+OK Capability list follows\r\nUSER\r\nTOP\r\nUIDL\r\n.\r\n",
        )
        .await;
        mua.write_all(b"NOOP\r\n").await.unwrap();
        expect(&mut mua, "+OK\r\n").await;
        mua.write_all(b"STAT\r\n").await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn top_argument_validation() {
        let (server_io, mut mua) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut ps = Pop3Server::new(server_io);
            ps.login_succeeded();
            ps.set_message_count(1);
            let cmd = ps.read_command().await.unwrap();
            assert_eq!(cmd, Pop3Command::Top(1, 2));
        });
        mua.write_all(b"TOP\r\n").await.unwrap();
        expect(&mut mua, "-ERR bad arguments to TOP\r\n").await;
        mua.write_all(b"TOP 1\r\n").await.unwrap();
        expect(&mut mua, "-ERR bad arguments to TOP\r\n").await;
        mua.write_all(b"TOP 1 2\r\n").await.unwrap();
        task.await.unwrap();
    }
}
