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

//! In-process fake servers for DITM session tests: a POP server with a
//! shared mailbox that survives reconnects, and a minimal API server
//! answering list_devices/add_device.

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use splintermail_core::protocol::pop3::pop3_encode;

#[derive(Clone)]
pub struct FakeMail {
    pub uid: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub struct FakePopState {
    pub mails: Vec<FakeMail>,
    /// UIDs the client has issued RETR for, in order.
    pub retr_log: Vec<String>,
}

/// Fake upstream POP server; state is shared so several sessions observe
/// the same mailbox.
#[derive(Clone)]
pub struct FakePopServer {
    pub state: Arc<Mutex<FakePopState>>,
    pub version: String,
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut buf = Vec::new();
    loop {
        let mut b = [0u8; 1];
        match stream.read(&mut b).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        buf.push(b[0]);
        if buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            return Some(String::from_utf8_lossy(&buf).to_string());
        }
    }
}

impl FakePopServer {
    pub fn new(version: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakePopState::default())),
            version: version.to_string(),
        }
    }

    pub fn add_mail(&self, uid: &str, body: &[u8]) {
        self.state.lock().unwrap().mails.push(FakeMail {
            uid: uid.to_string(),
            body: body.to_vec(),
        });
    }

    pub fn uids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .mails
            .iter()
            .map(|m| m.uid.clone())
            .collect()
    }

    pub fn retr_log(&self) -> Vec<String> {
        self.state.lock().unwrap().retr_log.clone()
    }

    /// Serve one client connection to completion.
    pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(self, mut stream: S) {
        let banner = format!("+OK Fake POP Server Ready DITMv{}\r\n", self.version);
        if stream.write_all(banner.as_bytes()).await.is_err() {
            return;
        }
        let mut pending_deletes: Vec<usize> = Vec::new();

        while let Some(line) = read_line(&mut stream).await {
            let mut words = line.splitn(2, ' ');
            let verb = words.next().unwrap_or("").to_ascii_uppercase();
            let arg = words.next().unwrap_or("");

            let reply: Vec<u8> = match verb.as_str() {
                "USER" => b"+OK\r\n".to_vec(),
                "PASS" => b"+OK Logged in.\r\n".to_vec(),
                "UIDL" => {
                    let state = self.state.lock().unwrap();
                    let mut out = b"+OK\r\n".to_vec();
                    for (i, mail) in state.mails.iter().enumerate() {
                        out.extend_from_slice(format!("{} {}\r\n", i + 1, mail.uid).as_bytes());
                    }
                    out.extend_from_slice(b".\r\n");
                    out
                }
                "RETR" => {
                    let idx: usize = arg.trim().parse().unwrap_or(0);
                    let mut state = self.state.lock().unwrap();
                    if idx == 0 || idx > state.mails.len() {
                        b"-ERR no such message\r\n".to_vec()
                    } else {
                        let mail = state.mails[idx - 1].clone();
                        state.retr_log.push(mail.uid.clone());
                        let mut out =
                            format!("+OK {} octets\r\n", mail.body.len()).into_bytes();
                        let mut raw = mail.body.clone();
                        pop3_encode(&mut raw, &mut out, true);
                        if !out.ends_with(b"\r\n") {
                            out.extend_from_slice(b"\r\n");
                        }
                        out.extend_from_slice(b".\r\n");
                        out
                    }
                }
                "DELE" => {
                    let idx: usize = arg.trim().parse().unwrap_or(0);
                    let n_mails = self.state.lock().unwrap().mails.len();
                    if idx == 0 || idx > n_mails {
                        b"-ERR no such message\r\n".to_vec()
                    } else {
                        pending_deletes.push(idx - 1);
                        format!("+OK {} deleted\r\n", idx).into_bytes()
                    }
                }
                "RSET" => {
                    pending_deletes.clear();
                    b"+OK\r\n".to_vec()
                }
                "QUIT" => {
                    {
                        let mut state = self.state.lock().unwrap();
                        pending_deletes.sort_unstable();
                        for &idx in pending_deletes.iter().rev() {
                            state.mails.remove(idx);
                        }
                    }
                    let _ = stream.write_all(b"+OK\r\n").await;
                    return;
                }
                _ => b"-ERR unrecognized command\r\n".to_vec(),
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

/// Fake management API server over plain HTTP; records every command.
pub struct FakeApiServer {
    pub devices: Arc<Mutex<Vec<String>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FakeApiServer {
    pub fn new(devices: Vec<String>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(devices)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Bind an ephemeral port and serve forever; returns the port.
    pub async fn start(&self) -> u16 {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let devices = self.devices.clone();
        let calls = self.calls.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(x) => x,
                    Err(_) => return,
                };
                let devices = devices.clone();
                let calls = calls.clone();
                tokio::spawn(handle_api_conn(stream, devices, calls));
            }
        });
        port
    }
}

async fn handle_api_conn(
    mut stream: tokio::net::TcpStream,
    devices: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    let (head_end, content_length) = loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        raw.extend_from_slice(&chunk[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&raw[..pos]).to_string();
            let clen: usize = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse().ok())?
                })
                .unwrap_or(0);
            break (pos + 4, clen);
        }
    };
    while raw.len() < head_end + content_length {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        raw.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let path = head
        .lines()
        .next()
        .and_then(|l| l.split(' ').nth(1))
        .unwrap_or("")
        .to_string();
    let command = path.strip_prefix("/api/").unwrap_or("").to_string();
    calls.lock().unwrap().push(command.clone());

    let body = &raw[head_end..head_end + content_length];
    let _payload: serde_json::Value = B64
        .decode(body)
        .ok()
        .and_then(|d| serde_json::from_slice(&d).ok())
        .unwrap_or(serde_json::Value::Null);

    let contents = match command.as_str() {
        "list_devices" => {
            let devices = devices.lock().unwrap().clone();
            serde_json::json!({ "devices": devices })
        }
        "add_device" => serde_json::json!({ "device": "registered" }),
        _ => serde_json::Value::Null,
    };
    let resp_body = serde_json::json!({
        "status": "success",
        "contents": contents,
    })
    .to_string();
    let resp = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        resp_body.len(),
        resp_body
    );
    let _ = stream.write_all(resp.as_bytes()).await;
}
