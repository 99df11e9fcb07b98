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

//! JSON-over-HTTPS client for the management API. Requests are
//! `POST /api/<command>` with a base64-encoded JSON payload
//! `{"path": ..., "arg": ...}`; responses are JSON
//! `{"status": ..., "contents": ...}`. Token-authenticated calls embed a
//! monotonically increasing nonce which the caller must persist *before*
//! the request goes out; a 401/403 means the token has been revoked.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorKind, Result};
use crate::net::connect_implicit_tls;

/// Parsed API response envelope.
#[derive(Debug)]
pub struct ApiResponse {
    pub code: u16,
    pub reason: String,
    pub status: String,
    pub contents: serde_json::Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code) && self.status == "success"
    }
}

/// Persistent API token: {token, secret, nonce} in `api_token.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiToken {
    pub token: String,
    pub secret: String,
    pub nonce: u64,
}

impl ApiToken {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::new(ErrorKind::Open, format!("{}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::new(ErrorKind::Param, format!("bad api token file: {}", e)))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::new(ErrorKind::Internal, format!("encoding token: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| Error::new(ErrorKind::Fs, format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Bump the nonce and persist it. Must complete before the token call
    /// is issued so a crash mid-call can never replay an old nonce.
    pub fn increment_and_save(&mut self, path: &Path) -> Result<()> {
        self.nonce += 1;
        self.write(path)
    }
}

/// One HTTP/1.1 POST exchange over an already-connected stream.
/// Returns (status code, reason phrase, body).
pub(crate) async fn http_post<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    auth_header: &str,
    body: &[u8],
) -> Result<(u16, String, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nAuthorization: {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        path,
        host,
        auth_header,
        body.len()
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(Error::from)?;
    stream.write_all(body).await.map_err(Error::from)?;
    stream.flush().await.map_err(Error::from)?;

    // read the full response; Connection: close bounds it
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.map_err(Error::from)?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
    }

    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::new(ErrorKind::Response, "no header terminator in response"))?;
    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| Error::new(ErrorKind::Response, "empty response"))?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let code: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| Error::new(ErrorKind::Response, format!("bad status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut content_length: Option<usize> = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    let body_start = header_end + 4;
    let body = match content_length {
        Some(len) => {
            if raw.len() < body_start + len {
                return Err(Error::new(ErrorKind::Response, "short response body"));
            }
            raw[body_start..body_start + len].to_vec()
        }
        None => raw[body_start..].to_vec(),
    };
    Ok((code, reason, body))
}

fn parse_envelope(code: u16, reason: String, body: &[u8]) -> Result<ApiResponse> {
    let parsed: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::new(ErrorKind::Response, format!("bad json in response: {}", e)))?;
    let status = parsed
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or_else(|| Error::new(ErrorKind::Response, "response missing status"))?
        .to_string();
    let contents = parsed
        .get("contents")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    Ok(ApiResponse {
        code,
        reason,
        status,
        contents,
    })
}

fn encode_payload(command: &str, arg: Option<&serde_json::Value>, nonce: Option<u64>) -> Vec<u8> {
    let mut payload = serde_json::json!({
        "path": format!("/api/{}", command),
        "arg": arg.cloned().unwrap_or(serde_json::Value::Null),
    });
    if let Some(n) = nonce {
        payload["nonce"] = serde_json::json!(n);
    }
    B64.encode(payload.to_string()).into_bytes()
}

/// Handle on the management API endpoint. TLS is the normal mode; plain
/// TCP exists for in-process test servers.
#[derive(Debug, Clone)]
pub struct ApiClient {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl ApiClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: true,
        }
    }

    async fn exchange(
        &self,
        path: &str,
        auth: &str,
        body: &[u8],
    ) -> Result<(u16, String, Vec<u8>)> {
        if self.use_tls {
            let mut stream = connect_implicit_tls(&self.host, self.port).await.map_err(|e| {
                let kind = if e.kind() == std::io::ErrorKind::InvalidData {
                    ErrorKind::Ssl
                } else {
                    ErrorKind::Conn
                };
                Error::new(kind, format!("connecting to {}:{}: {}", self.host, self.port, e))
            })?;
            http_post(&mut stream, &self.host, path, auth, body).await
        } else {
            let mut stream = tokio::net::TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| {
                    Error::new(
                        ErrorKind::Conn,
                        format!("connecting to {}:{}: {}", self.host, self.port, e),
                    )
                })?;
            http_post(&mut stream, &self.host, path, auth, body).await
        }
    }

    /// Call a password-authenticated endpoint (HTTP Basic auth).
    pub async fn password_call(
        &self,
        command: &str,
        arg: Option<&serde_json::Value>,
        user: &str,
        pass: &str,
    ) -> Result<ApiResponse> {
        let body = encode_payload(command, arg, None);
        let auth = format!("Basic {}", B64.encode(format!("{}:{}", user, pass)));
        let (code, reason, resp_body) =
            self.exchange(&format!("/api/{}", command), &auth, &body).await?;
        parse_envelope(code, reason, &resp_body)
    }

    /// Call a token-authenticated endpoint. The caller must already have
    /// incremented and persisted the token's nonce.
    pub async fn token_call(
        &self,
        command: &str,
        arg: Option<&serde_json::Value>,
        token: &ApiToken,
    ) -> Result<ApiResponse> {
        let body = encode_payload(command, arg, Some(token.nonce));
        let mut mac = Hmac::<Sha256>::new_from_slice(token.secret.as_bytes())
            .map_err(|_| Error::new(ErrorKind::Internal, "hmac key setup"))?;
        mac.update(&body);
        let sig = hex::encode(mac.finalize().into_bytes());
        let auth = format!("token {}:{}", token.token, sig);
        let (code, reason, resp_body) =
            self.exchange(&format!("/api/{}", command), &auth, &body).await?;
        parse_envelope(code, reason, &resp_body)
    }
}

/// True when a response means the token has been revoked and the local
/// token file should be deleted.
pub fn token_rejected(resp: &ApiResponse) -> bool {
    resp.code == 401 || resp.code == 403
}
