/*
 * main.rs
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

//! The splintermail command: `splintermail ditm` runs the local
//! decrypting proxy; any other command is passed through to the
//! management API.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use splintermail_core::api::{self, ApiClient, ApiToken};
use splintermail_core::ditm::{ditm_loop, DitmConfig, ListenConfig};

const DEFAULT_REMOTE_HOST: &str = "splintermail.com";
const DEFAULT_REMOTE_PORT: u16 = 995;
const DEFAULT_API_PORT: u16 = 443;
const DEFAULT_LOCAL_PORT: u16 = 1995;

#[derive(Parser)]
#[command(name = "splintermail", version, about)]
struct Cli {
    /// Command: "ditm", or an API command (e.g. list_devices)
    command: String,

    /// JSON argument for API commands
    arg: Option<String>,

    #[arg(long, default_value = DEFAULT_REMOTE_HOST)]
    remote_host: String,

    #[arg(long, default_value_t = DEFAULT_REMOTE_PORT)]
    remote_port: u16,

    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    api_port: u16,

    /// Local POP3 port the MUA connects to
    #[arg(long, default_value_t = DEFAULT_LOCAL_PORT)]
    port: u16,

    /// DITM state directory (default ~/.ditm)
    #[arg(long)]
    ditm_dir: Option<PathBuf>,

    #[arg(long)]
    cert: Option<PathBuf>,

    #[arg(long)]
    key: Option<PathBuf>,

    /// Account name for API commands
    #[arg(long, short)]
    user: Option<String>,

    /// Account password for API commands (prompted when omitted)
    #[arg(long)]
    password: Option<String>,
}

fn default_ditm_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|h| h.join(".ditm"))
        .unwrap_or_else(|| PathBuf::from(".ditm"))
}

fn prompt(label: &str) -> String {
    use std::io::Write;
    print!("{}: ", label);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    line.trim_end_matches(['\r', '\n']).to_string()
}

async fn run_api_command(cli: &Cli, ditm_dir: &PathBuf) -> Result<(), String> {
    let user = match &cli.user {
        Some(u) => u.clone(),
        None => prompt("username"),
    };
    let arg: Option<serde_json::Value> = match &cli.arg {
        Some(raw) => Some(
            serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone())),
        ),
        None => None,
    };

    let account_dir = ditm_dir.join(&user);
    let token_path = account_dir.join("api_token.json");
    let client = ApiClient::new(cli.remote_host.clone(), cli.api_port);

    // prefer a registered token; fall back to password auth
    let resp = match ApiToken::read(&token_path) {
        Ok(mut token) if cli.command != "add_token" => {
            // the nonce must hit the disk before the request leaves
            token
                .increment_and_save(&token_path)
                .map_err(|e| e.to_string())?;
            let resp = client
                .token_call(&cli.command, arg.as_ref(), &token)
                .await
                .map_err(|e| e.to_string())?;
            if api::token_rejected(&resp) {
                eprintln!("API token rejected, deleting token. Run this command again to generate a new token.");
                if let Err(e) = std::fs::remove_file(&token_path) {
                    eprintln!("error removing token: {}", e);
                }
                return Err("token rejected".to_string());
            }
            resp
        }
        _ => {
            let pass = match &cli.password {
                Some(p) => p.clone(),
                None => prompt("password"),
            };
            client
                .password_call(&cli.command, arg.as_ref(), &user, &pass)
                .await
                .map_err(|e| e.to_string())?
        }
    };

    if !resp.is_success() {
        return Err(format!("{} failed: {}", cli.command, resp.contents));
    }
    println!("{}", resp.contents);
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let ditm_dir = cli.ditm_dir.clone().unwrap_or_else(default_ditm_dir);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::from(255);
        }
    };

    if cli.command == "ditm" {
        let cfg = DitmConfig::new(
            cli.remote_host.clone(),
            cli.remote_port,
            ditm_dir,
            cli.remote_host.clone(),
            cli.api_port,
        );
        let listen = ListenConfig {
            port: cli.port,
            certpath: cli.cert.clone(),
            keypath: cli.key.clone(),
        };
        match runtime.block_on(ditm_loop(cfg, listen)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                log::error!("ditm exited with error: {}", e);
                ExitCode::from(255)
            }
        }
    } else {
        match runtime.block_on(run_api_command(&cli, &ditm_dir)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::from(1)
            }
        }
    }
}
