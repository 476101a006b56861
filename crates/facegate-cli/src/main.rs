use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use facegate_core::auth::{LoginRequest, RegisterRequest};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod client;
mod setup;
mod simulate;

#[derive(Parser)]
#[command(name = "facegate", version, about = "Face-gated login tools")]
struct Cli {
    /// facegated base URL
    #[arg(long, global = true, env = "FACEGATE_SERVER", default_value = "http://localhost:3000")]
    server: String,

    /// Session token for whoami and history
    #[arg(long, global = true, env = "FACEGATE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the face detection weights and write their manifest
    Setup {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Check the model directory against its manifest
    VerifyModels {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Run the face gate headless against a replay script
    Simulate {
        script: PathBuf,
        /// Stop after this many failed attempts
        #[arg(long, default_value_t = 1)]
        attempts: usize,
    },
    /// Create an account
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "FACEGATE_PASSWORD")]
        password: String,
    },
    /// Pass the face gate, then log in
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "FACEGATE_PASSWORD")]
        password: String,
        /// Replay script standing in for the camera
        #[arg(long)]
        gate: PathBuf,
        #[arg(long, default_value_t = 1)]
        attempts: usize,
    },
    /// Show the account behind the token
    Whoami,
    /// Show recent login attempts
    History,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = client::ApiClient::new(&cli.server);

    match cli.command {
        Command::Setup { model_dir } => {
            tokio::task::spawn_blocking(move || setup::run(model_dir)).await?
        }
        Command::VerifyModels { model_dir } => setup::verify(model_dir),
        Command::Simulate { script, attempts } => simulate::run(&script, attempts).await,
        Command::Register {
            name,
            email,
            username,
            password,
        } => {
            let req = RegisterRequest {
                name,
                email,
                username,
                password,
            };
            let resp = tokio::task::spawn_blocking(move || api.register(&req)).await??;
            println!("registered {} ({})", resp.user.username, resp.user.id);
            println!("token: {}", resp.token);
            Ok(())
        }
        Command::Login {
            username,
            password,
            gate,
            attempts,
        } => {
            let script = simulate::load_script(&gate)?;
            let run = simulate::run_gate(&script, attempts, simulate::print_event).await?;
            if !run.passed() {
                eprintln!("face gate did not pass; the server will refuse this login");
            }
            let req = LoginRequest {
                username,
                password,
                face_detected: run.passed(),
            };
            let resp = tokio::task::spawn_blocking(move || api.login(&req)).await??;
            println!("logged in as {}", resp.user.username);
            println!("token: {}", resp.token);
            Ok(())
        }
        Command::Whoami => {
            let token = require_token(cli.token)?;
            let resp = tokio::task::spawn_blocking(move || api.profile(&token)).await??;
            let user = resp.user;
            println!("{} <{}> ({}), id {}", user.name, user.email, user.username, user.id);
            Ok(())
        }
        Command::History => {
            let token = require_token(cli.token)?;
            let resp = tokio::task::spawn_blocking(move || api.history(&token)).await??;
            if resp.history.is_empty() {
                println!("no login attempts recorded");
            }
            for record in resp.history {
                println!(
                    "{}  {:<7}  face={:<5}  {:<15}  {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    if record.success { "success" } else { "failed" },
                    record.face_detected,
                    record.ip_address.as_deref().unwrap_or("-"),
                    record.user_agent.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
    }
}

fn require_token(token: Option<String>) -> Result<String> {
    match token {
        Some(token) if !token.is_empty() => Ok(token),
        _ => bail!("no session token; pass --token or set FACEGATE_TOKEN"),
    }
}
