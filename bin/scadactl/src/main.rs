//! ---
//! scada_section: "07-networking-external-interfaces"
//! scada_subsection: "binary"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Monitoring CLI polling the master's grid overview."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;

/// Exit code for transport failures.
const EXIT_TRANSPORT: u8 = 1;
/// Exit code for authentication failures.
const EXIT_AUTH: u8 = 2;

#[derive(Debug, Parser)]
#[command(author, version, about = "SCADA grid monitoring console", long_about = None)]
struct Cli {
    #[arg(
        long,
        env = "SCADA_MASTER_URL",
        default_value = "http://127.0.0.1:9000",
        help = "Master base URL"
    )]
    master: String,

    #[arg(long, env = "SCADA_USER", default_value = "viewer1", help = "Login username")]
    username: String,

    #[arg(long, env = "SCADA_PASS", default_value = "view@2024", help = "Login password")]
    password: String,

    #[arg(long, value_name = "SECONDS", help = "Re-poll at this interval instead of exiting")]
    watch: Option<u64>,
}

enum CtlError {
    Transport(String),
    Auth,
}

impl From<reqwest::Error> for CtlError {
    fn from(err: reqwest::Error) -> Self {
        CtlError::Transport(err.to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let token = match login(&client, &cli).await {
        Ok(token) => token,
        Err(CtlError::Auth) => {
            eprintln!("error: authentication failed for '{}'", cli.username);
            return ExitCode::from(EXIT_AUTH);
        }
        Err(CtlError::Transport(message)) => {
            eprintln!("error: cannot reach master: {message}");
            return ExitCode::from(EXIT_TRANSPORT);
        }
    };

    loop {
        match render_once(&client, &cli.master, &token).await {
            Ok(()) => {}
            Err(CtlError::Auth) => {
                eprintln!("error: token rejected; re-run to log in again");
                return ExitCode::from(EXIT_AUTH);
            }
            Err(CtlError::Transport(message)) => {
                eprintln!("error: transport failure: {message}");
                return ExitCode::from(EXIT_TRANSPORT);
            }
        }
        match cli.watch {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds.max(1))).await,
            None => return ExitCode::SUCCESS,
        }
    }
}

async fn login(client: &reqwest::Client, cli: &Cli) -> Result<String, CtlError> {
    let response = client
        .post(format!("{}/auth/login", cli.master))
        .json(&serde_json::json!({
            "username": cli.username,
            "password": cli.password,
        }))
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(CtlError::Auth);
    }
    let body: Value = response.error_for_status()?.json().await?;
    body["access_token"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| CtlError::Transport("login response missing access_token".into()))
}

async fn fetch(client: &reqwest::Client, url: &str, token: &str) -> Result<Value, CtlError> {
    let response = client.get(url).bearer_auth(token).send().await?;
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(CtlError::Auth);
    }
    Ok(response.error_for_status()?.json().await?)
}

async fn render_once(client: &reqwest::Client, base: &str, token: &str) -> Result<(), CtlError> {
    let overview = fetch(client, &format!("{base}/grid/overview"), token).await?;
    let nodes = fetch(client, &format!("{base}/nodes"), token).await?;

    println!("GRID OVERVIEW");
    println!(
        "  frequency: {:>8.3} Hz    generation: {:>8.1} MW    load: {:>8.1} MW    losses: {:>6.1} MW",
        overview["system_frequency_hz"].as_f64().unwrap_or(0.0),
        overview["total_generation_mw"].as_f64().unwrap_or(0.0),
        overview["total_load_mw"].as_f64().unwrap_or(0.0),
        overview["grid_losses_mw"].as_f64().unwrap_or(0.0),
    );
    println!(
        "  nodes: {} online / {} offline / {} degraded    alarms: {} warning, {} critical",
        overview["nodes_online"],
        overview["nodes_offline"],
        overview["nodes_degraded"],
        overview["alarms"]["warning"],
        overview["alarms"]["critical"],
    );

    println!("NODES");
    println!(
        "  {:<10} {:<14} {:<12} {:<22} {:>10} {:>8}",
        "NODE", "KIND", "LINK", "LAST HEARTBEAT", "RETRIES", "BREAKER"
    );
    if let Some(nodes) = nodes.as_array() {
        for node in nodes {
            let heartbeat = node["last_heartbeat"].as_str().unwrap_or("-");
            let heartbeat = heartbeat.split('.').next().unwrap_or(heartbeat);
            println!(
                "  {:<10} {:<14} {:<12} {:<22} {:>10} {:>8}",
                node["node_id"].as_str().unwrap_or("?"),
                node["kind"].as_str().unwrap_or("?"),
                node["link_state"].as_str().unwrap_or("?"),
                heartbeat,
                node["reconnect_attempts"],
                node["breaker_states"]["BRK-01"].as_str().unwrap_or("-"),
            );
        }
    }
    println!();
    Ok(())
}
