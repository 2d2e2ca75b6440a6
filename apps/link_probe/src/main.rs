use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use session_link::{load_settings_from, LinkSession, RestClient, SessionEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Hold a session link open and print what arrives on it.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    /// Settings file; defaults to `link.toml` or `$LINK_CONFIG`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Event type to print. Repeatable.
    #[arg(long = "route")]
    routes: Vec<String>,
    /// GET this path as JSON before connecting.
    #[arg(long)]
    fetch: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings_from(args.config.as_deref());
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(user_id) = args.user_id {
        settings.user_id = user_id;
    }

    if let Some(path) = &args.fetch {
        let rest = RestClient::from_settings(&settings);
        let body: Value = rest.get_json(path).await?;
        println!("{path}: {}", serde_json::to_string_pretty(&body)?);
    }

    let session = LinkSession::from_settings(&settings, None)?;
    let _routes: Vec<_> = args
        .routes
        .iter()
        .map(|route| {
            let route_name = route.clone();
            session.on_event::<Value, _>(route.clone(), move |event| {
                println!("[{route_name}] {event}");
            })
        })
        .collect();

    let mut events = session.subscribe_events();
    info!(url = %session.url(), "link_probe: connecting");
    session.start()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("link_probe: interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::ReconnectsExhausted { attempts }) => {
                    error!(attempts, "link_probe: giving up after reconnect attempts");
                    break;
                }
                Ok(SessionEvent::Disconnected { reason })
                    if !session.machine().has_connected_once() =>
                {
                    error!(%reason, "link_probe: could not connect");
                    break;
                }
                Ok(event) => info!(?event, "link_probe: session event"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "link_probe: dropped session events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.shutdown();
    // Give the closing handshake a moment before the runtime goes away.
    tokio::time::sleep(Duration::from_millis(250)).await;
    Ok(())
}
