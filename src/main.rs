use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use botlink::{
    Command, ControlServer, Reachability, ServerEvent, UpnpMapper, parse_command,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let port: u16 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 8081,
    };

    let server = Arc::new(ControlServer::new(Box::new(UpnpMapper::new())));

    // The automation layer proper (driving the bot's UI) lives outside this
    // crate; this loop just demonstrates the subscriber surface.
    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::Ready(info) => match info.reachability {
                    Reachability::External(addr) => {
                        info!(local = %info.local, external = %addr, "server is up")
                    }
                    Reachability::LocalOnly { reason } => {
                        info!(local = %info.local, %reason, "server is up (local network only)")
                    }
                },
                ServerEvent::Message(text) => match parse_command(&text) {
                    Some(Command::Start) => info!("bot start requested"),
                    Some(Command::Stop) => info!("bot stop requested"),
                    None => debug!(%text, "ignoring unknown message"),
                },
            }
        }
    });

    server.start(port).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await;

    Ok(())
}
