//! socket-router: a JSON message router over TCP
//!
//! Runs a router with two demo handlers:
//! - `echo`: uppercases a string body
//! - `ping`: answers `"pong"`
//!
//! Configuration via CLI arguments or TOML file.

use serde_json::Value;
use socket_router::config::Config;
use socket_router::{ResponseWriter, Router};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        force = config.force,
        max_frame_size = config.max_frame_size,
        "Starting socket-router"
    );

    let mut router = Router::with_config(config.router_config()).with_fault_hook(|fault| {
        warn!(message_type = %fault.message_type(), "Handler fault reported");
    });

    router.register("echo", echo)?;
    router.register("ping", |_, res| res.success("pong"))?;

    router.listen(config.port, config.force).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    router.end().await?;
    Ok(())
}

fn echo(body: Value, res: ResponseWriter) {
    match body.as_str() {
        Some(text) => res.success(text.to_uppercase()),
        None => res.error("echo expects a string body", Some(format!("got {body}"))),
    }
}
