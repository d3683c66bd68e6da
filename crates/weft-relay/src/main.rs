//! Standalone relay daemon.
//!
//! Run it once, point any number of peers at it:
//!   cargo run -p weft-relay -- --addr 127.0.0.1:9777

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use weft_relay::Relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("weft_relay=info".parse()?))
        .init();

    let addr = addr_flag().unwrap_or_else(|| "127.0.0.1:9777".to_string());

    let relay = Relay::new();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Relay listening on ws://{}", addr);

    relay.serve(listener).await?;
    Ok(())
}

/// Value following `--addr` on the command line, if any.
fn addr_flag() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--addr" {
            return args.next();
        }
    }
    None
}
