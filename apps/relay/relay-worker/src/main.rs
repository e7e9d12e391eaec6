//! Relay Worker Service - Entry Point
//!
//! Consumes from configured sources and republishes to configured producers.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    relay_worker::run().await
}
