use mirra_store::StoreError;
use scenarios::{delayed_fan_out, immediate_fan_out, relay_fan_out};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub mod scenarios;

#[tokio::main]
async fn main() -> Result<(), StoreError> {
    // RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICATED COMMIT SCENARIOS                     ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Scenario 1: synchronous fan-out in one process
    let stats = immediate_fan_out(4, 200)?;
    stats.print();

    // Scenario 2: same, with simulated latency
    let stats = delayed_fan_out(4, 200, Duration::from_millis(25)).await?;
    stats.print();

    // Scenario 3: replicas talking through a TCP relay
    let stats = relay_fan_out(3, 100).await?;
    stats.print();

    println!("\n✓ All scenarios completed");
    Ok(())
}
