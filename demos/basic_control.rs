use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use padlers::{HistoryMode, PadController, Preference, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚶 Padlers Basic Control Example");
    info!("Searching for WalkingPad devices...");

    let pad = match PadController::connect_first().await {
        Ok(pad) => pad,
        Err(e) => {
            error!("❌ Failed to connect to device: {}", e);
            return Err(e);
        }
    };

    pad.subscribe_status(|status| info!("{}", status));
    pad.query_stats().await?;

    // Keep the belt from running away
    pad.set_preference(Preference::MaxSpeed(40)).await?;

    info!("▶️  Starting belt in manual mode...");
    if let Err(e) = pad.start_belt(true).await {
        error!("❌ Failed to start: {}", e);
        return Err(e);
    }

    for speed in [20, 25, 30] {
        info!("⚡ Setting speed to {:.1} km/h", f64::from(speed) / 10.0);
        pad.set_speed(speed).await?;
        sleep(Duration::from_secs(5)).await;
        pad.query_stats().await?;
    }

    info!("⏹️  Stopping belt...");
    pad.stop_belt(true).await?;

    pad.subscribe_record(|record| {
        info!(
            "🏁 Bout: {} s, {:.2} km, {} steps",
            record.time,
            f64::from(record.dist) / 100.0,
            record.steps
        );
    });
    pad.query_history(HistoryMode::Latest).await?;
    sleep(Duration::from_secs(2)).await;

    info!("🔌 Disconnecting...");
    pad.disconnect().await?;
    info!("✅ Disconnected successfully");
    Ok(())
}
