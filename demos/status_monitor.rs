use std::{env, path::PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use padlers::{
    CalorieTracker, PadController, Profile, Result, SessionAnalysis, TelemetryLog,
    TelemetryRecord, TelemetryWriter,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Usage: status_monitor [log.jsonl] [profile.json]
    let mut args = env::args().skip(1);
    let log_path = PathBuf::from(args.next().unwrap_or_else(|| "walkingpad.jsonl".to_string()));
    let profile_path = args.next().map(PathBuf::from);

    info!("📊 Padlers Status Monitor Example");

    let profile = Profile::load(profile_path.as_deref())?;
    info!("Using {}", profile);

    // Pick up the calorie totals of a walk that is still going
    let mut tracker = CalorieTracker::new(profile.clone());
    if log_path.exists() {
        let analysis = SessionAnalysis::load_last(&TelemetryLog::new(&log_path), &profile, 1)?;
        if let Some(anchor) = analysis.resume_anchor() {
            info!(
                "Resuming from record at time {} ({:.1} kcal net so far)",
                anchor.time,
                analysis.closed_calories().net
            );
            tracker = tracker.resuming(anchor.clone(), analysis.closed_calories());
        }
    }

    let writer = TelemetryWriter::open(&log_path).await?;

    info!("Searching for WalkingPad devices...");
    let pad = match PadController::connect_first().await {
        Ok(pad) => {
            if let Some(device) = pad.device_info() {
                info!("✅ Connected to: {} ({})", device.name, device.address);
            }
            pad
        }
        Err(e) => {
            error!("❌ Failed to connect to device: {}", e);
            return Err(e);
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    pad.subscribe_status(move |status| {
        let _ = tx.send(status.clone());
    });
    pad.subscribe_record(|record| {
        info!(
            "Last record: time {} s, dist {:.2} km, steps {}",
            record.time,
            f64::from(record.dist) / 100.0,
            record.steps
        );
    });

    pad.start_polling().await?;
    info!("Press Ctrl+C to stop monitoring");

    loop {
        tokio::select! {
            status = rx.recv() => {
                let Some(status) = status else {
                    warn!("❌ Status stream ended");
                    break;
                };
                let live = tracker.update(&status);
                println!(
                    "{:>6} s {:>7.2} km {:>6} steps {:>4.1} km/h  {:>7.2} kcal ({:.2} net)",
                    status.time,
                    f64::from(status.dist) / 100.0,
                    status.steps,
                    status.speed_kmh(),
                    live.ccal_sum.unwrap_or_default(),
                    live.ccal_net_sum.unwrap_or_default(),
                );
                writer.append(TelemetryRecord::capture(&status, profile.id.as_deref(), Some(&live)))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    info!("🔌 Disconnecting...");
    pad.stop_polling().await;
    if let Err(e) = pad.disconnect().await {
        error!("❌ Failed to disconnect: {}", e);
    }
    writer.close().await?;

    let totals = tracker.totals();
    println!("\n📊 Session total: {:.2} kcal ({:.2} net)", totals.gross, totals.net);
    Ok(())
}
