use std::{env, path::PathBuf};
use tracing::info;
use padlers::{calories::margin_calories, segments, PadError, Profile, Result, TelemetryLog};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // Usage: session_replay <log.jsonl> [profile.json] [margins]
    let mut args = env::args().skip(1);
    let log_path = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| PadError::InvalidParameters("missing log file argument".to_string()))?;
    let profile = Profile::load(args.next().map(PathBuf::from).as_deref())?;
    let limit = args.next().and_then(|n| n.parse::<usize>().ok());

    let log = TelemetryLog::new(&log_path);
    info!("Replaying {} with {}", log.path().display(), profile);

    let records = log.reverse()?.filter_map(std::result::Result::ok);
    let mut total_gross = 0.0;
    let mut total_net = 0.0;

    for (index, margin) in segments(records, limit).enumerate() {
        let Some(summary) = margin.summary() else {
            continue;
        };
        let calories = margin_calories(&margin, &profile);
        total_gross += calories.total.gross;
        total_net += calories.total.net;

        println!(
            "#{index:<3} {:>6} s {:>7.2} km {:>6} steps {:>8.2} kcal ({:.2} net){}",
            summary.time,
            summary.dist as f64 / 100.0,
            summary.steps,
            calories.total.gross,
            calories.total.net,
            if margin.is_breaking() { "  [break]" } else { "" },
        );
        for segment in margin.segments() {
            if let (Some(time), Some(dist)) = (segment.segment_time, segment.segment_dist) {
                println!(
                    "       {:>4.1} km/h for {:>5} s, {:.2} km",
                    segment.speed_kmh(),
                    time,
                    dist as f64 / 100.0
                );
            }
        }
    }

    println!("\nTotal: {total_gross:.2} kcal ({total_net:.2} net)");
    Ok(())
}
