#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Padlers 🚶
//!
//! A Rust library for driving WalkingPad treadmills over Bluetooth Low Energy
//! and for making sense of the status logs they produce.
//!
//! The belt speaks a small framed protocol over two GATT characteristics of
//! service `fe00`: commands are written to `fe02` and status reports arrive as
//! notifications on `fe01`. Every frame looks like
//! `[magic, class, payload.., checksum, 0xFD]`, with `0xF7` as magic for
//! outbound and `0xF8` for inbound frames.
//!
//! On top of the protocol the crate provides:
//!
//! - **Session control**: [`PadController`] connects, enables notifications,
//!   rate-limits every outbound command and polls the belt for stats.
//! - **Telemetry logs**: [`TelemetryWriter`] appends one JSON record per
//!   status frame, [`TelemetryLog`] reads them back forward or in reverse.
//! - **Segmentation**: [`Segmenter`] splits a log into walking margins,
//!   robust to counter resets and clock jumps.
//! - **Calories**: [`calories`] estimates gross and net energy use per
//!   segment from a [`Profile`], and [`CalorieTracker`] keeps running totals
//!   while a session is live.
//!
//! ## Quick Start
//!
//! ```no_run
//! use padlers::{PadController, Profile, CalorieTracker};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pad = PadController::connect_first().await?;
//!
//!     let mut tracker = CalorieTracker::new(Profile::default());
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     pad.subscribe_status(move |status| {
//!         let _ = tx.send(status.clone());
//!     });
//!     pad.start_polling().await?;
//!
//!     pad.start_belt(true).await?;
//!     pad.set_speed(35).await?;
//!
//!     if let Some(status) = rx.recv().await {
//!         let live = tracker.update(&status);
//!         println!("{status} net kcal: {:?}", live.ccal_net_sum);
//!     }
//!
//!     pad.stop_belt(true).await?;
//!     pad.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy scanning and transport
pub mod ble;
/// Calorie model and live calorie tracking
pub mod calories;
/// Rate-limited outbound command path
pub mod channel;
/// Session controller
pub mod device;
/// Inbound frame decoding and subscriber fan-out
pub mod dispatcher;
/// Error types and handling
pub mod error;
/// Person profile file
pub mod profile;
/// Wire format: frames, commands and notifications
pub mod protocol;
/// Segmentation of telemetry logs into walking margins
pub mod session;
/// Telemetry records and log files
pub mod telemetry;
/// Transport abstraction and an in-memory mock
pub mod transport;
/// Type definitions and data structures
pub mod types;

pub use ble::{BleScanner, BleTransport};
pub use calories::{CalorieEstimate, CalorieTracker, LiveCalories, MarginCalories};
pub use channel::CommandChannel;
pub use device::PadController;
pub use dispatcher::{NotificationDispatcher, SubscriptionId};
pub use error::{PadError, Result};
pub use profile::Profile;
pub use protocol::{Command, LastRecordFrame, Notification, StatusFrame};
pub use session::{segments, Margin, MarginSummary, Segmenter, SessionAnalysis};
pub use telemetry::{TelemetryLog, TelemetryRecord, TelemetryWriter};
pub use transport::{MockTransport, Transport};
pub use types::{
    ConnectionParams, ControllerConfig, DeviceInfo, DeviceMode, HistoryMode, Preference,
    PreferenceKey, SessionState, TargetType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WalkingPad GATT service UUID
pub const WALKINGPAD_SERVICE_UUID: &str = "0000fe00-0000-1000-8000-00805f9b34fb";

/// Characteristic the belt sends status and record frames on
pub const WALKINGPAD_NOTIFY_CHAR_UUID: &str = "0000fe01-0000-1000-8000-00805f9b34fb";

/// Characteristic commands are written to, without response
pub const WALKINGPAD_WRITE_CHAR_UUID: &str = "0000fe02-0000-1000-8000-00805f9b34fb";
