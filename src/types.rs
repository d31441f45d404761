use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Lower bound for the stats polling interval
pub const MIN_POLL_INTERVAL_MS: u64 = 500;

/// Belt operating mode as understood by the controller board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceMode {
    /// Speed follows the user's position on the belt
    Automatic = 0,
    /// Speed is set by the remote or the app
    Manual = 1,
    /// Belt is idle and waits for a mode switch
    Standby = 2,
    /// Mode byte not recognised
    Unknown = 0xFF,
}

impl DeviceMode {
    /// Wire code sent in a switch-mode frame
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl From<u8> for DeviceMode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Automatic,
            1 => Self::Manual,
            2 => Self::Standby,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automatic => write!(f, "Automatic"),
            Self::Manual => write!(f, "Manual"),
            Self::Standby => write!(f, "Standby"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Target kinds accepted by the target preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    /// No target
    None = 0,
    /// Distance target
    Distance = 1,
    /// Calorie target
    Calories = 2,
    /// Time target
    Time = 3,
}

/// Device-side preference keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PreferenceKey {
    /// Workout target
    Target = 1,
    /// Maximum belt speed
    MaxSpeed = 3,
    /// Speed used when the belt starts
    StartSpeed = 4,
    /// Automatic start when someone steps on the belt
    AutoStartIntelligence = 5,
    /// Automatic mode sensitivity
    Sensitivity = 6,
    /// Display field bitmask
    Display = 7,
    /// Metric or imperial units
    Units = 8,
    /// Child lock
    ChildLock = 9,
}

/// A preference assignment, carrying its typed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preference {
    /// Maximum speed in units of 0.1 km/h
    MaxSpeed(u32),
    /// Start speed in units of 0.1 km/h
    StartSpeed(u32),
    /// Start the belt when someone steps on it
    AutoStartIntelligence(bool),
    /// Sensitivity, 1 = high, 2 = medium, 3 = low
    Sensitivity(u8),
    /// 7-bit mask of shown display fields
    Display(u8),
    /// Child lock
    ChildLock(bool),
    /// Display miles instead of kilometers
    UnitsMiles(bool),
    /// Workout target of the given type
    Target {
        /// Target kind
        kind: TargetType,
        /// Target value in device units
        value: u32,
    },
}

impl Preference {
    /// Key byte for this preference
    #[must_use]
    pub const fn key(&self) -> PreferenceKey {
        match self {
            Self::MaxSpeed(_) => PreferenceKey::MaxSpeed,
            Self::StartSpeed(_) => PreferenceKey::StartSpeed,
            Self::AutoStartIntelligence(_) => PreferenceKey::AutoStartIntelligence,
            Self::Sensitivity(_) => PreferenceKey::Sensitivity,
            Self::Display(_) => PreferenceKey::Display,
            Self::ChildLock(_) => PreferenceKey::ChildLock,
            Self::UnitsMiles(_) => PreferenceKey::Units,
            Self::Target { .. } => PreferenceKey::Target,
        }
    }

    /// Sub-type byte, only non-zero for targets
    #[must_use]
    pub const fn sub_type(&self) -> u8 {
        match self {
            Self::Target { kind, .. } => *kind as u8,
            _ => 0,
        }
    }

    /// Integer value sent on the wire
    #[must_use]
    pub fn value(&self) -> u32 {
        match *self {
            Self::MaxSpeed(v) | Self::StartSpeed(v) => v,
            Self::AutoStartIntelligence(b) | Self::ChildLock(b) | Self::UnitsMiles(b) => u32::from(b),
            Self::Sensitivity(v) | Self::Display(v) => u32::from(v),
            Self::Target { value, .. } => value,
        }
    }
}

/// Which history record to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryMode {
    /// Most recently finished bout
    #[default]
    Latest,
    /// The record before it
    Previous,
}

/// Lifecycle of the single device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No link
    Disconnected,
    /// Link is being established
    Connecting,
    /// Link is up, notifications not yet enabled
    Connected,
    /// Notifications are flowing
    Subscribed,
    /// Ready for commands
    Active,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Active => write!(f, "Active"),
        }
    }
}

/// Device information gathered while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised name
    pub name: String,
    /// Bluetooth address
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, address: String, rssi: i16) -> Self {
        Self {
            name,
            address,
            rssi,
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Case-insensitive substring an advertised name must contain
    pub name_filter: String,
    /// Connect to this address directly, skipping the name filter
    pub address: Option<String>,
    /// Address prefix used to pick among several candidates
    pub address_filter: Option<String>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 3_000,
            connect_timeout_ms: 10_000,
            name_filter: "walkingpad".to_string(),
            address: None,
            address_filter: None,
        }
    }
}

/// Controller behaviour configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Minimum spacing between two outbound frames, device-observed
    pub min_command_spacing_ms: u64,
    /// Stats polling interval, clamped to [`MIN_POLL_INTERVAL_MS`]
    pub poll_interval_ms: u64,
    /// Log every received message at info instead of debug
    pub log_messages_info: bool,
    /// Log undecodable frames at debug instead of error
    pub ignore_bad_packets: bool,
    /// Pause between a mode switch and the follow-up command
    pub settle_delay_ms: u64,
}

impl ControllerConfig {
    /// Minimum spacing between commands
    #[must_use]
    pub const fn command_spacing(&self) -> Duration {
        Duration::from_millis(self.min_command_spacing_ms)
    }

    /// Effective polling interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    /// Pause between a mode switch and the follow-up command
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_command_spacing_ms: 690,
            poll_interval_ms: MIN_POLL_INTERVAL_MS,
            log_messages_info: true,
            ignore_bad_packets: false,
            settle_delay_ms: 1_500,
        }
    }
}
