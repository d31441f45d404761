use crate::{
    error::{PadError, Result},
    types::{DeviceMode, HistoryMode, Preference},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{fmt, time::SystemTime};

/// First byte of every outbound frame
pub const COMMAND_MAGIC: u8 = 0xF7;

/// First byte of every inbound frame
pub const NOTIFY_MAGIC: u8 = 0xF8;

/// Last byte of every frame
pub const FRAME_END: u8 = 0xFD;

/// Class byte for belt control and live status
pub const CLASS_CONTROL: u8 = 0xA2;

/// Class byte for profile slot queries
pub const CLASS_PROFILE: u8 = 0xA5;

/// Class byte for preference writes
pub const CLASS_PREFERENCE: u8 = 0xA6;

/// Class byte for history queries and last-record replies
pub const CLASS_HISTORY: u8 = 0xA7;

/// Minimum length of a current status frame
pub const STATUS_FRAME_MIN_LEN: usize = 17;

/// Minimum length of a last-record frame
pub const RECORD_FRAME_MIN_LEN: usize = 17;

/// Length of frames the firmware emits
pub const NOTIFY_FRAME_LEN: usize = 20;

/// Width of every integer field on the wire
pub const INT_WIDTH: usize = 3;

/// Largest value representable in [`INT_WIDTH`] bytes
pub const INT_MAX: u32 = (1 << (8 * INT_WIDTH)) - 1;

/// Profile slot request frames captured from the vendor app, checksum included
pub const PROFILE_SLOT_FRAMES: [[u8; 10]; 8] = [
    [0xF7, 0xA5, 0x60, 0x4A, 0x4D, 0x93, 0x71, 0x29, 0xC9, 0xFD],
    [0xF7, 0xA5, 0x60, 0x4A, 0x3A, 0x3C, 0x71, 0x29, 0x5F, 0xFD],
    [0xF7, 0xA5, 0x60, 0x4A, 0x0F, 0xA5, 0x71, 0x29, 0x9D, 0xFD],
    [0xF7, 0xA5, 0x60, 0x4A, 0x15, 0x81, 0x71, 0x29, 0x7F, 0xFD],
    [0xF7, 0xA5, 0x60, 0x4A, 0x2D, 0xBD, 0x73, 0xAB, 0x57, 0xFD],
    [0xF7, 0xA5, 0x60, 0x4A, 0x31, 0x2A, 0x71, 0x29, 0x44, 0xFD],
    [0xF7, 0xA5, 0x60, 0x4A, 0x3A, 0x3C, 0x71, 0x29, 0x5F, 0xFD],
    [0xF7, 0xA5, 0x60, 0x4A, 0x4D, 0x93, 0x71, 0x29, 0xC9, 0xFD],
];

/// Encode an integer as a fixed-width big-endian field
///
/// Values wider than [`INT_WIDTH`] bytes are truncated to their low bytes.
#[must_use]
pub fn int_to_bytes(value: u32) -> [u8; INT_WIDTH] {
    let mut out = [0u8; INT_WIDTH];
    let mut buf = &mut out[..];
    buf.put_uint(u64::from(value & INT_MAX), INT_WIDTH);
    out
}

/// Decode a fixed-width big-endian field from the start of `data`
///
/// # Errors
///
/// Returns [`PadError::ParseError`] if `data` is shorter than [`INT_WIDTH`].
pub fn bytes_to_int(data: &[u8]) -> Result<u32> {
    if data.len() < INT_WIDTH {
        return Err(PadError::ParseError(format!(
            "Integer field too short: {} bytes, expected {INT_WIDTH}",
            data.len()
        )));
    }
    let mut buf = data;
    let value = buf.get_uint(INT_WIDTH);
    Ok(value as u32)
}

/// Checksum over everything between the magic byte and the checksum slot
#[must_use]
pub fn checksum(frame: &[u8]) -> u8 {
    if frame.len() < 3 {
        return 0;
    }
    frame[1..frame.len() - 2]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Write the checksum into the second-to-last byte of `frame`
pub fn fix_checksum(frame: &mut [u8]) {
    if frame.len() < 3 {
        return;
    }
    let sum = checksum(frame);
    let slot = frame.len() - 2;
    frame[slot] = sum;
}

/// Check the checksum byte of a complete frame
#[must_use]
pub fn verify_checksum(frame: &[u8]) -> bool {
    frame.len() >= 3 && frame[frame.len() - 2] == checksum(frame)
}

/// Outbound commands understood by the belt controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Switch belt mode
    SwitchMode(DeviceMode),
    /// Set belt speed in units of 0.1 km/h
    SetSpeed(u8),
    /// Start the belt
    Start,
    /// Stop the belt, same frame as a zero speed
    Stop,
    /// Ask for a current status frame
    QueryStats,
    /// Ask for a last-record frame
    QueryHistory(HistoryMode),
    /// Ask for the preference block; the firmware beeps and replies with a status
    QueryPreference,
    /// Write one preference
    SetPreference(Preference),
    /// Ask for one of the stored profile slots
    AskProfileSlot(usize),
}

impl Command {
    /// Short name used in logs and error messages
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SwitchMode(_) => "switch_mode",
            Self::SetSpeed(_) => "set_speed",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::QueryStats => "query_stats",
            Self::QueryHistory(_) => "query_history",
            Self::QueryPreference => "query_preference",
            Self::SetPreference(_) => "set_preference",
            Self::AskProfileSlot(_) => "ask_profile_slot",
        }
    }

    /// Serialize the command into a checksummed frame
    ///
    /// # Errors
    ///
    /// Returns [`PadError::InvalidParameters`] for an unknown mode, a sensitivity
    /// outside 1..=3, a preference value wider than three bytes, or a profile
    /// slot that does not exist.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(COMMAND_MAGIC);

        match *self {
            Self::SwitchMode(mode) => {
                if mode == DeviceMode::Unknown {
                    return Err(PadError::InvalidParameters(
                        "Cannot switch to an unknown mode".to_string(),
                    ));
                }
                buf.put_slice(&[CLASS_CONTROL, 0x02, mode.code()]);
            }
            Self::SetSpeed(speed) => buf.put_slice(&[CLASS_CONTROL, 0x01, speed]),
            Self::Stop => buf.put_slice(&[CLASS_CONTROL, 0x01, 0x00]),
            Self::Start => buf.put_slice(&[CLASS_CONTROL, 0x04, 0x01]),
            Self::QueryStats => buf.put_slice(&[CLASS_CONTROL, 0x00, 0x00]),
            Self::QueryPreference => buf.put_slice(&[CLASS_CONTROL, 0x03, 0x07]),
            Self::QueryHistory(HistoryMode::Latest) => {
                buf.put_slice(&[CLASS_HISTORY, 0xAA, 0xFF]);
            }
            Self::QueryHistory(HistoryMode::Previous) => {
                buf.put_slice(&[CLASS_HISTORY, 0xAA, 0x00]);
            }
            Self::SetPreference(pref) => {
                if let Preference::Sensitivity(level) = pref {
                    if !(1..=3).contains(&level) {
                        return Err(PadError::InvalidParameters(format!(
                            "Sensitivity {level} is out of range (1 - 3)"
                        )));
                    }
                }
                if pref.value() > INT_MAX {
                    return Err(PadError::InvalidParameters(format!(
                        "Preference value {} does not fit in {INT_WIDTH} bytes",
                        pref.value()
                    )));
                }
                buf.put_u8(CLASS_PREFERENCE);
                buf.put_u8(pref.key() as u8);
                buf.put_u8(pref.sub_type());
                buf.put_slice(&int_to_bytes(pref.value()));
            }
            Self::AskProfileSlot(slot) => {
                let template = PROFILE_SLOT_FRAMES.get(slot).ok_or_else(|| {
                    PadError::InvalidParameters(format!(
                        "Profile slot {slot} does not exist (0 - {})",
                        PROFILE_SLOT_FRAMES.len() - 1
                    ))
                })?;
                let mut frame = BytesMut::from(&template[..]);
                fix_checksum(&mut frame);
                return Ok(frame.freeze());
            }
        }

        buf.put_u8(0);
        buf.put_u8(FRAME_END);
        fix_checksum(&mut buf);
        Ok(buf.freeze())
    }
}

/// Live status reported by the belt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    /// Distance in units of 10 m
    pub dist: u32,
    /// Elapsed time in seconds
    pub time: u32,
    /// Step count
    pub steps: u32,
    /// Belt speed in units of 0.1 km/h
    pub speed: u8,
    /// Speed requested by the app, in units of 1/30 km/h
    pub app_speed: u8,
    /// Belt state byte
    pub belt_state: u8,
    /// Mode byte, see [`DeviceMode`]
    pub manual_mode: u8,
    /// Last remote button pressed
    pub controller_button: u8,
    /// Frame as received
    pub raw: Bytes,
    /// Receive time assigned locally
    pub received_at: SystemTime,
}

impl StatusFrame {
    /// Decode a current status frame
    ///
    /// # Errors
    ///
    /// Returns [`PadError::ParseError`] if the type bytes do not match or the
    /// buffer is shorter than [`STATUS_FRAME_MIN_LEN`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if !Self::check_type(data) {
            return Err(PadError::ParseError(
                "Incorrect message type for a status frame".to_string(),
            ));
        }
        if data.len() < STATUS_FRAME_MIN_LEN {
            return Err(PadError::ParseError(format!(
                "Status frame too short: {} bytes, expected {STATUS_FRAME_MIN_LEN}",
                data.len()
            )));
        }

        Ok(Self {
            belt_state: data[2],
            speed: data[3],
            manual_mode: data[4],
            time: bytes_to_int(&data[5..])?,
            dist: bytes_to_int(&data[8..])?,
            steps: bytes_to_int(&data[11..])?,
            app_speed: data[14],
            controller_button: data[16],
            raw: Bytes::copy_from_slice(data),
            received_at: SystemTime::now(),
        })
    }

    /// Whether `data` starts with the status type bytes
    #[must_use]
    pub fn check_type(data: &[u8]) -> bool {
        data.starts_with(&[NOTIFY_MAGIC, CLASS_CONTROL])
    }

    /// Serialize the known fields into the firmware's 20-byte layout
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NOTIFY_FRAME_LEN);
        buf.put_u8(NOTIFY_MAGIC);
        buf.put_u8(CLASS_CONTROL);
        buf.put_u8(self.belt_state);
        buf.put_u8(self.speed);
        buf.put_u8(self.manual_mode);
        buf.put_slice(&int_to_bytes(self.time));
        buf.put_slice(&int_to_bytes(self.dist));
        buf.put_slice(&int_to_bytes(self.steps));
        buf.put_u8(self.app_speed);
        buf.put_u8(0);
        buf.put_u8(self.controller_button);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(FRAME_END);
        fix_checksum(&mut buf);
        buf.freeze()
    }

    /// Belt mode
    #[must_use]
    pub fn mode(&self) -> DeviceMode {
        DeviceMode::from(self.manual_mode)
    }

    /// Speed in km/h
    #[must_use]
    pub fn speed_kmh(&self) -> f64 {
        f64::from(self.speed) / 10.0
    }

    /// Receive time as seconds since the Unix epoch
    #[must_use]
    pub fn received_secs(&self) -> f64 {
        unix_secs(self.received_at)
    }
}

impl fmt::Display for StatusFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let app_speed = if self.app_speed > 0 {
            f64::from(self.app_speed) / 30.0
        } else {
            0.0
        };
        write!(
            f,
            "StatusFrame(dist={:.2}, time={}, steps={}, speed={:.1}, state={}, mode={}, app_speed={:.2}, button={})",
            f64::from(self.dist) / 100.0,
            self.time,
            self.steps,
            self.speed_kmh(),
            self.belt_state,
            self.mode(),
            app_speed,
            self.controller_button,
        )
    }
}

/// Summary of the most recently finished bout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastRecordFrame {
    /// Distance in units of 10 m
    pub dist: u32,
    /// Elapsed time in seconds
    pub time: u32,
    /// Step count
    pub steps: u32,
    /// Frame as received
    pub raw: Bytes,
    /// Receive time assigned locally
    pub received_at: SystemTime,
}

impl LastRecordFrame {
    /// Decode a last-record frame
    ///
    /// # Errors
    ///
    /// Returns [`PadError::ParseError`] if the type bytes do not match or the
    /// buffer is shorter than [`RECORD_FRAME_MIN_LEN`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if !Self::check_type(data) {
            return Err(PadError::ParseError(
                "Incorrect message type for a record frame".to_string(),
            ));
        }
        if data.len() < RECORD_FRAME_MIN_LEN {
            return Err(PadError::ParseError(format!(
                "Record frame too short: {} bytes, expected {RECORD_FRAME_MIN_LEN}",
                data.len()
            )));
        }

        Ok(Self {
            time: bytes_to_int(&data[8..])?,
            dist: bytes_to_int(&data[11..])?,
            steps: bytes_to_int(&data[14..])?,
            raw: Bytes::copy_from_slice(data),
            received_at: SystemTime::now(),
        })
    }

    /// Whether `data` starts with the last-record type bytes
    #[must_use]
    pub fn check_type(data: &[u8]) -> bool {
        data.starts_with(&[NOTIFY_MAGIC, CLASS_HISTORY])
    }

    /// Serialize the known fields into the firmware's 20-byte layout
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NOTIFY_FRAME_LEN);
        buf.put_u8(NOTIFY_MAGIC);
        buf.put_u8(CLASS_HISTORY);
        buf.put_bytes(0, 6);
        buf.put_slice(&int_to_bytes(self.time));
        buf.put_slice(&int_to_bytes(self.dist));
        buf.put_slice(&int_to_bytes(self.steps));
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(FRAME_END);
        fix_checksum(&mut buf);
        buf.freeze()
    }
}

impl fmt::Display for LastRecordFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LastRecordFrame(dist={:.2}, time={}, steps={})",
            f64::from(self.dist) / 100.0,
            self.time,
            self.steps,
        )
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Current status
    Status(StatusFrame),
    /// Last finished bout
    Record(LastRecordFrame),
}

/// Classify and decode an inbound buffer by its first two bytes
///
/// # Errors
///
/// Returns [`PadError::ParseError`] for unknown type bytes or truncated frames.
pub fn decode(data: &[u8]) -> Result<Notification> {
    if StatusFrame::check_type(data) {
        return StatusFrame::from_bytes(data).map(Notification::Status);
    }
    if LastRecordFrame::check_type(data) {
        return LastRecordFrame::from_bytes(data).map(Notification::Record);
    }
    Err(PadError::ParseError(format!(
        "Unknown message type: {:02X?}",
        &data[..data.len().min(2)]
    )))
}

/// Lowercase hex rendering of a frame, as stored in telemetry logs
#[must_use]
pub fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// Comma-separated hex rendering used in message logs
#[must_use]
pub fn hex_list(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn unix_secs(time: SystemTime) -> f64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Preference, TargetType};

    fn sample_status() -> StatusFrame {
        StatusFrame {
            dist: 1234,
            time: 3_725,
            steps: 4_321,
            speed: 35,
            app_speed: 90,
            belt_state: 1,
            manual_mode: 1,
            controller_button: 0,
            raw: Bytes::new(),
            received_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_int_field_round_trip() {
        assert_eq!(int_to_bytes(0x01_02_03), [0x01, 0x02, 0x03]);
        assert_eq!(bytes_to_int(&[0x01, 0x02, 0x03, 0xFF]).unwrap(), 0x01_02_03);
        assert_eq!(int_to_bytes(INT_MAX + 1), [0, 0, 0]);
        assert!(bytes_to_int(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn test_set_speed_frame() {
        let frame = Command::SetSpeed(25).encode().unwrap();

        assert_eq!(frame.len(), 6);
        assert_eq!(&frame[..], &[0xF7, 0xA2, 0x01, 25, 0xA2 + 0x01 + 25, 0xFD]);
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn test_control_frames_match_firmware_templates() {
        assert_eq!(
            &Command::QueryStats.encode().unwrap()[..],
            &[247, 162, 0, 0, 162, 253]
        );
        assert_eq!(
            &Command::QueryPreference.encode().unwrap()[..],
            &[247, 162, 3, 7, 172, 253]
        );
        assert_eq!(
            &Command::QueryHistory(HistoryMode::Latest).encode().unwrap()[..],
            &[247, 167, 170, 255, 80, 253]
        );
        assert_eq!(
            &Command::QueryHistory(HistoryMode::Previous).encode().unwrap()[..],
            &[247, 167, 170, 0, 81, 253]
        );
        assert_eq!(
            &Command::Start.encode().unwrap()[..],
            &[247, 162, 4, 1, 167, 253]
        );
        assert_eq!(
            &Command::SwitchMode(DeviceMode::Standby).encode().unwrap()[..],
            &[247, 162, 2, 2, 166, 253]
        );
        assert_eq!(
            Command::Stop.encode().unwrap(),
            Command::SetSpeed(0).encode().unwrap()
        );
    }

    #[test]
    fn test_every_command_frame_has_valid_checksum() {
        let commands = [
            Command::SwitchMode(DeviceMode::Manual),
            Command::SetSpeed(60),
            Command::Start,
            Command::Stop,
            Command::QueryStats,
            Command::QueryHistory(HistoryMode::Latest),
            Command::QueryPreference,
            Command::SetPreference(Preference::MaxSpeed(60)),
            Command::SetPreference(Preference::Target {
                kind: TargetType::Distance,
                value: 0x01_00_00,
            }),
            Command::AskProfileSlot(0),
            Command::AskProfileSlot(7),
        ];

        for command in commands {
            let frame = command.encode().unwrap();
            assert_eq!(frame[0], COMMAND_MAGIC, "{}", command.name());
            assert_eq!(frame[frame.len() - 1], FRAME_END, "{}", command.name());
            let expected = frame[1..frame.len() - 2]
                .iter()
                .map(|b| u32::from(*b))
                .sum::<u32>()
                % 256;
            assert_eq!(u32::from(frame[frame.len() - 2]), expected, "{}", command.name());
        }
    }

    #[test]
    fn test_preference_frame_layout() {
        let frame = Command::SetPreference(Preference::Target {
            kind: TargetType::Time,
            value: 1800,
        })
        .encode()
        .unwrap();

        assert_eq!(frame.len(), 9);
        assert_eq!(&frame[..7], &[0xF7, 0xA6, 1, 3, 0x00, 0x07, 0x08]);
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn test_profile_slot_templates_keep_their_checksum() {
        for (slot, template) in PROFILE_SLOT_FRAMES.iter().enumerate() {
            let frame = Command::AskProfileSlot(slot).encode().unwrap();
            assert_eq!(&frame[..], &template[..]);
        }
        assert!(Command::AskProfileSlot(8).encode().is_err());
    }

    #[test]
    fn test_invalid_parameters_are_rejected() {
        assert!(Command::SetPreference(Preference::Sensitivity(0)).encode().is_err());
        assert!(Command::SetPreference(Preference::Sensitivity(4)).encode().is_err());
        assert!(Command::SetPreference(Preference::Sensitivity(2)).encode().is_ok());
        assert!(Command::SetPreference(Preference::MaxSpeed(INT_MAX + 1))
            .encode()
            .is_err());
        assert!(Command::SwitchMode(DeviceMode::Unknown).encode().is_err());
    }

    #[test]
    fn test_status_frame_field_round_trip() {
        let original = sample_status();
        let bytes = original.to_bytes();
        assert_eq!(bytes.len(), NOTIFY_FRAME_LEN);

        let Notification::Status(decoded) = decode(&bytes).unwrap() else {
            panic!("expected a status frame");
        };
        assert_eq!(decoded.dist, original.dist);
        assert_eq!(decoded.time, original.time);
        assert_eq!(decoded.steps, original.steps);
        assert_eq!(decoded.speed, original.speed);
        assert_eq!(decoded.app_speed, original.app_speed);
        assert_eq!(decoded.belt_state, original.belt_state);
        assert_eq!(decoded.manual_mode, original.manual_mode);
        assert_eq!(decoded.controller_button, original.controller_button);
        assert_eq!(decoded.raw, bytes);
        assert_eq!(decoded.mode(), DeviceMode::Manual);
    }

    #[test]
    fn test_record_frame_decoding() {
        let frame = LastRecordFrame {
            dist: 250,
            time: 1_800,
            steps: 2_400,
            raw: Bytes::new(),
            received_at: SystemTime::now(),
        };
        let Notification::Record(decoded) = decode(&frame.to_bytes()).unwrap() else {
            panic!("expected a record frame");
        };
        assert_eq!(decoded.dist, 250);
        assert_eq!(decoded.time, 1_800);
        assert_eq!(decoded.steps, 2_400);
    }

    #[test]
    fn test_decode_rejects_unknown_and_short_frames() {
        assert!(decode(&[0xF8, 0xA1, 0, 0]).unwrap_err().is_framing_error());
        assert!(decode(&[]).is_err());

        let status = sample_status().to_bytes();
        assert!(decode(&status[..16]).is_err());
        assert!(decode(&status[..17]).is_ok());
    }

    #[test]
    fn test_hex_rendering() {
        assert_eq!(hex_string(&[0xF8, 0xA2, 0x01]), "f8a201");
        assert_eq!(hex_list(&[0xF8, 0xA2]), "f8, a2");
    }

    #[test]
    fn test_status_display() {
        let text = sample_status().to_string();
        assert!(text.contains("dist=12.34"));
        assert!(text.contains("speed=3.5"));
        assert!(text.contains("mode=Manual"));
    }
}
