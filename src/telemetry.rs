use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error};

use crate::{
    calories::LiveCalories,
    error::{PadError, Result},
    profile::deserialize_optional_id,
    protocol::{hex_string, unix_secs, StatusFrame},
};

/// Batch size used when scanning a log backwards
pub const DEFAULT_BATCH_SIZE: usize = 8 * 1024;

/// Deltas between a boundary record and its predecessor in the stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordDelta {
    /// Device time delta in seconds
    pub time: i64,
    /// Step delta
    pub steps: i64,
    /// Distance delta
    pub dist: i64,
    /// Capture-clock delta in seconds
    pub rtime: f64,
}

/// One persisted status sample
///
/// Captured fields mirror [`StatusFrame`] plus the capture time and the
/// calorie figures known at capture. The `segment_*`, `breaking` and
/// `ldiff` fields are only filled in by session segmentation and are not
/// written by the capture path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Device time in seconds
    pub time: u32,
    /// Distance in device units
    pub dist: u32,
    /// Step counter
    pub steps: u32,
    /// Belt speed in units of 0.1 km/h
    pub speed: u8,
    /// Capture wall-clock time, seconds since the Unix epoch
    pub rec_time: f64,
    /// Speed requested by the app
    #[serde(default)]
    pub app_speed: u8,
    /// Belt state byte
    #[serde(default)]
    pub belt_state: u8,
    /// Last remote button
    #[serde(default)]
    pub controller_button: u8,
    /// Mode byte, see [`crate::DeviceMode`]
    #[serde(default)]
    pub manual_mode: u8,
    /// Raw frame as lowercase hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Profile id at capture time
    #[serde(
        default,
        deserialize_with = "deserialize_optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub pid: Option<String>,
    /// Gross kcal of the open segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccal: Option<f64>,
    /// Net kcal of the open segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccal_net: Option<f64>,
    /// Gross kcal of closed segments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccal_sum: Option<f64>,
    /// Net kcal of closed segments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccal_net_sum: Option<f64>,
    /// Device seconds spent in the segment this record closes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_time: Option<i64>,
    /// Capture-clock seconds of the segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_rtime: Option<f64>,
    /// Distance covered in the segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_dist: Option<i64>,
    /// Steps taken in the segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_steps: Option<i64>,
    /// Segment boundary forced by a data discontinuity
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub breaking: bool,
    /// Debug deltas recorded at a segment boundary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldiff: Option<RecordDelta>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl TelemetryRecord {
    /// Minimal record, mostly useful for replay and tests
    #[must_use]
    pub const fn new(time: u32, dist: u32, steps: u32, speed: u8, rec_time: f64) -> Self {
        Self {
            time,
            dist,
            steps,
            speed,
            rec_time,
            app_speed: 0,
            belt_state: 0,
            controller_button: 0,
            manual_mode: 0,
            raw: None,
            pid: None,
            ccal: None,
            ccal_net: None,
            ccal_sum: None,
            ccal_net_sum: None,
            segment_time: None,
            segment_rtime: None,
            segment_dist: None,
            segment_steps: None,
            breaking: false,
            ldiff: None,
        }
    }

    /// Build the persisted form of a live status frame
    ///
    /// Calorie figures are rounded to three decimals and left out when the
    /// tracker has not computed them.
    #[must_use]
    pub fn capture(status: &StatusFrame, pid: Option<&str>, calories: Option<&LiveCalories>) -> Self {
        let mut record = Self::new(
            status.time,
            status.dist,
            status.steps,
            status.speed,
            unix_secs(status.received_at),
        );
        record.app_speed = status.app_speed;
        record.belt_state = status.belt_state;
        record.controller_button = status.controller_button;
        record.manual_mode = status.manual_mode;
        record.raw = Some(hex_string(&status.raw));
        record.pid = pid.map(str::to_string);

        if let Some(cal) = calories {
            record.ccal = cal.ccal.map(round3);
            record.ccal_net = cal.ccal_net.map(round3);
            record.ccal_sum = cal.ccal_sum.map(round3);
            record.ccal_net_sum = cal.ccal_net_sum.map(round3);
        }
        record
    }

    /// Parse one log line, `None` for blank or malformed lines
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Skipping unparseable telemetry line: {}", e);
                None
            }
        }
    }

    /// Belt speed in km/h
    #[must_use]
    pub fn speed_kmh(&self) -> f64 {
        f64::from(self.speed) / 10.0
    }

    /// Drop segmentation debug detail
    pub fn strip_detail(&mut self) {
        self.ldiff = None;
    }
}

/// Lines of a seekable byte source, last line first
///
/// The source is read in fixed-size batches from the end, so the memory
/// used is bounded by the batch size plus the longest line. Blank lines are
/// skipped and a trailing `\r` is removed.
pub struct ReverseLines<R> {
    reader: R,
    position: u64,
    batch_size: usize,
    carry: Vec<u8>,
    ready: Vec<Vec<u8>>,
    finished: bool,
}

impl<R: Read + Seek> ReverseLines<R> {
    /// Start reading from the end of `reader`
    ///
    /// # Errors
    ///
    /// Returns [`PadError::Io`] if the source cannot be seeked.
    pub fn new(mut reader: R, batch_size: usize) -> Result<Self> {
        let position = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            reader,
            position,
            batch_size: batch_size.max(1),
            carry: Vec::new(),
            ready: Vec::new(),
            finished: false,
        })
    }

    fn read_batch(&mut self) -> io::Result<()> {
        let start = self.position.saturating_sub(self.batch_size as u64);
        let len = usize::try_from(self.position - start)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut combined = vec![0; len];
        self.reader.seek(SeekFrom::Start(start))?;
        self.reader.read_exact(&mut combined)?;
        self.position = start;

        combined.append(&mut self.carry);
        let mut pieces = combined.split(|b| *b == b'\n');
        self.carry = pieces.next().map(<[u8]>::to_vec).unwrap_or_default();
        self.ready.extend(pieces.map(<[u8]>::to_vec));
        Ok(())
    }
}

impl<R: Read + Seek> Iterator for ReverseLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(mut line) = self.ready.pop() {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                return Some(Ok(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.position == 0 {
                self.finished = true;
                let mut first = std::mem::take(&mut self.carry);
                if first.last() == Some(&b'\r') {
                    first.pop();
                }
                if first.is_empty() {
                    return None;
                }
                return Some(Ok(String::from_utf8_lossy(&first).into_owned()));
            }

            if let Err(e) = self.read_batch() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

/// Lines of a buffered byte source in order
///
/// Lines that are not valid UTF-8 are decoded lossily, so they reach the
/// record parser and get skipped there like any other malformed line.
pub struct ForwardLines<R> {
    lines: io::Split<R>,
}

impl<R: BufRead> ForwardLines<R> {
    /// Read lines from the current position of `reader`
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.split(b'\n'),
        }
    }
}

impl<R: BufRead> Iterator for ForwardLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.lines.next()?;
        Some(line.map(|mut line| {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            String::from_utf8_lossy(&line).into_owned()
        }))
    }
}

/// Records decoded from a line source, skipping malformed lines
pub struct Records<I> {
    lines: I,
}

impl<I> Records<I> {
    /// Wrap a line iterator
    pub const fn new(lines: I) -> Self {
        Self { lines }
    }
}

impl<I> Iterator for Records<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    type Item = Result<TelemetryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) => {
                    if let Some(record) = TelemetryRecord::parse_line(&line) {
                        return Some(Ok(record));
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Newline-delimited JSON telemetry log on disk
///
/// Every call to [`forward`](Self::forward) or [`reverse`](Self::reverse)
/// opens the file again, so a scan can be restarted at will.
#[derive(Debug, Clone)]
pub struct TelemetryLog {
    path: PathBuf,
    batch_size: usize,
}

impl TelemetryLog {
    /// Log at `path`; nothing is opened yet
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the reverse-scan batch size
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Log file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in capture order
    ///
    /// # Errors
    ///
    /// Returns [`PadError::Io`] if the file cannot be opened.
    pub fn forward(&self) -> Result<Records<ForwardLines<BufReader<File>>>> {
        let file = File::open(&self.path)?;
        Ok(Records::new(ForwardLines::new(BufReader::new(file))))
    }

    /// Records most recent first
    ///
    /// # Errors
    ///
    /// Returns [`PadError::Io`] if the file cannot be opened.
    pub fn reverse(&self) -> Result<Records<ReverseLines<File>>> {
        let file = File::open(&self.path)?;
        Ok(Records::new(ReverseLines::new(file, self.batch_size)?))
    }
}

/// Append-only log writer fed through an unbounded channel
///
/// [`append`](Self::append) never blocks, so it can be called from a
/// notification subscriber. A background task serializes and writes one
/// JSON object per line.
pub struct TelemetryWriter {
    sender: mpsc::UnboundedSender<TelemetryRecord>,
    task: JoinHandle<Result<()>>,
}

impl TelemetryWriter {
    /// Open `path` for appending, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns [`PadError::Io`] if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_records(file, receiver));

        Ok(Self { sender, task })
    }

    /// Queue a record for writing
    ///
    /// # Errors
    ///
    /// Returns [`PadError::Other`] if the writer task has stopped.
    pub fn append(&self, record: TelemetryRecord) -> Result<()> {
        self.sender
            .send(record)
            .map_err(|_| PadError::Other("telemetry writer stopped".to_string()))
    }

    /// A cloneable handle for use inside subscribers
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<TelemetryRecord> {
        self.sender.clone()
    }

    /// Flush queued records and stop the writer task
    ///
    /// Outstanding [`sender`](Self::sender) handles must be dropped first,
    /// otherwise this waits for them.
    ///
    /// # Errors
    ///
    /// Returns the first write error the task hit.
    pub async fn close(self) -> Result<()> {
        drop(self.sender);
        self.task
            .await
            .map_err(|e| PadError::Other(format!("telemetry writer task failed: {e}")))?
    }
}

async fn write_records(
    mut file: tokio::fs::File,
    mut receiver: mpsc::UnboundedReceiver<TelemetryRecord>,
) -> Result<()> {
    while let Some(record) = receiver.recv().await {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        if let Err(e) = file.write_all(&line).await {
            error!("Failed to append telemetry record: {}", e);
            return Err(e.into());
        }
    }
    file.flush().await?;
    Ok(())
}
