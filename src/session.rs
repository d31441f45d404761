use std::mem;
use tracing::debug;

use crate::{
    calories::{margin_calories, CalorieEstimate, MarginCalories},
    error::Result,
    profile::Profile,
    telemetry::{RecordDelta, TelemetryLog, TelemetryRecord},
};

/// Largest tolerated gap between device time and capture time, in seconds
pub const MAX_CLOCK_DRIFT_SECS: f64 = 300.0;

/// One walking bout, most recent record first
///
/// Records carrying `segment_*` fields close the constant-speed segment that
/// ended at them; their `speed` is the speed of that segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Margin {
    records: Vec<TelemetryRecord>,
}

/// Aggregates of a margin's closed segments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginSummary {
    /// Earliest capture time in the margin
    pub started_at: f64,
    /// Latest capture time in the margin
    pub ended_at: f64,
    /// Device seconds over closed segments
    pub time: i64,
    /// Distance over closed segments
    pub dist: i64,
    /// Steps over closed segments
    pub steps: i64,
}

impl Margin {
    /// Boundary records in stream order
    #[must_use]
    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    /// Take the records out
    #[must_use]
    pub fn into_records(self) -> Vec<TelemetryRecord> {
        self.records
    }

    /// Whether the margin was cut by a data discontinuity
    #[must_use]
    pub fn is_breaking(&self) -> bool {
        self.records.last().is_some_and(|r| r.breaking)
    }

    /// Records that close a segment
    pub fn segments(&self) -> impl Iterator<Item = &TelemetryRecord> {
        self.records.iter().filter(|r| r.segment_time.is_some())
    }

    /// Remove per-boundary debug deltas
    pub fn strip_detail(&mut self) {
        self.records
            .iter_mut()
            .for_each(TelemetryRecord::strip_detail);
    }

    /// Capture-time span and segment totals
    #[must_use]
    pub fn summary(&self) -> Option<MarginSummary> {
        let first = self.records.first()?;
        let mut summary = MarginSummary {
            started_at: first.rec_time,
            ended_at: first.rec_time,
            time: 0,
            dist: 0,
            steps: 0,
        };
        for record in &self.records {
            summary.started_at = summary.started_at.min(record.rec_time);
            summary.ended_at = summary.ended_at.max(record.rec_time);
        }
        for record in self.segments() {
            summary.time += record.segment_time.unwrap_or(0);
            summary.dist += record.segment_dist.unwrap_or(0);
            summary.steps += record.segment_steps.unwrap_or(0);
        }
        Some(summary)
    }

    fn has_elapsed_segment(&self) -> bool {
        self.records.iter().any(|r| {
            r.segment_time.is_some_and(|t| t > 0) || r.segment_rtime.is_some_and(|t| t > 0.0)
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    time: u32,
    dist: u32,
    steps: u32,
    speed: u8,
    rec_time: f64,
}

impl From<&TelemetryRecord> for Mark {
    fn from(r: &TelemetryRecord) -> Self {
        Self {
            time: r.time,
            dist: r.dist,
            steps: r.steps,
            speed: r.speed,
            rec_time: r.rec_time,
        }
    }
}

fn close_segment(boundary: &mut TelemetryRecord, from: Mark, to: Mark) {
    boundary.segment_time = Some(i64::from(from.time) - i64::from(to.time));
    boundary.segment_rtime = Some(from.rec_time - to.rec_time);
    boundary.segment_dist = Some(i64::from(from.dist) - i64::from(to.dist));
    boundary.segment_steps = Some(i64::from(from.steps) - i64::from(to.steps));
}

/// Splits a most-recent-first record stream into margins
///
/// A margin closes at a device counter reset (a stopped belt reporting zero
/// time) or at a discontinuity: counters or capture time going forward while
/// reading backwards, or device time drifting from capture time by more than
/// [`MAX_CLOCK_DRIFT_SECS`]. Margins without any elapsed segment are dropped
/// and do not count toward the limit.
///
/// The engine owns no shared state; two engines over the same input and
/// limit yield the same margins.
pub struct Segmenter<I> {
    records: I,
    limit: Option<usize>,
    yielded: usize,
    last: Option<Mark>,
    last_diff: Option<Mark>,
    margin: Vec<TelemetryRecord>,
    in_record: bool,
    finished: bool,
}

impl<I> Segmenter<I>
where
    I: Iterator<Item = TelemetryRecord>,
{
    /// Segment `records`, stopping after `limit` margins (`None` or zero
    /// means no limit)
    pub fn new(records: impl IntoIterator<IntoIter = I>, limit: Option<usize>) -> Self {
        Self {
            records: records.into_iter(),
            limit: limit.filter(|l| *l > 0),
            yielded: 0,
            last: None,
            last_diff: None,
            margin: Vec::new(),
            in_record: false,
            finished: false,
        }
    }

    fn push(&mut self, mut r: TelemetryRecord) -> Option<Vec<TelemetryRecord>> {
        if r.speed != 0 {
            self.in_record = true;
        }

        let (Some(last), Some(last_diff)) = (self.last, self.last_diff) else {
            return self.anchor(r);
        };
        if !self.in_record {
            return self.anchor(r);
        }

        let current = Mark::from(&r);
        let dtime = i64::from(last.time) - i64::from(r.time);
        let dsteps = i64::from(last.steps) - i64::from(r.steps);
        let ddist = i64::from(last.dist) - i64::from(r.dist);
        let drtime = last.rec_time - r.rec_time;
        #[allow(clippy::cast_precision_loss)]
        let drift = (dtime as f64 - drtime).abs();

        let breaking =
            dtime < 0 || dsteps < 0 || ddist < 0 || drtime < 0.0 || drift > MAX_CLOCK_DRIFT_SECS;

        if breaking {
            debug!(
                "Discontinuity at time {}: dtime {}, dsteps {}, ddist {}, drtime {:.1}",
                r.time, dtime, dsteps, ddist, drtime
            );
            r.breaking = true;
            if let Some(boundary) = self.margin.last_mut() {
                boundary.breaking = true;
                close_segment(boundary, last_diff, last);
            }
            let completed = mem::replace(&mut self.margin, vec![r]);
            self.last = Some(current);
            self.last_diff = Some(current);
            self.in_record = current.speed != 0;
            return Some(completed);
        }

        let counter_reset = r.speed == 0 && r.time == 0;
        if last_diff.speed != r.speed || counter_reset {
            if let Some(boundary) = self.margin.last_mut() {
                close_segment(boundary, last_diff, current);
            }
            r.ldiff = Some(RecordDelta {
                time: dtime,
                steps: dsteps,
                dist: ddist,
                rtime: drtime,
            });
            self.last_diff = Some(current);
            self.last = Some(current);

            if counter_reset {
                self.margin.push(r.clone());
                self.in_record = false;
                return Some(mem::replace(&mut self.margin, vec![r]));
            }
            self.margin.push(r);
            return None;
        }

        self.last = Some(current);
        None
    }

    fn anchor(&mut self, r: TelemetryRecord) -> Option<Vec<TelemetryRecord>> {
        let mark = Mark::from(&r);
        self.last = Some(mark);
        self.last_diff = Some(mark);
        if self.in_record {
            self.margin.push(r);
        } else {
            self.margin = vec![r];
        }
        None
    }

    fn emit(&mut self, records: Vec<TelemetryRecord>) -> Option<Margin> {
        let margin = Margin { records };
        if !margin.has_elapsed_segment() {
            return None;
        }
        self.yielded += 1;
        if self.limit.is_some_and(|limit| self.yielded >= limit) {
            self.finished = true;
        }
        Some(margin)
    }
}

impl<I> Iterator for Segmenter<I>
where
    I: Iterator<Item = TelemetryRecord>,
{
    type Item = Margin;

    fn next(&mut self) -> Option<Margin> {
        while !self.finished {
            let Some(record) = self.records.next() else {
                self.finished = true;
                let mut tail = mem::take(&mut self.margin);
                if let (Some(boundary), Some(last_diff), Some(last)) =
                    (tail.last_mut(), self.last_diff, self.last)
                {
                    close_segment(boundary, last_diff, last);
                }
                return self.emit(tail);
            };
            if let Some(completed) = self.push(record) {
                if let Some(margin) = self.emit(completed) {
                    return Some(margin);
                }
            }
        }
        None
    }
}

/// Segment a most-recent-first record sequence
pub fn segments<I>(records: I, limit: Option<usize>) -> Segmenter<I::IntoIter>
where
    I: IntoIterator<Item = TelemetryRecord>,
{
    Segmenter::new(records, limit)
}

/// The latest walks recovered from a telemetry log
#[derive(Debug, Clone, Default)]
pub struct SessionAnalysis {
    /// Most recent record in the log
    pub last_record: Option<TelemetryRecord>,
    /// Recovered margins, most recent first
    pub margins: Vec<Margin>,
    /// Calories of the most recent margin
    pub calories: Option<MarginCalories>,
}

impl SessionAnalysis {
    /// Replay `log` backwards and price the most recent walk
    ///
    /// # Errors
    ///
    /// Returns [`crate::PadError::Io`] if the log cannot be read. Malformed
    /// lines are skipped.
    pub fn load_last(log: &TelemetryLog, profile: &Profile, limit: usize) -> Result<Self> {
        let mut read_error = None;
        let records = log
            .reverse()?
            .map_while(|record| record.map_err(|e| read_error = Some(e)).ok());
        let analysis = Self::from_records(records, profile, limit);

        match read_error {
            Some(e) => Err(e),
            None => Ok(analysis),
        }
    }

    /// Same as [`load_last`](Self::load_last) over in-memory records
    pub fn from_records(
        records: impl IntoIterator<Item = TelemetryRecord>,
        profile: &Profile,
        limit: usize,
    ) -> Self {
        let mut last_record = None;
        let records = records.into_iter().inspect(|r| {
            if last_record.is_none() {
                last_record = Some(r.clone());
            }
        });
        let margins: Vec<Margin> = segments(records, Some(limit)).collect();
        let calories = margins.first().map(|m| margin_calories(m, profile));

        Self {
            last_record,
            margins,
            calories,
        }
    }

    /// Most recent record of the most recent walk
    #[must_use]
    pub fn resume_anchor(&self) -> Option<&TelemetryRecord> {
        self.margins.first()?.records().first()
    }

    /// Calories of the most recent walk's closed segments
    #[must_use]
    pub fn closed_calories(&self) -> CalorieEstimate {
        self.calories.as_ref().map(|c| c.total).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rec(time: u32, dist: u32, steps: u32, speed: u8, rec_time: f64) -> TelemetryRecord {
        TelemetryRecord::new(time, dist, steps, speed, rec_time)
    }

    /// A walk at 2.0 km/h then 3.0 km/h, stopped and reset, newest first
    fn two_speed_walk() -> Vec<TelemetryRecord> {
        let mut forward = vec![rec(0, 0, 0, 0, 1000.0)];
        for i in 1..=5u32 {
            forward.push(rec(i * 30, i * 20, i * 40, 20, 1000.0 + f64::from(i * 30)));
        }
        for i in 6..=10u32 {
            forward.push(rec(i * 30, i * 25, i * 50, 30, 1000.0 + f64::from(i * 30)));
        }
        forward.push(rec(0, 0, 0, 0, 1400.0));
        forward.reverse();
        forward
    }

    #[test]
    fn test_single_segment_between_resets() {
        let records = vec![
            rec(0, 0, 0, 0, 1000.0),
            rec(60, 100, 80, 10, 940.0),
            rec(0, 0, 0, 0, 880.0),
        ];
        let margins: Vec<_> = segments(records, None).collect();

        assert_eq!(margins.len(), 1);
        let closed: Vec<_> = margins[0].segments().collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].speed, 10);
        assert_eq!(closed[0].segment_time, Some(60));
        assert_eq!(closed[0].segment_dist, Some(100));
        assert_eq!(closed[0].segment_steps, Some(80));
        assert!(!margins[0].is_breaking());
    }

    #[test]
    fn test_speed_changes_split_segments() {
        let margins: Vec<_> = segments(two_speed_walk(), None).collect();
        assert_eq!(margins.len(), 1);

        let closed: Vec<_> = margins[0].segments().collect();
        assert_eq!(closed.len(), 2);
        // newest segment first
        assert_eq!(closed[0].speed, 30);
        assert_eq!(closed[0].segment_time, Some(150));
        assert_eq!(closed[1].speed, 20);
        assert_eq!(closed[1].segment_time, Some(150));
        assert_eq!(closed[1].segment_dist, Some(100));
        assert!(closed[1].ldiff.is_some());

        let summary = margins[0].summary().unwrap();
        assert_eq!(summary.time, 300);
        assert!((summary.ended_at - summary.started_at - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_capture_clock_jump_breaks_margin() {
        let records = vec![
            rec(100, 50, 200, 20, 2000.0),
            rec(90, 45, 180, 20, 1990.0),
            rec(80, 40, 160, 20, 1000.0),
        ];
        let margins: Vec<_> = segments(records, None).collect();

        assert_eq!(margins.len(), 1);
        assert!(margins[0].is_breaking());
        let closing = margins[0].records().last().unwrap();
        assert_eq!(closing.time, 100);
        assert!(closing.breaking);
        assert_eq!(closing.segment_time, Some(10));
    }

    #[test]
    fn test_each_discontinuity_breaks_on_its_own() {
        // the third record upsets exactly one of the consistency checks
        let cases = [
            ("capture clock runs forward", rec(80, 40, 160, 20, 1995.0)),
            ("steps go up", rec(80, 40, 190, 20, 1980.0)),
            ("distance goes up", rec(80, 50, 160, 20, 1980.0)),
            ("device time goes up", rec(95, 40, 160, 20, 1980.0)),
        ];

        for (name, odd) in cases {
            let records = vec![
                rec(100, 50, 200, 20, 2000.0),
                rec(90, 45, 180, 20, 1990.0),
                odd,
            ];
            let margins: Vec<_> = segments(records, None).collect();

            assert_eq!(margins.len(), 1, "{name}");
            assert!(margins[0].is_breaking(), "{name}");
            let closing = margins[0].records().last().unwrap();
            assert_eq!(closing.time, 100, "{name}");
            assert_eq!(closing.segment_time, Some(10), "{name}");
            assert_eq!(closing.segment_rtime, Some(10.0), "{name}");
        }
    }

    #[test]
    fn test_consistent_stream_does_not_break() {
        let records = vec![
            rec(100, 50, 200, 20, 2000.0),
            rec(90, 45, 180, 20, 1990.0),
            rec(80, 40, 160, 20, 1980.0),
        ];
        let margins: Vec<_> = segments(records, None).collect();

        assert_eq!(margins.len(), 1);
        assert!(!margins[0].is_breaking());
        assert_eq!(margins[0].records()[0].segment_time, Some(20));
    }

    #[test]
    fn test_counter_regression_breaks_margin() {
        // reading backwards, time goes up again: an older bout
        let records = vec![
            rec(50, 30, 60, 20, 3050.0),
            rec(20, 10, 20, 20, 3020.0),
            rec(400, 300, 600, 20, 3010.0),
            rec(380, 290, 570, 20, 2990.0),
        ];
        let margins: Vec<_> = segments(records, None).collect();

        assert_eq!(margins.len(), 2);
        assert!(margins[0].is_breaking());
        assert_eq!(margins[0].records()[0].segment_time, Some(30));
        assert_eq!(margins[1].records()[0].time, 400);
        assert_eq!(margins[1].records()[0].segment_time, Some(20));
    }

    #[test]
    fn test_idle_tail_collapses_to_one_anchor() {
        // belt stopped with the counters still showing the finished walk
        let mut records = vec![
            rec(300, 250, 500, 0, 1500.0),
            rec(300, 250, 500, 0, 1450.0),
        ];
        records.extend(two_speed_walk().into_iter().skip(1));
        let margins: Vec<_> = segments(records, None).collect();

        assert_eq!(margins.len(), 1);
        let anchor = &margins[0].records()[0];
        assert_eq!(anchor.rec_time, 1450.0);
        assert_eq!(anchor.segment_time, Some(0));
        assert_eq!(anchor.segment_rtime, Some(150.0));
    }

    #[test]
    fn test_unfinished_oldest_walk_is_yielded() {
        let records = vec![
            rec(0, 0, 0, 0, 1300.0),
            rec(120, 80, 160, 25, 1240.0),
            rec(60, 40, 80, 25, 1180.0),
        ];
        let margins: Vec<_> = segments(records, None).collect();
        assert_eq!(margins.len(), 1);
        assert_eq!(margins[0].segments().count(), 1);
    }

    #[test]
    fn test_segmentation_is_idempotent() {
        let mut records = two_speed_walk();
        records.extend(two_speed_walk().into_iter().map(|mut r| {
            r.rec_time -= 5000.0;
            r
        }));

        let first: Vec<_> = segments(records.clone(), Some(5)).collect();
        let second: Vec<_> = segments(records, Some(5)).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_limit_counts_only_real_margins() {
        let mut records = two_speed_walk();
        records.extend(two_speed_walk().into_iter().map(|mut r| {
            r.rec_time -= 5000.0;
            r
        }));

        let margins: Vec<_> = segments(records.clone(), Some(1)).collect();
        assert_eq!(margins.len(), 1);
        assert_eq!(margins[0], segments(records, None).next().unwrap());
    }

    #[test]
    fn test_clean_margins_are_monotonic() {
        let mut records = two_speed_walk();
        records.extend(vec![
            rec(300, 250, 500, 30, 100.0),
            rec(900, 700, 1500, 30, 50.0),
        ]);

        for margin in segments(records, None).filter(|m| !m.is_breaking()) {
            for pair in margin.records().windows(2) {
                let (newer, older) = (&pair[0], &pair[1]);
                if older.speed == 0 && older.time == 0 {
                    continue;
                }
                assert!(newer.time >= older.time);
                assert!(newer.dist >= older.dist);
                assert!(newer.steps >= older.steps);
            }
        }
    }

    #[test]
    fn test_strip_detail() {
        let mut margin = segments(two_speed_walk(), None).next().unwrap();
        assert!(margin.records().iter().any(|r| r.ldiff.is_some()));
        margin.strip_detail();
        assert!(margin.records().iter().all(|r| r.ldiff.is_none()));
        assert_eq!(margin.segments().count(), 2);
    }

    #[test]
    fn test_load_last_from_log() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut forward = two_speed_walk();
        forward.reverse();
        for record in &forward {
            writeln!(file, "{}", serde_json::to_string(record).unwrap()).unwrap();
        }
        writeln!(file, "not a record").unwrap();

        let log = TelemetryLog::new(file.path()).with_batch_size(64);
        let profile = Profile::default();
        let analysis = SessionAnalysis::load_last(&log, &profile, 1).unwrap();

        assert_eq!(analysis.margins.len(), 1);
        assert_eq!(analysis.last_record.as_ref().unwrap().rec_time, 1400.0);
        assert_eq!(analysis.resume_anchor().unwrap().rec_time, 1300.0);

        let calories = analysis.calories.as_ref().unwrap();
        assert_eq!(calories.segments.len(), 2);
        assert!(analysis.closed_calories().gross > 0.0);
        assert!(analysis.closed_calories().net < analysis.closed_calories().gross);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(segments(Vec::new(), None).count(), 0);
        let analysis = SessionAnalysis::from_records(Vec::new(), &Profile::default(), 1);
        assert!(analysis.margins.is_empty());
        assert!(analysis.resume_anchor().is_none());
        assert_eq!(analysis.closed_calories(), CalorieEstimate::default());
    }
}
