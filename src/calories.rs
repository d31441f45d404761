use std::ops::{Add, AddAssign};
use tracing::{debug, info};

use crate::{
    profile::Profile,
    protocol::StatusFrame,
    session::{Margin, MAX_CLOCK_DRIFT_SECS},
    telemetry::TelemetryRecord,
};

/// Grades above this use the linear approximation
pub const POLYNOMIAL_GRADE_LIMIT: f64 = 0.06;

/// Cubic coefficients in speed (km/h) for grades -5% ..= +5% in 1% steps
const WALK2_COEFFICIENTS: [[f64; 4]; 11] = [
    [0.0251, -0.2157, 0.7888, 1.2957],
    [0.0244, -0.2079, 0.8053, 1.3281],
    [0.0237, -0.2000, 0.8217, 1.3605],
    [0.0230, -0.1922, 0.8382, 1.3929],
    [0.0222, -0.1844, 0.8546, 1.4253],
    [0.0215, -0.1765, 0.8710, 1.4577],
    [0.0171, -0.1062, 0.6080, 1.8600],
    [0.0184, -0.1134, 0.6566, 1.9200],
    [0.0196, -0.1205, 0.7053, 1.9800],
    [0.0208, -0.1277, 0.7539, 2.0400],
    [0.0221, -0.1349, 0.8025, 2.1000],
];

/// Gross walking kcal per minute
///
/// `grade` is the elevation as a fraction (5% = 0.05). The polynomial model
/// is fitted for speeds of roughly 1 to 7.5 km/h.
#[must_use]
pub fn calories_walk2_minute(speed_kmh: f64, weight: f64, grade: f64) -> f64 {
    if grade <= POLYNOMIAL_GRADE_LIMIT {
        let row = ((grade * 100.0).max(-5.0).trunc() + 5.0).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let row = (row as usize).min(WALK2_COEFFICIENTS.len() - 1);
        let c = WALK2_COEFFICIENTS[row];
        let per_kg = c[0] * speed_kmh.powi(3) + c[1] * speed_kmh.powi(2) + c[2] * speed_kmh + c[3];
        return per_kg * weight / 60.0;
    }

    let mpm = speed_kmh * 1000.0 / 60.0;
    (0.1 * mpm + 1.8 * mpm * grade + 3.5) * weight * 60.0 * 5.0 / 1000.0 / 60.0
}

/// Basal metabolic rate in kcal per day
///
/// Height is in meters.
#[must_use]
pub fn calories_bmr(weight: f64, height: f64, age: f64, male: bool) -> f64 {
    if male {
        13.75 * weight + 5.0 * (height * 100.0) - 6.76 * age + 66.0
    } else {
        9.56 * weight + 1.85 * (height * 100.0) - 4.68 * age + 655.0
    }
}

/// Resting metabolic kcal per minute
#[must_use]
pub fn calories_rmrcb_minute(weight: f64, height: f64, age: f64, male: bool) -> f64 {
    calories_bmr(weight, height, age, male) * 1.1 / 24.0 / 60.0
}

/// Gross and net kcal of some stretch of walking
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalorieEstimate {
    /// Total burned, resting metabolism included
    pub gross: f64,
    /// Gross minus resting metabolism over the same time
    pub net: f64,
}

impl Add for CalorieEstimate {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            gross: self.gross + other.gross,
            net: self.net + other.net,
        }
    }
}

impl AddAssign for CalorieEstimate {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// Estimate for `seconds` spent at `speed_kmh` on a flat belt
#[must_use]
pub fn estimate_duration(seconds: f64, speed_kmh: f64, profile: &Profile) -> CalorieEstimate {
    let minutes = seconds / 60.0;
    let gross = minutes * calories_walk2_minute(speed_kmh, profile.weight, 0.0);
    let rest = minutes
        * calories_rmrcb_minute(profile.weight, profile.height, profile.age, profile.male);
    CalorieEstimate {
        gross,
        net: gross - rest,
    }
}

/// Estimate for the segment closed by `record`
///
/// `None` when the record does not close a segment.
#[must_use]
pub fn estimate(record: &TelemetryRecord, profile: &Profile) -> Option<CalorieEstimate> {
    #[allow(clippy::cast_precision_loss)]
    let seconds = record.segment_time? as f64;
    Some(estimate_duration(seconds, record.speed_kmh(), profile))
}

/// Per-segment estimates of one margin and their sum
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarginCalories {
    /// One entry per closed segment, in margin order
    pub segments: Vec<CalorieEstimate>,
    /// Sum over `segments`
    pub total: CalorieEstimate,
}

/// Estimate every closed segment of `margin`
pub fn margin_calories(margin: &Margin, profile: &Profile) -> MarginCalories {
    let mut result = MarginCalories::default();

    for record in margin.records() {
        let Some(cal) = estimate(record, profile) else {
            continue;
        };
        #[allow(clippy::cast_precision_loss)]
        let dist_km = record.segment_dist.unwrap_or(0) as f64 / 100.0;
        info!(
            "Calories for time {:>5}, speed {:4.1}, seg time: {:>4}, dist: {:5.2}, steps: {:>5}, cal: {:7.2}, ncal: {:7.2}",
            record.time,
            record.speed_kmh(),
            record.segment_time.unwrap_or(0),
            dist_km,
            record.segment_steps.unwrap_or(0),
            cal.gross,
            cal.net
        );
        result.segments.push(cal);
        result.total += cal;
    }

    info!(
        "Calories burned so far this walk: {:7.2} kcal, {:7.2} kcal net",
        result.total.gross, result.total.net
    );
    result
}

/// Calorie figures attached to a captured status frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LiveCalories {
    /// Gross kcal of the open segment
    pub ccal: Option<f64>,
    /// Net kcal of the open segment
    pub ccal_net: Option<f64>,
    /// Gross kcal including closed segments
    pub ccal_sum: Option<f64>,
    /// Net kcal including closed segments
    pub ccal_net_sum: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct SegmentStart {
    time: u32,
    dist: u32,
    speed: u8,
}

/// Running calorie accounting over live status frames
///
/// A segment runs from the last speed change to the current frame and is
/// priced at the speed it started with. Closed segments are accumulated
/// whenever the speed changes. Counters going backwards reset everything.
pub struct CalorieTracker {
    profile: Profile,
    start: Option<SegmentStart>,
    last_counters: Option<(u32, u32)>,
    current: CalorieEstimate,
    closed: CalorieEstimate,
    resume: Option<(TelemetryRecord, CalorieEstimate)>,
}

impl CalorieTracker {
    /// Fresh tracker for `profile`
    #[must_use]
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            start: None,
            last_counters: None,
            current: CalorieEstimate { gross: 0.0, net: 0.0 },
            closed: CalorieEstimate { gross: 0.0, net: 0.0 },
            resume: None,
        }
    }

    /// Continue a walk recovered from the telemetry log
    ///
    /// `anchor` is the most recent logged record of that walk and `closed`
    /// the calories of its closed segments. Both are only taken over if the
    /// first live frame is consistent with the anchor.
    #[must_use]
    pub fn resuming(mut self, anchor: TelemetryRecord, closed: CalorieEstimate) -> Self {
        self.resume = Some((anchor, closed));
        self
    }

    /// Profile used for estimates
    #[must_use]
    pub const fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Closed segments plus the open one
    #[must_use]
    pub fn totals(&self) -> CalorieEstimate {
        self.closed + self.current
    }

    /// Account one live frame
    pub fn update(&mut self, status: &StatusFrame) -> LiveCalories {
        if let Some((time, steps)) = self.last_counters {
            if time > status.time || steps > status.steps {
                debug!("Resetting calorie measurements");
                self.start = None;
                self.current = CalorieEstimate::default();
                self.closed = CalorieEstimate::default();
                self.resume = None;
            }
        }
        self.last_counters = Some((status.time, status.steps));

        let start = match self.start {
            Some(start) => start,
            None => {
                let start = self.initial_start(status);
                self.start = Some(start);
                start
            }
        };

        let el_time = i64::from(status.time) - i64::from(start.time);
        let el_dist = i64::from(status.dist) - i64::from(start.dist);

        let mut live = LiveCalories::default();
        if el_time > 0 && el_dist > 0 {
            #[allow(clippy::cast_precision_loss)]
            let cal = estimate_duration(el_time as f64, f64::from(start.speed) / 10.0, &self.profile);
            self.current = cal;
            live = LiveCalories {
                ccal: Some(cal.gross),
                ccal_net: Some(cal.net),
                ccal_sum: Some(self.closed.gross + cal.gross),
                ccal_net_sum: Some(self.closed.net + cal.net),
            };
        }

        if start.speed != status.speed {
            self.closed += self.current;
            self.current = CalorieEstimate::default();
            self.start = Some(SegmentStart {
                time: status.time,
                dist: status.dist,
                speed: status.speed,
            });
        }

        live
    }

    fn initial_start(&mut self, status: &StatusFrame) -> SegmentStart {
        let from_status = SegmentStart {
            time: status.time,
            dist: status.dist,
            speed: status.speed,
        };
        let Some((anchor, closed)) = self.resume.take() else {
            return from_status;
        };

        let rec_time = status.received_secs();
        if status.time < anchor.time
            || status.dist < anchor.dist
            || status.steps < anchor.steps
            || rec_time < anchor.rec_time
        {
            debug!("Logged walk is ahead of the live counters, not resuming");
            return from_status;
        }

        let drift = (f64::from(status.time - anchor.time) - (rec_time - anchor.rec_time)).abs();
        if drift > MAX_CLOCK_DRIFT_SECS {
            debug!("Logged walk is {:.0}s off the live clock, not resuming", drift);
            return from_status;
        }

        info!(
            "Resuming walk from t={}s with {:.2} kcal already burned",
            anchor.time, closed.gross
        );
        self.closed = closed;
        SegmentStart {
            time: anchor.time,
            dist: anchor.dist,
            speed: status.speed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::{Duration, UNIX_EPOCH};

    fn status(time: u32, dist: u32, steps: u32, speed: u8, rec_time: u64) -> StatusFrame {
        StatusFrame {
            dist,
            time,
            steps,
            speed,
            app_speed: speed,
            belt_state: 1,
            manual_mode: 1,
            controller_button: 0,
            raw: Bytes::new(),
            received_at: UNIX_EPOCH + Duration::from_secs(rec_time),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_walk2_flat_five_kmh() {
        let per_kg = 0.0215 * 125.0 - 0.1765 * 25.0 + 0.8710 * 5.0 + 1.4577;
        assert!(close(calories_walk2_minute(5.0, 80.0, 0.0), per_kg * 80.0 / 60.0));
    }

    #[test]
    fn test_walk2_grade_rows() {
        let at = |grade: f64| calories_walk2_minute(4.0, 70.0, grade);
        let row = |r: usize| {
            let c = WALK2_COEFFICIENTS[r];
            (c[0] * 64.0 + c[1] * 16.0 + c[2] * 4.0 + c[3]) * 70.0 / 60.0
        };
        assert!(close(at(-0.20), row(0)));
        assert!(close(at(-0.05), row(0)));
        assert!(close(at(0.03), row(8)));
        assert!(close(at(0.06), row(10)));

        let mpm = 4.0 * 1000.0 / 60.0;
        let linear = (0.1 * mpm + 1.8 * mpm * 0.1 + 3.5) * 70.0 * 5.0 / 1000.0;
        assert!(close(at(0.1), linear));
    }

    #[test]
    fn test_bmr_branches_on_sex() {
        assert!(close(calories_bmr(80.0, 1.8, 30.0, true), 1863.2));
        assert!(close(calories_bmr(80.0, 1.8, 30.0, false), 9.56 * 80.0 + 1.85 * 180.0 - 4.68 * 30.0 + 655.0));
        assert!(close(calories_rmrcb_minute(80.0, 1.8, 30.0, true), 1863.2 * 1.1 / 1440.0));
    }

    #[test]
    fn test_one_minute_at_five_kmh() {
        let mut record = TelemetryRecord::new(60, 100, 80, 50, 0.0);
        record.segment_time = Some(60);

        let profile = Profile::default();
        let cal = estimate(&record, &profile).unwrap();
        assert!(close(cal.gross, calories_walk2_minute(5.0, 80.0, 0.0)));
        assert!(cal.gross > 0.0);
        assert!(cal.net < cal.gross);

        for (age, weight, height, male) in [(20.0, 50.0, 1.5, false), (70.0, 120.0, 2.0, true)] {
            let profile = Profile {
                age,
                weight,
                height,
                male,
                ..Default::default()
            };
            let cal = estimate(&record, &profile).unwrap();
            assert!(cal.net < cal.gross);
        }
    }

    #[test]
    fn test_estimate_requires_segment_time() {
        let record = TelemetryRecord::new(60, 100, 80, 50, 0.0);
        assert!(estimate(&record, &Profile::default()).is_none());
    }

    #[test]
    fn test_rest_segment_burns_nothing_gross() {
        let cal = estimate_duration(120.0, 0.0, &Profile::default());
        let per_kg = WALK2_COEFFICIENTS[5][3];
        assert!(close(cal.gross, 2.0 * per_kg * 80.0 / 60.0));
        assert!(cal.net < cal.gross);
    }

    #[test]
    fn test_tracker_accumulates_on_speed_change() {
        let profile = Profile::default();
        let mut tracker = CalorieTracker::new(profile.clone());

        let first = tracker.update(&status(0, 0, 0, 30, 1000));
        assert_eq!(first, LiveCalories::default());

        let live = tracker.update(&status(60, 50, 90, 30, 1060));
        let expected = estimate_duration(60.0, 3.0, &profile);
        assert!(close(live.ccal.unwrap(), expected.gross));
        assert!(close(live.ccal_sum.unwrap(), expected.gross));

        // speed change closes the 3.0 km/h segment
        let live = tracker.update(&status(120, 100, 180, 50, 1120));
        let closed = estimate_duration(120.0, 3.0, &profile);
        assert!(close(live.ccal.unwrap(), closed.gross));

        let live = tracker.update(&status(180, 190, 280, 50, 1180));
        let open = estimate_duration(60.0, 5.0, &profile);
        assert!(close(live.ccal.unwrap(), open.gross));
        assert!(close(live.ccal_sum.unwrap(), closed.gross + open.gross));
        assert!(close(live.ccal_net_sum.unwrap(), closed.net + open.net));
        assert!(close(tracker.totals().gross, closed.gross + open.gross));
    }

    #[test]
    fn test_tracker_resets_on_counter_regression() {
        let mut tracker = CalorieTracker::new(Profile::default());
        tracker.update(&status(0, 0, 0, 30, 1000));
        tracker.update(&status(100, 80, 150, 30, 1100));
        assert!(tracker.totals().gross > 0.0);

        let live = tracker.update(&status(5, 2, 6, 30, 1200));
        assert_eq!(live, LiveCalories::default());
        assert_eq!(tracker.totals(), CalorieEstimate::default());
    }

    #[test]
    fn test_tracker_resumes_consistent_walk() {
        let profile = Profile::default();
        let anchor = TelemetryRecord::new(600, 500, 900, 40, 5000.0);
        let closed = CalorieEstimate { gross: 40.0, net: 25.0 };
        let mut tracker = CalorieTracker::new(profile.clone()).resuming(anchor, closed);

        let live = tracker.update(&status(660, 560, 1000, 40, 5060));
        let open = estimate_duration(60.0, 4.0, &profile);
        assert!(close(live.ccal.unwrap(), open.gross));
        assert!(close(live.ccal_sum.unwrap(), 40.0 + open.gross));
    }

    #[test]
    fn test_tracker_ignores_stale_walk() {
        let anchor = TelemetryRecord::new(600, 500, 900, 40, 5000.0);
        let closed = CalorieEstimate { gross: 40.0, net: 25.0 };
        let mut tracker = CalorieTracker::new(Profile::default()).resuming(anchor, closed);

        // device advanced 60s while the wall clock advanced an hour
        let live = tracker.update(&status(660, 560, 1000, 40, 8600));
        assert_eq!(live, LiveCalories::default());
        assert_eq!(tracker.totals(), CalorieEstimate::default());
    }
}
