use chrono::{
    DateTime,
    Duration,
    NaiveDate,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use tidemark_source_api::Record;

/// A half-open time slice `(start, end]` of a change-capture extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts > self.start && ts <= self.end
    }

    /// Calendar date the window's records are partitioned under
    ///
    /// Windows never cross midnight, so a window ending exactly at midnight
    /// belongs to the previous day.
    pub fn partition_date(&self) -> NaiveDate {
        (self.end - Duration::nanoseconds(1)).date_naive()
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Lazy, restartable sequence of fixed-width windows covering `(from, to]`
///
/// Boundaries are aligned to multiples of `width` since the Unix epoch (and
/// to midnight, which every width dividing a day hits), so the same delta
/// always splits into the same windows regardless of where a run starts.
#[derive(Debug, Clone)]
pub struct WindowPlan {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    width: Duration,
    cursor: DateTime<Utc>,
}

impl WindowPlan {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>, width: Duration) -> Self {
        let width = if width <= Duration::zero() {
            Duration::hours(1)
        } else {
            width
        };
        Self {
            from,
            to,
            width,
            cursor: from,
        }
    }

    pub fn from(&self) -> DateTime<Utc> {
        self.from
    }

    pub fn to(&self) -> DateTime<Utc> {
        self.to
    }

    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }

    /// Restarts the sequence at the window containing `ts`
    pub fn resume_from(&mut self, ts: DateTime<Utc>) {
        self.cursor = ts.clamp(self.from, self.to);
    }

    fn next_boundary(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let width_ms = self.width.num_milliseconds().max(1);
        let ms = after.timestamp_millis();
        let aligned = (ms.div_euclid(width_ms) + 1) * width_ms;
        let candidate = DateTime::<Utc>::from_timestamp_millis(aligned).unwrap_or(self.to);

        let next_midnight = after
            .date_naive()
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(self.to);

        candidate.min(next_midnight).min(self.to)
    }
}

impl Iterator for WindowPlan {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.to {
            return None;
        }
        let start = self.cursor;
        let end = self.next_boundary(start);
        self.cursor = end;
        Some(TimeWindow::new(start, end))
    }
}

/// One window's worth of extracted rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub source_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub rows: Vec<Record>,
    /// Logical extraction point: the window's upper bound
    pub extracted_at: DateTime<Utc>,
    /// Row count reported by the source's count query for the same bounds
    pub expected_count: u64,
}

impl Batch {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.window_start, self.window_end)
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn partition_date(&self) -> NaiveDate {
        self.window().partition_date()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_plan_aligns_to_hours() {
        let windows: Vec<_> =
            WindowPlan::new(ts(1, 10, 30), ts(1, 13, 15), Duration::hours(1)).collect();

        assert_eq!(
            windows,
            vec![
                TimeWindow::new(ts(1, 10, 30), ts(1, 11, 0)),
                TimeWindow::new(ts(1, 11, 0), ts(1, 12, 0)),
                TimeWindow::new(ts(1, 12, 0), ts(1, 13, 0)),
                TimeWindow::new(ts(1, 13, 0), ts(1, 13, 15)),
            ]
        );
    }

    #[test]
    fn test_plan_splits_at_midnight() {
        let windows: Vec<_> =
            WindowPlan::new(ts(1, 20, 0), ts(2, 4, 0), Duration::hours(5)).collect();

        assert!(windows.iter().any(|w| w.end == ts(2, 0, 0)));
        assert_eq!(windows.first().map(|w| w.start), Some(ts(1, 20, 0)));
        assert_eq!(windows.last().map(|w| w.end), Some(ts(2, 4, 0)));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_plan_resume() {
        let mut plan = WindowPlan::new(ts(1, 0, 0), ts(1, 4, 0), Duration::hours(1));
        plan.resume_from(ts(1, 2, 0));
        let windows: Vec<_> = plan.collect();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start, ts(1, 2, 0));
    }

    #[test]
    fn test_empty_plan() {
        let plan = WindowPlan::new(ts(1, 4, 0), ts(1, 4, 0), Duration::hours(1));
        assert!(plan.is_empty());
        assert_eq!(plan.count(), 0);
    }

    #[test]
    fn test_partition_date_for_midnight_end() {
        let window = TimeWindow::new(ts(1, 23, 0), ts(2, 0, 0));
        assert_eq!(window.partition_date(), ts(1, 0, 0).date_naive());
        assert!(window.contains(ts(2, 0, 0)));
        assert!(!window.contains(ts(1, 23, 0)));
    }
}
