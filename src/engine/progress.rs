use crate::model::ProgressSample;
use regex::Regex;
use std::sync::OnceLock;

/// Recognise a `Year <n>` progress marker and return the year.
pub(crate) fn parse_year_marker(line: &str) -> Option<i32> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    let re = MARKER
        .get_or_init(|| Regex::new(r"\bYear\s+(-?\d{1,6})\b").ok())
        .as_ref()?;
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Simulation horizon used to turn a year into a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressWindow {
    pub base_year: i32,
    pub end_year: i32,
}

impl ProgressWindow {
    /// `clamp(0, 100, (year - base) / (end - base) * 100)`; a zero-length
    /// window reads 0 until the end year is reached, then 100.
    pub fn percent(&self, year: i32) -> f64 {
        let span = self.end_year - self.base_year;
        if span <= 0 {
            return if year >= self.end_year { 100.0 } else { 0.0 };
        }
        let pct = f64::from(year - self.base_year) / f64::from(span) * 100.0;
        pct.clamp(0.0, 100.0)
    }
}

/// De-duplicates progress and keeps the percentage non-decreasing for the
/// lifetime of one invocation.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    window: Option<ProgressWindow>,
    last: Option<ProgressSample>,
}

impl ProgressTracker {
    pub fn new(window: Option<ProgressWindow>) -> Self {
        Self { window, last: None }
    }

    /// Returns the sample to report, or `None` when nothing changed.
    pub fn observe(&mut self, year: i32) -> Option<ProgressSample> {
        let computed = self.window.map(|w| w.percent(year));
        let percent = match (computed, self.last.and_then(|l| l.percent)) {
            (Some(now), Some(prev)) => Some(now.max(prev)),
            (now, _) => now,
        };
        let sample = ProgressSample { year, percent };
        if self.last == Some(sample) {
            return None;
        }
        self.last = Some(sample);
        Some(sample)
    }
}
