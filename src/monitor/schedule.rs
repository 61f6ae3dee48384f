//! Due-time bookkeeping for the three probe cadences

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// The three broker measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Latency,
    Bandwidth,
    ConnectionCount,
}

impl ProbeKind {
    /// Run order within one tick
    pub const ALL: [ProbeKind; 3] = [
        ProbeKind::Latency,
        ProbeKind::Bandwidth,
        ProbeKind::ConnectionCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Latency => "latency",
            ProbeKind::Bandwidth => "bandwidth",
            ProbeKind::ConnectionCount => "connection_count",
        }
    }

    /// Whether a failure of this probe takes the broker out of rotation
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProbeKind::ConnectionCount)
    }

    fn slot(self) -> usize {
        match self {
            ProbeKind::Latency => 0,
            ProbeKind::Bandwidth => 1,
            ProbeKind::ConnectionCount => 2,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks when each probe kind last ran
///
/// All clocks start at construction, so nothing is due until its interval has
/// elapsed once.
#[derive(Debug, Clone)]
pub struct ProbeSchedule {
    intervals: [Duration; 3],
    last_run: [Instant; 3],
}

impl ProbeSchedule {
    pub fn new(
        latency: Duration,
        bandwidth: Duration,
        connection_count: Duration,
        started: Instant,
    ) -> Self {
        Self {
            intervals: [latency, bandwidth, connection_count],
            last_run: [started; 3],
        }
    }

    pub fn interval(&self, kind: ProbeKind) -> Duration {
        self.intervals[kind.slot()]
    }

    pub fn is_due(&self, kind: ProbeKind, now: Instant) -> bool {
        now.saturating_duration_since(self.last_run[kind.slot()]) >= self.interval(kind)
    }

    /// Probe kinds due at `now`, in run order
    pub fn due(&self, now: Instant) -> Vec<ProbeKind> {
        ProbeKind::ALL
            .into_iter()
            .filter(|kind| self.is_due(*kind, now))
            .collect()
    }

    pub fn mark_run(&mut self, kind: ProbeKind, at: Instant) {
        self.last_run[kind.slot()] = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(start: Instant) -> ProbeSchedule {
        ProbeSchedule::new(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(15),
            start,
        )
    }

    #[test]
    fn test_nothing_due_at_start() {
        let start = Instant::now();
        assert!(schedule(start).due(start).is_empty());
    }

    #[test]
    fn test_cadences_at_coarse_ticks() {
        let start = Instant::now();
        let mut schedule = schedule(start);

        // First 20 s tick: every cadence has elapsed
        let tick1 = start + Duration::from_secs(20);
        assert_eq!(schedule.due(tick1), ProbeKind::ALL.to_vec());
        for kind in schedule.due(tick1) {
            schedule.mark_run(kind, tick1);
        }

        // Second tick: still all due since every interval is shorter than the tick
        let tick2 = tick1 + Duration::from_secs(20);
        assert_eq!(schedule.due(tick2).len(), 3);
    }

    #[test]
    fn test_finer_tick_runs_each_cadence_independently() {
        let start = Instant::now();
        let mut schedule = schedule(start);

        let at = start + Duration::from_secs(5);
        assert_eq!(schedule.due(at), vec![ProbeKind::Latency]);
        schedule.mark_run(ProbeKind::Latency, at);

        let at = start + Duration::from_secs(10);
        assert_eq!(
            schedule.due(at),
            vec![ProbeKind::Latency, ProbeKind::Bandwidth]
        );
    }

    #[test]
    fn test_zero_interval_always_due() {
        let start = Instant::now();
        let schedule = ProbeSchedule::new(Duration::ZERO, Duration::ZERO, Duration::ZERO, start);
        assert_eq!(schedule.due(start).len(), 3);
    }

    #[test]
    fn test_probe_kind_properties() {
        assert!(ProbeKind::Latency.is_fatal());
        assert!(ProbeKind::Bandwidth.is_fatal());
        assert!(!ProbeKind::ConnectionCount.is_fatal());
        assert_eq!(ProbeKind::ConnectionCount.to_string(), "connection_count");
    }
}
