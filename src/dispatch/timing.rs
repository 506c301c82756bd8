use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

/// Phases a dispatch step can report time for.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Ord, PartialOrd)]
pub enum TimeFlag {
    AutomationStateWait,
    AutomationStateFetch,
    TaskWorkerWait,
    LoadUser,
    WorkerThreadWait,
    Generate,
    CollectFiles,
    GenerateMime,
    InsertFiles,
    ReplaceTokens,
    GetPage,
    SendMailWait,
    Send,
    Process,
}

impl TimeFlag {
    pub const ALL: [TimeFlag; 14] = [
        Self::AutomationStateWait,
        Self::AutomationStateFetch,
        Self::TaskWorkerWait,
        Self::LoadUser,
        Self::WorkerThreadWait,
        Self::Generate,
        Self::CollectFiles,
        Self::GenerateMime,
        Self::InsertFiles,
        Self::ReplaceTokens,
        Self::GetPage,
        Self::SendMailWait,
        Self::Send,
        Self::Process,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

impl Display for TimeFlag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Accumulator for per-phase timings.
pub trait TimeSummary {
    fn add_time_duration(&mut self, flag: TimeFlag, duration: Duration);

    fn add_time_span(&mut self, flag: TimeFlag, start: Instant, end: Instant) {
        self.add_time_duration(flag, end.saturating_duration_since(start));
    }

    /// Whether this summary accepts the categories of [`TimeFlag`]. Reporters skip summaries
    /// that decline.
    fn supports_custom_timing_categories(&self) -> bool {
        true
    }
}

/// Summary that drops everything.
impl TimeSummary for () {
    fn add_time_duration(&mut self, _flag: TimeFlag, _duration: Duration) {}

    fn supports_custom_timing_categories(&self) -> bool {
        false
    }
}

impl<S: TimeSummary + ?Sized> TimeSummary for &mut S {
    fn add_time_duration(&mut self, flag: TimeFlag, duration: Duration) {
        (**self).add_time_duration(flag, duration)
    }

    fn supports_custom_timing_categories(&self) -> bool {
        (**self).supports_custom_timing_categories()
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct PhaseTotal {
    pub total: Duration,
    pub samples: u64,
}

impl PhaseTotal {
    pub fn average(&self) -> Duration {
        match u32::try_from(self.samples) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.samples as f64),
        }
    }
}

/// Total time and sample count per [`TimeFlag`].
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct TimeTotals {
    phases: [PhaseTotal; TimeFlag::ALL.len()],
}

impl TimeTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, flag: TimeFlag) -> PhaseTotal {
        self.phases[flag.index()]
    }

    pub fn merge(&mut self, other: &TimeTotals) {
        for (a, b) in self.phases.iter_mut().zip(other.phases.iter()) {
            a.total += b.total;
            a.samples += b.samples;
        }
    }

    /// Phases with at least one sample.
    pub fn iter(&self) -> impl Iterator<Item = (TimeFlag, PhaseTotal)> + '_ {
        TimeFlag::ALL.into_iter().map(|f| (f, self.get(f))).filter(|(_, p)| p.samples > 0)
    }
}

impl TimeSummary for TimeTotals {
    fn add_time_duration(&mut self, flag: TimeFlag, duration: Duration) {
        let phase = &mut self.phases[flag.index()];
        phase.total += duration;
        phase.samples += 1;
    }
}
