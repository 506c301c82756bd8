//! Sequential dispatch loop draining a [`ReadAheadBuffer`].
//!
//! Each step pulls one item, hands it to an [`ItemHandler`] and turns the handler's
//! [`ItemOutcome`] into [`Feedback`] for whoever drives the loop.

mod periodic;
mod timing;

pub use periodic::*;
pub use timing::*;

use std::fmt::Display;
use std::marker::PhantomData;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::ReadAheadBuffer;

/// Result of processing a single item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum ItemOutcome {
    Continue,
    /// The item is dropped, the loop goes on.
    SkipItem(String),
    /// Stop the loop, it can be resumed later.
    Pause(String),
    Abort(String),
}

/// Result of one dispatch step.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Feedback {
    Continue,
    Pause,
    Abort,
    /// The buffer is exhausted.
    Finish,
}

/// Answer of the interrupt probe checked before every item.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum InterruptSignal {
    #[default]
    Proceed,
    Pause,
    Abort,
}

pub trait ItemHandler<T> {
    fn handle(&mut self, item: T, summary: &mut dyn TimeSummary) -> ItemOutcome;
}

pub struct FnHandler<F, T> {
    func: F,
    _phantom: PhantomData<fn(T)>,
}

/// Adapts a closure into an [`ItemHandler`].
pub fn handler_fn<T, F>(func: F) -> FnHandler<F, T>
where
    F: FnMut(T, &mut dyn TimeSummary) -> ItemOutcome,
{
    FnHandler {
        func,
        _phantom: PhantomData,
    }
}

impl<T, F> ItemHandler<T> for FnHandler<F, T>
where
    F: FnMut(T, &mut dyn TimeSummary) -> ItemOutcome,
{
    fn handle(&mut self, item: T, summary: &mut dyn TimeSummary) -> ItemOutcome {
        (self.func)(item, summary)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct DispatchCounts {
    pub processed: u64,
    pub skipped: u64,
    pub fetch_errors: u64,
}

pub struct Dispatcher<T, E, H, S = TimeTotals> {
    buffer: ReadAheadBuffer<T, E>,
    handler: H,
    summary: S,
    interrupt: Option<Box<dyn FnMut() -> InterruptSignal + Send>>,
    periodic: Option<Periodic>,
    counts: DispatchCounts,
}

impl<T, E, H> Dispatcher<T, E, H>
where
    T: Send + 'static,
    E: Display + Send + 'static,
    H: ItemHandler<T>,
{
    pub fn new(buffer: ReadAheadBuffer<T, E>, handler: H) -> Self {
        Self::with_summary(buffer, handler, TimeTotals::new())
    }
}

impl<T, E, H, S> Dispatcher<T, E, H, S>
where
    T: Send + 'static,
    E: Display + Send + 'static,
    H: ItemHandler<T>,
    S: TimeSummary,
{
    pub fn with_summary(buffer: ReadAheadBuffer<T, E>, handler: H, summary: S) -> Self {
        Self {
            buffer,
            handler,
            summary,
            interrupt: None,
            periodic: None,
            counts: DispatchCounts::default(),
        }
    }

    pub fn with_interrupt(mut self, probe: impl FnMut() -> InterruptSignal + Send + 'static) -> Self {
        self.interrupt = Some(Box::new(probe));
        self
    }

    /// Runs `action` after the first processed item and then after every `interval` processed
    /// items.
    pub fn with_periodic(mut self, interval: usize, action: impl FnMut() + Send + 'static) -> Self {
        self.periodic = Some(Periodic::new(interval, action));
        self
    }

    pub fn counts(&self) -> DispatchCounts {
        self.counts
    }

    pub fn summary(&self) -> &S {
        &self.summary
    }

    pub fn into_summary(self) -> S {
        self.summary
    }

    pub fn buffer(&self) -> &ReadAheadBuffer<T, E> {
        &self.buffer
    }

    /// Processes at most one item.
    pub fn step(&mut self) -> Feedback {
        if let Some(probe) = self.interrupt.as_mut() {
            match probe() {
                InterruptSignal::Proceed => {}
                InterruptSignal::Pause => return Feedback::Pause,
                InterruptSignal::Abort => return Feedback::Abort,
            }
        }

        let step_start = Instant::now();
        let item = match self.buffer.next() {
            None => return Feedback::Finish,
            Some(Err(err)) => {
                self.counts.fetch_errors += 1;
                error!(error = %err, "failed to fetch the next item");
                return Feedback::Pause;
            }
            Some(Ok(item)) => item,
        };
        self.report(TimeFlag::AutomationStateFetch, step_start);

        //process covers the whole step, fetch included
        let outcome = self.handler.handle(item, &mut self.summary);
        self.report(TimeFlag::Process, step_start);

        match outcome {
            ItemOutcome::Continue => {
                self.counts.processed += 1;
                if let Some(periodic) = self.periodic.as_mut() {
                    periodic.tick();
                }
                Feedback::Continue
            }
            ItemOutcome::SkipItem(reason) => {
                self.counts.skipped += 1;
                warn!(%reason, "item skipped");
                Feedback::Continue
            }
            ItemOutcome::Pause(reason) => {
                info!(%reason, "dispatch paused");
                Feedback::Pause
            }
            ItemOutcome::Abort(reason) => {
                warn!(%reason, "dispatch aborted");
                Feedback::Abort
            }
        }
    }

    /// Steps until the loop pauses, aborts or runs out of items.
    pub fn run(&mut self) -> Feedback {
        loop {
            let feedback = self.step();
            if feedback != Feedback::Continue {
                debug!(?feedback, counts = ?self.counts, "dispatch loop stopped");
                return feedback;
            }
        }
    }

    fn report(&mut self, flag: TimeFlag, start: Instant) {
        if self.summary.supports_custom_timing_categories() {
            self.summary.add_time_span(flag, start, Instant::now());
        }
    }
}
