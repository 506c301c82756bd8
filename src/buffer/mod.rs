mod config;
mod spawn;

pub use config::*;
pub use spawn::*;

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::iter::FusedIterator;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::{Error, Result};

type Producer<T, E> = dyn Fn() -> std::result::Result<Option<T>, E> + Send + Sync;
type Produced<T, E> = thread::Result<std::result::Result<Option<T>, E>>;

/// Adaptive read-ahead over a blocking, sequential data source.
///
/// The producer closure returns `Ok(Some(value))` for a value, `Ok(None)` once the source has no
/// more data and `Err(e)` for a failed fetch. Consumers call [`next`](Self::next) from any number
/// of threads; the buffer keeps `peak + padding` producer invocations either in flight or
/// completed and waiting, where `peak` tracks how many consumers were blocked at once and decays
/// by one every `decay_interval` satisfied requests.
///
/// Results come out in completion order. The producer may be invoked concurrently whenever
/// `padding > 0` or several consumers are waiting; it has to tolerate that.
pub struct ReadAheadBuffer<T, E> {
    inner: Arc<Inner<T, E>>,
}

/// Where a buffer is in its lifetime.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Phase {
    /// The source may still produce values.
    Active,
    /// The source signaled completion, but results are queued or producers are still running.
    Draining,
    /// Nothing left, every further `next` returns `None`.
    Exhausted,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct BufferStats {
    pub pending: usize,
    pub active_producers: usize,
    pub waiting_consumers: usize,
    pub peak_waiting_consumers: usize,
    pub requests_since_decline: usize,
    pub production_complete: bool,
}

impl BufferStats {
    pub fn phase(&self) -> Phase {
        match (self.production_complete, self.pending + self.active_producers) {
            (false, _) => Phase::Active,
            (true, 0) => Phase::Exhausted,
            (true, _) => Phase::Draining,
        }
    }
}

struct Inner<T, E> {
    state: Mutex<State<T, E>>,
    cond: Condvar,
    producer: Box<Producer<T, E>>,
    spawner: Box<dyn Spawn>,
    sizing: Sizing,
}

struct State<T, E> {
    pending: VecDeque<std::result::Result<T, E>>,
    production_complete: bool,
    active_producers: usize,
    waiting_consumers: usize,
    peak_waiting_consumers: usize,
    requests_since_decline: usize,
}

impl<T, E> State<T, E> {
    const fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            production_complete: false,
            active_producers: 0,
            waiting_consumers: 0,
            peak_waiting_consumers: 0,
            requests_since_decline: 0,
        }
    }

    /// Reserves producer slots up to `peak + padding` and returns how many were reserved.
    fn reserve(&mut self, padding: usize) -> usize {
        if self.production_complete {
            return 0;
        }
        let target = self.peak_waiting_consumers + padding;
        let deficit = target.saturating_sub(self.pending.len() + self.active_producers);
        self.active_producers += deficit;
        deficit
    }

    fn enter_wait(&mut self) {
        self.waiting_consumers += 1;
        if self.waiting_consumers > self.peak_waiting_consumers {
            self.peak_waiting_consumers = self.waiting_consumers;
            //fresh spike cancels the decay in progress
            self.requests_since_decline = 0;
            debug!(peak = self.peak_waiting_consumers, "consumer peak raised");
        }
    }

    fn leave_wait(&mut self) {
        self.waiting_consumers -= 1;
    }

    fn record_request(&mut self, decay_interval: usize) {
        self.requests_since_decline += 1;
        if self.requests_since_decline >= decay_interval {
            self.peak_waiting_consumers = self.peak_waiting_consumers.saturating_sub(1);
            self.requests_since_decline = 0;
            trace!(peak = self.peak_waiting_consumers, "consumer peak decayed");
        }
    }

    fn is_exhausted(&self) -> bool {
        self.production_complete && self.pending.is_empty() && self.active_producers == 0
    }

    fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.pending.len(),
            active_producers: self.active_producers,
            waiting_consumers: self.waiting_consumers,
            peak_waiting_consumers: self.peak_waiting_consumers,
            requests_since_decline: self.requests_since_decline,
            production_complete: self.production_complete,
        }
    }
}

impl<T, E> Inner<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Tops up the producers in flight. Spawning happens with the lock held, a producer can only
    /// report back once the caller waits on `cond` or returns.
    fn ensure_production(self: &Arc<Self>, state: &mut State<T, E>) {
        let deficit = state.reserve(self.sizing.padding);
        if deficit == 0 {
            return;
        }
        trace!(
            deficit,
            active = state.active_producers,
            pending = state.pending.len(),
            "spawning producers"
        );
        for _ in 0..deficit {
            let inner = self.clone();
            if let Err(err) = self.spawner.spawn(Box::new(move || inner.produce())) {
                state.active_producers -= 1;
                error!(error = %err, "cannot spawn producer");
            }
        }
    }

    fn produce(&self) {
        let produced = self.invoke();
        let mut state = self.state.lock();
        self.record(&mut state, produced);
    }

    fn invoke(&self) -> Produced<T, E> {
        catch_unwind(AssertUnwindSafe(|| (self.producer)()))
    }

    fn record(&self, state: &mut State<T, E>, produced: Produced<T, E>) {
        state.active_producers -= 1;
        match produced {
            Ok(Ok(Some(value))) => state.pending.push_back(Ok(value)),
            Ok(Ok(None)) => {
                if !state.production_complete {
                    debug!(pending = state.pending.len(), active = state.active_producers, "production complete");
                }
                state.production_complete = true;
            }
            Ok(Err(err)) => {
                warn!(pending = state.pending.len(), "producer failed");
                state.pending.push_back(Err(err));
            }
            Err(payload) => {
                error!(panic = panic_message(&*payload), "producer panicked");
            }
        }
        self.cond.notify_one();
    }

    fn next(self: &Arc<Self>) -> Option<std::result::Result<T, E>> {
        let mut state = self.state.lock();
        let result = loop {
            if let Some(result) = state.pending.pop_front() {
                break Some(result);
            }
            if state.is_exhausted() {
                break None;
            }
            state.enter_wait();
            self.ensure_production(&mut state);
            if state.active_producers == 0 && !state.production_complete {
                //nothing in flight could wake us, produce on this thread
                state.active_producers += 1;
                let produced = MutexGuard::unlocked(&mut state, || self.invoke());
                self.record(&mut state, produced);
            } else {
                self.cond.wait(&mut state);
            }
            state.leave_wait();
        };

        match result {
            Some(result) => {
                self.ensure_production(&mut state);
                state.record_request(self.sizing.decay_interval);
                Some(result)
            }
            None => {
                //let the other waiters observe exhaustion too
                self.cond.notify_all();
                None
            }
        }
    }
}

impl<T, E> ReadAheadBuffer<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Buffer with default sizing, producing on dedicated threads.
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn() -> std::result::Result<Option<T>, E> + Send + Sync + 'static,
    {
        let sizing = Sizing {
            padding: DEFAULT_PADDING as usize,
            decay_interval: DEFAULT_DECAY_INTERVAL as usize,
        };
        Self::from_parts(Box::new(producer), Box::new(ThreadSpawner::default()), sizing)
    }

    pub fn builder() -> Builder<T, E> {
        Builder {
            producer: None,
            config: BufferConfig::default(),
            spawner: None,
        }
    }

    fn from_parts(producer: Box<Producer<T, E>>, spawner: Box<dyn Spawn>, sizing: Sizing) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new()),
                cond: Condvar::new(),
                producer,
                spawner,
                sizing,
            }),
        }
    }

    /// Blocks until a result is available or the source is exhausted.
    ///
    /// `Some(Err(_))` carries the error of a single failed producer invocation; the stream goes
    /// on after it. `None` is terminal: once returned, every later call returns `None` as well.
    pub fn next(&self) -> Option<std::result::Result<T, E>> {
        self.inner.next()
    }

    pub fn iter(&self) -> Iter<'_, T, E> {
        Iter { buffer: self }
    }
}

impl<T, E> ReadAheadBuffer<T, E> {
    pub fn padding(&self) -> usize {
        self.inner.sizing.padding
    }

    pub fn decay_interval(&self) -> usize {
        self.inner.sizing.decay_interval
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.state.lock().stats()
    }

    pub fn phase(&self) -> Phase {
        self.stats().phase()
    }
}

impl<T, E> Clone for ReadAheadBuffer<T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> Debug for ReadAheadBuffer<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadAheadBuffer")
            .field("padding", &self.inner.sizing.padding)
            .field("decay_interval", &self.inner.sizing.decay_interval)
            .field("stats", &self.stats())
            .finish()
    }
}

pub struct Builder<T, E> {
    producer: Option<Box<Producer<T, E>>>,
    config: BufferConfig,
    spawner: Option<Box<dyn Spawn>>,
}

impl<T, E> Builder<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn producer<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> std::result::Result<Option<T>, E> + Send + Sync + 'static,
    {
        self.producer = Some(Box::new(producer));
        self
    }

    pub fn padding(mut self, padding: i64) -> Self {
        self.config.padding = padding;
        self
    }

    pub fn decay_interval(mut self, decay_interval: i64) -> Self {
        self.config.decay_interval = decay_interval;
        self
    }

    pub fn config(mut self, config: BufferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn spawner(mut self, spawner: impl Spawn + 'static) -> Self {
        self.spawner = Some(Box::new(spawner));
        self
    }

    pub fn build(self) -> Result<ReadAheadBuffer<T, E>> {
        let producer = self.producer.ok_or(Error::invalid("producer", "a producer is required"))?;
        let sizing = self.config.sizing()?;
        let spawner = self.spawner.unwrap_or_else(|| Box::new(ThreadSpawner::default()));
        Ok(ReadAheadBuffer::from_parts(producer, spawner, sizing))
    }
}

pub struct Iter<'a, T, E> {
    buffer: &'a ReadAheadBuffer<T, E>,
}

impl<T, E> Iterator for Iter<'_, T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Item = std::result::Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.next()
    }
}

impl<T, E> FusedIterator for Iter<'_, T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
}

impl<'a, T, E> IntoIterator for &'a ReadAheadBuffer<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Item = std::result::Result<T, E>;
    type IntoIter = Iter<'a, T, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{bounded, unbounded};
    use rand::Rng;
    use std::collections::HashSet;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::{scope, sleep};
    use std::time::{Duration, Instant};

    /// Producer yielding `0..count` and then the completion signal.
    fn counting(count: usize, calls: Arc<AtomicUsize>) -> impl Fn() -> std::result::Result<Option<usize>, String> + Send + Sync {
        move || {
            let i = calls.fetch_add(1, Ordering::SeqCst);
            Ok((i < count).then_some(i))
        }
    }

    fn jitter() {
        let micros = rand::thread_rng().gen_range(0..300);
        sleep(Duration::from_micros(micros));
    }

    #[test]
    fn test_sequence_then_exhaustion() {
        let source = Mutex::new(VecDeque::from([1, 2, 3, 4, 5]));
        let buffer: ReadAheadBuffer<i32, String> = ReadAheadBuffer::builder()
            .producer(move || Ok(source.lock().pop_front()))
            .padding(0)
            .decay_interval(1)
            .build()
            .unwrap();

        for expected in 1..=5 {
            assert_eq!(buffer.next(), Some(Ok(expected)));
        }
        assert_eq!(buffer.next(), None);
        assert_eq!(buffer.next(), None);
        assert_eq!(buffer.phase(), Phase::Exhausted);
    }

    #[test]
    fn test_invalid_construction() {
        let err = ReadAheadBuffer::<u8, ()>::builder().producer(|| Ok(None)).padding(-1).build().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "padding", .. }), "{err}");

        let err = ReadAheadBuffer::<u8, ()>::builder()
            .producer(|| Ok(None))
            .decay_interval(-1)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "decay_interval", .. }), "{err}");

        let err = ReadAheadBuffer::<u8, ()>::builder().build().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "producer", .. }), "{err}");

        let buffer = ReadAheadBuffer::<u8, ()>::builder().producer(|| Ok(None)).padding(0).decay_interval(0).build().unwrap();
        assert_eq!((buffer.padding(), buffer.decay_interval()), (0, 0));
        assert_eq!(buffer.next(), None);
    }

    #[test]
    fn test_defaults() {
        let buffer = ReadAheadBuffer::new(|| Ok::<_, ()>(None::<u8>));
        assert_eq!(buffer.padding(), 2);
        assert_eq!(buffer.decay_interval(), 5);
        assert_eq!(buffer.phase(), Phase::Active);
        assert_eq!(buffer.next(), None);
        assert_eq!(buffer.phase(), Phase::Exhausted);
    }

    #[test]
    fn test_single_consumer_without_padding_keeps_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let count = counting(200, calls.clone());
        let buffer = ReadAheadBuffer::builder()
            .producer(move || {
                jitter();
                count()
            })
            .padding(0)
            .build()
            .unwrap();

        let values = buffer.iter().collect::<std::result::Result<Vec<_>, _>>().unwrap();
        assert_eq!(values, (0..200).collect::<Vec<_>>());
        assert_eq!(calls.load(Ordering::SeqCst), 201);
    }

    #[test]
    fn test_error_is_delivered_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let buffer = ReadAheadBuffer::builder()
            .producer(move || {
                let i = c.fetch_add(1, Ordering::SeqCst);
                match i {
                    3 => Err(format!("fetch {i} failed")),
                    i if i <= 10 => Ok(Some(i)),
                    _ => Ok(None),
                }
            })
            .padding(2)
            .build()
            .unwrap();

        let mut values = Vec::new();
        let mut errors = Vec::new();
        for result in &buffer {
            match result {
                Ok(v) => values.push(v),
                Err(e) => errors.push(e),
            }
        }
        values.sort_unstable();
        assert_eq!(errors, vec!["fetch 3 failed".to_string()]);
        assert_eq!(values, vec![0, 1, 2, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(buffer.next(), None);
    }

    #[test]
    fn test_concurrent_consumers_get_every_value_once() {
        const VALUES: usize = 500;
        const CONSUMERS: usize = 8;
        const PADDING: usize = 2;

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let count = counting(VALUES, calls);
        let (flight, max) = (in_flight.clone(), max_in_flight.clone());
        let buffer = ReadAheadBuffer::builder()
            .producer(move || {
                let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                jitter();
                let result = count();
                flight.fetch_sub(1, Ordering::SeqCst);
                result
            })
            .padding(PADDING as i64)
            .decay_interval(3)
            .build()
            .unwrap();

        let (tx, rx) = unbounded();
        scope(|s| {
            for _ in 0..CONSUMERS {
                let (buffer, tx) = (buffer.clone(), tx.clone());
                s.spawn(move || {
                    while let Some(result) = buffer.next() {
                        tx.send(result.unwrap()).unwrap();
                        jitter();
                    }
                    //exhaustion must stick for every consumer
                    assert_eq!(buffer.next(), None);
                });
            }
        });
        drop(tx);

        let received = rx.iter().collect::<Vec<_>>();
        let unique = received.iter().copied().collect::<HashSet<_>>();
        assert_eq!(received.len(), VALUES);
        assert_eq!(unique, (0..VALUES).collect::<HashSet<_>>());
        assert!(max_in_flight.load(Ordering::SeqCst) <= CONSUMERS + PADDING);
        assert_eq!(buffer.phase(), Phase::Exhausted);
    }

    #[test]
    fn test_target_depth_is_never_exceeded() {
        const CONSUMERS: usize = 4;
        const PADDING: usize = 3;

        let calls = Arc::new(AtomicUsize::new(0));
        let count = counting(300, calls);
        let buffer = ReadAheadBuffer::builder()
            .producer(move || {
                sleep(Duration::from_micros(200));
                count()
            })
            .padding(PADDING as i64)
            .decay_interval(i64::MAX)
            .build()
            .unwrap();

        scope(|s| {
            for _ in 0..CONSUMERS {
                let buffer = buffer.clone();
                s.spawn(move || buffer.iter().for_each(drop));
            }
            let watcher = buffer.clone();
            s.spawn(move || loop {
                let stats = watcher.stats();
                assert!(stats.active_producers + stats.pending <= stats.peak_waiting_consumers + PADDING, "{stats:?}");
                assert!(stats.peak_waiting_consumers <= CONSUMERS, "{stats:?}");
                if stats.phase() == Phase::Exhausted {
                    break;
                }
                thread::yield_now();
            });
        });
    }

    #[test]
    fn test_peak_decay() {
        let mut state = State::<(), ()>::new();
        for _ in 0..3 {
            state.enter_wait();
        }
        for _ in 0..3 {
            state.leave_wait();
        }
        assert_eq!(state.peak_waiting_consumers, 3);
        assert_eq!(state.reserve(2), 5);
        state.active_producers = 0;

        for _ in 0..4 {
            state.record_request(5);
        }
        assert_eq!(state.peak_waiting_consumers, 3);
        state.record_request(5);
        assert_eq!(state.peak_waiting_consumers, 2);
        assert_eq!(state.requests_since_decline, 0);
        assert_eq!(state.reserve(2), 4);
    }

    #[test]
    fn test_new_peak_resets_decay() {
        let mut state = State::<(), ()>::new();
        state.enter_wait();
        state.leave_wait();
        state.record_request(3);
        state.record_request(3);
        assert_eq!(state.requests_since_decline, 2);

        state.enter_wait();
        state.enter_wait();
        assert_eq!(state.peak_waiting_consumers, 2);
        assert_eq!(state.requests_since_decline, 0);
        state.leave_wait();
        state.leave_wait();

        //zero interval declines on every request, never below zero
        for _ in 0..5 {
            state.record_request(0);
        }
        assert_eq!(state.peak_waiting_consumers, 0);
    }

    #[test]
    fn test_reserve_stops_after_completion() {
        let mut state = State::<(), ()>::new();
        state.peak_waiting_consumers = 2;
        state.pending.push_back(Ok(()));
        assert_eq!(state.reserve(1), 2);
        assert_eq!(state.reserve(1), 0);
        state.active_producers = 0;
        state.production_complete = true;
        assert_eq!(state.reserve(10), 0);
    }

    #[test]
    fn test_draining_phase() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = bounded::<()>(1);
        let c = calls.clone();
        let buffer: ReadAheadBuffer<u32, ()> = ReadAheadBuffer::builder()
            .producer(move || match c.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(None),
                _ => {
                    gate_rx.recv().unwrap();
                    Ok(Some(7))
                }
            })
            .padding(1)
            .build()
            .unwrap();

        scope(|s| {
            let consumer = s.spawn(|| buffer.next());
            let start = Instant::now();
            while buffer.phase() != Phase::Draining {
                assert!(start.elapsed() < Duration::from_secs(10), "never started draining: {:?}", buffer.stats());
                thread::yield_now();
            }
            gate_tx.send(()).unwrap();
            assert_eq!(consumer.join().unwrap(), Some(Ok(7)));
        });
        assert_eq!(buffer.next(), None);
        assert_eq!(buffer.phase(), Phase::Exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_producer_is_replaced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let buffer: ReadAheadBuffer<usize, ()> = ReadAheadBuffer::builder()
            .producer(move || {
                let i = c.fetch_add(1, Ordering::SeqCst);
                if i == 2 {
                    panic!("producer {i} blew up");
                }
                Ok((i < 6).then_some(i))
            })
            .padding(0)
            .build()
            .unwrap();

        let values = buffer.iter().map(Result::unwrap).collect::<Vec<_>>();
        assert_eq!(values, vec![0, 1, 3, 4, 5]);
    }

    struct RefusingSpawner;

    impl Spawn for RefusingSpawner {
        fn spawn(&self, _task: Task) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "no threads left"))
        }
    }

    #[test]
    fn test_spawn_failure_falls_back_to_consumer_thread() {
        let calls = Arc::new(AtomicUsize::new(0));
        let buffer = ReadAheadBuffer::builder()
            .producer(counting(4, calls.clone()))
            .spawner(RefusingSpawner)
            .build()
            .unwrap();

        let values = buffer.iter().map(Result::unwrap).collect::<Vec<_>>();
        assert_eq!(values, vec![0, 1, 2, 3]);
        assert_eq!(buffer.stats().active_producers, 0);
    }

    #[test]
    fn test_rayon_spawner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let buffer = ReadAheadBuffer::builder()
            .producer(counting(100, calls))
            .spawner(RayonSpawner::with_threads(3).unwrap())
            .padding(4)
            .build()
            .unwrap();

        let mut values = buffer.iter().map(Result::unwrap).collect::<Vec<_>>();
        values.sort_unstable();
        assert_eq!(values, (0..100).collect::<Vec<_>>());
    }
}
