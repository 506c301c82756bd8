use std::any::Any;
use std::io;
use std::sync::Arc;
use std::thread;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::error;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Launches producer invocations for a buffer.
///
/// `spawn` is called while the buffer state is locked, so it must hand the task off and return
/// without waiting for it.
pub trait Spawn: Send + Sync {
    fn spawn(&self, task: Task) -> io::Result<()>;
}

impl<S: Spawn + ?Sized> Spawn for Arc<S> {
    fn spawn(&self, task: Task) -> io::Result<()> {
        (**self).spawn(task)
    }
}

/// One dedicated OS thread per producer invocation.
#[derive(Clone, Debug)]
pub struct ThreadSpawner {
    name: String,
}

impl Default for ThreadSpawner {
    fn default() -> Self {
        Self::named("readahead-producer")
    }
}

impl ThreadSpawner {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Spawn for ThreadSpawner {
    fn spawn(&self, task: Task) -> io::Result<()> {
        thread::Builder::new().name(self.name.clone()).spawn(task).map(drop)
    }
}

/// Runs producer invocations on a caller-owned rayon pool.
#[derive(Clone)]
pub struct RayonSpawner {
    pool: Arc<ThreadPool>,
}

impl RayonSpawner {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self { pool }
    }

    /// Builds a dedicated pool. Producers usually block on I/O, so size it by the expected
    /// in-flight depth rather than by core count.
    pub fn with_threads(threads: usize) -> crate::Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("readahead-pool-{i}"))
            .panic_handler(pool_panic_handler)
            .build()?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Spawn for RayonSpawner {
    fn spawn(&self, task: Task) -> io::Result<()> {
        self.pool.spawn(task);
        Ok(())
    }
}

fn pool_panic_handler(payload: Box<dyn Any + Send>) {
    error!(panic = panic_message(&*payload), "producer pool thread panicked");
}

/// Text of a `panic!` payload, or a placeholder for payloads that are not strings.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}
