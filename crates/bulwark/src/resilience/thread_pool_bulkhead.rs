//! Worker-pool bulkhead
//!
//! Submitted work runs on a bounded set of tokio worker tasks instead of the
//! caller's task. Admission follows executor rules:
//!
//! 1. fewer than `core_thread_pool_size` workers: start a worker for the job
//! 2. otherwise queue the job while the queue has room
//! 3. otherwise start a non-core worker up to `max_thread_pool_size`
//! 4. otherwise reject
//!
//! Workers beyond the core size retire after `keep_alive_duration` idle.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, warn};

use super::bulkhead::{publish, BulkheadEvent, BulkheadEventKind};
use super::clock::{Clock, SystemClock};
use super::error::{ConfigError, ConfigResult, Rejection, ResilienceError, ResilienceResult};
use super::event::EventPublisher;

/// Configuration for a thread-pool bulkhead
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolBulkheadConfig {
    pub core_thread_pool_size: u32,
    pub max_thread_pool_size: u32,
    /// Jobs that may wait for a worker; zero disables queueing
    pub queue_capacity: u32,
    /// Idle time after which a non-core worker exits
    pub keep_alive_duration: Duration,
}

impl Default for ThreadPoolBulkheadConfig {
    fn default() -> Self {
        Self {
            core_thread_pool_size: 10,
            max_thread_pool_size: 20,
            queue_capacity: 100,
            keep_alive_duration: Duration::from_millis(20),
        }
    }
}

impl ThreadPoolBulkheadConfig {
    pub fn builder() -> ThreadPoolBulkheadConfigBuilder {
        ThreadPoolBulkheadConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.core_thread_pool_size == 0 {
            return Err(ConfigError::invalid("core_thread_pool_size must be greater than 0"));
        }
        if self.max_thread_pool_size < self.core_thread_pool_size {
            return Err(ConfigError::invalid(format!(
                "max_thread_pool_size ({}) must be at least core_thread_pool_size ({})",
                self.max_thread_pool_size, self.core_thread_pool_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ThreadPoolBulkheadConfigBuilder {
    config: ThreadPoolBulkheadConfig,
}

impl ThreadPoolBulkheadConfigBuilder {
    pub fn new() -> Self {
        Self { config: ThreadPoolBulkheadConfig::default() }
    }

    pub fn core_thread_pool_size(mut self, size: u32) -> Self {
        self.config.core_thread_pool_size = size;
        self
    }

    pub fn max_thread_pool_size(mut self, size: u32) -> Self {
        self.config.max_thread_pool_size = size;
        self
    }

    pub fn queue_capacity(mut self, capacity: u32) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn keep_alive_duration(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive_duration = keep_alive;
        self
    }

    pub fn build(self) -> ConfigResult<ThreadPoolBulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a thread-pool bulkhead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadPoolBulkheadMetrics {
    pub core_thread_pool_size: u32,
    pub max_thread_pool_size: u32,
    pub thread_pool_size: u32,
    pub active_threads: u32,
    pub queue_depth: u32,
    pub queue_capacity: u32,
    pub remaining_queue_capacity: u32,
}

/// The submitted work panicked or its worker was torn down before it ran
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task on bulkhead '{bulkhead}' did not complete")]
pub struct TaskAborted {
    pub bulkhead: String,
}

/// Completion handle of submitted work
///
/// Dropping the handle before the work starts skips it.
#[must_use = "dropping the handle before the work starts skips it"]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<T>,
    bulkhead: Arc<str>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskAborted>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let bulkhead = Arc::clone(&self.bulkhead);
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map_err(|_| TaskAborted { bulkhead: bulkhead.to_string() })
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("bulkhead", &self.bulkhead).finish()
    }
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct PoolState {
    queue: VecDeque<Job>,
    pool_size: u32,
    shutdown: bool,
}

struct PoolShared {
    name: Arc<str>,
    config: ThreadPoolBulkheadConfig,
    state: Mutex<PoolState>,
    work_available: Notify,
    active: AtomicU32,
    events: Arc<EventPublisher<BulkheadEvent>>,
    clock: Arc<dyn Clock>,
}

/// Named worker-pool bulkhead
#[derive(Clone)]
pub struct ThreadPoolBulkhead {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for ThreadPoolBulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolBulkhead")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ThreadPoolBulkhead {
    pub fn new(name: impl Into<String>, config: ThreadPoolBulkheadConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: ThreadPoolBulkheadConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let queue = VecDeque::with_capacity(config.queue_capacity.min(1024) as usize);
        Ok(Self {
            shared: Arc::new(PoolShared {
                name: Arc::from(name.into()),
                config,
                state: Mutex::new(PoolState { queue, pool_size: 0, shutdown: false }),
                work_available: Notify::new(),
                active: AtomicU32::new(0),
                events: Arc::new(EventPublisher::new()),
                clock,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ThreadPoolBulkheadConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EventPublisher<BulkheadEvent> {
        &self.shared.events
    }

    /// Hand work to the pool
    ///
    /// Must be called from within a tokio runtime; outside one every
    /// submission is rejected.
    pub fn submit<F, Fut, T>(&self, task: F) -> Result<TaskHandle<T>, Rejection>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = &self.shared;
        let Ok(runtime) = Handle::try_current() else {
            error!(name = %shared.name, "Thread-pool bulkhead used outside a tokio runtime");
            return Err(self.reject());
        };

        let (sender, receiver) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                if sender.is_closed() {
                    return;
                }
                let output = task().await;
                let _ = sender.send(output);
            }
            .boxed()
        });

        let config = &shared.config;
        let mut state = shared.state.lock();
        if state.shutdown {
            drop(state);
            debug!(name = %shared.name, "Thread-pool bulkhead is shut down");
            return Err(self.reject());
        }

        if state.pool_size < config.core_thread_pool_size {
            state.pool_size += 1;
            drop(state);
            runtime.spawn(run_worker(Arc::clone(shared), Some(job)));
        } else if (state.queue.len() as u32) < config.queue_capacity {
            state.queue.push_back(job);
            drop(state);
            shared.work_available.notify_one();
        } else if state.pool_size < config.max_thread_pool_size {
            state.pool_size += 1;
            let pool_size = state.pool_size;
            drop(state);
            debug!(name = %shared.name, pool_size, "Queue full, starting non-core worker");
            runtime.spawn(run_worker(Arc::clone(shared), Some(job)));
        } else {
            drop(state);
            return Err(self.reject());
        }

        publish(&shared.events, &shared.name, shared.clock.as_ref(), BulkheadEventKind::CallPermitted);
        Ok(TaskHandle { receiver, bulkhead: Arc::clone(&shared.name) })
    }

    /// Submit a fallible operation and flatten the outcome into a
    /// [`ResilienceResult`]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
    {
        let handle = self.submit(operation)?;
        match handle.await {
            Ok(result) => result.map_err(|source| ResilienceError::OperationFailed { source }),
            Err(aborted) => {
                warn!(name = %self.shared.name, error = %aborted, "Submitted task aborted");
                Err(ResilienceError::Cancelled)
            }
        }
    }

    fn reject(&self) -> Rejection {
        let shared = &self.shared;
        debug!(name = %shared.name, "Thread-pool bulkhead rejected call");
        publish(&shared.events, &shared.name, shared.clock.as_ref(), BulkheadEventKind::CallRejected);
        Rejection::BulkheadFull {
            name: shared.name.to_string(),
            max_concurrent_calls: shared.config.max_thread_pool_size,
        }
    }

    /// Stop accepting work; queued jobs still run, then workers exit
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_available.notify_waiters();
        debug!(name = %self.shared.name, "Thread-pool bulkhead shutting down");
    }

    pub fn metrics(&self) -> ThreadPoolBulkheadMetrics {
        let config = &self.shared.config;
        let state = self.shared.state.lock();
        let queue_depth = state.queue.len() as u32;
        ThreadPoolBulkheadMetrics {
            core_thread_pool_size: config.core_thread_pool_size,
            max_thread_pool_size: config.max_thread_pool_size,
            thread_pool_size: state.pool_size,
            active_threads: self.shared.active.load(Ordering::Relaxed),
            queue_depth,
            queue_capacity: config.queue_capacity,
            remaining_queue_capacity: config.queue_capacity.saturating_sub(queue_depth),
        }
    }
}

async fn run_worker(shared: Arc<PoolShared>, mut job: Option<Job>) {
    loop {
        if let Some(work) = job.take() {
            shared.active.fetch_add(1, Ordering::Relaxed);
            if AssertUnwindSafe(work()).catch_unwind().await.is_err() {
                error!(name = %shared.name, "Task panicked on thread-pool bulkhead");
            }
            shared.active.fetch_sub(1, Ordering::Relaxed);
            publish(&shared.events, &shared.name, shared.clock.as_ref(), BulkheadEventKind::CallFinished);
        }

        match next_job(&shared).await {
            Some(next) => job = Some(next),
            None => return,
        }
    }
}

/// Wait for queued work; `None` means this worker should exit
async fn next_job(shared: &PoolShared) -> Option<Job> {
    loop {
        let notified = shared.work_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let may_retire = {
            let mut state = shared.state.lock();
            if let Some(job) = state.queue.pop_front() {
                return Some(job);
            }
            if state.shutdown {
                state.pool_size -= 1;
                return None;
            }
            state.pool_size > shared.config.core_thread_pool_size
        };

        if !may_retire {
            notified.await;
            continue;
        }

        tokio::select! {
            () = &mut notified => {}
            () = shared.clock.sleep(shared.config.keep_alive_duration) => {
                let mut state = shared.state.lock();
                if state.queue.is_empty() && state.pool_size > shared.config.core_thread_pool_size {
                    state.pool_size -= 1;
                    debug!(name = %shared.name, pool_size = state.pool_size, "Idle worker retired");
                    return None;
                }
            }
        }
    }
}
