//! Per-element conversion scheduling
//!
//! The scheduler keeps at most one pending job per display element. A new
//! request for an element that already has work in flight either collapses
//! into it (identical request) or supersedes it; superseded work may still
//! run to completion on a worker, but its result is discarded.
//!
//! Every registry mutation (submit, completion, unregister, cancel) happens
//! under one mutex. Completion checks that the finishing job still owns the
//! element's handle and delivers while holding that lock, so a stale result
//! can never be delivered, nor land after a newer one.
//!
//! Jobs run on a fixed pool of named std threads fed through an mpsc queue.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::CharcoalError;
use crate::job::{ConversionJob, ElementId};
use crate::units::Converter;

/// A formatted result for one element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub element_id: ElementId,
    pub text: String,
}

/// Receives formatted results.
///
/// Called on a worker thread with the scheduler's registry locked: keep it
/// short and never call back into the scheduler from it.
pub trait ResultSink: Send + Sync + 'static {
    fn deliver(&self, element_id: ElementId, text: String);
}

impl<F> ResultSink for F
where
    F: Fn(ElementId, String) + Send + Sync + 'static,
{
    fn deliver(&self, element_id: ElementId, text: String) {
        self(element_id, text)
    }
}

/// Sink forwarding results over an mpsc channel
pub struct ChannelSink(Mutex<Sender<Delivery>>);

impl ChannelSink {
    pub fn new(sender: Sender<Delivery>) -> Self {
        ChannelSink(Mutex::new(sender))
    }
}

impl ResultSink for ChannelSink {
    fn deliver(&self, element_id: ElementId, text: String) {
        let sender = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.send(Delivery { element_id, text }).is_err() {
            debug!("Delivery receiver for {} has gone away", element_id);
        }
    }
}

/// Scheduler construction options
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker thread count; defaults to one less than available parallelism
    pub workers: Option<usize>,
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            thread_name: "charcoal-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..Self::default()
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count).max(1)
    }
}

fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// What `submit` did with a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No job was pending for the element; the new one was queued
    Scheduled,
    /// A pending job was cancelled and the new one queued in its place
    Replaced,
    /// An identical job is already pending; nothing new was queued
    Debounced,
    /// The scheduler has shut down
    Rejected,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub debounced: u64,
    pub superseded: u64,
    /// Pending jobs cancelled by `unregister` or `cancel_all`
    pub cancelled: u64,
    /// Jobs dequeued after cancellation and never run
    pub skipped: u64,
    pub executed: u64,
    pub delivered: u64,
    /// Results discarded because their handle was gone at completion
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    debounced: AtomicU64,
    superseded: AtomicU64,
    cancelled: AtomicU64,
    skipped: AtomicU64,
    executed: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            debounced: self.debounced.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// The single pending job of an element
struct JobHandle {
    ticket: u64,
    request: ConversionJob,
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    fn matches(&self, job: &ConversionJob) -> bool {
        self.request.same_request(job)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct Registry {
    handles: HashMap<ElementId, JobHandle>,
    next_ticket: u64,
}

struct Task {
    ticket: u64,
    job: ConversionJob,
    cancelled: Arc<AtomicBool>,
}

struct Shared {
    registry: Mutex<Registry>,
    converter: Arc<dyn Converter>,
    sink: Box<dyn ResultSink>,
    counters: Counters,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, task: Task) {
        let element_id = task.job.element_id;
        if task.cancelled.load(Ordering::Acquire) {
            debug!("Skipping cancelled job {} for {}", task.ticket, element_id);
            Counters::bump(&self.counters.skipped);
            return;
        }

        let converter = self.converter.as_ref();
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.job.execute(converter)));

        match result {
            Ok(text) => {
                Counters::bump(&self.counters.executed);
                self.complete(element_id, task.ticket, text)
            }
            Err(_) => {
                error!("Conversion job {} for {} panicked", task.ticket, element_id);
                self.release(element_id, task.ticket);
                Counters::bump(&self.counters.failed);
            }
        }
    }

    /// Pending -> Completed, delivering only if this job still owns the handle
    fn complete(&self, element_id: ElementId, ticket: u64, text: String) {
        let mut registry = self.registry();
        let owns_handle = registry
            .handles
            .get(&element_id)
            .is_some_and(|handle| handle.ticket == ticket);

        if owns_handle {
            registry.handles.remove(&element_id);
            debug!("Delivering {:?} to {}", text, element_id);
            self.sink.deliver(element_id, text);
            Counters::bump(&self.counters.delivered);
        } else {
            debug!("Dropping stale result of job {} for {}", ticket, element_id);
            Counters::bump(&self.counters.dropped);
        }
    }

    fn release(&self, element_id: ElementId, ticket: u64) {
        let mut registry = self.registry();
        if registry
            .handles
            .get(&element_id)
            .is_some_and(|handle| handle.ticket == ticket)
        {
            registry.handles.remove(&element_id);
        }
    }
}

fn worker_loop(shared: Arc<Shared>, queue: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let next = {
            let receiver = queue.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match next {
            Ok(task) => shared.run(task),
            Err(_) => break,
        }
    }
    debug!("{} exiting", thread::current().name().unwrap_or("worker"));
}

/// Runs conversion jobs with at most one pending job per element
pub struct ConversionScheduler {
    shared: Arc<Shared>,
    queue: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConversionScheduler {
    /// Start the worker pool
    pub fn new(
        converter: Arc<dyn Converter>,
        config: SchedulerConfig,
        sink: impl ResultSink,
    ) -> Result<Self, CharcoalError> {
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            converter,
            sink: Box::new(sink),
            counters: Counters::default(),
        });

        let (sender, receiver) = channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let count = config.worker_count();

        let mut workers = Vec::with_capacity(count);
        for index in 1..=count {
            let shared = Arc::clone(&shared);
            let queue = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker_loop(shared, queue))?;
            workers.push(handle);
        }
        info!("Conversion scheduler started with {} workers", count);

        Ok(Self {
            shared,
            queue: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Start a scheduler whose results arrive on the returned receiver
    pub fn with_channel(
        converter: Arc<dyn Converter>,
        config: SchedulerConfig,
    ) -> Result<(Self, Receiver<Delivery>), CharcoalError> {
        let (sender, receiver) = channel();
        let scheduler = Self::new(converter, config, ChannelSink::new(sender))?;
        Ok((scheduler, receiver))
    }

    /// Queue a job for its element, replacing or collapsing into any job
    /// already pending for that element.
    pub fn submit(&self, job: ConversionJob) -> SubmitOutcome {
        let element_id = job.element_id;
        let counters = &self.shared.counters;
        let mut registry = self.shared.registry();

        let mut outcome = SubmitOutcome::Scheduled;
        if let Some(existing) = registry.handles.get(&element_id) {
            if existing.matches(&job) {
                debug!("Same request already pending for {}", element_id);
                Counters::bump(&counters.debounced);
                return SubmitOutcome::Debounced;
            }
            debug!("Cancelling pending job {} for {}", existing.ticket, element_id);
            existing.cancel();
            Counters::bump(&counters.superseded);
            outcome = SubmitOutcome::Replaced;
        }

        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = queue.as_ref() else {
            warn!("Scheduler shut down, rejecting job for {}", element_id);
            if let Some(previous) = registry.handles.remove(&element_id) {
                previous.cancel();
            }
            return SubmitOutcome::Rejected;
        };

        registry.next_ticket += 1;
        let ticket = registry.next_ticket;
        let cancelled = Arc::new(AtomicBool::new(false));
        registry.handles.insert(
            element_id,
            JobHandle {
                ticket,
                request: job.clone(),
                cancelled: Arc::clone(&cancelled),
            },
        );

        let task = Task {
            ticket,
            job,
            cancelled,
        };
        if sender.send(task).is_err() {
            error!("Worker pool is gone, rejecting job for {}", element_id);
            registry.handles.remove(&element_id);
            return SubmitOutcome::Rejected;
        }

        Counters::bump(&counters.submitted);
        outcome
    }

    /// Cancel and forget any pending job for an element being torn down
    pub fn unregister(&self, element_id: ElementId) {
        let mut registry = self.shared.registry();
        if let Some(handle) = registry.handles.remove(&element_id) {
            debug!("Cancelling job {} for unregistered {}", handle.ticket, element_id);
            handle.cancel();
            Counters::bump(&self.shared.counters.cancelled);
        }
    }

    /// Cancel every pending job
    pub fn cancel_all(&self) {
        let mut registry = self.shared.registry();
        let count = registry.handles.len();
        for (_, handle) in registry.handles.drain() {
            handle.cancel();
            Counters::bump(&self.shared.counters.cancelled);
        }
        if count > 0 {
            info!("Cancelled {} pending conversion jobs", count);
        }
    }

    pub fn is_pending(&self, element_id: ElementId) -> bool {
        self.shared.registry().handles.contains_key(&element_id)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.registry().handles.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot()
    }

    /// Cancel pending work, stop accepting jobs, and wait for the workers
    /// to drain the queue and exit.
    pub fn shutdown(&self) {
        self.cancel_all();

        let sender = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("Conversion worker exited abnormally");
            }
        }
        info!("Conversion scheduler stopped");
    }
}

impl Drop for ConversionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
