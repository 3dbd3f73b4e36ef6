//! Stage engine - bounded, ordered processing stages chained into a pipeline
//!
//! Each stage owns one runner task that pulls items off a bounded channel and
//! hands them to its `StageLogic`. Capacity is enforced by a semaphore permit
//! that travels with the item and is released only once the logic has returned
//! for it, so `in_flight` always counts the item currently being processed.
//!
//! Completion propagates forward: `complete()` closes the stage input, the runner
//! drains what is queued, flushes its logic, completes its downstream stage and
//! waits for it before reporting done itself.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant as StdInstant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::kafka::metrics_consts::{STAGE_BACKPRESSURE_TOTAL, STAGE_BACKPRESSURE_WAIT_MS, STAGE_FAULTS};

/// Items a stage accepts ahead of its downstream unless configured otherwise.
pub const DEFAULT_STAGE_CAPACITY: usize = 1;

/// The input side of a pipeline stage.
#[async_trait]
pub trait Stage<In: Send + 'static>: Send + Sync {
    fn name(&self) -> &str;

    /// Hand an item to the stage, waiting while it is at capacity. Returns false
    /// once the stage has started draining.
    async fn send(&self, item: In) -> bool;

    /// Request a graceful drain. Idempotent.
    fn complete(&self);

    /// Resolves once this stage and everything downstream of it has finished.
    async fn completion(&self);
}

/// The transform run by a stage.
///
/// A returned error (or a panic) is logged and counted by the engine; it never
/// stops the stage and never leaks capacity. Deciding whether a failure should
/// skip, retry or propagate is up to the logic itself.
#[async_trait]
pub trait StageLogic: Send + 'static {
    type In: Send + 'static;
    type Out: Send + 'static;

    async fn process(
        &mut self,
        item: Self::In,
        downstream: &dyn Stage<Self::Out>,
    ) -> anyhow::Result<()>;

    /// When the logic wants `on_timer` called next.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    async fn on_timer(&mut self, _downstream: &dyn Stage<Self::Out>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once the input is closed and fully drained.
    async fn flush(&mut self, _downstream: &dyn Stage<Self::Out>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Slot<T> {
    item: T,
    // released once the logic has processed `item`
    permit: OwnedSemaphorePermit,
}

/// Handle to a running stage; the value `link` returns.
pub struct StageHandle<In> {
    name: String,
    capacity: usize,
    sender: Mutex<Option<mpsc::Sender<Slot<In>>>>,
    permits: Arc<Semaphore>,
    done: watch::Receiver<bool>,
}

impl<In: Send + 'static> StageHandle<In> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items accepted but not yet fully processed.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    pub fn is_draining(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn sender(&self) -> Option<mpsc::Sender<Slot<In>>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::Closed) => None,
            Err(TryAcquireError::NoPermits) => {
                metrics::counter!(STAGE_BACKPRESSURE_TOTAL, "stage" => self.name.clone())
                    .increment(1);
                let start = StdInstant::now();
                let permit = self.permits.clone().acquire_owned().await.ok();
                metrics::histogram!(STAGE_BACKPRESSURE_WAIT_MS, "stage" => self.name.clone())
                    .record(start.elapsed().as_millis() as f64);
                permit
            }
        }
    }
}

#[async_trait]
impl<In: Send + 'static> Stage<In> for StageHandle<In> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, item: In) -> bool {
        if self.is_draining() {
            return false;
        }
        let Some(permit) = self.acquire().await else {
            return false;
        };
        // complete() may have been called while waiting for capacity
        let Some(sender) = self.sender() else {
            return false;
        };
        sender.send(Slot { item, permit }).await.is_ok()
    }

    fn complete(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            debug!(stage = %self.name, "Stage drain requested");
        }
    }

    async fn completion(&self) {
        let mut done = self.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            debug!(stage = %self.name, "Stage runner exited before signalling completion");
        }
    }
}

/// Builds a stage from its logic and links it to a downstream stage.
pub struct StageBuilder<L> {
    name: String,
    logic: L,
    capacity: usize,
}

impl<L: StageLogic> StageBuilder<L> {
    pub fn new(name: impl Into<String>, logic: L) -> Self {
        Self {
            name: name.into(),
            logic,
            capacity: DEFAULT_STAGE_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Spawn the stage runner feeding `downstream` and return the stage input.
    pub fn link(self, downstream: Arc<dyn Stage<L::Out>>) -> Arc<StageHandle<L::In>> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let (done_tx, done_rx) = watch::channel(false);

        let name = self.name.clone();
        tokio::spawn(run_stage(name, self.logic, receiver, downstream, done_tx));

        Arc::new(StageHandle {
            name: self.name,
            capacity: self.capacity,
            sender: Mutex::new(Some(sender)),
            permits: Arc::new(Semaphore::new(self.capacity)),
            done: done_rx,
        })
    }
}

enum Event<T> {
    Item(Option<Slot<T>>),
    Timer,
}

async fn run_stage<L: StageLogic>(
    name: String,
    mut logic: L,
    mut receiver: mpsc::Receiver<Slot<L::In>>,
    downstream: Arc<dyn Stage<L::Out>>,
    done: watch::Sender<bool>,
) {
    debug!(stage = %name, downstream = downstream.name(), "Stage started");

    loop {
        let deadline = logic.next_deadline();
        let event = tokio::select! {
            biased;
            slot = receiver.recv() => Event::Item(slot),
            _ = wait_until(deadline) => Event::Timer,
        };

        match event {
            Event::Item(Some(slot)) => {
                let Slot { item, permit } = slot;
                guarded(&name, "process", logic.process(item, downstream.as_ref())).await;
                drop(permit);
            }
            Event::Item(None) => break,
            Event::Timer => guarded(&name, "timer", logic.on_timer(downstream.as_ref())).await,
        }
    }

    guarded(&name, "flush", logic.flush(downstream.as_ref())).await;
    downstream.complete();
    downstream.completion().await;

    debug!(stage = %name, "Stage drained");
    done.send_replace(true);
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn guarded<F>(stage: &str, phase: &'static str, work: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(stage = stage, phase = phase, error = ?e, "Stage transform failed");
            metrics::counter!(STAGE_FAULTS, "stage" => stage.to_string(), "kind" => "error")
                .increment(1);
        }
        Err(panic) => {
            error!(
                stage = stage,
                phase = phase,
                panic = panic_message(panic.as_ref()),
                "Stage transform panicked"
            );
            metrics::counter!(STAGE_FAULTS, "stage" => stage.to_string(), "kind" => "panic")
                .increment(1);
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Terminal stage: accepts and drops everything.
pub struct Discard<T> {
    _marker: PhantomData<fn(T)>,
}

impl<T> Discard<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Discard<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Stage<T> for Discard<T> {
    fn name(&self) -> &str {
        "discard"
    }

    async fn send(&self, _item: T) -> bool {
        true
    }

    fn complete(&self) {}

    async fn completion(&self) {}
}
