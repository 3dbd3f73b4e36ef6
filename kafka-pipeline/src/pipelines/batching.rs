//! Batch stage - groups messages into size- or time-bounded batches
//!
//! A batch is emitted once `size` messages have accumulated, or when the flush
//! timer fires. The timer is a trailing debounce measured from the last emission
//! (not from the first message in the accumulator) and is re-armed after every
//! emission. With a zero `time` there is no timer and a partial batch is only
//! emitted when the stage drains.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::kafka::batch_message::Batch;
use crate::kafka::message::Message;
use crate::kafka::metrics_consts::{BATCH_STAGE_BATCHES_EMITTED, BATCH_STAGE_BATCH_SIZE};
use crate::pipelines::stage::{Stage, StageBuilder, StageHandle, StageLogic};
use crate::policy::BatchPolicy;

pub struct BatchLogic<T> {
    size: usize,
    time: Duration,
    accumulator: Vec<Message<T>>,
    deadline: Option<Instant>,
}

impl<T> BatchLogic<T> {
    pub fn new(policy: &BatchPolicy) -> Self {
        let mut logic = Self {
            size: policy.size,
            time: policy.time,
            accumulator: Vec::with_capacity(policy.size),
            deadline: None,
        };
        logic.rearm();
        logic
    }

    fn rearm(&mut self) {
        self.deadline = if self.time.is_zero() {
            None
        } else {
            Some(Instant::now() + self.time)
        };
    }

    async fn emit(&mut self, trigger: &'static str, downstream: &dyn Stage<Batch<T>>)
    where
        T: Send + Sync + 'static,
    {
        let messages = std::mem::replace(&mut self.accumulator, Vec::with_capacity(self.size));
        self.rearm();

        let batch = Batch::new(messages);
        debug!(size = batch.len(), trigger = trigger, "Emitting batch");
        metrics::histogram!(BATCH_STAGE_BATCH_SIZE).record(batch.len() as f64);
        metrics::counter!(BATCH_STAGE_BATCHES_EMITTED, "trigger" => trigger).increment(1);

        let size = batch.len();
        if !downstream.send(batch).await {
            warn!(
                size = size,
                downstream = downstream.name(),
                "Downstream refused batch while draining"
            );
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> StageLogic for BatchLogic<T> {
    type In = Message<T>;
    type Out = Batch<T>;

    async fn process(
        &mut self,
        item: Message<T>,
        downstream: &dyn Stage<Batch<T>>,
    ) -> anyhow::Result<()> {
        self.accumulator.push(item);
        if self.accumulator.len() >= self.size {
            self.emit("size", downstream).await;
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    async fn on_timer(&mut self, downstream: &dyn Stage<Batch<T>>) -> anyhow::Result<()> {
        if self.accumulator.is_empty() {
            self.rearm();
        } else {
            self.emit("timer", downstream).await;
        }
        Ok(())
    }

    async fn flush(&mut self, downstream: &dyn Stage<Batch<T>>) -> anyhow::Result<()> {
        if !self.accumulator.is_empty() {
            self.emit("flush", downstream).await;
        }
        Ok(())
    }
}

pub fn batch_stage<T: Send + Sync + 'static>(
    name: impl Into<String>,
    policy: &BatchPolicy,
    downstream: Arc<dyn Stage<Batch<T>>>,
) -> Arc<StageHandle<Message<T>>> {
    StageBuilder::new(name, BatchLogic::new(policy)).link(downstream)
}
