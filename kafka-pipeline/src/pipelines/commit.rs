use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::kafka::message::Committable;
use crate::kafka::metrics_consts::COMMIT_STAGE_SOFT_FAILURES;
use crate::pipelines::stage::{Stage, StageBuilder, StageHandle, StageLogic};

/// Commits every item it receives, then forwards it.
///
/// A failed commit is a soft failure: it is logged and counted, and the item
/// still moves on. At-least-once delivery is not guaranteed for the affected
/// partition until a later commit succeeds.
pub struct CommitLogic<I> {
    _marker: PhantomData<fn(I)>,
}

impl<I> CommitLogic<I> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<I> Default for CommitLogic<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<I: Committable> StageLogic for CommitLogic<I> {
    type In = I;
    type Out = I;

    async fn process(&mut self, item: I, downstream: &dyn Stage<I>) -> anyhow::Result<()> {
        if item.commit(false) {
            debug!(targets = item.commit_targets().len(), "Committed");
        } else {
            for target in item.commit_targets() {
                warn!(
                    topic = target.topic(),
                    partition = target.partition_number(),
                    offset = target.offset(),
                    "Commit failed - at-least-once not guaranteed for partition until next commit"
                );
            }
            metrics::counter!(COMMIT_STAGE_SOFT_FAILURES).increment(1);
        }

        downstream.send(item).await;
        Ok(())
    }
}

pub fn commit_stage<I: Committable>(
    name: impl Into<String>,
    downstream: Arc<dyn Stage<I>>,
) -> Arc<StageHandle<I>> {
    StageBuilder::new(name, CommitLogic::new()).link(downstream)
}
