use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::pipelines::stage::{Stage, StageBuilder, StageHandle, StageLogic};
use crate::policy::BufferPolicy;

/// Pass-through logic. Combined with a stage capacity it becomes a Buffer: up to
/// `size` items are accepted ahead of a slower downstream.
pub struct Forward<T> {
    _marker: PhantomData<fn(T)>,
}

impl<T> Forward<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Forward<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> StageLogic for Forward<T> {
    type In = T;
    type Out = T;

    async fn process(&mut self, item: T, downstream: &dyn Stage<T>) -> anyhow::Result<()> {
        if !downstream.send(item).await {
            warn!(downstream = downstream.name(), "Downstream refused item while draining");
        }
        Ok(())
    }
}

pub fn buffer_stage<T: Send + 'static>(
    policy: &BufferPolicy,
    downstream: Arc<dyn Stage<T>>,
) -> Arc<StageHandle<T>> {
    StageBuilder::new("buffer", Forward::new())
        .with_capacity(policy.size)
        .link(downstream)
}
