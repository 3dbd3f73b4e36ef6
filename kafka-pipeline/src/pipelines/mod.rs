//! Pipeline stages and the compiler that assembles them from a `PolicySet`.
//!
//! # Stage order
//!
//! Policies, when present, always become stages in this order:
//!
//! ```text
//! State? -> Buffer -> Parallel -> Batch -> Action (+Retry) -> Commit -> Discard
//! ```
//!
//! - A disabled State policy means no pipeline and no subscription.
//! - Buffer comes first so each parallel lane gets its own downstream capacity.
//! - Batch precedes the action so batched commit semantics apply.
//! - Commit is last so nothing downstream still holds an uncommitted item.
//!
//! Everything after Parallel is the lane *tail*. The compiler builds it through
//! a factory so every lane gets a structurally identical copy. Parallel with a
//! degree of 1 is not inserted at all.
//!
//! # Module Structure
//!
//! ```text
//! pipelines/
//! ├── stage.rs     # Stage engine: Stage, StageLogic, StageBuilder, Discard
//! ├── buffer.rs    # Buffer stage
//! ├── parallel.rs  # Grouped parallelism
//! ├── batching.rs  # Size/time batching
//! ├── action.rs    # User action wrapped by the retry policy
//! └── commit.rs    # Commit stage
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ConfigError;
use crate::kafka::batch_message::Batch;
use crate::kafka::message::Message;
use crate::policy::{GroupBy, PolicySet};

pub mod action;
pub mod batching;
pub mod buffer;
pub mod commit;
pub mod parallel;
pub mod stage;

pub use action::{handler_fn, ErrorInterceptor, FailureContext, Handler, LoggingInterceptor};
pub use parallel::{FieldSelector, GroupKeySelector, LaneFactory};
pub use stage::{Discard, Stage, StageBuilder, StageHandle, StageLogic};

use action::action_stage;
use batching::batch_stage;
use buffer::buffer_stage;
use commit::commit_stage;
use parallel::parallel_stage;

/// The user action a pipeline ends in. Its shape has to match the policies:
/// per-batch exactly when a Batch policy is configured.
pub enum Action<T> {
    PerMessage(Arc<dyn Handler<Message<T>>>),
    PerBatch(Arc<dyn Handler<Batch<T>>>),
}

impl<T> Clone for Action<T> {
    fn clone(&self) -> Self {
        match self {
            Action::PerMessage(handler) => Action::PerMessage(handler.clone()),
            Action::PerBatch(handler) => Action::PerBatch(handler.clone()),
        }
    }
}

impl<T> Action<T> {
    fn shape(&self) -> &'static str {
        match self {
            Action::PerMessage(_) => "per-message",
            Action::PerBatch(_) => "per-batch",
        }
    }
}

/// Runtime collaborators the compiled stages need besides the policies.
pub struct PipelineContext<T> {
    pub interceptor: Arc<dyn ErrorInterceptor>,
    /// Cancels retry backoffs when the subscription shuts down
    pub cancel: CancellationToken,
    /// Selectors for `parallel(<field>)` grouping, by field name
    pub fields: HashMap<String, FieldSelector<T>>,
}

impl<T> PipelineContext<T> {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            interceptor: Arc::new(LoggingInterceptor),
            cancel,
            fields: HashMap::new(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ErrorInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, selector: FieldSelector<T>) -> Self {
        self.fields.insert(name.into().to_lowercase(), selector);
        self
    }
}

/// A compiled, running pipeline.
pub struct Pipeline<T> {
    head: Arc<dyn Stage<Message<T>>>,
    stages: Vec<&'static str>,
}

impl<T: Send + Sync + 'static> Pipeline<T> {
    pub fn head(&self) -> &Arc<dyn Stage<Message<T>>> {
        &self.head
    }

    /// Stage names from head to tail, one entry per stage kind.
    pub fn stages(&self) -> &[&'static str] {
        &self.stages
    }
}

/// Build the pipeline for `policies`.
///
/// Returns `Ok(None)` when a State policy disables the handler. Configuration
/// faults (handler shape, unknown group-by field) are reported here, before any
/// stage is spawned.
pub fn compile<T: Send + Sync + 'static>(
    policies: &PolicySet,
    action: Action<T>,
    context: PipelineContext<T>,
) -> Result<Option<Pipeline<T>>, ConfigError> {
    if !policies.is_enabled() {
        info!("Handler disabled by state policy - no pipeline built");
        return Ok(None);
    }

    match (&action, policies.batch()) {
        (Action::PerMessage(_), Some(_)) | (Action::PerBatch(_), None) => {
            return Err(ConfigError::HandlerMismatch(format!(
                "{} handler with batch policy {}",
                action.shape(),
                if policies.batch().is_some() {
                    "configured"
                } else {
                    "absent"
                }
            )));
        }
        _ => {}
    }

    // the group-by field must resolve even when degree 1 drops the stage
    let selector = match policies.parallel() {
        Some(parallel) => {
            let selector = group_key_selector(&parallel.by, &context.fields)?;
            (parallel.degree != 1).then(|| (selector, parallel.lanes()))
        }
        None => None,
    };

    let mut stages = Vec::new();
    if policies.buffer().is_some() {
        stages.push("buffer");
    }
    if selector.is_some() {
        stages.push("parallel");
    }
    if policies.batch().is_some() {
        stages.push("batch");
    }
    stages.push("action");
    if policies.commit() {
        stages.push("commit");
    }

    let tail = TailFactory {
        policies: policies.clone(),
        action,
        interceptor: context.interceptor,
        cancel: context.cancel,
    };

    let mut head: Arc<dyn Stage<Message<T>>> = match selector {
        Some((selector, lanes)) => {
            let factory: LaneFactory<T> = Arc::new(move |_lane| tail.build());
            parallel_stage("parallel", selector, lanes, factory)
        }
        None => tail.build(),
    };
    if let Some(buffer) = policies.buffer() {
        head = buffer_stage(buffer, head);
    }

    info!(stages = ?stages, "Pipeline compiled");
    Ok(Some(Pipeline { head, stages }))
}

fn group_key_selector<T>(
    by: &GroupBy,
    fields: &HashMap<String, FieldSelector<T>>,
) -> Result<GroupKeySelector<T>, ConfigError> {
    Ok(match by {
        GroupBy::Partition => GroupKeySelector::Partition,
        GroupBy::Key => GroupKeySelector::Key,
        GroupBy::Field(name) => {
            let selector = fields
                .get(&name.to_lowercase())
                .cloned()
                .ok_or_else(|| ConfigError::UnknownField(name.clone()))?;
            GroupKeySelector::Field {
                name: name.clone(),
                selector,
            }
        }
    })
}

/// Builds the Batch -> Action -> Commit tail, once for a plain pipeline or once
/// per lane behind a parallel stage.
struct TailFactory<T> {
    policies: PolicySet,
    action: Action<T>,
    interceptor: Arc<dyn ErrorInterceptor>,
    cancel: CancellationToken,
}

impl<T: Send + Sync + 'static> TailFactory<T> {
    fn build(&self) -> Arc<dyn Stage<Message<T>>> {
        let retry = self.policies.effective_retry();
        match (&self.action, self.policies.batch()) {
            (Action::PerBatch(handler), Some(batch)) => {
                let mut next: Arc<dyn Stage<Batch<T>>> = Arc::new(Discard::new());
                if self.policies.commit() {
                    next = commit_stage("commit", next);
                }
                let action = action_stage(
                    "action",
                    handler.clone(),
                    retry,
                    self.interceptor.clone(),
                    self.cancel.clone(),
                    next,
                );
                batch_stage("batch", batch, action)
            }
            (Action::PerMessage(handler), _) => {
                let mut next: Arc<dyn Stage<Message<T>>> = Arc::new(Discard::new());
                if self.policies.commit() {
                    next = commit_stage("commit", next);
                }
                action_stage(
                    "action",
                    handler.clone(),
                    retry,
                    self.interceptor.clone(),
                    self.cancel.clone(),
                    next,
                )
            }
            // compile() rejects a per-batch handler without a batch policy
            (Action::PerBatch(_), None) => Arc::new(Discard::<Message<T>>::new()),
        }
    }
}
