//! Action stage - runs the user handler, wrapped by the retry policy
//!
//! The stage processes one item at a time (capacity 1), so retries of item N
//! always finish before item N+1 is looked at. Every failed attempt is reported
//! to the `ErrorInterceptor`. Items that succeed are forwarded downstream; items
//! abandoned after `Skip` or after exhausting retries are not forwarded and
//! therefore never committed.
//!
//! On shutdown a bounded retry keeps going until it succeeds or runs out, like
//! any other in-flight item. Only an infinite retry is abandoned when the
//! subscription is cancelled during its backoff.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kafka::message::Committable;
use crate::kafka::metrics_consts::{ACTION_ABANDONED, ACTION_FAILURES};
use crate::kafka::types::PartitionOffset;
use crate::pipelines::stage::{panic_message, Stage, StageBuilder, StageHandle, StageLogic};
use crate::policy::RetryPolicy;

/// A user action over a message or a batch. Returning only once the work is
/// done, or has failed, is what gives the pipeline its ordering.
#[async_trait]
pub trait Handler<I>: Send + Sync {
    async fn handle(&self, item: &I) -> anyhow::Result<()>;
}

/// Handler built from an async closure.
pub struct HandlerFn<F, I> {
    f: F,
    _marker: PhantomData<fn(I)>,
}

/// Wrap an async closure taking the item by value as a `Handler`.
pub fn handler_fn<F, Fut, I>(f: F) -> HandlerFn<F, I>
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
    I: Clone + Send + Sync,
{
    HandlerFn {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, I> Handler<I> for HandlerFn<F, I>
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
    I: Clone + Send + Sync,
{
    async fn handle(&self, item: &I) -> anyhow::Result<()> {
        (self.f)(item.clone()).await
    }
}

/// Details of one failed attempt, handed to the interceptor.
#[derive(Debug, Clone)]
pub struct FailureContext<'a> {
    pub stage: &'a str,
    /// 1 for the first failure of an item
    pub attempt: u32,
    pub will_retry: bool,
    pub targets: &'a [PartitionOffset],
}

/// Hook receiving every handler failure.
pub trait ErrorInterceptor: Send + Sync {
    fn on_error(&self, context: &FailureContext<'_>, error: &anyhow::Error);
}

/// Default interceptor: logs the failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl ErrorInterceptor for LoggingInterceptor {
    fn on_error(&self, context: &FailureContext<'_>, error: &anyhow::Error) {
        let first = context.targets.first();
        warn!(
            stage = context.stage,
            attempt = context.attempt,
            will_retry = context.will_retry,
            topic = first.map(PartitionOffset::topic),
            partition = first.map(PartitionOffset::partition_number),
            offset = first.map(PartitionOffset::offset),
            targets = context.targets.len(),
            error = ?error,
            "Handler failed"
        );
    }
}

pub struct ActionLogic<I> {
    name: String,
    handler: Arc<dyn Handler<I>>,
    retry: RetryPolicy,
    interceptor: Arc<dyn ErrorInterceptor>,
    cancel: CancellationToken,
}

impl<I> ActionLogic<I> {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn Handler<I>>,
        retry: RetryPolicy,
        interceptor: Arc<dyn ErrorInterceptor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            retry,
            interceptor,
            cancel,
        }
    }

    async fn attempt(&self, item: &I) -> anyhow::Result<()> {
        match AssertUnwindSafe(self.handler.handle(item)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )),
        }
    }
}

#[async_trait]
impl<I: Committable> StageLogic for ActionLogic<I> {
    type In = I;
    type Out = I;

    async fn process(&mut self, item: I, downstream: &dyn Stage<I>) -> anyhow::Result<()> {
        let mut failures: u32 = 0;

        loop {
            let result = self.attempt(&item).await;
            let error = match result {
                Ok(()) => {
                    if !downstream.send(item).await {
                        warn!(stage = %self.name, "Downstream refused handled item while draining");
                    }
                    return Ok(());
                }
                Err(error) => error,
            };

            failures = failures.saturating_add(1);
            let will_retry = self.retry.should_retry(failures);
            let targets = item.commit_targets();
            metrics::counter!(ACTION_FAILURES, "stage" => self.name.clone()).increment(1);
            self.interceptor.on_error(
                &FailureContext {
                    stage: &self.name,
                    attempt: failures,
                    will_retry,
                    targets: &targets,
                },
                &error,
            );

            if !will_retry {
                let reason = match self.retry {
                    RetryPolicy::Skip => "skipped",
                    RetryPolicy::Retry { .. } => "retries_exhausted",
                };
                metrics::counter!(ACTION_ABANDONED, "reason" => reason).increment(1);
                return Ok(());
            }

            let backoff = self.retry.backoff(failures - 1);
            if !self.retry.is_infinite() {
                tokio::time::sleep(backoff).await;
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(
                        stage = %self.name,
                        attempt = failures,
                        "Shutdown during infinite retry backoff - item left uncommitted"
                    );
                    metrics::counter!(ACTION_ABANDONED, "reason" => "shutdown").increment(1);
                    return Ok(());
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

pub fn action_stage<I: Committable>(
    name: impl Into<String>,
    handler: Arc<dyn Handler<I>>,
    retry: RetryPolicy,
    interceptor: Arc<dyn ErrorInterceptor>,
    cancel: CancellationToken,
    downstream: Arc<dyn Stage<I>>,
) -> Arc<StageHandle<I>> {
    let name = name.into();
    StageBuilder::new(
        name.clone(),
        ActionLogic::new(name, handler, retry, interceptor, cancel),
    )
    .link(downstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::message::Message;
    use crate::kafka::test_utils::RecordingCommitter;
    use crate::kafka::types::Partition;
    use crate::pipelines::stage::tests::Collect;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingInterceptor {
        calls: Mutex<Vec<(u32, bool)>>,
    }

    impl ErrorInterceptor for CountingInterceptor {
        fn on_error(&self, context: &FailureContext<'_>, _error: &anyhow::Error) {
            self.calls
                .lock()
                .unwrap()
                .push((context.attempt, context.will_retry));
        }
    }

    fn message(offset: i64) -> Message<u32> {
        Message::new(
            Partition::new("test-topic", 0),
            offset,
            None,
            None,
            7,
            Arc::new(RecordingCommitter::new()),
        )
    }

    async fn run(
        retry: RetryPolicy,
        handler: Arc<dyn Handler<Message<u32>>>,
        items: i64,
    ) -> (Arc<Collect<Message<u32>>>, Arc<CountingInterceptor>) {
        let sink = Collect::<Message<u32>>::new();
        let interceptor = Arc::new(CountingInterceptor::default());
        let stage = action_stage(
            "action",
            handler,
            retry,
            interceptor.clone(),
            CancellationToken::new(),
            sink.clone(),
        );
        for offset in 0..items {
            stage.send(message(offset)).await;
        }
        stage.complete();
        stage.completion().await;
        (sink, interceptor)
    }

    fn always_failing(attempts: Arc<AtomicU32>) -> Arc<dyn Handler<Message<u32>>> {
        Arc::new(handler_fn(move |_: Message<u32>| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("always fails"))
            }
        }))
    }

    #[tokio::test]
    async fn test_skip_runs_failing_action_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let (sink, interceptor) =
            run(RetryPolicy::Skip, always_failing(attempts.clone()), 1).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*interceptor.calls.lock().unwrap(), vec![(1, false)]);
        assert!(sink.items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_attempts_one_plus_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let (sink, interceptor) = run(
            RetryPolicy::retry(3, Duration::from_millis(10)),
            always_failing(attempts.clone()),
            1,
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(
            *interceptor.calls.lock().unwrap(),
            vec![(1, true), (2, true), (3, true), (4, false)]
        );
        assert!(sink.items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_exponentially() {
        let attempts = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();
        run(
            RetryPolicy::retry(3, Duration::from_millis(100)),
            always_failing(attempts.clone()),
            1,
        )
        .await;

        // 100 + 200 + 400
        assert!(start.elapsed() >= Duration::from_millis(700));
        assert!(start.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_and_forwards_in_order() {
        let attempts = Arc::new(AtomicU32::new(0));
        let handler = {
            let attempts = attempts.clone();
            Arc::new(handler_fn(move |message: Message<u32>| {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    // the first item fails twice before succeeding
                    if message.offset() == 0 && n < 2 {
                        return Err(anyhow!("transient"));
                    }
                    Ok(())
                }
            }))
        };

        let (sink, interceptor) =
            run(RetryPolicy::retry(5, Duration::from_millis(5)), handler, 3).await;

        let offsets: Vec<i64> = sink.items().iter().map(Message::offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(interceptor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_counts_as_failure() {
        struct Panics;

        #[async_trait]
        impl Handler<Message<u32>> for Panics {
            async fn handle(&self, _item: &Message<u32>) -> anyhow::Result<()> {
                panic!("handler bug")
            }
        }

        let (sink, interceptor) = run(RetryPolicy::Skip, Arc::new(Panics), 2).await;

        assert_eq!(interceptor.calls.lock().unwrap().len(), 2);
        assert!(sink.items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_lets_bounded_retry_finish() {
        let attempts = Arc::new(AtomicU32::new(0));
        let handler = {
            let attempts = attempts.clone();
            Arc::new(handler_fn(move |_: Message<u32>| {
                let attempts = attempts.clone();
                async move {
                    // fails twice, then succeeds
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(anyhow!("transient"));
                    }
                    Ok(())
                }
            }))
        };
        let cancel = CancellationToken::new();
        let sink = Collect::<Message<u32>>::new();
        let stage = action_stage(
            "action",
            handler,
            RetryPolicy::retry(3, Duration::from_millis(100)),
            Arc::new(LoggingInterceptor),
            cancel.clone(),
            sink.clone(),
        );

        stage.send(message(0)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        // first backoff is still running
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        cancel.cancel();
        stage.complete();
        stage.completion().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let offsets: Vec<i64> = sink.items().iter().map(Message::offset).collect();
        assert_eq!(offsets, vec![0]);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_infinite_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let sink = Collect::<Message<u32>>::new();
        let stage = action_stage(
            "action",
            always_failing(attempts.clone()),
            RetryPolicy::infinite(Duration::from_millis(5)),
            Arc::new(LoggingInterceptor),
            cancel.clone(),
            sink.clone(),
        );

        stage.send(message(0)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        stage.complete();

        tokio::time::timeout(Duration::from_secs(5), stage.completion())
            .await
            .unwrap();
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert!(sink.items().is_empty());
    }
}
