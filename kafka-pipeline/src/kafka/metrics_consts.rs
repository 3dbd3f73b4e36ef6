// ==== Consumption loop metrics ====
/// Counter for records read from the transport, labelled by topic
pub const CONSUMER_MESSAGES_RECEIVED: &str = "kafka_pipeline_messages_received_total";

/// Counter for transport errors raised by consume, labelled by error type
pub const CONSUMER_TRANSPORT_ERRORS: &str = "kafka_pipeline_transport_errors_total";

/// Counter for payloads that could not be decoded and were skipped
pub const CONSUMER_DECODE_ERRORS: &str = "kafka_pipeline_decode_errors_total";

// ==== Commit metrics ====
/// Counter for broker commits, labelled by status (success/failure)
pub const COMMITS_TOTAL: &str = "kafka_pipeline_commits_total";

/// Counter for commits that reported failure to a Commit stage
pub const COMMIT_STAGE_SOFT_FAILURES: &str = "kafka_pipeline_commit_soft_failures_total";

// ==== Stage metrics ====
/// Counter for faults raised inside a stage transform, labelled by stage
pub const STAGE_FAULTS: &str = "kafka_pipeline_stage_faults_total";

/// Counter for sends that had to wait for stage capacity, labelled by stage
pub const STAGE_BACKPRESSURE_TOTAL: &str = "kafka_pipeline_stage_backpressure_total";

/// Histogram for time spent waiting on stage capacity
pub const STAGE_BACKPRESSURE_WAIT_MS: &str = "kafka_pipeline_stage_backpressure_wait_ms";

/// Histogram for emitted batch sizes
pub const BATCH_STAGE_BATCH_SIZE: &str = "kafka_pipeline_batch_size";

/// Counter for emitted batches, labelled by trigger (size/timer/flush)
pub const BATCH_STAGE_BATCHES_EMITTED: &str = "kafka_pipeline_batches_emitted_total";

/// Gauge for the number of lanes opened by a parallel stage
pub const PARALLEL_STAGE_LANES: &str = "kafka_pipeline_parallel_lanes";

// ==== Retry metrics ====
/// Counter for failed user action attempts
pub const ACTION_FAILURES: &str = "kafka_pipeline_action_failures_total";

/// Counter for items abandoned after retries were exhausted or skipped
pub const ACTION_ABANDONED: &str = "kafka_pipeline_action_abandoned_total";

// ==== Offset resolution metrics ====
/// Counter for start offsets resolved at assignment, labelled by policy kind
pub const OFFSETS_RESOLVED: &str = "kafka_pipeline_offsets_resolved_total";

/// Counter for partitions whose start offset could not be resolved
pub const OFFSET_RESOLUTION_ERRORS: &str = "kafka_pipeline_offset_resolution_errors_total";

// ==== Subscription metrics ====
/// Gauge for the number of running subscriptions
pub const SUBSCRIPTIONS_ACTIVE: &str = "kafka_pipeline_subscriptions_active";

/// Counter for unsubscribe calls whose drain did not finish within the timeout
pub const UNSUBSCRIBE_TIMEOUTS: &str = "kafka_pipeline_unsubscribe_timeouts_total";
