//! Offset Resolver - maps a symbolic offset policy onto concrete start offsets
//!
//! Runs once per partition when the transport reports an assignment. The result
//! seeds the partition's consumption start point before the first record is read.
//!
//! Bias is applied to the base offset and the sum is clamped to the partition's
//! current `[low, high]` watermarks: a bias that leaves the range is pinned to the
//! nearest boundary. For `Stored` this means a large negative bias from a recent
//! commit can land all the way back on `low`.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::TransportError;
use crate::kafka::metrics_consts::{OFFSETS_RESOLVED, OFFSET_RESOLUTION_ERRORS};
use crate::kafka::transport::{AssignmentListener, OffsetSource};
use crate::kafka::types::{Partition, PartitionOffset};
use crate::policy::{OffsetKind, OffsetPolicy};

/// Default timeout for the watermark / committed / timestamp queries.
pub const DEFAULT_OFFSET_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Constrain `offset` to `[low, high]`.
pub fn clamp_offset(offset: i64, low: i64, high: i64) -> i64 {
    let high = high.max(low);
    offset.clamp(low, high)
}

pub struct OffsetResolver {
    policy: OffsetPolicy,
    timeout: Duration,
}

impl OffsetResolver {
    pub fn new(policy: OffsetPolicy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }

    pub fn policy(&self) -> &OffsetPolicy {
        &self.policy
    }

    /// Resolve the start offset of one partition.
    pub fn resolve(
        &self,
        source: &dyn OffsetSource,
        partition: &Partition,
    ) -> Result<i64, TransportError> {
        if let Some(as_of) = self.policy.as_of_date() {
            let found =
                source.offset_for_timestamp(partition, as_of.timestamp_millis(), self.timeout)?;
            return match found {
                Some(offset) => Ok(offset),
                // nothing at or after the date yet: start at the end of the log
                None => source
                    .watermarks(partition, self.timeout)
                    .map(|(_, high)| high),
            };
        }

        let (low, high) = source.watermarks(partition, self.timeout)?;
        let base = match self.policy.kind() {
            OffsetKind::Begin => low,
            OffsetKind::End => high,
            OffsetKind::Stored => source.committed(partition, self.timeout)?.unwrap_or(low),
            OffsetKind::StoredOrEnd => source.committed(partition, self.timeout)?.unwrap_or(high),
        };

        Ok(clamp_offset(base.saturating_add(self.policy.bias()), low, high))
    }

    /// Resolve every partition, leaving out the ones whose queries failed so the
    /// transport falls back to its default start position for them.
    pub fn resolve_all(
        &self,
        source: &dyn OffsetSource,
        partitions: &[Partition],
    ) -> Vec<PartitionOffset> {
        let kind = if self.policy.as_of_date().is_some() {
            "as_of"
        } else {
            self.policy.kind().as_str()
        };

        partitions
            .iter()
            .filter_map(|partition| match self.resolve(source, partition) {
                Ok(offset) => {
                    info!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset = offset,
                        policy = kind,
                        bias = self.policy.bias(),
                        "Resolved start offset"
                    );
                    metrics::counter!(OFFSETS_RESOLVED, "kind" => kind).increment(1);
                    Some(PartitionOffset::new(partition.clone(), offset))
                }
                Err(e) => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        policy = kind,
                        error = ?e,
                        "Failed to resolve start offset - using transport default"
                    );
                    metrics::counter!(
                        OFFSET_RESOLUTION_ERRORS,
                        "error_type" => e.error_type()
                    )
                    .increment(1);
                    None
                }
            })
            .collect()
    }
}

/// Assignment listener seeding newly assigned partitions from an offset policy.
/// Without a policy the transport's own start position is kept.
pub struct OffsetAssignmentListener {
    resolver: Option<OffsetResolver>,
}

impl OffsetAssignmentListener {
    pub fn new(resolver: Option<OffsetResolver>) -> Self {
        Self { resolver }
    }
}

impl AssignmentListener for OffsetAssignmentListener {
    fn on_assigned(
        &self,
        source: &dyn OffsetSource,
        partitions: &[Partition],
    ) -> Vec<PartitionOffset> {
        info!(count = partitions.len(), "Partitions assigned");
        match &self.resolver {
            Some(resolver) => resolver.resolve_all(source, partitions),
            None => vec![],
        }
    }

    fn on_revoked(&self, partitions: &[Partition]) {
        info!(count = partitions.len(), "Partitions revoked");
    }
}
