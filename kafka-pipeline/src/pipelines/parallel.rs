//! Parallel stage - fans one ordered stream out into per-group lanes
//!
//! Every message is mapped to a group key (partition number, key hash or field
//! hash) and from there to a lane: the key itself for unbounded parallelism, or
//! `key mod degree`. Each lane is its own copy of the rest of the pipeline, built
//! lazily by the lane factory the first time the lane is used.
//!
//! Routing happens on the stage runner, one message at a time, so messages that
//! share a lane keep their arrival order. Lanes run independently and may
//! complete out of order relative to each other. Only grouping by partition keeps
//! every partition inside a single lane; with key or field grouping a partition is
//! spread over several lanes, and ordering commits across them is left to the
//! per-partition batch rule of the commit stage.

use std::hash::Hasher;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use siphasher::sip::SipHasher13;
use tracing::{debug, info, warn};

use crate::kafka::message::Message;
use crate::kafka::metrics_consts::PARALLEL_STAGE_LANES;
use crate::pipelines::stage::{Discard, Stage, StageBuilder, StageHandle, StageLogic};

/// Reads a named field from a decoded value, for grouping by field.
pub type FieldSelector<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

/// Builds the remainder of the pipeline for one lane.
pub type LaneFactory<T> = Arc<dyn Fn(u64) -> Arc<dyn Stage<Message<T>>> + Send + Sync>;

pub enum GroupKeySelector<T> {
    Partition,
    Key,
    Field {
        name: String,
        selector: FieldSelector<T>,
    },
}

impl<T> GroupKeySelector<T> {
    pub fn group_key(&self, message: &Message<T>) -> u64 {
        match self {
            GroupKeySelector::Partition => u64::from(message.partition().unsigned_abs()),
            GroupKeySelector::Key => hash_text(message.key().unwrap_or_default()),
            GroupKeySelector::Field { selector, .. } => {
                hash_text(selector(message.value()).as_deref().unwrap_or_default())
            }
        }
    }

    fn label(&self) -> &str {
        match self {
            GroupKeySelector::Partition => "partition",
            GroupKeySelector::Key => "key",
            GroupKeySelector::Field { name, .. } => name.as_str(),
        }
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(text.as_bytes());
    hasher.finish()
}

pub struct ParallelLogic<T> {
    name: String,
    selector: GroupKeySelector<T>,
    lanes_limit: Option<u64>,
    lanes: Arc<DashMap<u64, Arc<dyn Stage<Message<T>>>>>,
    factory: LaneFactory<T>,
}

impl<T: Send + Sync + 'static> ParallelLogic<T> {
    /// `lanes_limit` of None opens one lane per distinct group key.
    pub fn new(
        name: impl Into<String>,
        selector: GroupKeySelector<T>,
        lanes_limit: Option<u64>,
        factory: LaneFactory<T>,
    ) -> Self {
        Self {
            name: name.into(),
            selector,
            lanes_limit,
            lanes: Arc::new(DashMap::new()),
            factory,
        }
    }

    /// Shared view of the lane map, for observing lane count.
    pub fn lanes(&self) -> Arc<DashMap<u64, Arc<dyn Stage<Message<T>>>>> {
        self.lanes.clone()
    }

    fn lane_id(&self, message: &Message<T>) -> u64 {
        let key = self.selector.group_key(message);
        match self.lanes_limit {
            Some(limit) => key % limit,
            None => key,
        }
    }

    /// Get or create the lane, releasing the map guard before returning.
    fn lane(&self, lane_id: u64) -> Arc<dyn Stage<Message<T>>> {
        let lane = self
            .lanes
            .entry(lane_id)
            .or_insert_with(|| {
                debug!(stage = %self.name, lane = lane_id, "Opening lane");
                (self.factory)(lane_id)
            })
            .clone();
        metrics::gauge!(PARALLEL_STAGE_LANES, "stage" => self.name.clone())
            .set(self.lanes.len() as f64);
        lane
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> StageLogic for ParallelLogic<T> {
    type In = Message<T>;
    type Out = Message<T>;

    async fn process(
        &mut self,
        item: Message<T>,
        _downstream: &dyn Stage<Message<T>>,
    ) -> anyhow::Result<()> {
        let lane_id = self.lane_id(&item);
        let lane = self.lane(lane_id);
        let (partition, offset) = (item.partition(), item.offset());

        if !lane.send(item).await {
            warn!(
                stage = %self.name,
                lane = lane_id,
                partition = partition,
                offset = offset,
                "Lane refused message while draining"
            );
        }
        Ok(())
    }

    async fn flush(&mut self, _downstream: &dyn Stage<Message<T>>) -> anyhow::Result<()> {
        let lanes: Vec<Arc<dyn Stage<Message<T>>>> =
            self.lanes.iter().map(|lane| lane.value().clone()).collect();

        info!(
            stage = %self.name,
            lanes = lanes.len(),
            group_by = self.selector.label(),
            "Draining parallel lanes"
        );

        for lane in &lanes {
            lane.complete();
        }
        join_all(lanes.iter().map(|lane| lane.completion())).await;
        Ok(())
    }
}

/// Parallel stage whose lanes each run a pipeline built by `factory`.
pub fn parallel_stage<T: Send + Sync + 'static>(
    name: impl Into<String>,
    selector: GroupKeySelector<T>,
    lanes_limit: Option<u64>,
    factory: LaneFactory<T>,
) -> Arc<StageHandle<Message<T>>> {
    let name = name.into();
    StageBuilder::new(
        name.clone(),
        ParallelLogic::new(name, selector, lanes_limit, factory),
    )
    .link(Arc::new(Discard::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::test_utils::RecordingCommitter;
    use crate::kafka::types::Partition;
    use crate::pipelines::stage::tests::Collect;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<(u64, i32, i64)>>>;

    struct Record {
        lane: u64,
        seen: Seen,
        delay: Duration,
    }

    #[async_trait]
    impl StageLogic for Record {
        type In = Message<String>;
        type Out = Message<String>;

        async fn process(
            &mut self,
            item: Message<String>,
            downstream: &dyn Stage<Message<String>>,
        ) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            self.seen
                .lock()
                .unwrap()
                .push((self.lane, item.partition(), item.offset()));
            downstream.send(item).await;
            Ok(())
        }
    }

    fn recording_factory(seen: Seen, delay: Duration) -> LaneFactory<String> {
        Arc::new(move |lane| {
            let stage: Arc<dyn Stage<Message<String>>> = StageBuilder::new(
                format!("lane-{lane}"),
                Record {
                    lane,
                    seen: seen.clone(),
                    delay,
                },
            )
            .link(Collect::<Message<String>>::new());
            stage
        })
    }

    fn message(
        committer: &Arc<RecordingCommitter>,
        partition: i32,
        offset: i64,
        key: &str,
    ) -> Message<String> {
        Message::new(
            Partition::new("test-topic", partition),
            offset,
            Some(key.to_string()),
            None,
            format!("{{\"customer\":\"{key}\"}}"),
            committer.clone(),
        )
    }

    #[tokio::test]
    async fn test_partition_lanes_preserve_per_partition_order() {
        let committer = Arc::new(RecordingCommitter::new());
        let seen: Seen = Arc::new(Mutex::new(vec![]));
        let stage = parallel_stage(
            "parallel",
            GroupKeySelector::Partition,
            None,
            recording_factory(seen.clone(), Duration::from_millis(1)),
        );

        for offset in 0..20 {
            let partition = (offset % 4) as i32;
            stage
                .send(message(&committer, partition, offset, "k"))
                .await;
        }
        stage.complete();
        stage.completion().await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 20);

        let mut per_partition: HashMap<i32, Vec<i64>> = HashMap::new();
        for (lane, partition, offset) in seen {
            assert_eq!(lane, partition as u64);
            per_partition.entry(partition).or_default().push(offset);
        }
        assert_eq!(per_partition.len(), 4);
        for offsets in per_partition.values() {
            let mut sorted = offsets.clone();
            sorted.sort();
            assert_eq!(offsets, &sorted);
        }
    }

    #[tokio::test]
    async fn test_degree_bounds_lane_count() {
        let committer = Arc::new(RecordingCommitter::new());
        let seen: Seen = Arc::new(Mutex::new(vec![]));
        let logic = ParallelLogic::new(
            "parallel",
            GroupKeySelector::Key,
            Some(3),
            recording_factory(seen.clone(), Duration::ZERO),
        );
        let lanes = logic.lanes();
        let stage = StageBuilder::new("parallel", logic).link(Arc::new(Discard::new()));

        for (offset, key) in ["a", "b", "c", "d", "e", "f", "g", "h"].iter().enumerate() {
            stage
                .send(message(&committer, 0, offset as i64, key))
                .await;
        }
        stage.complete();
        stage.completion().await;

        assert!(lanes.len() <= 3);
        assert!(lanes.iter().all(|lane| *lane.key() < 3));
        assert_eq!(seen.lock().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_same_key_always_maps_to_same_lane() {
        let committer = Arc::new(RecordingCommitter::new());
        let selector = GroupKeySelector::<String>::Key;

        let first = selector.group_key(&message(&committer, 0, 1, "customer-7"));
        let second = selector.group_key(&message(&committer, 5, 99, "customer-7"));
        let other = selector.group_key(&message(&committer, 0, 2, "customer-8"));

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_field_selector_groups_by_value() {
        let committer = Arc::new(RecordingCommitter::new());
        let selector = GroupKeySelector::<String>::Field {
            name: "customer".to_string(),
            selector: Arc::new(|value: &String| {
                serde_json::from_str::<serde_json::Value>(value)
                    .ok()
                    .and_then(|v| v["customer"].as_str().map(str::to_string))
            }),
        };

        let a = selector.group_key(&message(&committer, 0, 1, "alice"));
        let a_again = selector.group_key(&message(&committer, 3, 2, "alice"));
        let b = selector.group_key(&message(&committer, 0, 3, "bob"));

        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_slow_lane_does_not_reorder_other_lanes() {
        let committer = Arc::new(RecordingCommitter::new());
        let seen: Seen = Arc::new(Mutex::new(vec![]));
        let slow_seen = seen.clone();
        let factory: LaneFactory<String> = Arc::new(move |lane| {
            let delay = if lane == 0 {
                Duration::from_millis(30)
            } else {
                Duration::ZERO
            };
            let stage: Arc<dyn Stage<Message<String>>> = StageBuilder::new(
                format!("lane-{lane}"),
                Record {
                    lane,
                    seen: slow_seen.clone(),
                    delay,
                },
            )
            .link(Arc::new(Discard::new()));
            stage
        });
        let stage = parallel_stage("parallel", GroupKeySelector::Partition, None, factory);

        stage.send(message(&committer, 0, 0, "k")).await;
        stage.send(message(&committer, 1, 0, "k")).await;
        stage.send(message(&committer, 1, 1, "k")).await;
        stage.complete();
        stage.completion().await;

        let seen = seen.lock().unwrap().clone();
        // partition 1 finished before the slow partition 0 lane
        assert_eq!(seen.last(), Some(&(0, 0, 0)));
        let partition_one: Vec<i64> = seen
            .iter()
            .filter(|(_, partition, _)| *partition == 1)
            .map(|(_, _, offset)| *offset)
            .collect();
        assert_eq!(partition_one, vec![0, 1]);
    }
}
