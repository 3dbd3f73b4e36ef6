// Kafka module - message model, transport contract and offset resolution
pub mod batch_message;
pub mod config;
pub mod consumer;
pub mod message;
pub mod metrics_consts;
pub mod offset_resolver;
pub mod transport;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use batch_message::Batch;
pub use config::ConsumerConfigBuilder;
pub use consumer::{KafkaTransport, KafkaTransportFactory};
pub use message::{CommitState, Committable, Message};
pub use offset_resolver::{OffsetAssignmentListener, OffsetResolver};
pub use transport::{AssignmentListener, Committer, OffsetSource, Transport, TransportFactory};
pub use types::{Partition, PartitionOffset, RawRecord};
