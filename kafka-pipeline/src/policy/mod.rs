//! # Policy
//!
//! Typed policy values attached to a handler and the validated `PolicySet` the
//! pipeline compiler consumes. Policies come from either the builder API or the
//! inline configuration string (see [`parser`]); both front ends produce the same
//! `PolicySet`. No policy is mutated once a pipeline has been built from it.
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

pub mod offset;
pub mod parser;

pub use offset::{OffsetKind, OffsetPolicy};
pub use parser::{parse_inline, InlineConfig};

/// Retries used when no Retry or Skip policy is configured.
pub const DEFAULT_RETRY_COUNT: i32 = 3;
/// Base backoff used when no Retry policy is configured, or when one omits its delay.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Upper bound of a single retry backoff.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Number of in-flight items a Buffer stage accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    pub size: usize,
}

/// Size- or time-bounded batching. A zero `time` disables the flush timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub size: usize,
    pub time: Duration,
}

/// How a message is mapped to a parallel lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupBy {
    Partition,
    Key,
    /// A named field of the decoded value, read through a selector registered
    /// with the subscription request
    Field(String),
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupBy::Partition => f.write_str("partition"),
            GroupBy::Key => f.write_str("key"),
            GroupBy::Field(name) => write!(f, "field:{name}"),
        }
    }
}

/// Grouped parallelism. `degree` is -1 for one lane per distinct group key, or
/// N > 0 for `key mod N` lanes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelPolicy {
    pub by: GroupBy,
    pub degree: i32,
}

impl ParallelPolicy {
    pub const UNBOUNDED: i32 = -1;

    /// Lane count, or None when every group key gets its own lane.
    pub fn lanes(&self) -> Option<u64> {
        u64::try_from(self.degree).ok().filter(|n| *n > 0)
    }
}

/// What happens when the user action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Report the failure and move on to the next item.
    Skip,
    /// Retry `retries` times (-1 retries forever) with exponential backoff from `delay`.
    Retry { retries: i32, delay: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Retry {
            retries: DEFAULT_RETRY_COUNT,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub const INFINITE: i32 = -1;

    pub fn retry(retries: i32, delay: Duration) -> Self {
        RetryPolicy::Retry { retries, delay }
    }

    pub fn infinite(delay: Duration) -> Self {
        RetryPolicy::Retry {
            retries: Self::INFINITE,
            delay,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, RetryPolicy::Retry { retries, .. } if *retries == Self::INFINITE)
    }

    /// Whether another attempt may follow `failures` consecutive failures of one item.
    pub fn should_retry(&self, failures: u32) -> bool {
        match self {
            RetryPolicy::Skip => false,
            RetryPolicy::Retry { retries, .. } if *retries == Self::INFINITE => true,
            RetryPolicy::Retry { retries, .. } => {
                i64::from(failures) <= i64::from(*retries)
            }
        }
    }

    /// Backoff before retry number `attempt` (0 for the first retry):
    /// `min(2^attempt * delay, 60s)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Skip => Duration::ZERO,
            RetryPolicy::Retry { delay, .. } => 2u32
                .checked_pow(attempt)
                .and_then(|factor| delay.checked_mul(factor))
                .map_or(MAX_RETRY_BACKOFF, |backoff| backoff.min(MAX_RETRY_BACKOFF)),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            RetryPolicy::Retry { retries, .. } if *retries < Self::INFINITE => {
                Err(ConfigError::InvalidArgument {
                    name: "retry".to_string(),
                    message: format!("retry count must be -1 or >= 0, got {retries}"),
                })
            }
            _ => Ok(()),
        }
    }
}

/// One typed policy value, as produced by any discovery front end.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    State { enabled: bool },
    Buffer(BufferPolicy),
    Parallel(ParallelPolicy),
    Batch(BatchPolicy),
    Retry(RetryPolicy),
    Commit,
    Offset(OffsetPolicy),
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Policy::State { .. } => "state",
            Policy::Buffer(_) => "buffer",
            Policy::Parallel(_) => "parallel",
            Policy::Batch(_) => "batch",
            // skip and retry are two settings of the same policy slot
            Policy::Retry(_) => "retry",
            Policy::Commit => "commit",
            Policy::Offset(_) => "offset",
        }
    }
}

/// The validated set of policies for one handler: at most one of each kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicySet {
    state: Option<bool>,
    buffer: Option<BufferPolicy>,
    parallel: Option<ParallelPolicy>,
    batch: Option<BatchPolicy>,
    retry: Option<RetryPolicy>,
    commit: bool,
    offset: Option<OffsetPolicy>,
}

impl PolicySet {
    pub fn builder() -> PolicySetBuilder {
        PolicySetBuilder::default()
    }

    /// Collect policies, rejecting duplicates, then validate the result.
    pub fn from_policies<I>(policies: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = Policy>,
    {
        let mut set = PolicySet::default();
        for policy in policies {
            set.insert(policy)?;
        }
        set.validate()?;
        Ok(set)
    }

    fn insert(&mut self, policy: Policy) -> Result<(), ConfigError> {
        let name = policy.name();
        let duplicate = match policy {
            Policy::State { enabled } => self.state.replace(enabled).is_some(),
            Policy::Buffer(p) => self.buffer.replace(p).is_some(),
            Policy::Parallel(p) => self.parallel.replace(p).is_some(),
            Policy::Batch(p) => self.batch.replace(p).is_some(),
            Policy::Retry(p) => self.retry.replace(p).is_some(),
            Policy::Commit => std::mem::replace(&mut self.commit, true),
            Policy::Offset(p) => self.offset.replace(p).is_some(),
        };
        if duplicate {
            return Err(ConfigError::DuplicatePolicy(name));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(buffer) = &self.buffer {
            if buffer.size < 1 {
                return Err(invalid("buffer", "size must be at least 1"));
            }
        }
        if let Some(batch) = &self.batch {
            if batch.size <= 1 {
                return Err(invalid("batch", "size must be greater than 1"));
            }
        }
        if let Some(parallel) = &self.parallel {
            if parallel.degree == 0 || parallel.degree < ParallelPolicy::UNBOUNDED {
                return Err(invalid("parallel", "degree must be -1 or at least 1"));
            }
            if let GroupBy::Field(name) = &parallel.by {
                if name.is_empty() {
                    return Err(invalid("parallel", "field name must not be empty"));
                }
            }
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(offset) = &self.offset {
            offset.validate()?;
        }
        Ok(())
    }

    /// False when a State policy disables the handler.
    pub fn is_enabled(&self) -> bool {
        self.state.unwrap_or(true)
    }

    pub fn buffer(&self) -> Option<&BufferPolicy> {
        self.buffer.as_ref()
    }

    pub fn parallel(&self) -> Option<&ParallelPolicy> {
        self.parallel.as_ref()
    }

    pub fn batch(&self) -> Option<&BatchPolicy> {
        self.batch.as_ref()
    }

    /// The configured retry policy, if any. See `effective_retry` for the one
    /// actually applied.
    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn effective_retry(&self) -> RetryPolicy {
        self.retry.unwrap_or_default()
    }

    pub fn commit(&self) -> bool {
        self.commit
    }

    pub fn offset(&self) -> Option<&OffsetPolicy> {
        self.offset.as_ref()
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidArgument {
        name: name.to_string(),
        message: message.to_string(),
    }
}

/// Builder front end for `PolicySet`.
///
/// ```ignore
/// let policies = PolicySet::builder()
///     .buffer(20)
///     .batch(10, Duration::from_millis(500))
///     .retry(3, Duration::from_millis(100))
///     .commit()
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct PolicySetBuilder {
    policies: Vec<Policy>,
}

impl PolicySetBuilder {
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn state(self, enabled: bool) -> Self {
        self.policy(Policy::State { enabled })
    }

    pub fn buffer(self, size: usize) -> Self {
        self.policy(Policy::Buffer(BufferPolicy { size }))
    }

    pub fn batch(self, size: usize, time: Duration) -> Self {
        self.policy(Policy::Batch(BatchPolicy { size, time }))
    }

    pub fn parallel(self, by: GroupBy, degree: i32) -> Self {
        self.policy(Policy::Parallel(ParallelPolicy { by, degree }))
    }

    pub fn retry(self, retries: i32, delay: Duration) -> Self {
        self.policy(Policy::Retry(RetryPolicy::retry(retries, delay)))
    }

    pub fn skip(self) -> Self {
        self.policy(Policy::Retry(RetryPolicy::Skip))
    }

    pub fn commit(self) -> Self {
        self.policy(Policy::Commit)
    }

    pub fn offset(self, offset: OffsetPolicy) -> Self {
        self.policy(Policy::Offset(offset))
    }

    pub fn build(self) -> Result<PolicySet, ConfigError> {
        PolicySet::from_policies(self.policies)
    }
}
