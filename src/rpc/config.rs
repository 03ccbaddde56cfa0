use std::time::Duration;

use crate::common::{Id, MAX_BUCKET_SIZE_K};

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Default timeout of the liveness probe sent before evicting a contact.
pub const DEFAULT_PING_TTL: Duration = Duration::from_secs(5);
/// Default interval after which an untouched bucket is refreshed.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Default number of parallel probes per lookup round.
pub const DEFAULT_ALPHA: usize = 3;

#[derive(Debug, Clone)]
/// Node configurations, fixed at construction.
pub struct Config {
    /// This node's [Id].
    ///
    /// Defaults to None, where a random Id is generated.
    pub id: Option<Id>,
    /// Bucket size, also the number of contacts returned by FIND_NODE and the
    /// replication factor of `put`.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Number of concurrent probes per lookup round.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Request timeout duration.
    ///
    /// The longer this duration is, the longer lookups take until they converge.
    /// The shorter it is, the more responses from busy nodes we miss out on.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// How long the least recently seen contact of a full bucket has to answer
    /// a ping before it is replaced by a newcomer.
    ///
    /// Zero evicts on the first expiry check, tests use it to skip the grace period.
    ///
    /// Defaults to [DEFAULT_PING_TTL]
    pub ping_ttl: Duration,
    /// Buckets untouched for this long are refreshed, and the periodic refresh
    /// runs at this interval.
    ///
    /// Defaults to [DEFAULT_REFRESH_INTERVAL]
    pub refresh_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            k: MAX_BUCKET_SIZE_K,
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ping_ttl: DEFAULT_PING_TTL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}
