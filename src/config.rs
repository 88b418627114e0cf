//! Router configuration.
//!
//! All limits that bound per-node memory live here so a deployment can tune
//! them in one place. [`DhtConfig::default`] gives the values the protocol
//! was designed around; tests shrink the thresholds to provoke congestion.

use tokio::time::Duration;

/// Redundant trails kept per finger.
pub const DEFAULT_MAX_TRAILS_PER_FINGER: usize = 2;

/// Routing entries a node carries before it starts rejecting trail setups.
pub const DEFAULT_ROUTING_TABLE_THRESHOLD: usize = 64;

/// Trails through a single friend before it stops being chosen as a first hop.
pub const DEFAULT_FRIEND_TRAIL_THRESHOLD: u32 = 64;

/// Cooldown advertised in `TrailRejected`.
pub const DEFAULT_CONGESTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum frames queued for a single friend.
pub const MAXIMUM_PENDING_PER_PEER: usize = 64;

/// Lifetime of a queued frame before it is dropped unsent.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lower bound of the randomized finger search interval.
pub const DHT_MINIMUM_FIND_PEER_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound of the randomized finger search interval.
pub const DHT_MAXIMUM_FIND_PEER_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub const DEFAULT_VERIFY_SUCCESSOR_INTERVAL: Duration = Duration::from_secs(15);

/// How long a discovery round waits for its setup result.
pub const DEFAULT_TRAIL_SETUP_TIMEOUT: Duration = Duration::from_secs(20);

pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests that have travelled this many hops are dropped.
pub const DEFAULT_MAX_HOPS: u32 = 64;

/// Upper bound on the replication level carried by PUT and GET.
pub const MAXIMUM_REPLICATION_LEVEL: u32 = 16;

/// Distinct keys held by the in-memory content store.
pub const DEFAULT_STORE_CAPACITY: usize = 100_000;

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub max_trails_per_finger: usize,
    pub routing_table_threshold: usize,
    pub friend_trail_threshold: u32,
    pub congestion_timeout: Duration,
    pub max_pending_per_peer: usize,
    pub message_timeout: Duration,
    pub find_peer_min_interval: Duration,
    pub find_peer_max_interval: Duration,
    pub verify_successor_interval: Duration,
    pub trail_setup_timeout: Duration,
    pub get_timeout: Duration,
    pub max_hops: u32,
    pub store_capacity: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            max_trails_per_finger: DEFAULT_MAX_TRAILS_PER_FINGER,
            routing_table_threshold: DEFAULT_ROUTING_TABLE_THRESHOLD,
            friend_trail_threshold: DEFAULT_FRIEND_TRAIL_THRESHOLD,
            congestion_timeout: DEFAULT_CONGESTION_TIMEOUT,
            max_pending_per_peer: MAXIMUM_PENDING_PER_PEER,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            find_peer_min_interval: DHT_MINIMUM_FIND_PEER_INTERVAL,
            find_peer_max_interval: DHT_MAXIMUM_FIND_PEER_INTERVAL,
            verify_successor_interval: DEFAULT_VERIFY_SUCCESSOR_INTERVAL,
            trail_setup_timeout: DEFAULT_TRAIL_SETUP_TIMEOUT,
            get_timeout: DEFAULT_GET_TIMEOUT,
            max_hops: DEFAULT_MAX_HOPS,
            store_capacity: DEFAULT_STORE_CAPACITY,
        }
    }
}

impl DhtConfig {
    /// Short intervals for simulations and tests.
    pub fn fast() -> Self {
        Self {
            find_peer_min_interval: Duration::from_millis(50),
            find_peer_max_interval: Duration::from_millis(150),
            verify_successor_interval: Duration::from_millis(100),
            trail_setup_timeout: Duration::from_millis(500),
            get_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_trails_per_finger == 0 {
            anyhow::bail!("max_trails_per_finger must be at least 1");
        }
        if self.max_pending_per_peer == 0 {
            anyhow::bail!("max_pending_per_peer must be at least 1");
        }
        if self.find_peer_min_interval > self.find_peer_max_interval {
            anyhow::bail!(
                "find_peer_min_interval ({:?}) exceeds find_peer_max_interval ({:?})",
                self.find_peer_min_interval,
                self.find_peer_max_interval
            );
        }
        for (name, value) in [
            ("verify_successor_interval", self.verify_successor_interval),
            ("trail_setup_timeout", self.trail_setup_timeout),
            ("get_timeout", self.get_timeout),
        ] {
            if value.is_zero() {
                anyhow::bail!("{name} must be non-zero");
            }
        }
        if self.max_hops == 0 {
            anyhow::bail!("max_hops must be at least 1");
        }
        if self.store_capacity == 0 {
            anyhow::bail!("store_capacity must be at least 1");
        }
        Ok(())
    }
}
