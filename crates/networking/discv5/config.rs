use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use crate::types::NodeRecord;

pub const DEFAULT_UDP_PORT: u16 = 30303;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_PENDING_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_FULFILLED_SWEEP_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_SESSION_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_BUCKET_SIZE: usize = 16;
pub const DEFAULT_REPLACEMENT_CACHE_SIZE: usize = 16;
pub const DEFAULT_MAX_ALLOWED_FAILURES: u32 = 3;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 3;
/// Max number of records returned in a single FINDNODE reply.
pub const DEFAULT_MAX_NODES_PER_RESPONSE: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("receive timeout ({receive:?}) is shorter than the request timeout ({request:?})")]
    ReceiveTimeoutTooShort { receive: Duration, request: Duration },
}

/// Configuration of a discovery node.
#[derive(Debug, Clone)]
pub struct Discv5Config {
    /// Address the UDP socket binds to.
    pub listen_ip: IpAddr,
    /// 0 binds an ephemeral port, the bound one is advertised.
    pub udp_port: u16,
    /// IP advertised in our record. Defaults to `listen_ip` when it isn't unspecified.
    pub external_ip: Option<IpAddr>,

    /// How long a request waits for its reply before counting as a failure.
    pub request_timeout: Duration,
    /// How long callers of the public handle wait for a reply.
    pub receive_timeout: Duration,
    pub pending_sweep_interval: Duration,
    pub fulfilled_sweep_interval: Duration,

    pub session_cache_capacity: usize,
    pub bucket_size: usize,
    pub replacement_cache_size: usize,
    /// Consecutive failures tolerated before a node is considered dead.
    pub max_allowed_failures: u32,

    /// Entries not seen for this long get pinged.
    pub ping_interval: Duration,
    /// Dead entries are replaced and a random lookup is run this often.
    pub refresh_interval: Duration,
    /// Self lookups keep our neighbourhood populated.
    pub lookup_interval: Duration,
    /// Number of nodes queried in parallel during a lookup.
    pub lookup_concurrency: usize,
    pub max_nodes_per_response: usize,

    /// At most one WHOAREYOU per source endpoint within this window.
    pub whoareyou_rate_limit: Duration,
    /// Outbound nonce and rate limit bookkeeping is pruned this often.
    pub cleanup_interval: Duration,

    /// Records inserted at startup before the first lookup.
    pub bootnodes: Vec<NodeRecord>,
}

impl Default for Discv5Config {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: DEFAULT_UDP_PORT,
            external_ip: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            receive_timeout: Duration::from_secs(2),
            pending_sweep_interval: DEFAULT_PENDING_SWEEP_INTERVAL,
            fulfilled_sweep_interval: DEFAULT_FULFILLED_SWEEP_INTERVAL,
            session_cache_capacity: DEFAULT_SESSION_CACHE_CAPACITY,
            bucket_size: DEFAULT_BUCKET_SIZE,
            replacement_cache_size: DEFAULT_REPLACEMENT_CACHE_SIZE,
            max_allowed_failures: DEFAULT_MAX_ALLOWED_FAILURES,
            ping_interval: DEFAULT_PING_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            lookup_interval: Duration::from_secs(30),
            lookup_concurrency: DEFAULT_LOOKUP_CONCURRENCY,
            max_nodes_per_response: DEFAULT_MAX_NODES_PER_RESPONSE,
            whoareyou_rate_limit: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(5),
            bootnodes: Vec::new(),
        }
    }
}

impl Discv5Config {
    /// Rejects settings the node can't run with. Called before anything is bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("session_cache_capacity", self.session_cache_capacity),
            ("bucket_size", self.bucket_size),
            ("lookup_concurrency", self.lookup_concurrency),
            ("max_nodes_per_response", self.max_nodes_per_response),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }

        let intervals = [
            ("request_timeout", self.request_timeout),
            ("receive_timeout", self.receive_timeout),
            ("pending_sweep_interval", self.pending_sweep_interval),
            ("fulfilled_sweep_interval", self.fulfilled_sweep_interval),
            ("ping_interval", self.ping_interval),
            ("refresh_interval", self.refresh_interval),
            ("lookup_interval", self.lookup_interval),
            ("cleanup_interval", self.cleanup_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Zero(name));
        }

        if self.receive_timeout < self.request_timeout {
            return Err(ConfigError::ReceiveTimeoutTooShort {
                receive: self.receive_timeout,
                request: self.request_timeout,
            });
        }
        Ok(())
    }

    /// IP to put in our record.
    pub fn advertised_ip(&self) -> IpAddr {
        match self.external_ip {
            Some(ip) => ip,
            None if self.listen_ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => self.listen_ip,
        }
    }
}
