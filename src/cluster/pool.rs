//! Per-node pool-of-pools: one [`Pool`] per cluster node address, built
//! lazily as the topology introduces new nodes and pruned as it drops
//! stale ones.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::{ConnectionAddr, ConnectionInfo, PoolConfig};
use crate::pool::Pool;
use crate::types::{ErrorKind, RedisError, RedisResult};

/// Builds the per-node [`ConnectionInfo`] by grafting a node's `host:port`
/// onto the cluster's shared auth/TLS/timeout template.
pub fn connection_info_for_node(template: &ConnectionInfo, addr: &str) -> RedisResult<ConnectionInfo> {
    let (host, port) = addr
        .rsplit_once(':')
        .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
        .ok_or_else(|| RedisError::from((ErrorKind::InvalidClientConfig, "invalid cluster node address")))?;

    let mut info = template.clone();
    info.addr = match &template.addr {
        ConnectionAddr::TcpTls { insecure, .. } => ConnectionAddr::TcpTls { host, port, insecure: *insecure },
        _ => ConnectionAddr::Tcp(host, port),
    };
    Ok(info)
}

/// A per-node map of [`Pool`]s sharing one `max_connections_per_node` cap
/// and one connection template (credentials, TLS, timeouts).
pub struct ClusterConnectionPool {
    template: ConnectionInfo,
    per_node_config: PoolConfig,
    readonly: bool,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
}

impl ClusterConnectionPool {
    pub fn new(template: ConnectionInfo, per_node_config: PoolConfig, readonly: bool) -> Self {
        ClusterConnectionPool { template, per_node_config, readonly, pools: Mutex::new(HashMap::new()) }
    }

    /// Returns the pool for `addr`, creating it on first reference.
    pub fn pool_for(&self, addr: &str) -> RedisResult<Arc<Pool>> {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(addr) {
            return Ok(pool.clone());
        }
        let info = connection_info_for_node(&self.template, addr)?;
        let pool = Arc::new(Pool::new(info, self.per_node_config.clone(), self.readonly));
        pools.insert(addr.to_string(), pool.clone());
        Ok(pool)
    }

    /// Drops any per-node pool not present in the latest topology, closing
    /// whatever connections it still held idle.
    pub fn prune_to(&self, live_addrs: &[String]) {
        let mut pools = self.pools.lock().unwrap();
        pools.retain(|addr, _| live_addrs.contains(addr));
    }

    pub fn known_addrs(&self) -> Vec<String> {
        self.pools.lock().unwrap().keys().cloned().collect()
    }

    /// Builds the per-node [`ConnectionInfo`] for `addr` without opening a
    /// pooled connection, for callers (pub/sub) that need a dedicated,
    /// long-lived connection outside the pool.
    pub fn connection_info_for(&self, addr: &str) -> RedisResult<ConnectionInfo> {
        connection_info_for_node(&self.template, addr)
    }
}
