//! `ClusterClient`: slot-aware command dispatch over a set of per-node
//! pools, following `MOVED`/`ASK`/`TRYAGAIN` redirection until a response
//! is obtained or the retry budget is exhausted.
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{debug, trace, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::aio::ConnectionLike;
use crate::cmd::{cmd, Cmd};
use crate::connection::{parse_url, ConnectionInfo, PoolConfig};
use crate::types::{ErrorKind, RedisError, RedisResult, Value};

use super::pool::ClusterConnectionPool;
use super::topology::{parse_cluster_slots, slot_for_keys, SlotMap};

/// After this many consecutive `MOVED` redirects for one call, give up —
/// a well-formed cluster converges in far fewer hops than this.
const MAX_MOVED_REDIRECTS: usize = 16;
/// How many times a connection error triggers a topology refresh and
/// retry before the call gives up.
const DEFAULT_REINITIALIZE_STEPS: usize = 3;
/// Bound on `TRYAGAIN` retries; each attempt backs off exponentially
/// starting from this base delay.
const TRYAGAIN_MAX_RETRIES: usize = 5;
const TRYAGAIN_BASE_DELAY: Duration = Duration::from_millis(10);

/// Commands that touch no key and are routed by fan-out or a random
/// master rather than by slot. `KEYS`/`SCAN` style fan-out is left to
/// callers (the router gives them the full master list via
/// [`ClusterClient::master_addrs`]); what's listed here just needs *a*
/// connection to execute against.
fn is_keyless(name: &str) -> bool {
    matches!(name, "PING" | "INFO" | "CLIENT" | "CLUSTER" | "ECHO" | "CONFIG" | "DBSIZE" | "FLUSHALL" | "FLUSHDB")
}

struct ClusterInner {
    startup_nodes: Vec<ConnectionInfo>,
    pools: ClusterConnectionPool,
    topology: ArcSwap<SlotMap>,
    refresh_lock: AsyncMutex<()>,
    readonly: bool,
    reinitialize_steps: usize,
}

/// A cluster-aware client: routes each command to the node that owns its
/// key's slot, following redirects and refreshing the topology as the
/// cluster reshapes itself.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
}

impl ClusterClient {
    /// Builds a client from a set of `redis://`/`rediss://` seed URLs.
    /// The first URL's credentials/TLS/timeouts become the template used
    /// when connecting to every other node discovered via `CLUSTER SLOTS`.
    pub fn new(urls: &[&str], readonly: bool) -> RedisResult<Self> {
        if urls.is_empty() {
            return Err(RedisError::from((ErrorKind::InvalidClientConfig, "cluster client needs at least one startup node")));
        }
        let mut startup_nodes = Vec::with_capacity(urls.len());
        let mut template: Option<ConnectionInfo> = None;
        let mut per_node_config = PoolConfig::default();
        for url in urls {
            let (info, pool_config) = parse_url(url, false)?;
            if template.is_none() {
                template = Some(info.clone());
                per_node_config = pool_config;
            }
            startup_nodes.push(info);
        }
        let template = template.unwrap();

        let inner = ClusterInner {
            startup_nodes,
            pools: ClusterConnectionPool::new(template, per_node_config, readonly),
            topology: ArcSwap::from_pointee(SlotMap::new()),
            refresh_lock: AsyncMutex::new(()),
            readonly,
            reinitialize_steps: DEFAULT_REINITIALIZE_STEPS,
        };
        Ok(ClusterClient { inner: Arc::new(inner) })
    }

    /// Performs the initial `CLUSTER SLOTS` bootstrap against the startup
    /// nodes. Must be called (or implicitly triggered by the first
    /// `execute`) before any command can be routed.
    pub async fn bootstrap(&self) -> RedisResult<()> {
        self.refresh_topology().await
    }

    pub fn master_addrs(&self) -> Vec<String> {
        self.inner.topology.load().master_addrs()
    }

    async fn refresh_topology(&self) -> RedisResult<()> {
        let _guard = self.inner.refresh_lock.lock().await;

        let candidates: Vec<String> = {
            let current = self.inner.topology.load();
            if current.is_empty() {
                self.inner.startup_nodes.iter().map(|info| info.addr.to_string()).collect()
            } else {
                current.master_addrs()
            }
        };

        let slots_cmd = {
            let mut c = cmd("CLUSTER");
            c.arg("SLOTS");
            c
        };

        let mut last_err = None;
        for addr in &candidates {
            let pool = match self.inner.pools.pool_for(addr) {
                Ok(pool) => pool,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            let mut conn = match pool.acquire().await {
                Ok(conn) => conn,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            match conn.req_packed_command(&slots_cmd).await {
                Ok(value) => match parse_cluster_slots(&value) {
                    Ok(new_topology) => {
                        trace!("refreshed cluster topology from {addr}: {} slots covered", new_topology.node_addrs().len());
                        self.inner.pools.prune_to(&new_topology.node_addrs());
                        self.inner.topology.store(Arc::new(new_topology));
                        return Ok(());
                    }
                    Err(err) => last_err = Some(err),
                },
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| RedisError::from((ErrorKind::ClusterDown, "no startup node answered CLUSTER SLOTS"))))
    }

    fn addr_for_slot(&self, slot: u16) -> Option<String> {
        self.inner.topology.load().owner_for_slot(slot, self.inner.readonly).map(|n| n.addr())
    }

    /// Acquires a pooled connection to the node owning `slot`, or to any
    /// known master if `slot` is `None` (a keyless/all-keyless batch).
    /// Used by [`crate::pipeline::ClusterPipeline`] to bind a whole
    /// `MULTI`/`EXEC` batch to one node.
    pub async fn acquire(&self, slot: Option<u16>) -> RedisResult<crate::pool::PooledConnection> {
        if self.inner.topology.load().is_empty() {
            self.bootstrap().await?;
        }
        let addr = match slot {
            Some(slot) => match self.addr_for_slot(slot) {
                Some(addr) => addr,
                None => {
                    self.refresh_topology().await?;
                    self.addr_for_slot(slot).ok_or_else(|| RedisError::from((ErrorKind::ClusterDown, "no node owns the requested slot")))?
                }
            },
            None => self
                .master_addrs()
                .into_iter()
                .next()
                .ok_or_else(|| RedisError::from((ErrorKind::ClusterDown, "cluster topology has no known masters")))?,
        };
        self.inner.pools.pool_for(&addr)?.acquire().await
    }

    /// Resolves the node owning `channel`'s slot and returns connection
    /// parameters for it, for opening a dedicated pub/sub connection
    /// pinned to that node (per-spec: pattern subscriptions are not
    /// guaranteed to span every node, only the one this pins to).
    pub async fn pubsub_connection_info(&self, channel: &str) -> RedisResult<ConnectionInfo> {
        let slot = super::topology::key_slot(channel.as_bytes());
        if self.inner.topology.load().is_empty() {
            self.bootstrap().await?;
        }
        let addr = match self.addr_for_slot(slot) {
            Some(addr) => addr,
            None => {
                self.refresh_topology().await?;
                self.addr_for_slot(slot).ok_or_else(|| RedisError::from((ErrorKind::ClusterDown, "no node owns the requested slot")))?
            }
        };
        self.inner.pools.connection_info_for(&addr)
    }

    /// Publishes to `channel` on the node that owns its slot; Redis
    /// Cluster fans the message out to every subscriber internally from
    /// there, so routing only the publish itself is sufficient.
    pub async fn publish(&self, channel: &str, message: &[u8]) -> RedisResult<Value> {
        let slot = super::topology::key_slot(channel.as_bytes());
        let mut conn = self.acquire(Some(slot)).await?;
        let mut command = cmd("PUBLISH");
        command.arg(channel).arg(message);
        conn.req_packed_command(&command).await
    }

    /// Dispatches a single-key (or keyless) command, following
    /// redirection until it completes or the retry budgets run out.
    pub async fn execute(&self, command: &Cmd) -> RedisResult<Value> {
        if self.inner.topology.load().is_empty() {
            self.bootstrap().await?;
        }

        let keys = command.keys();
        let slot = if is_keyless(&command.name()) { None } else { slot_for_keys(&keys)? };

        let mut target_addr = match slot {
            Some(slot) => match self.addr_for_slot(slot) {
                Some(addr) => addr,
                None => {
                    self.refresh_topology().await?;
                    self.addr_for_slot(slot).ok_or_else(|| RedisError::from((ErrorKind::ClusterDown, "no node owns the requested slot")))?
                }
            },
            None => self
                .master_addrs()
                .into_iter()
                .next()
                .ok_or_else(|| RedisError::from((ErrorKind::ClusterDown, "cluster topology has no known masters")))?,
        };

        let mut moved_count = 0;
        let mut reinit_count = 0;
        let mut tryagain_count = 0;
        let mut asking = false;

        loop {
            let pool = self.inner.pools.pool_for(&target_addr)?;
            let mut conn = pool.acquire().await?;

            if asking {
                let asking_cmd = cmd("ASKING");
                conn.req_packed_command(&asking_cmd).await?;
                asking = false;
            }

            match conn.req_packed_command(command).await {
                Ok(value) => return crate::callbacks::apply(&command.name(), value),
                Err(err) => {
                    drop(conn);
                    match err.kind() {
                        ErrorKind::Moved => {
                            moved_count += 1;
                            if moved_count > MAX_MOVED_REDIRECTS {
                                return Err(RedisError::from((
                                    ErrorKind::ClusterTopologyExhausted,
                                    "too many consecutive MOVED redirects",
                                )));
                            }
                            let (moved_slot, new_addr) = err
                                .redirect_target()
                                .ok_or_else(|| RedisError::from((ErrorKind::ResponseError, "MOVED error missing redirect target")))?;
                            debug!("MOVED {moved_slot} -> {new_addr}");
                            self.refresh_topology().await?;
                            target_addr = self.addr_for_slot(moved_slot).unwrap_or(new_addr);
                        }
                        ErrorKind::Ask => {
                            let (_slot, new_addr) = err
                                .redirect_target()
                                .ok_or_else(|| RedisError::from((ErrorKind::ResponseError, "ASK error missing redirect target")))?;
                            debug!("ASK -> {new_addr}");
                            target_addr = new_addr;
                            asking = true;
                        }
                        ErrorKind::TryAgain => {
                            tryagain_count += 1;
                            if tryagain_count > TRYAGAIN_MAX_RETRIES {
                                return Err(err);
                            }
                            tokio::time::sleep(TRYAGAIN_BASE_DELAY * 2u32.pow(tryagain_count as u32 - 1)).await;
                        }
                        ErrorKind::ClusterDown => return Err(err),
                        _ if err.is_connection_dropped() => {
                            reinit_count += 1;
                            if reinit_count > self.inner.reinitialize_steps {
                                return Err(err);
                            }
                            warn!("connection to {target_addr} dropped, refreshing topology (attempt {reinit_count})");
                            self.refresh_topology().await?;
                            target_addr = match slot {
                                Some(slot) => self.addr_for_slot(slot).unwrap_or(target_addr),
                                None => self.master_addrs().into_iter().next().unwrap_or(target_addr),
                            };
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::parser::ValueDecoder;

    use super::*;

    #[test]
    fn keyless_allowlist_covers_admin_commands() {
        assert!(is_keyless("CLUSTER"));
        assert!(is_keyless("PING"));
        assert!(!is_keyless("GET"));
    }

    /// Builds the raw RESP reply for a `CLUSTER SLOTS` call describing one
    /// full-range slot owned by a single master, no replicas.
    fn cluster_slots_reply(port: u16) -> Vec<u8> {
        let host = "127.0.0.1";
        format!(
            "*1\r\n*3\r\n:0\r\n:16383\r\n*2\r\n${}\r\n{}\r\n:{}\r\n",
            host.len(),
            host,
            port
        )
        .into_bytes()
    }

    async fn command_name(decoder: &mut ValueDecoder, buf: &mut BytesMut) -> Option<String> {
        let value = decoder.decode(buf).ok()??;
        match value {
            Value::Bulk(items) => items.first().and_then(Value::as_data).map(|d| String::from_utf8_lossy(d).to_uppercase()),
            _ => None,
        }
    }

    /// A node that always answers `CLUSTER SLOTS` with the full range
    /// pointing at itself and every other command with `+OK`.
    async fn spawn_plain_node() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let port = addr.port();
                tokio::spawn(async move {
                    let mut decoder = ValueDecoder::new();
                    let mut buf = BytesMut::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some(name) = command_name(&mut decoder, &mut buf).await {
                            let reply: Vec<u8> = if name == "CLUSTER" {
                                cluster_slots_reply(port)
                            } else {
                                b"+OK\r\n".to_vec()
                            };
                            if socket.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// A node that owns the whole keyspace until the first `GET`, which it
    /// redirects with `MOVED` to `target_port`; every command thereafter
    /// (and every subsequent `CLUSTER SLOTS`) reports the range as owned by
    /// `target_port`, simulating a topology change that has already
    /// propagated by the time the client re-queries it.
    async fn spawn_moving_node(target_port: u16) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let moved = StdArc::new(AtomicBool::new(false));
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let moved = moved.clone();
                let own_port = addr.port();
                tokio::spawn(async move {
                    let mut decoder = ValueDecoder::new();
                    let mut buf = BytesMut::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some(name) = command_name(&mut decoder, &mut buf).await {
                            let reply: Vec<u8> = if name == "CLUSTER" {
                                let owner = if moved.load(Ordering::SeqCst) { target_port } else { own_port };
                                cluster_slots_reply(owner)
                            } else if name == "GET" && !moved.swap(true, Ordering::SeqCst) {
                                format!("-MOVED 0 127.0.0.1:{target_port}\r\n").into_bytes()
                            } else {
                                b"+OK\r\n".to_vec()
                            };
                            if socket.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn execute_follows_a_moved_redirect_to_the_new_owner() {
        let _ = env_logger::try_init();
        let owner_addr = spawn_plain_node().await;
        let origin_addr = spawn_moving_node(owner_addr.port()).await;

        let client = ClusterClient::new(&[&format!("redis://127.0.0.1:{}", origin_addr.port())], false).unwrap();
        client.bootstrap().await.unwrap();

        let mut get = cmd("GET");
        get.arg("somekey");
        let value = client.execute(&get).await.unwrap();
        assert!(value.looks_like_ok());

        // The redirect should have repointed the slot at the new owner.
        assert_eq!(client.addr_for_slot(0), Some(owner_addr.to_string()));
    }

    #[tokio::test]
    async fn execute_routes_a_value_bearing_single_key_command_without_cross_slot() {
        let addr = spawn_plain_node().await;
        let client = ClusterClient::new(&[&format!("redis://127.0.0.1:{}", addr.port())], false).unwrap();
        client.bootstrap().await.unwrap();

        let mut rpush = cmd("RPUSH");
        rpush.arg("a{foo}").arg("1").arg("2");
        let value = client.execute(&rpush).await.unwrap();
        assert!(value.looks_like_ok());

        let mut set = cmd("SET");
        set.arg("{foo}a").arg("1");
        let value = client.execute(&set).await.unwrap();
        assert_eq!(value, crate::types::Value::Int(1));
    }
}
