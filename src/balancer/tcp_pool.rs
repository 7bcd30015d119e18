//! Fixed-size TCP connection pool over a discovered host list.
//!
//! Simpler sibling of the aperture balancer: it keeps `size` connections
//! dialed against hosts drawn uniformly at random from the supplied list,
//! and hands out connections by power-of-two-choices on availability.
//! Hosts move through three sets keyed by `"host:port"`:
//!
//! ```text
//! free -> connecting -> connected -> (closed -> free, while still listed)
//! ```
//!
//! A given key lives in exactly one of the three sets at any time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionOptions};
use crate::socket::{BoxFuture, RSocket};
use crate::transport::connect_tcp;

/// Pause before re-dialing after a failed connect.
const REDIAL_DELAY: Duration = Duration::from_millis(100);

/// One `host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Set key, `"host:port"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How [`TcpLoadBalancer::get_connection`] picks among connected entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Two random candidates, higher availability wins.
    #[default]
    PowerOfTwoChoices,
    /// Uniform random.
    Random,
}

/// Options for [`TcpLoadBalancer`].
#[derive(Clone)]
pub struct TcpLoadBalancerOptions {
    /// Target pool size.
    pub size: usize,
    /// Selection strategy for `get_connection`.
    pub strategy: SelectionStrategy,
    /// Options applied to every dialed connection.
    pub connection_options: ConnectionOptions,
}

impl Default for TcpLoadBalancerOptions {
    fn default() -> Self {
        Self {
            size: 4,
            strategy: SelectionStrategy::default(),
            connection_options: ConnectionOptions::default(),
        }
    }
}

struct PoolState {
    hosts: Vec<HostPort>,
    free: Vec<HostPort>,
    connecting: HashSet<String>,
    connected: HashMap<String, Arc<Connection>>,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    size: usize,
    connection_options: ConnectionOptions,
    ready_tx: watch::Sender<bool>,
    close_tx: watch::Sender<bool>,
}

/// Fixed-size pool of RSocket connections over a TCP host list.
pub struct TcpLoadBalancer {
    shared: Arc<PoolShared>,
    strategy: SelectionStrategy,
}

impl TcpLoadBalancer {
    /// Seed the free set from `hosts` and dial up to `size` of them.
    pub fn new(hosts: Vec<HostPort>, options: TcpLoadBalancerOptions) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (close_tx, _) = watch::channel(false);

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                free: hosts.clone(),
                hosts,
                connecting: HashSet::new(),
                connected: HashMap::new(),
                closed: false,
            }),
            size: options.size,
            connection_options: options.connection_options,
            ready_tx,
            close_tx,
        });

        shared.fill_deficit();

        Self {
            shared,
            strategy: options.strategy,
        }
    }

    /// Pick a connection per the strategy; `None` while the pool is empty.
    pub fn get_connection(&self) -> Option<Arc<Connection>> {
        let state = self.shared.state.lock().expect("lock poisoned");
        let connections: Vec<&Arc<Connection>> = state.connected.values().collect();

        match connections.len() {
            0 => None,
            1 => Some(Arc::clone(connections[0])),
            len => {
                let mut rng = rand::thread_rng();
                match self.strategy {
                    SelectionStrategy::Random => {
                        Some(Arc::clone(connections[rng.gen_range(0..len)]))
                    }
                    SelectionStrategy::PowerOfTwoChoices => {
                        let first = rng.gen_range(0..len);
                        let mut second = rng.gen_range(0..len);
                        while second == first {
                            second = rng.gen_range(0..len);
                        }
                        let (a, b) = (connections[first], connections[second]);
                        if a.availability() == 0.0 && b.availability() == 0.0 {
                            // Both candidates dead: fall back to uniform.
                            return Some(Arc::clone(connections[rng.gen_range(0..len)]));
                        }
                        Some(Arc::clone(if a.availability() >= b.availability() {
                            a
                        } else {
                            b
                        }))
                    }
                }
            }
        }
    }

    /// Reconcile the pool against a new host list: new hosts become dial
    /// candidates, and every active entry for a removed host is closed.
    pub fn update_hosts(&self, new_hosts: Vec<HostPort>) {
        let to_close: Vec<Arc<Connection>> = {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if state.closed {
                return;
            }

            let added: Vec<HostPort> = new_hosts
                .iter()
                .filter(|h| !state.hosts.contains(h))
                .cloned()
                .collect();
            let removed: Vec<HostPort> = state
                .hosts
                .iter()
                .filter(|h| !new_hosts.contains(h))
                .cloned()
                .collect();
            state.hosts = new_hosts;

            for host in added {
                debug!(host = %host.key(), "host added");
                state.free.push(host);
            }

            let mut to_close = Vec::new();
            for host in removed {
                debug!(host = %host.key(), "host removed");
                state.free.retain(|h| h != &host);
                if let Some(connection) = state.connected.remove(&host.key()) {
                    to_close.push(connection);
                }
                // In-flight dials to removed hosts are dropped when they
                // complete and find the host gone.
            }
            to_close
        };

        for connection in to_close {
            tokio::spawn(async move { connection.close().await });
        }
        self.shared.fill_deficit();
    }

    /// Resolves once the first connection is established.
    pub fn ready(&self) -> BoxFuture<()> {
        watch_flag(self.shared.ready_tx.subscribe())
    }

    /// Resolves once the pool has shut down.
    pub fn closed(&self) -> BoxFuture<()> {
        watch_flag(self.shared.close_tx.subscribe())
    }

    /// Tear down the pool and every active connection.
    pub async fn close(&self) {
        let connections = {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            state.free.clear();
            state.connected.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };

        for connection in connections {
            connection.close().await;
        }
        self.shared.maybe_signal_closed();
    }

    /// Connected entry count.
    pub fn connected_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("lock poisoned")
            .connected
            .len()
    }
}

impl PoolShared {
    /// Dial random free candidates until the pool reaches its size.
    fn fill_deficit(self: &Arc<Self>) {
        loop {
            let host = {
                let mut state = self.state.lock().expect("lock poisoned");
                if state.closed {
                    return;
                }
                let active = state.connecting.len() + state.connected.len();
                if active >= self.size || state.free.is_empty() {
                    return;
                }
                let idx = rand::thread_rng().gen_range(0..state.free.len());
                let host = state.free.swap_remove(idx);
                state.connecting.insert(host.key());
                host
            };
            self.spawn_dial(host);
        }
    }

    fn spawn_dial(self: &Arc<Self>, host: HostPort) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let dial = async {
                let transport = connect_tcp(&host.host, host.port).await?;
                Connection::connect(transport, shared.connection_options.clone()).await
            };

            match dial.await {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    let keep = {
                        let mut state = shared.state.lock().expect("lock poisoned");
                        state.connecting.remove(&host.key());
                        if state.closed || !state.hosts.contains(&host) {
                            false
                        } else {
                            state
                                .connected
                                .insert(host.key(), Arc::clone(&connection));
                            true
                        }
                    };

                    if !keep {
                        connection.close().await;
                        shared.maybe_signal_closed();
                        return;
                    }

                    debug!(host = %host.key(), "host connected");
                    shared.ready_tx.send_replace(true);

                    let watcher = Arc::clone(&shared);
                    let watched = Arc::clone(&connection);
                    tokio::spawn(async move {
                        watched.closed().await;
                        watcher.on_connection_closed(host);
                    });
                }
                Err(e) => {
                    warn!(host = %host.key(), "dial failed: {e}");
                    {
                        let mut state = shared.state.lock().expect("lock poisoned");
                        state.connecting.remove(&host.key());
                        if !state.closed && state.hosts.contains(&host) {
                            state.free.push(host);
                        }
                    }
                    shared.maybe_signal_closed();
                    tokio::time::sleep(REDIAL_DELAY).await;
                    shared.fill_deficit();
                }
            }
        });
    }

    fn on_connection_closed(self: &Arc<Self>, host: HostPort) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            state.connected.remove(&host.key());
            if state.closed {
                drop(state);
                self.maybe_signal_closed();
                return;
            }
            debug!(host = %host.key(), "connection closed");
            if state.hosts.contains(&host) {
                state.free.push(host);
            }
        }
        self.fill_deficit();
    }

    /// Emit `close` once both active sets are empty after shutdown.
    fn maybe_signal_closed(&self) {
        let state = self.state.lock().expect("lock poisoned");
        if state.closed && state.connected.is_empty() && state.connecting.is_empty() {
            self.close_tx.send_replace(true);
        }
    }
}

fn watch_flag(mut rx: watch::Receiver<bool>) -> BoxFuture<()> {
    Box::pin(async move {
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Responder, ResponderFuture, ServerOptions};
    use crate::protocol::Payload;
    use tokio::net::TcpListener;

    fn echo_responder() -> Responder {
        Arc::new(|payload: Payload| Box::pin(async move { Ok(payload) }) as ResponderFuture)
    }

    async fn spawn_echo_server() -> HostPort {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    if let Ok(connection) =
                        Connection::accept(stream, ServerOptions::default(), echo_responder())
                            .await
                    {
                        connection.closed().await;
                    }
                });
            }
        });
        HostPort::new("127.0.0.1", port)
    }

    fn assert_sets_disjoint(pool: &TcpLoadBalancer) {
        let state = pool.shared.state.lock().unwrap();
        for host in &state.free {
            let key = host.key();
            assert!(!state.connecting.contains(&key), "{key} free and connecting");
            assert!(
                !state.connected.contains_key(&key),
                "{key} free and connected"
            );
        }
        for key in &state.connecting {
            assert!(
                !state.connected.contains_key(key),
                "{key} connecting and connected"
            );
        }
    }

    #[tokio::test]
    async fn test_pool_dials_up_to_size() {
        let mut hosts = Vec::new();
        for _ in 0..3 {
            hosts.push(spawn_echo_server().await);
        }

        let pool = TcpLoadBalancer::new(
            hosts,
            TcpLoadBalancerOptions {
                size: 2,
                ..TcpLoadBalancerOptions::default()
            },
        );
        tokio::time::timeout(Duration::from_secs(2), pool.ready())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.connected_count(), 2);
        assert_sets_disjoint(&pool);

        let connection = pool.get_connection().unwrap();
        let response = connection
            .request(Payload::from_str(None, Some("hello")))
            .await
            .unwrap();
        assert_eq!(response.data.as_deref(), Some(&b"hello"[..]));

        pool.close().await;
    }

    #[tokio::test]
    async fn test_empty_pool_returns_none() {
        let pool = TcpLoadBalancer::new(Vec::new(), TcpLoadBalancerOptions::default());
        assert!(pool.get_connection().is_none());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_small_host_list_bounds_pool() {
        let host = spawn_echo_server().await;
        let pool = TcpLoadBalancer::new(
            vec![host],
            TcpLoadBalancerOptions {
                size: 4,
                ..TcpLoadBalancerOptions::default()
            },
        );
        tokio::time::timeout(Duration::from_secs(2), pool.ready())
            .await
            .unwrap();

        // min(size, |hosts|) = 1 dialed.
        assert_eq!(pool.connected_count(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_update_hosts_closes_removed() {
        let kept = spawn_echo_server().await;
        let dropped = spawn_echo_server().await;

        let pool = TcpLoadBalancer::new(
            vec![kept.clone(), dropped.clone()],
            TcpLoadBalancerOptions {
                size: 2,
                ..TcpLoadBalancerOptions::default()
            },
        );
        tokio::time::timeout(Duration::from_secs(2), pool.ready())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.connected_count(), 2);

        pool.update_hosts(vec![kept.clone()]);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = pool.shared.state.lock().unwrap();
        assert!(!state.connected.contains_key(&dropped.key()));
        assert!(state.connected.contains_key(&kept.key()));
        assert_eq!(state.hosts, vec![kept.clone()]);
        drop(state);

        assert_sets_disjoint(&pool);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_update_hosts_dials_added() {
        let first = spawn_echo_server().await;
        let second = spawn_echo_server().await;

        let pool = TcpLoadBalancer::new(
            vec![first.clone()],
            TcpLoadBalancerOptions {
                size: 2,
                ..TcpLoadBalancerOptions::default()
            },
        );
        tokio::time::timeout(Duration::from_secs(2), pool.ready())
            .await
            .unwrap();
        assert_eq!(pool.connected_count(), 1);

        pool.update_hosts(vec![first, second.clone()]);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = pool.shared.state.lock().unwrap();
        assert!(state.connected.contains_key(&second.key()));
        assert_eq!(state.connected.len(), 2);
        drop(state);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let host = spawn_echo_server().await;
        let pool = TcpLoadBalancer::new(
            vec![host],
            TcpLoadBalancerOptions {
                size: 1,
                ..TcpLoadBalancerOptions::default()
            },
        );
        tokio::time::timeout(Duration::from_secs(2), pool.ready())
            .await
            .unwrap();

        let connection = pool.get_connection().unwrap();
        connection.close().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The endpoint went back to free and was re-dialed.
        assert_eq!(pool.connected_count(), 1);
        assert_sets_disjoint(&pool);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_signals_when_drained() {
        let host = spawn_echo_server().await;
        let pool = TcpLoadBalancer::new(vec![host], TcpLoadBalancerOptions::default());
        tokio::time::timeout(Duration::from_secs(2), pool.ready())
            .await
            .unwrap();

        let closed = pool.closed();
        pool.close().await;
        tokio::time::timeout(Duration::from_secs(1), closed)
            .await
            .unwrap();

        assert!(pool.get_connection().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_returns_to_free() {
        // Port 1: connection refused.
        let pool = TcpLoadBalancer::new(
            vec![HostPort::new("127.0.0.1", 1)],
            TcpLoadBalancerOptions {
                size: 1,
                ..TcpLoadBalancerOptions::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = pool.shared.state.lock().unwrap();
        assert_eq!(state.connected.len(), 0);
        // The host cycles between free and connecting as redials happen.
        assert!(state.free.len() + state.connecting.len() == 1);
        drop(state);
        pool.close().await;
    }

    #[test]
    fn test_host_port_key() {
        assert_eq!(HostPort::new("10.0.0.1", 7878).key(), "10.0.0.1:7878");
    }
}
