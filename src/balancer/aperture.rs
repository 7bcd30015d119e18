//! Aperture load balancer.
//!
//! Multiplexes requests over a dynamic subset (the aperture) of the supplied
//! connection factories. Sockets are wrapped `Draining -> Weighted` as they
//! are built; selection is power-of-three-choices over
//! `availability / (1 + predicted_latency * (outstanding + 1))`, taking the
//! largest load (highest goodness). The aperture widens when the average
//! outstanding count runs hot and narrows when it runs cold; a periodic
//! recycle evicts the slowest socket to force exploration.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::RSocketError;
use crate::factory::ConnectionFactory;
use crate::metrics::{noop_recorder, Counter, Histogram, MetricsRecorder, Timer};
use crate::protocol::Payload;
use crate::socket::{
    BoxFuture, DrainingSocket, RSocket, Response, WeightedSocket, WeightedSocketOptions,
};

/// Options for [`LoadBalancer`].
#[derive(Clone)]
pub struct LoadBalancerOptions {
    /// Aperture on startup (clamped into `[min, max]`).
    pub initial_aperture: i32,
    /// Lower aperture bound.
    pub min_aperture: i32,
    /// Upper aperture bound.
    pub max_aperture: i32,
    /// Idle time after which a socket's latency prediction decays.
    pub inactivity_period: Duration,
    /// Period of the slowest-socket recycle tick.
    pub refresh_period: Duration,
    /// Minimum spacing between aperture adjustments.
    pub aperture_refresh_period: Duration,
    /// Metrics sink; defaults to a no-op recorder.
    pub metrics: Arc<dyn MetricsRecorder>,
}

impl Default for LoadBalancerOptions {
    fn default() -> Self {
        Self {
            initial_aperture: 5,
            min_aperture: 4,
            max_aperture: 100,
            inactivity_period: Duration::from_millis(1000),
            refresh_period: Duration::from_secs(300),
            aperture_refresh_period: Duration::from_millis(100),
            metrics: noop_recorder(),
        }
    }
}

/// A socket in the aperture, tied to the factory that spawned it.
struct BalancedSocket {
    socket: WeightedSocket,
    factory: Arc<dyn ConnectionFactory>,
    id: u64,
}

struct BalancerState {
    factories: Vec<Arc<dyn ConnectionFactory>>,
    sockets: Vec<Arc<BalancedSocket>>,
    target_aperture: i32,
    pending: i32,
    last_aperture_refresh: Instant,
    closed: bool,
}

struct BalancerShared {
    state: Mutex<BalancerState>,
    outstanding: AtomicI64,
    next_socket_id: AtomicU64,
    min_aperture: i32,
    max_aperture: i32,
    inactivity_period: Duration,
    aperture_refresh_period: Duration,
    close_tx: tokio::sync::watch::Sender<bool>,
    ready_tx: tokio::sync::watch::Sender<bool>,
    requests: Arc<dyn Counter>,
    empty_requests: Arc<dyn Counter>,
    evictions: Arc<dyn Counter>,
    request_timer: Arc<dyn Timer>,
    aperture_gauge: Arc<dyn Histogram>,
}

/// Weighted, aperture-tuned client-side load balancer.
pub struct LoadBalancer {
    shared: Arc<BalancerShared>,
    recycle_task: Mutex<Option<JoinHandle<()>>>,
}

impl LoadBalancer {
    pub fn new(factories: Vec<Arc<dyn ConnectionFactory>>, options: LoadBalancerOptions) -> Self {
        let min = options.min_aperture.max(1);
        let max = options.max_aperture.max(min);
        let target = options.initial_aperture.clamp(min, max);

        let (close_tx, _) = tokio::sync::watch::channel(false);
        let (ready_tx, _) = tokio::sync::watch::channel(false);

        let shared = Arc::new(BalancerShared {
            state: Mutex::new(BalancerState {
                factories,
                sockets: Vec::new(),
                target_aperture: target,
                pending: 0,
                last_aperture_refresh: Instant::now(),
                closed: false,
            }),
            outstanding: AtomicI64::new(0),
            next_socket_id: AtomicU64::new(0),
            min_aperture: min,
            max_aperture: max,
            inactivity_period: options.inactivity_period,
            aperture_refresh_period: options.aperture_refresh_period,
            close_tx,
            ready_tx,
            requests: options.metrics.counter("balancer.requests"),
            empty_requests: options.metrics.counter("balancer.empty_requests"),
            evictions: options.metrics.counter("balancer.evictions"),
            request_timer: options.metrics.timer("balancer.request_latency"),
            aperture_gauge: options.metrics.histogram("balancer.target_aperture"),
        });

        shared.refresh_sockets();

        let recycle_shared = Arc::clone(&shared);
        let mut close_rx = shared.close_tx.subscribe();
        let refresh_period = options.refresh_period;
        let recycle_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => recycle_shared.recycle(),
                    _ = close_rx.changed() => break,
                }
            }
        });

        Self {
            shared,
            recycle_task: Mutex::new(Some(recycle_task)),
        }
    }

    /// Add a factory to the pool.
    pub fn add_factory(&self, factory: Arc<dyn ConnectionFactory>) {
        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if state.closed {
                return;
            }
            debug!(name = %factory.name(), "factory added");
            state.factories.push(factory);
        }
        self.shared.refresh_sockets();
    }

    /// Remove a factory and every socket it spawned.
    pub fn remove_factory(&self, name: &str) {
        let removed: Vec<Arc<BalancedSocket>> = {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            state.factories.retain(|f| f.name() != name);
            let (removed, kept) = state
                .sockets
                .drain(..)
                .partition(|s| s.factory.name() == name);
            state.sockets = kept;
            removed
        };
        for socket in removed {
            debug!(name, "socket removed with its factory");
            self.shared.evictions.increment();
            tokio::spawn(async move { socket.socket.close().await });
        }
        self.shared.refresh_sockets();
    }

    /// Resolves once the first socket is connected.
    pub fn ready(&self) -> BoxFuture<()> {
        watch_flag(self.shared.ready_tx.subscribe())
    }

    /// Current target aperture.
    pub fn target_aperture(&self) -> i32 {
        self.shared
            .state
            .lock()
            .expect("lock poisoned")
            .target_aperture
    }

    /// Connected socket count (excludes pending connects).
    pub fn socket_count(&self) -> usize {
        self.shared.state.lock().expect("lock poisoned").sockets.len()
    }
}

impl RSocket for LoadBalancer {
    fn request(&self, request: Payload) -> Response {
        let shared = &self.shared;
        shared.refresh_sockets();

        let Some(selected) = shared.select_socket() else {
            shared.empty_requests.increment();
            return Response::ready_err(RSocketError::EmptyBalancer);
        };

        shared.requests.increment();
        shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let guard = OutstandingGuard {
            shared: Arc::clone(shared),
        };

        let response = selected.socket.request(request);
        let cancel = response.cancel_handle();
        let timer = Arc::clone(&shared.request_timer);
        let start = Instant::now();
        Response::from_future(cancel, async move {
            let outcome = response.await;
            timer.record(start.elapsed());
            drop(guard);
            outcome
        })
    }

    /// Arithmetic mean of member availabilities; 0 when closed or empty.
    fn availability(&self) -> f64 {
        let state = self.shared.state.lock().expect("lock poisoned");
        if state.closed || state.sockets.is_empty() {
            return 0.0;
        }
        let sum: f64 = state.sockets.iter().map(|s| s.socket.availability()).sum();
        sum / state.sockets.len() as f64
    }

    fn close(&self) -> BoxFuture<()> {
        let shared = Arc::clone(&self.shared);
        let recycle = self.recycle_task.lock().expect("lock poisoned").take();
        Box::pin(async move {
            let sockets = {
                let mut state = shared.state.lock().expect("lock poisoned");
                state.closed = true;
                std::mem::take(&mut state.sockets)
            };
            if let Some(task) = recycle {
                task.abort();
            }
            for socket in sockets {
                socket.socket.close().await;
            }
            shared.close_tx.send_replace(true);
        })
    }

    fn closed(&self) -> BoxFuture<()> {
        watch_flag(self.shared.close_tx.subscribe())
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        if let Some(task) = self.recycle_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
    }
}

impl BalancerShared {
    /// Converge the socket set toward the target aperture: at most one open
    /// or one eviction per call.
    fn refresh_sockets(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return;
        }
        self.update_aperture(&mut state);

        let n = state.sockets.len() as i32 + state.pending;
        if n < state.target_aperture {
            self.open_socket(&mut state);
        } else if n > state.target_aperture {
            self.evict_slowest(&mut state);
        }
    }

    /// Resize the aperture from the average outstanding count, rate-limited.
    fn update_aperture(&self, state: &mut BalancerState) {
        let now = Instant::now();
        if now.saturating_duration_since(state.last_aperture_refresh)
            < self.aperture_refresh_period
        {
            return;
        }
        state.last_aperture_refresh = now;

        if state.sockets.is_empty() {
            return;
        }
        let avg_outstanding =
            self.outstanding.load(Ordering::Acquire) as f64 / state.sockets.len() as f64;

        if avg_outstanding < 1.5 && state.target_aperture > self.min_aperture {
            state.target_aperture -= 1;
            debug!(target = state.target_aperture, avg_outstanding, "aperture narrowed");
        } else if avg_outstanding > 2.5 && state.target_aperture < self.max_aperture {
            state.target_aperture += 1;
            debug!(target = state.target_aperture, avg_outstanding, "aperture widened");
        }
        self.aperture_gauge.record(state.target_aperture as u64);
    }

    /// Pick a factory by P3C over availability and build a socket from it.
    /// The factory leaves the list while its socket lives.
    fn open_socket(self: &Arc<Self>, state: &mut BalancerState) {
        if state.factories.is_empty() {
            return;
        }
        let idx = p3c_argmax(&state.factories, |f| f.availability(), |f| f.availability())
            .expect("factories not empty");
        let factory = state.factories.remove(idx);
        state.pending += 1;

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match factory.build().await {
                Ok(raw) => {
                    let draining = Arc::new(DrainingSocket::new(raw));
                    let weighted = WeightedSocket::new(
                        draining,
                        WeightedSocketOptions {
                            inactivity_period: shared.inactivity_period,
                            ..WeightedSocketOptions::default()
                        },
                    );
                    let balanced = Arc::new(BalancedSocket {
                        socket: weighted,
                        factory,
                        id: shared.next_socket_id.fetch_add(1, Ordering::AcqRel),
                    });

                    let closed_early = {
                        let mut state = shared.state.lock().expect("lock poisoned");
                        state.pending -= 1;
                        if state.closed {
                            true
                        } else {
                            state.sockets.push(Arc::clone(&balanced));
                            false
                        }
                    };
                    if closed_early {
                        balanced.socket.close().await;
                        return;
                    }

                    shared.ready_tx.send_replace(true);

                    // Socket error/close pulls it out of the aperture.
                    let watcher_shared = Arc::clone(&shared);
                    let closed_fut = balanced.socket.closed();
                    let id = balanced.id;
                    tokio::spawn(async move {
                        closed_fut.await;
                        watcher_shared.remove_socket_by_id(id);
                    });

                    shared.refresh_sockets();
                }
                Err(e) => {
                    warn!(name = %factory.name(), "socket build failed: {e}");
                    let mut state = shared.state.lock().expect("lock poisoned");
                    state.pending -= 1;
                    // Back in the pool; its availability now reflects the
                    // failure, so P3C deprioritizes it.
                    state.factories.push(factory);
                }
            }
        });
    }

    /// Evict the slowest socket (P3C maximizing predicted latency).
    fn evict_slowest(self: &Arc<Self>, state: &mut BalancerState) {
        let Some(idx) = p3c_argmax(
            &state.sockets,
            |s| s.socket.predicted_latency(),
            |_| 1.0,
        ) else {
            return;
        };
        let balanced = state.sockets.remove(idx);
        state.factories.push(Arc::clone(&balanced.factory));
        self.evictions.increment();
        debug!(name = %balanced.factory.name(), "socket evicted");
        tokio::spawn(async move { balanced.socket.close().await });
    }

    /// Recycle tick: evict the slowest socket to force exploration.
    fn recycle(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.closed || state.sockets.is_empty() || state.factories.is_empty() {
                return;
            }
            self.evict_slowest(&mut state);
        }
        self.refresh_sockets();
    }

    fn remove_socket_by_id(self: &Arc<Self>, id: u64) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            let Some(idx) = state.sockets.iter().position(|s| s.id == id) else {
                return;
            };
            let balanced = state.sockets.remove(idx);
            debug!(name = %balanced.factory.name(), "socket closed, factory returned");
            state.factories.push(Arc::clone(&balanced.factory));
            self.evictions.increment();
        }
        self.refresh_sockets();
    }

    /// P3C over the load function; `None` when no socket is connected.
    fn select_socket(&self) -> Option<Arc<BalancedSocket>> {
        let state = self.state.lock().expect("lock poisoned");
        if state.sockets.is_empty() {
            return None;
        }
        let idx = p3c_argmax(&state.sockets, load, |s| s.socket.availability())?;
        Some(Arc::clone(&state.sockets[idx]))
    }
}

/// The balancer's goodness function; the argmax is the best candidate.
fn load(socket: &Arc<BalancedSocket>) -> f64 {
    let availability = socket.socket.availability();
    let predicted = socket.socket.predicted_latency();
    let outstanding = socket.socket.outstanding() as f64;
    availability / (1.0 + predicted * (outstanding + 1.0))
}

/// Argmax of `key` over up to three distinct random candidates.
///
/// Fewer than three items degrade to a full scan. Candidate trios with an
/// unavailable member are resampled up to five times; ties break in
/// sampling order.
fn p3c_argmax<T>(
    items: &[T],
    key: impl Fn(&T) -> f64,
    availability: impl Fn(&T) -> f64,
) -> Option<usize> {
    if items.is_empty() {
        return None;
    }
    if items.len() < 3 {
        let mut best = 0;
        for idx in 1..items.len() {
            if key(&items[idx]) > key(&items[best]) {
                best = idx;
            }
        }
        return Some(best);
    }

    let mut rng = rand::thread_rng();
    let mut candidates = sample_distinct(&mut rng, items.len());
    for _ in 0..5 {
        if candidates
            .iter()
            .all(|&idx| availability(&items[idx]) > 0.0)
        {
            break;
        }
        candidates = sample_distinct(&mut rng, items.len());
    }

    let mut best = candidates[0];
    for &idx in &candidates[1..] {
        if key(&items[idx]) > key(&items[best]) {
            best = idx;
        }
    }
    Some(best)
}

/// Three distinct indices in `0..len` (requires `len >= 3`).
fn sample_distinct(rng: &mut impl Rng, len: usize) -> [usize; 3] {
    let first = rng.gen_range(0..len);
    let mut second = rng.gen_range(0..len);
    while second == first {
        second = rng.gen_range(0..len);
    }
    let mut third = rng.gen_range(0..len);
    while third == first || third == second {
        third = rng.gen_range(0..len);
    }
    [first, second, third]
}

struct OutstandingGuard {
    shared: Arc<BalancerShared>,
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

fn watch_flag(mut rx: tokio::sync::watch::Receiver<bool>) -> BoxFuture<()> {
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
    use crate::error::Result;
    use crate::socket::CancelHandle;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::watch;

    /// In-process socket completing after a fixed latency.
    struct MockSocket {
        latency: Duration,
        requests: Arc<AtomicU64>,
        close_tx: watch::Sender<bool>,
    }

    impl MockSocket {
        fn new(latency: Duration, requests: Arc<AtomicU64>) -> Self {
            let (close_tx, _) = watch::channel(false);
            Self {
                latency,
                requests,
                close_tx,
            }
        }
    }

    impl RSocket for MockSocket {
        fn request(&self, request: Payload) -> Response {
            self.requests.fetch_add(1, Ordering::Relaxed);
            let latency = self.latency;
            Response::from_future(CancelHandle::new(), async move {
                tokio::time::sleep(latency).await;
                Ok(request)
            })
        }

        fn availability(&self) -> f64 {
            if *self.close_tx.borrow() {
                0.0
            } else {
                1.0
            }
        }

        fn close(&self) -> BoxFuture<()> {
            self.close_tx.send_replace(true);
            Box::pin(async {})
        }

        fn closed(&self) -> BoxFuture<()> {
            watch_flag(self.close_tx.subscribe())
        }
    }

    struct MockFactory {
        name: String,
        latency: Duration,
        requests: Arc<AtomicU64>,
        builds: AtomicU64,
    }

    impl MockFactory {
        fn new(name: &str, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                latency,
                requests: Arc::new(AtomicU64::new(0)),
                builds: AtomicU64::new(0),
            })
        }
    }

    impl ConnectionFactory for MockFactory {
        fn build(&self) -> BoxFuture<Result<Arc<dyn RSocket>>> {
            self.builds.fetch_add(1, Ordering::Relaxed);
            let latency = self.latency;
            let requests = Arc::clone(&self.requests);
            Box::pin(async move { Ok(Arc::new(MockSocket::new(latency, requests)) as Arc<dyn RSocket>) })
        }

        fn availability(&self) -> f64 {
            1.0
        }

        fn name(&self) -> String {
            self.name.clone()
        }
    }

    fn balancer(factories: Vec<Arc<MockFactory>>, options: LoadBalancerOptions) -> LoadBalancer {
        let factories = factories
            .into_iter()
            .map(|f| f as Arc<dyn ConnectionFactory>)
            .collect();
        LoadBalancer::new(factories, options)
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_balancer_fails_requests() {
        let lb = LoadBalancer::new(Vec::new(), LoadBalancerOptions::default());
        let result = lb.request(Payload::empty()).await;
        assert!(matches!(result, Err(RSocketError::EmptyBalancer)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_flow_once_ready() {
        let factory = MockFactory::new("a", Duration::from_millis(1));
        let lb = balancer(
            vec![Arc::clone(&factory)],
            LoadBalancerOptions {
                min_aperture: 1,
                initial_aperture: 1,
                ..LoadBalancerOptions::default()
            },
        );
        tokio::time::timeout(Duration::from_secs(1), lb.ready())
            .await
            .unwrap();

        let response = lb.request(Payload::from_str(None, Some("hi"))).await.unwrap();
        assert_eq!(response.data.as_deref(), Some(&b"hi"[..]));
        assert_eq!(factory.requests.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aperture_stays_in_bounds() {
        let factories: Vec<_> = (0..10)
            .map(|i| MockFactory::new(&format!("f{i}"), Duration::from_millis(1)))
            .collect();
        let lb = balancer(
            factories,
            LoadBalancerOptions {
                min_aperture: 2,
                max_aperture: 6,
                initial_aperture: 4,
                aperture_refresh_period: Duration::from_millis(10),
                ..LoadBalancerOptions::default()
            },
        );
        tokio::time::timeout(Duration::from_secs(1), lb.ready())
            .await
            .unwrap();

        for _ in 0..50 {
            let _ = lb.request(Payload::empty()).await;
            tokio::time::advance(Duration::from_millis(5)).await;
            let target = lb.target_aperture();
            assert!((2..=6).contains(&target), "target = {target}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sockets_plus_pending_bounded_by_target() {
        let factories: Vec<_> = (0..8)
            .map(|i| MockFactory::new(&format!("f{i}"), Duration::from_millis(1)))
            .collect();
        let lb = balancer(
            factories,
            LoadBalancerOptions {
                min_aperture: 3,
                initial_aperture: 3,
                ..LoadBalancerOptions::default()
            },
        );

        for _ in 0..30 {
            let _ = lb.request(Payload::empty()).await;
            let state = lb.shared.state.lock().unwrap();
            let n = state.sockets.len() as i32 + state.pending;
            assert!(
                n <= state.target_aperture + 1,
                "{} sockets + {} pending > target {}",
                state.sockets.len(),
                state.pending,
                state.target_aperture
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_socket_returns_factory() {
        let factory = MockFactory::new("a", Duration::from_millis(1));
        let lb = balancer(
            vec![Arc::clone(&factory)],
            LoadBalancerOptions {
                min_aperture: 1,
                initial_aperture: 1,
                ..LoadBalancerOptions::default()
            },
        );
        tokio::time::timeout(Duration::from_secs(1), lb.ready())
            .await
            .unwrap();
        assert_eq!(lb.socket_count(), 1);

        // Kill the socket out from under the balancer.
        let socket = Arc::clone(&lb.shared.state.lock().unwrap().sockets[0]);
        socket.socket.close().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The close watcher returned the factory and a rebuild follows.
        assert!(factory.builds.load(Ordering::Relaxed) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_factory_drops_its_sockets() {
        let a = MockFactory::new("a", Duration::from_millis(1));
        let b = MockFactory::new("b", Duration::from_millis(1));
        let lb = balancer(
            vec![Arc::clone(&a), Arc::clone(&b)],
            LoadBalancerOptions {
                min_aperture: 2,
                initial_aperture: 2,
                ..LoadBalancerOptions::default()
            },
        );
        for _ in 0..5 {
            let _ = lb.request(Payload::empty()).await;
            tokio::task::yield_now().await;
        }

        lb.remove_factory("a");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = lb.shared.state.lock().unwrap();
        assert!(state.sockets.iter().all(|s| s.factory.name() != "a"));
        assert!(state.factories.iter().all(|f| f.name() != "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_tears_down_everything() {
        let factories: Vec<_> = (0..4)
            .map(|i| MockFactory::new(&format!("f{i}"), Duration::from_millis(1)))
            .collect();
        let lb = balancer(factories, LoadBalancerOptions::default());
        for _ in 0..5 {
            let _ = lb.request(Payload::empty()).await;
            tokio::task::yield_now().await;
        }

        let closed = lb.closed();
        lb.close().await;
        tokio::time::timeout(Duration::from_secs(1), closed)
            .await
            .unwrap();

        assert_eq!(lb.availability(), 0.0);
        let result = lb.request(Payload::empty()).await;
        assert!(matches!(result, Err(RSocketError::EmptyBalancer)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_availability_is_mean_of_members() {
        let factories: Vec<_> = (0..3)
            .map(|i| MockFactory::new(&format!("f{i}"), Duration::from_millis(1)))
            .collect();
        let lb = balancer(
            factories,
            LoadBalancerOptions {
                min_aperture: 3,
                initial_aperture: 3,
                ..LoadBalancerOptions::default()
            },
        );
        for _ in 0..5 {
            let _ = lb.request(Payload::empty()).await;
            tokio::task::yield_now().await;
        }
        assert!(lb.socket_count() > 0);
        assert!((lb.availability() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_p3c_small_sets_scan_fully() {
        let items = [1.0, 3.0, 2.0];
        // Length 3 samples; length 2 scans.
        let idx = p3c_argmax(&items[..2], |x| *x, |_| 1.0).unwrap();
        assert_eq!(idx, 1);
        assert!(p3c_argmax::<f64>(&[], |x| *x, |_| 1.0).is_none());
    }

    #[test]
    fn test_p3c_prefers_high_load() {
        // One candidate dominates; over many rounds it must win nearly always.
        let items: Vec<f64> = vec![0.1, 0.1, 0.1, 0.1, 100.0, 0.1];
        let mut wins = 0;
        for _ in 0..200 {
            if p3c_argmax(&items, |x| *x, |_| 1.0) == Some(4) {
                wins += 1;
            }
        }
        // The dominant item is in the sampled trio about half the time.
        assert!(wins > 60, "wins = {wins}");
    }

    #[test]
    fn test_sample_distinct_indices() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let [a, b, c] = sample_distinct(&mut rng, 3);
            let mut sorted = [a, b, c];
            sorted.sort_unstable();
            assert_eq!(sorted, [0, 1, 2]);
        }
    }
}
