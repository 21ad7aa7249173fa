//! DNS proxy orchestration.
//!
//! Owns the listening socket, the receive loop, the cache sweep and the
//! per-query tasks that answer from cache or race the upstreams.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{DEFAULT_MAX_ENTRIES, DnsCache};
use crate::dns::{self, QuerySignature};
use crate::error::{Error, Result};
use crate::stats::{Stats, StatsSnapshot};
use crate::upstream::{self, MAX_DNS_PACKET_SIZE};

/// Tunables for a [`Proxy`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// How long the receive loop blocks on the socket before re-checking for stop.
    pub read_timeout: Duration,
    /// Deadline for a single upstream exchange.
    pub upstream_timeout: Duration,
    /// Deadline for the whole upstream race.
    pub query_timeout: Duration,
    /// Fixed lifetime of cached responses.
    pub cache_ttl: Duration,
    /// Period of the expired-entry sweep.
    pub sweep_interval: Duration,
    /// Cache bound (0 = unbounded).
    pub max_cache_entries: usize,
}

impl ProxyConfig {
    /// Reject periods and deadlines that cannot drive a timer.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("read_timeout", self.read_timeout),
            ("upstream_timeout", self.upstream_timeout),
            ("query_timeout", self.query_timeout),
            ("sweep_interval", self.sweep_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            upstream_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
            max_cache_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// State shared with the background tasks.
struct Shared {
    upstreams: Vec<String>,
    config: ProxyConfig,
    cache: DnsCache,
    stats: Stats,
}

/// Resources that exist only between `start` and `stop`.
///
/// The receive loop holds the only other strong reference to the socket;
/// per-query tasks get a `Weak` one.
struct Running {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    socket: Arc<UdpSocket>,
    receiver: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Caching DNS forwarder listening on a single UDP socket.
///
/// Construction performs no I/O. [`Proxy::start`] binds and spawns the
/// background tasks on the current tokio runtime; [`Proxy::stop`] tears them
/// down, releases the port and may be called from any thread. A stopped proxy
/// can be started again, on the same port.
pub struct Proxy {
    listen_addr: String,
    listen_port: u16,
    shared: Arc<Shared>,
    state: Mutex<Option<Running>>,
}

impl Proxy {
    /// Create a proxy with the default [`ProxyConfig`].
    ///
    /// `upstreams` are `host:port` strings; see
    /// [`normalize_upstream`](crate::normalize_upstream) for filling in the port.
    pub fn new(listen_addr: impl Into<String>, listen_port: u16, upstreams: Vec<String>) -> Self {
        Self::with_config(listen_addr, listen_port, upstreams, ProxyConfig::default())
    }

    pub fn with_config(
        listen_addr: impl Into<String>,
        listen_port: u16,
        upstreams: Vec<String>,
        config: ProxyConfig,
    ) -> Self {
        let cache = DnsCache::with_max_entries(config.max_cache_entries);
        Self {
            listen_addr: listen_addr.into(),
            listen_port,
            shared: Arc::new(Shared {
                upstreams,
                config,
                cache,
                stats: Stats::new(),
            }),
            state: Mutex::new(None),
        }
    }

    /// Bind the listening socket and spawn the receive and sweep loops.
    ///
    /// Must be called from within a tokio runtime. Binding a privileged port
    /// such as 53 usually requires elevated privileges.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.shared.config.validate()?;

        let handle = Handle::try_current().map_err(io::Error::other)?;

        let socket = Arc::new(self.bind()?);
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let receiver = handle.spawn(receive_loop(
            socket.clone(),
            self.shared.clone(),
            shutdown_tx.subscribe(),
        ));
        let sweeper = handle.spawn(sweep_loop(self.shared.clone(), shutdown_tx.subscribe()));

        *state = Some(Running {
            local_addr,
            shutdown_tx,
            socket,
            receiver,
            sweeper,
        });

        info!(
            listen = %local_addr,
            upstreams = ?self.shared.upstreams,
            "DNS proxy started"
        );
        Ok(())
    }

    fn bind(&self) -> Result<UdpSocket> {
        let target = self.bind_target();
        let bind_err = |source: io::Error| Error::Bind {
            addr: target.clone(),
            source,
        };

        let ip: IpAddr = self
            .listen_addr
            .parse()
            .map_err(|e| bind_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        debug!(addr = %target, "attempting to bind");
        let socket = std::net::UdpSocket::bind(SocketAddr::new(ip, self.listen_port))
            .map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        UdpSocket::from_std(socket).map_err(bind_err)
    }

    fn bind_target(&self) -> String {
        match self.listen_addr.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.listen_port).to_string(),
            Err(_) => format!("{}:{}", self.listen_addr, self.listen_port),
        }
    }

    /// Signal both background loops, wait for them to exit and release the
    /// socket.
    ///
    /// When this returns the listening port is free again. Queries already
    /// being resolved keep running, but their answers are discarded. Stopping
    /// a proxy that is not running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.lock_state().take() else {
            return Ok(());
        };
        let Running {
            local_addr,
            shutdown_tx,
            socket,
            receiver,
            sweeper,
        } = running;

        let _ = shutdown_tx.send(());
        for (task, name) in [(receiver, "receive loop"), (sweeper, "sweep loop")] {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(task = name, error = %e, "background task panicked");
                }
            }
        }
        drop(socket);

        info!(listen = %local_addr, "DNS proxy stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().is_some()
    }

    /// Address actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_state().as_ref().map(|running| running.local_addr)
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn upstreams(&self) -> &[String] {
        &self.shared.upstreams
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    /// Number of cached responses, expired-but-unswept ones included.
    pub fn cache_size(&self) -> usize {
        self.shared.cache.len()
    }

    pub fn clear_cache(&self) {
        let removed = self.shared.cache.clear();
        info!(removed, "DNS cache cleared");
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.shared.stats.snapshot_and_reset()
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<Running>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receive datagrams until stopped, handing each one to its own task.
///
/// The buffer is reused, so every query is copied out before dispatch.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
    let read_timeout = shared.config.read_timeout;
    debug!("DNS request handler started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("DNS request handler received stop signal");
                break;
            }
            result = tokio::time::timeout(read_timeout, socket.recv_from(&mut buf)) => {
                let (len, client) = match result {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        warn!(error = %e, "UDP recv error");
                        continue;
                    }
                    Ok(Ok(r)) => r,
                };

                let query = buf[..len].to_vec();
                debug!(%client, bytes = len, "received query");
                tokio::spawn(handle_query(
                    Arc::downgrade(&socket),
                    shared.clone(),
                    query,
                    client,
                ));
            }
        }
    }
}

/// Send `response` to `client`, or `None` once the proxy has been stopped.
async fn send_reply(
    socket: &Weak<UdpSocket>,
    response: &[u8],
    client: SocketAddr,
) -> Option<io::Result<usize>> {
    let socket = socket.upgrade()?;
    Some(socket.send_to(response, client).await)
}

/// Answer one query from cache, or race the upstreams and cache the winner.
///
/// The socket is held weakly so a stopped proxy is not kept bound by queries
/// still waiting on upstreams.
async fn handle_query(
    socket: Weak<UdpSocket>,
    shared: Arc<Shared>,
    query: Vec<u8>,
    client: SocketAddr,
) {
    let started = Instant::now();

    if shared.upstreams.is_empty() {
        warn!(%client, "no upstream DNS servers configured, dropping query");
        shared.stats.record_dropped();
        return;
    }

    let signature = match QuerySignature::parse(&query) {
        Ok(signature) => Some(signature),
        Err(e) => {
            debug!(%client, error = %e, "query is not cacheable");
            None
        }
    };

    if let Some(signature) = &signature {
        if let Some(cached) = shared.cache.get(signature.as_str()) {
            let response = match dns::message_id(&query) {
                Some(id) => dns::with_message_id(cached, id),
                None => cached,
            };
            match send_reply(&socket, &response, client).await {
                Some(Ok(sent)) => {
                    shared.stats.record_cached(started.elapsed());
                    debug!(
                        %client,
                        %signature,
                        bytes = sent,
                        total_ms = started.elapsed().as_secs_f64() * 1000.0,
                        "CACHED"
                    );
                }
                Some(Err(e)) => warn!(%client, error = %e, "failed to send cached response"),
                None => debug!(%client, "proxy stopped, cached response discarded"),
            }
            return;
        }
    }

    let config = &shared.config;
    let Some(winner) = upstream::race(
        &shared.upstreams,
        &query,
        config.upstream_timeout,
        config.query_timeout,
    )
    .await
    else {
        warn!(%client, "all upstream queries failed or timed out");
        shared.stats.record_dropped();
        return;
    };

    match send_reply(&socket, &winner.response, client).await {
        Some(Ok(sent)) => {
            shared.stats.record_forwarded(started.elapsed());
            debug!(
                %client,
                upstream = %winner.upstream,
                bytes = sent,
                total_ms = started.elapsed().as_secs_f64() * 1000.0,
                "FORWARDED"
            );
        }
        Some(Err(e)) => warn!(%client, error = %e, "failed to send response"),
        None => debug!(%client, upstream = %winner.upstream, "proxy stopped, response discarded"),
    }

    if let Some(signature) = signature {
        shared
            .cache
            .set(signature.as_str(), &winner.response, config.cache_ttl);
    }
}

/// Periodically drop expired cache entries until stopped.
async fn sweep_loop(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(shared.config.sweep_interval);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                let removed = shared.cache.cleanup_expired();
                if removed > 0 {
                    info!(removed, size = shared.cache.len(), "cache cleanup");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::build_query;

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            read_timeout: Duration::from_millis(50),
            upstream_timeout: Duration::from_millis(200),
            query_timeout: Duration::from_millis(500),
            sweep_interval: Duration::from_millis(50),
            ..ProxyConfig::default()
        }
    }

    #[tokio::test]
    async fn new_is_inert() {
        let proxy = Proxy::new("127.0.0.1", 0, vec![]);

        assert!(!proxy.is_running());
        assert!(proxy.local_addr().is_none());
        assert_eq!(proxy.cache_size(), 0);
    }

    #[tokio::test]
    async fn start_twice_is_already_running() {
        let proxy = Proxy::new("127.0.0.1", 0, vec![]);

        proxy.start().unwrap();
        let second = proxy.start();

        assert!(matches!(second, Err(Error::AlreadyRunning)));
        assert!(proxy.is_running());
        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_twice_is_noop() {
        let proxy = Proxy::new("127.0.0.1", 0, vec![]);
        proxy.start().unwrap();

        assert!(proxy.stop().await.is_ok());
        assert!(proxy.stop().await.is_ok());
        assert!(!proxy.is_running());
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let proxy = Proxy::new("127.0.0.1", 0, vec![]);

        assert!(proxy.stop().await.is_ok());
    }

    #[tokio::test]
    async fn start_reports_port_in_use() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let proxy = Proxy::new("127.0.0.1", port, vec![]);

        let err = proxy.start().unwrap_err();

        assert!(matches!(err, Error::Bind { .. }));
        assert!(!proxy.is_running());
    }

    #[tokio::test]
    async fn start_reports_invalid_address() {
        let proxy = Proxy::new("not-an-ip", 5353, vec![]);

        let err = proxy.start().unwrap_err();

        match err {
            Error::Bind { addr, source } => {
                assert_eq!(addr, "not-an-ip:5353");
                assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn start_outside_runtime_fails() {
        let proxy = Proxy::new("127.0.0.1", 0, vec![]);

        assert!(proxy.start().is_err());
        assert!(!proxy.is_running());
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let proxy = Proxy::with_config("127.0.0.1", 0, vec![], test_config());

        proxy.start().unwrap();
        proxy.stop().await.unwrap();
        proxy.start().unwrap();

        assert!(proxy.is_running());
        proxy.stop().await.unwrap();
    }

    fn free_port() -> u16 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn stop_releases_fixed_port() {
        let port = free_port();
        let proxy = Proxy::with_config("127.0.0.1", port, vec![], test_config());

        proxy.start().unwrap();
        proxy.stop().await.unwrap();

        drop(std::net::UdpSocket::bind(("127.0.0.1", port)).unwrap());
        proxy.start().unwrap();
        assert_eq!(proxy.local_addr().map(|addr| addr.port()), Some(port));
        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_rejects_zero_sweep_interval() {
        let config = ProxyConfig {
            sweep_interval: Duration::ZERO,
            ..test_config()
        };
        let proxy = Proxy::with_config("127.0.0.1", 0, vec![], config);

        let err = proxy.start().unwrap_err();

        assert!(matches!(err, Error::Config(ref msg) if msg.contains("sweep_interval")));
        assert!(!proxy.is_running());
    }

    #[test]
    fn validate_rejects_zero_deadlines() {
        let zeroed = [
            ProxyConfig {
                read_timeout: Duration::ZERO,
                ..ProxyConfig::default()
            },
            ProxyConfig {
                upstream_timeout: Duration::ZERO,
                ..ProxyConfig::default()
            },
            ProxyConfig {
                query_timeout: Duration::ZERO,
                ..ProxyConfig::default()
            },
        ];

        for config in zeroed {
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn answer_is_discarded_once_socket_is_gone() {
        let proxy = Proxy::with_config(
            "127.0.0.1",
            0,
            vec!["127.0.0.1:9".to_owned()],
            test_config(),
        );
        proxy
            .shared
            .cache
            .set("example.com|1", &[0u8; 12], Duration::from_secs(60));
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let weak = Arc::downgrade(&socket);
        drop(socket);

        let client: SocketAddr = "127.0.0.1:9".parse().unwrap();
        handle_query(weak, proxy.shared.clone(), build_query(1, "example.com", 1), client).await;

        assert_eq!(proxy.stats().cached, 0);
        assert_eq!(proxy.cache_size(), 1);
    }

    #[tokio::test]
    async fn sweep_loop_removes_expired_entries() {
        let proxy = Proxy::with_config("127.0.0.1", 0, vec![], test_config());
        proxy
            .shared
            .cache
            .set("stale|1", &[0u8; 12], Duration::from_millis(1));
        proxy
            .shared
            .cache
            .set("live|1", &[0u8; 12], Duration::from_secs(600));

        proxy.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(proxy.cache_size(), 1);
        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn clear_cache_empties_cache() {
        let proxy = Proxy::new("127.0.0.1", 0, vec![]);
        proxy.shared.cache.set("a|1", &[1], Duration::from_secs(60));

        proxy.clear_cache();

        assert_eq!(proxy.cache_size(), 0);
    }

    #[tokio::test]
    async fn cache_hit_carries_query_id() {
        let proxy = Proxy::with_config(
            "127.0.0.1",
            0,
            vec!["127.0.0.1:9".to_owned()],
            test_config(),
        );
        let mut cached = build_query(0x1111, "example.com", 1);
        cached[2] |= 0x80; // QR
        proxy
            .shared
            .cache
            .set("example.com|1", &cached, Duration::from_secs(60));
        proxy.start().unwrap();
        let server = proxy.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&build_query(0x2222, "example.com", 1), server)
            .await
            .unwrap();
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dns::message_id(&buf[..len]), Some(0x2222));
        assert_eq!(buf[2..len], cached[2..]);
        assert_eq!(proxy.stats().cached, 1);
        proxy.stop().await.unwrap();
    }
}
