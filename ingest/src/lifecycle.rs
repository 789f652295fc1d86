//! Startup, graceful shutdown, and close of one server instance.
//!
//! The server is a value: tests build several side by side, and nothing
//! here touches process globals. Setup runs a fixed list of steps, each
//! with bounded retry; shutdown runs the four-phase drain protocol and
//! then closes subsystems in a fixed order, returning the first error.

use crate::config::Config;
use crate::drain::DrainFlag;
use crate::errors::IngestError;
use crate::metrics_defs;
use crate::service::IngressService;
use crate::sink::{AsyncMultiTokenSink, ItemSink};
use crate::stats::Stats;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use shared::admin_service::AdminService;
use shared::http::serve_until_shutdown;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SETUP_RETRY_ATTEMPTS: u32 = 10;
pub const SETUP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Run one setup step up to `attempts` times, sleeping `delay` between
/// failures. Exhausting the attempts wraps the last error.
pub async fn retry<T, F, Fut>(
    step: &'static str,
    attempts: u32,
    delay: Duration,
    mut f: F,
) -> Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        tracing::info!(step, attempt, "running setup step");
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                return Err(IngestError::SetupFailed {
                    step,
                    attempts,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                tracing::warn!(step, error = %e, "setup step failed; trying again after a sleep");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

struct ListenerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    async fn close(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn bind_and_serve<S, B, E>(port: u16, service: S) -> Result<ListenerHandle, IngestError>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
    E: std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    tracing::info!(%addr, "listening");
    let task = tokio::spawn(serve_until_shutdown(listener, Arc::new(service), shutdown_rx));
    Ok(ListenerHandle {
        addr,
        shutdown,
        task,
    })
}

pub struct Server {
    config: Config,
    stats: Arc<Stats>,
    drain: Arc<DrainFlag>,
    cancel: CancellationToken,
    sink: Option<Arc<AsyncMultiTokenSink>>,
    ingest_listener: Option<ListenerHandle>,
    admin_listener: Option<ListenerHandle>,
}

impl Server {
    /// Run the ordered setup steps, each with bounded retry.
    pub async fn setup(config: Config) -> Result<Self, IngestError> {
        let stats = Arc::new(Stats::new());
        let drain = Arc::new(DrainFlag::new());
        let cancel = CancellationToken::new();

        let sink = retry(
            "construct data sink",
            SETUP_RETRY_ATTEMPTS,
            SETUP_RETRY_DELAY,
            || {
                let sink_config = config.sink.clone();
                async move { Ok(Arc::new(AsyncMultiTokenSink::new(&sink_config)?)) }
            },
        )
        .await?;
        tracing::info!(
            workers = config.sink.num_workers,
            buffer = config.sink.buffer_size,
            batch = config.sink.batch_size,
            datapoint_endpoint = %config.sink.datapoint_endpoint,
            event_endpoint = %config.sink.event_endpoint,
            "data sink configured"
        );

        let service = IngressService::new(
            sink.clone() as Arc<dyn ItemSink>,
            stats.clone(),
            drain.clone(),
            cancel.clone(),
            config.token_header.clone(),
            Vec::new(),
        );

        let ingest_listener = retry(
            "ingest listener",
            SETUP_RETRY_ATTEMPTS,
            SETUP_RETRY_DELAY,
            || {
                let service = service.clone();
                let port = config.ingest_port;
                async move { bind_and_serve(port, service).await }
            },
        )
        .await?;

        let admin_listener = retry(
            "admin listener",
            SETUP_RETRY_ATTEMPTS,
            SETUP_RETRY_DELAY,
            || {
                let drain = drain.clone();
                let port = config.admin_port;
                async move { bind_and_serve(port, AdminService::new(move || !drain.is_set())).await }
            },
        )
        .await?;

        retry(
            "register self metrics",
            SETUP_RETRY_ATTEMPTS,
            SETUP_RETRY_DELAY,
            || async {
                metrics_defs::register_all();
                Ok(())
            },
        )
        .await?;

        Ok(Self {
            config,
            stats,
            drain,
            cancel,
            sink: Some(sink),
            ingest_listener: Some(ingest_listener),
            admin_listener: Some(admin_listener),
        })
    }

    pub fn ingest_addr(&self) -> Option<SocketAddr> {
        self.ingest_listener.as_ref().map(|listener| listener.addr)
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_listener.as_ref().map(|listener| listener.addr)
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Serve until `shutdown` resolves, then drain and close.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<(), IngestError> {
        shutdown.await;
        tracing::info!("shutdown signal received");
        self.graceful_shutdown().await;
        self.close().await
    }

    /// The four-phase drain: set the flag, sleep out the load-balancer
    /// removal window, then wait for the request counter to go quiet,
    /// bounded by the hard ceiling.
    async fn graceful_shutdown(&self) {
        let graceful = &self.config.graceful;
        tracing::info!("starting graceful shutdown");
        self.drain.set();

        let hard_deadline = tokio::time::Instant::now() + graceful.max_wait;
        tokio::time::sleep(graceful.min_wait.min(graceful.max_wait)).await;
        tracing::info!("waiting for connections to drain");

        let mut previous = self.stats.total_connections();
        let mut quiet_since = std::time::Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(hard_deadline) => {
                    tracing::warn!("connections never drained; closing anyway");
                    return;
                }
                _ = tokio::time::sleep(graceful.check_interval) => {
                    let current = self.stats.total_connections();
                    if current != previous {
                        tracing::info!(new_requests = current - previous, "still seeing requests");
                        previous = current;
                        quiet_since = std::time::Instant::now();
                        continue;
                    }
                    if quiet_since.elapsed() >= graceful.silent_time {
                        tracing::info!("request counter went quiet; proceeding to close");
                        return;
                    }
                }
            }
        }
    }

    /// Close subsystems in order: data listener, admin listener, sink.
    /// The first error wins; later subsystems still get closed.
    pub async fn close(&mut self) -> Result<(), IngestError> {
        tracing::info!("close called");
        let mut first_error: Option<IngestError> = None;

        // unblock any producer still parked on a full queue
        self.cancel.cancel();

        if let Some(listener) = self.ingest_listener.take() {
            listener.close().await;
        }
        if let Some(listener) = self.admin_listener.take() {
            listener.close().await;
        }
        if let Some(sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                first_error.get_or_insert(e.into());
            }
        }

        tracing::info!("close done");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{wait_for, MockUpstream, UpstreamBehavior};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config(upstream: &MockUpstream) -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.ingest_port = 0;
        config.admin_port = 0;
        config.graceful.min_wait = Duration::from_millis(100);
        config.graceful.max_wait = Duration::from_secs(2);
        config.graceful.check_interval = Duration::from_millis(25);
        config.graceful.silent_time = Duration::from_millis(50);
        config.sink.num_workers = 1;
        config.sink.buffer_size = 100;
        config.sink.batch_size = 10;
        config.sink.shutdown_timeout = Duration::from_millis(200);
        config.sink.datapoint_endpoint = upstream.url("/v2/datapoint");
        config.sink.event_endpoint = upstream.url("/v2/event");
        config
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry("flaky", 5, Duration::from_millis(1), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err(IngestError::SelfReporting("nope".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = retry("doomed", 3, Duration::from_millis(1), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(IngestError::SelfReporting("still broken".to_string()))
            }
        })
        .await;

        match result.unwrap_err() {
            IngestError::SetupFailed { step, attempts, .. } => {
                assert_eq!(step, "doomed");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected SetupFailed, got {other}"),
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_serve_and_graceful_shutdown() {
        let upstream = MockUpstream::start(UpstreamBehavior::Ok).await;
        let server = Server::setup(test_config(&upstream)).await.unwrap();
        let ingest_addr = server.ingest_addr().unwrap();
        let admin_addr = server.admin_addr().unwrap();
        let stats = server.stats();

        let (trigger, signal) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(server.run_until(async {
            let _ = signal.await;
        }));

        let client = reqwest::Client::new();

        // health and readiness while serving
        let response = client
            .get(format!("http://{ingest_addr}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let response = client
            .get(format!("http://{admin_addr}/ready"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        // a data request flows through to the upstream
        let response = client
            .post(format!("http://{ingest_addr}/v2/datapoint"))
            .header("X-SF-Token", "t1")
            .body(r#"{"gauge": [{"metric": "m", "value": 1, "timestamp": 1000}]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        wait_for(|| upstream.item_count() == 1, Duration::from_secs(1)).await;
        let captured = upstream.requests();
        assert_eq!(captured[0].token.as_deref(), Some("t1"));
        assert_eq!(stats.total_connections(), 1);

        trigger.send(()).unwrap();

        // drain flag flips immediately: health 404 with Connection: close,
        // readiness gone, while the listener still accepts
        tokio::time::sleep(Duration::from_millis(20)).await;
        let response = client
            .get(format!("http://{ingest_addr}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        assert_eq!(
            response
                .headers()
                .get("connection")
                .and_then(|value| value.to_str().ok()),
            Some("close")
        );
        let response = client
            .get(format!("http://{admin_addr}/ready"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);

        // clean exit well inside max_wait
        let result = tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .expect("server exited within max_wait")
            .unwrap();
        assert!(result.is_ok(), "close reported {result:?}");

        // the listener is gone
        assert!(tokio::net::TcpStream::connect(ingest_addr).await.is_err());
    }

    #[tokio::test]
    async fn test_close_reports_sink_shutdown_timeout() {
        let upstream = MockUpstream::start(UpstreamBehavior::Stall).await;
        let mut config = test_config(&upstream);
        config.graceful.min_wait = Duration::from_millis(10);
        config.graceful.silent_time = Duration::from_millis(20);
        let server = Server::setup(config).await.unwrap();
        let ingest_addr = server.ingest_addr().unwrap();

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{ingest_addr}/v2/datapoint"))
            .header("X-SF-Token", "t1")
            .body(r#"{"gauge": [{"metric": "m", "value": 1}]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        // the stalled upstream pins the worker, so close times out
        let result = server.run_until(async {}).await;
        match result {
            Err(IngestError::Sink(crate::errors::SinkError::ShutdownTimeout { .. })) => {}
            other => panic!("expected sink shutdown timeout, got {other:?}"),
        }
    }
}
