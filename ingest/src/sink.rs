//! The asynchronous multi-token sink.
//!
//! One bounded MPMC queue carries a tagged union of datapoints and events
//! for every tenant. A fixed fleet of workers drains it, groups what it
//! drained by (token, kind), and issues one upstream POST per group. No
//! worker owns a token; ordering holds within a single submission and
//! nowhere else.
//!
//! The sink never retries upstream: a failed batch is logged, counted and
//! dropped, because a retrying edge buffer with bounded memory amplifies
//! the very outages it is meant to absorb.

use crate::config::SinkConfig;
use crate::data::{Datapoint, Event, Item, ItemKind};
use crate::decoder::{render_datapoint_body, render_event_body};
use crate::errors::{IngestError, SinkError};
use crate::metrics_defs::{INCOMING_ITEMS, SINK_DROPPED_ITEMS};
use crate::TOKEN_HEADER;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Bound on the wait for the first item of a drain, so an idle worker
/// wakes regularly instead of parking on the queue forever.
const FIRST_ITEM_WAIT: Duration = Duration::from_millis(50);

/// Ceiling on one upstream request, connect included.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Where decoded items go. The ingress service talks to the sink through
/// this seam so tests can substitute a recorder.
#[async_trait]
pub trait ItemSink: Send + Sync {
    /// Enqueue one submission's items as a contiguous run.
    ///
    /// Blocks while the queue is full; if `cancel` fires first the run may
    /// be partially enqueued and a queue-full error comes back.
    async fn submit(
        &self,
        token: &str,
        items: Vec<Item>,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: ItemSink + ?Sized> ItemSink for Arc<S> {
    async fn submit(
        &self,
        token: &str,
        items: Vec<Item>,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        (**self).submit(token, items, cancel).await
    }
}

/// Counts items entering the sink for one protocol before delegating.
pub struct CountingSink {
    protocol: &'static str,
    inner: Arc<dyn ItemSink>,
    received: AtomicI64,
}

impl CountingSink {
    pub fn new(protocol: &'static str, inner: Arc<dyn ItemSink>) -> Self {
        Self {
            protocol,
            inner,
            received: AtomicI64::new(0),
        }
    }

    pub fn received(&self) -> i64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }
}

#[async_trait]
impl ItemSink for CountingSink {
    async fn submit(
        &self,
        token: &str,
        items: Vec<Item>,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        self.received.fetch_add(items.len() as i64, Ordering::Relaxed);
        metrics::counter!(
            INCOMING_ITEMS.name,
            "protocol" => self.protocol,
            "reason" => "incoming_counter",
        )
        .increment(items.len() as u64);
        self.inner.submit(token, items, cancel).await
    }
}

struct Slot {
    token: Arc<str>,
    item: Item,
}

/// One (token, kind) group formed inside a worker drain.
struct Batch {
    token: Arc<str>,
    kind: ItemKind,
    items: Vec<Item>,
}

pub struct AsyncMultiTokenSink {
    tx: async_channel::Sender<Slot>,
    rx: async_channel::Receiver<Slot>,
    closed: AtomicBool,
    workers: Mutex<JoinSet<()>>,
    shutdown_timeout: Duration,
    dropped_items: Arc<AtomicI64>,
}

impl AsyncMultiTokenSink {
    /// Build the sink and start its worker fleet on the current runtime.
    pub fn new(config: &SinkConfig) -> Result<Self, IngestError> {
        let (tx, rx) = async_channel::bounded(config.buffer_size.max(1));
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| IngestError::HttpClient(e.to_string()))?;

        let dropped_items = Arc::new(AtomicI64::new(0));
        let mut workers = JoinSet::new();
        for _ in 0..config.num_workers.max(1) {
            workers.spawn(worker_loop(Worker {
                rx: rx.clone(),
                client: client.clone(),
                datapoint_endpoint: config.datapoint_endpoint.clone(),
                event_endpoint: config.event_endpoint.clone(),
                batch_size: config.batch_size.max(1),
                dropped_items: dropped_items.clone(),
            }));
        }

        Ok(Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
            workers: Mutex::new(workers),
            shutdown_timeout: config.shutdown_timeout,
            dropped_items,
        })
    }

    /// Items currently buffered.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Items dropped after failed upstream POSTs.
    pub fn dropped(&self) -> i64 {
        self.dropped_items.load(Ordering::Relaxed)
    }

    /// Stop accepting submissions and give workers up to the shutdown
    /// timeout to flush. Whatever is still queued after that is discarded.
    pub async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.close();

        let mut workers = self.workers.lock().await;
        let deadline = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    let remaining = self.rx.len();
                    tracing::warn!(remaining, "sink workers did not drain in time");
                    return Err(SinkError::ShutdownTimeout {
                        timeout: self.shutdown_timeout,
                        remaining,
                    });
                }
                joined = workers.join_next() => {
                    if joined.is_none() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ItemSink for AsyncMultiTokenSink {
    async fn submit(
        &self,
        token: &str,
        items: Vec<Item>,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }

        let token: Arc<str> = Arc::from(token);
        for item in items {
            let slot = Slot {
                token: token.clone(),
                item,
            };
            tokio::select! {
                sent = self.tx.send(slot) => {
                    sent.map_err(|_| SinkError::Closed)?;
                }
                _ = cancel.cancelled() => {
                    return Err(SinkError::QueueFull);
                }
            }
        }
        Ok(())
    }
}

struct Worker {
    rx: async_channel::Receiver<Slot>,
    client: reqwest::Client,
    datapoint_endpoint: Url,
    event_endpoint: Url,
    batch_size: usize,
    dropped_items: Arc<AtomicI64>,
}

async fn worker_loop(worker: Worker) {
    loop {
        // Bounded wait for the first item, then a tight non-blocking
        // drain up to the batch size.
        let first = match tokio::time::timeout(FIRST_ITEM_WAIT, worker.rx.recv()).await {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => break, // closed and fully drained
            Err(_) => continue,
        };

        let mut drained = vec![first];
        while drained.len() < worker.batch_size {
            match worker.rx.try_recv() {
                Ok(slot) => drained.push(slot),
                Err(_) => break,
            }
        }

        for batch in group_by_token_and_kind(drained) {
            post_batch(&worker, batch).await;
        }
    }
}

/// Group a drain into per-(token, kind) batches, preserving drain order
/// within each group.
fn group_by_token_and_kind(drained: Vec<Slot>) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    let mut by_key: HashMap<(Arc<str>, ItemKind), usize> = HashMap::new();

    for slot in drained {
        let key = (slot.token.clone(), slot.item.kind());
        match by_key.get(&key) {
            Some(&index) => batches[index].items.push(slot.item),
            None => {
                by_key.insert(key, batches.len());
                batches.push(Batch {
                    kind: slot.item.kind(),
                    token: slot.token,
                    items: vec![slot.item],
                });
            }
        }
    }
    batches
}

async fn post_batch(worker: &Worker, batch: Batch) {
    let count = batch.items.len();

    let (endpoint, body) = match batch.kind {
        ItemKind::Datapoint => {
            let points: Vec<Datapoint> = batch
                .items
                .into_iter()
                .filter_map(|item| match item {
                    Item::Datapoint(point) => Some(point),
                    Item::Event(_) => None,
                })
                .collect();
            (&worker.datapoint_endpoint, render_datapoint_body(&points))
        }
        ItemKind::Event => {
            let events: Vec<Event> = batch
                .items
                .into_iter()
                .filter_map(|item| match item {
                    Item::Event(event) => Some(event),
                    Item::Datapoint(_) => None,
                })
                .collect();
            (&worker.event_endpoint, render_event_body(&events))
        }
    };

    let body = match body {
        Ok(body) => body,
        Err(e) => {
            worker.dropped_items.fetch_add(count as i64, Ordering::Relaxed);
            tracing::error!(error = %e, items = count, "failed to render upstream body; dropping batch");
            return;
        }
    };

    let result = worker
        .client
        .post(endpoint.clone())
        .header(TOKEN_HEADER, batch.token.as_ref())
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            worker.dropped_items.fetch_add(count as i64, Ordering::Relaxed);
            metrics::counter!(SINK_DROPPED_ITEMS.name).increment(count as u64);
            tracing::warn!(
                status = %response.status(),
                kind = batch.kind.as_str(),
                items = count,
                "upstream rejected batch; dropping"
            );
        }
        Err(e) => {
            worker.dropped_items.fetch_add(count as i64, Ordering::Relaxed);
            metrics::counter!(SINK_DROPPED_ITEMS.name).increment(count as u64);
            tracing::warn!(
                error = %e,
                kind = batch.kind.as_str(),
                items = count,
                "upstream request failed; dropping batch"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MetricType, Value};
    use crate::decoder::Decoder;
    use crate::testutils::{wait_for, MockUpstream, UpstreamBehavior};
    use std::collections::HashMap as StdHashMap;

    fn gauge(metric: &str, value: i64) -> Item {
        Item::Datapoint(Datapoint {
            metric: metric.to_string(),
            dimensions: StdHashMap::new(),
            value: Value::Integer(value),
            metric_type: MetricType::Gauge,
            timestamp: 0,
        })
    }

    fn event(event_type: &str) -> Item {
        Item::Event(Event {
            event_type: event_type.to_string(),
            category: crate::data::EventCategory::UserDefined,
            dimensions: StdHashMap::new(),
            properties: StdHashMap::new(),
            timestamp: 0,
        })
    }

    fn sink_config(upstream: &MockUpstream, workers: usize, buffer: usize, batch: usize) -> SinkConfig {
        SinkConfig {
            datapoint_endpoint: upstream.url("/v2/datapoint"),
            event_endpoint: upstream.url("/v2/event"),
            shutdown_timeout: Duration::from_secs(1),
            num_workers: workers,
            buffer_size: buffer,
            batch_size: batch,
        }
    }

    #[test]
    fn test_group_by_token_and_kind() {
        let token_a: Arc<str> = Arc::from("a");
        let token_b: Arc<str> = Arc::from("b");
        let drained = vec![
            Slot { token: token_a.clone(), item: gauge("m1", 1) },
            Slot { token: token_b.clone(), item: gauge("m2", 2) },
            Slot { token: token_a.clone(), item: event("e1") },
            Slot { token: token_a.clone(), item: gauge("m3", 3) },
        ];

        let batches = group_by_token_and_kind(drained);
        assert_eq!(batches.len(), 3);

        assert_eq!(batches[0].token.as_ref(), "a");
        assert_eq!(batches[0].kind, ItemKind::Datapoint);
        assert_eq!(batches[0].items, vec![gauge("m1", 1), gauge("m3", 3)]);

        assert_eq!(batches[1].token.as_ref(), "b");
        assert_eq!(batches[1].items.len(), 1);

        assert_eq!(batches[2].token.as_ref(), "a");
        assert_eq!(batches[2].kind, ItemKind::Event);
    }

    #[tokio::test]
    async fn test_batches_never_mix_tokens_or_kinds() {
        let upstream = MockUpstream::start(UpstreamBehavior::Ok).await;
        let sink = AsyncMultiTokenSink::new(&sink_config(&upstream, 1, 100, 5)).unwrap();
        let cancel = CancellationToken::new();

        let a_points: Vec<Item> = (0..7).map(|i| gauge("a.metric", i)).collect();
        let b_points: Vec<Item> = (0..5).map(|i| gauge("b.metric", i)).collect();
        let a_events: Vec<Item> = vec![event("deploy"), event("restart")];

        sink.submit("token-a", a_points, &cancel).await.unwrap();
        sink.submit("token-b", b_points, &cancel).await.unwrap();
        sink.submit("token-a", a_events, &cancel).await.unwrap();

        wait_for(|| upstream.item_count() == 14, Duration::from_secs(2)).await;

        let mut per_token_points: StdHashMap<String, usize> = StdHashMap::new();
        for request in upstream.requests() {
            let token = request.token.clone().expect("every POST carries a token");
            if request.path == "/v2/event" {
                assert_eq!(token, "token-a");
                continue;
            }
            assert_eq!(request.path, "/v2/datapoint");
            let items = crate::decoder::JsonDecoderV2
                .decode(&request.body)
                .expect("upstream body is valid v2 JSON");
            assert!(items.len() <= 5, "batch exceeded the configured size");
            for item in &items {
                match item {
                    Item::Datapoint(point) => {
                        // a batch never mixes tokens
                        let expected = format!("{}.metric", token.trim_start_matches("token-"));
                        assert_eq!(point.metric, expected);
                    }
                    other => panic!("expected datapoint, got {other:?}"),
                }
            }
            *per_token_points.entry(token).or_default() += items.len();
        }

        assert_eq!(per_token_points.get("token-a"), Some(&7));
        assert_eq!(per_token_points.get("token-b"), Some(&5));
    }

    #[tokio::test]
    async fn test_submission_order_preserved() {
        let upstream = MockUpstream::start(UpstreamBehavior::Ok).await;
        let sink = AsyncMultiTokenSink::new(&sink_config(&upstream, 1, 100, 100)).unwrap();
        let cancel = CancellationToken::new();

        let items: Vec<Item> = (0..20).map(|i| gauge(&format!("m{i:02}"), i)).collect();
        sink.submit("t", items, &cancel).await.unwrap();

        wait_for(|| upstream.item_count() == 20, Duration::from_secs(2)).await;

        let mut metrics_seen = Vec::new();
        for request in upstream.requests() {
            for item in crate::decoder::JsonDecoderV2.decode(&request.body).unwrap() {
                match item {
                    Item::Datapoint(point) => metrics_seen.push(point.metric),
                    other => panic!("expected datapoint, got {other:?}"),
                }
            }
        }
        let expected: Vec<String> = (0..20).map(|i| format!("m{i:02}")).collect();
        assert_eq!(metrics_seen, expected);
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let upstream = MockUpstream::start(UpstreamBehavior::Ok).await;
        let sink = AsyncMultiTokenSink::new(&sink_config(&upstream, 1, 10, 10)).unwrap();
        let cancel = CancellationToken::new();

        sink.close().await.unwrap();
        let err = sink.submit("t", vec![gauge("m", 1)], &cancel).await.unwrap_err();
        assert!(matches!(err, SinkError::Closed));
    }

    #[tokio::test]
    async fn test_close_flushes_queue() {
        let upstream = MockUpstream::start(UpstreamBehavior::Ok).await;
        let sink = AsyncMultiTokenSink::new(&sink_config(&upstream, 2, 100, 10)).unwrap();
        let cancel = CancellationToken::new();

        let items: Vec<Item> = (0..30).map(|i| gauge("m", i)).collect();
        sink.submit("t", items, &cancel).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(upstream.item_count(), 30);
        assert_eq!(sink.queued(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_returns_queue_full_on_cancel() {
        let upstream = MockUpstream::start(UpstreamBehavior::Stall).await;
        let mut config = sink_config(&upstream, 1, 2, 1);
        config.shutdown_timeout = Duration::from_millis(100);
        let sink = AsyncMultiTokenSink::new(&config).unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let items: Vec<Item> = (0..10).map(|i| gauge("m", i)).collect();
        let err = sink.submit("t", items, &cancel).await.unwrap_err();
        assert!(matches!(err, SinkError::QueueFull));
        // the partial run stays queued
        assert!(sink.queued() > 0);
    }

    #[tokio::test]
    async fn test_close_times_out_against_stalled_upstream() {
        let upstream = MockUpstream::start(UpstreamBehavior::Stall).await;
        let mut config = sink_config(&upstream, 1, 10, 2);
        config.shutdown_timeout = Duration::from_millis(100);
        let sink = AsyncMultiTokenSink::new(&config).unwrap();
        let cancel = CancellationToken::new();

        sink.submit("t", (0..6).map(|i| gauge("m", i)).collect(), &cancel)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = sink.close().await.unwrap_err();
        assert!(matches!(err, SinkError::ShutdownTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failed_upstream_drops_and_counts() {
        let upstream = MockUpstream::start(UpstreamBehavior::Fail(500)).await;
        let sink = AsyncMultiTokenSink::new(&sink_config(&upstream, 1, 10, 10)).unwrap();
        let cancel = CancellationToken::new();

        sink.submit("t", vec![gauge("m", 1), gauge("m", 2)], &cancel)
            .await
            .unwrap();

        wait_for(|| sink.dropped() == 2, Duration::from_secs(2)).await;
        assert_eq!(sink.dropped(), 2);
    }

    #[tokio::test]
    async fn test_counting_sink() {
        let upstream = MockUpstream::start(UpstreamBehavior::Ok).await;
        let inner = Arc::new(AsyncMultiTokenSink::new(&sink_config(&upstream, 1, 10, 10)).unwrap());
        let counting = CountingSink::new("sfx_json_v2", inner);
        let cancel = CancellationToken::new();

        counting
            .submit("t", vec![gauge("m", 1), gauge("m", 2), event("e")], &cancel)
            .await
            .unwrap();
        assert_eq!(counting.received(), 3);
    }
}
