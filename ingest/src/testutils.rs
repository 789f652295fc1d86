//! Helpers shared by the crate's tests: a recording sink and a mock
//! upstream ingest server.

use crate::data::Item;
use crate::errors::SinkError;
use crate::sink::ItemSink;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Poll `condition` until it holds or the timeout trips the test.
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An `ItemSink` that remembers submissions instead of forwarding them.
pub struct RecordingSink {
    submissions: Mutex<Vec<(String, Vec<Item>)>>,
    pub fail_queue_full: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            fail_queue_full: AtomicBool::new(false),
        }
    }

    pub fn submissions(&self) -> Vec<(String, Vec<Item>)> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn total_items(&self) -> usize {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, items)| items.len())
            .sum()
    }
}

#[async_trait]
impl ItemSink for RecordingSink {
    async fn submit(
        &self,
        token: &str,
        items: Vec<Item>,
        _cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        if self.fail_queue_full.load(Ordering::Relaxed) {
            return Err(SinkError::QueueFull);
        }
        self.submissions
            .lock()
            .unwrap()
            .push((token.to_string(), items));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub path: String,
    pub token: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub enum UpstreamBehavior {
    Ok,
    Fail(u16),
    Stall,
}

/// A throwaway upstream ingest server on a loopback port.
pub struct MockUpstream {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockUpstream {
    pub async fn start(behavior: UpstreamBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));

        let captured = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = hyper_util::rt::TokioIo::new(stream);
                let captured = captured.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let captured = captured.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();
                            let token = parts
                                .headers
                                .get(crate::TOKEN_HEADER)
                                .and_then(|value| value.to_str().ok())
                                .map(str::to_string);
                            captured.lock().unwrap().push(CapturedRequest {
                                path: parts.uri.path().to_string(),
                                token,
                                body,
                            });

                            match behavior {
                                UpstreamBehavior::Ok => {}
                                UpstreamBehavior::Fail(status) => {
                                    return Ok::<_, std::convert::Infallible>(
                                        Response::builder()
                                            .status(status)
                                            .body(Full::new(Bytes::from_static(b"nope")))
                                            .unwrap(),
                                    );
                                }
                                UpstreamBehavior::Stall => std::future::pending::<()>().await,
                            }
                            Ok(Response::new(Full::new(Bytes::from_static(b"\"OK\""))))
                        }
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    )
                    .serve_connection(io, service)
                    .await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", self.addr, path)).unwrap()
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Total items across every captured body.
    pub fn item_count(&self) -> usize {
        self.requests()
            .iter()
            .map(|request| count_items(&request.body, &request.path))
            .sum()
    }
}

fn count_items(body: &[u8], path: &str) -> usize {
    if path.ends_with("/event") {
        serde_json::from_slice::<Vec<serde_json::Value>>(body)
            .map(|events| events.len())
            .unwrap_or(0)
    } else {
        serde_json::from_slice::<BTreeMap<String, Vec<serde_json::Value>>>(body)
            .map(|by_type| by_type.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}
