//! The ingress HTTP service.
//!
//! One hyper service handles every data endpoint plus the health check.
//! Each data request runs a fixed pipeline: token extraction, decoder
//! selection by path and content type, decode, submit to the per-protocol
//! counting sink, and request accounting on the way out. Unknown paths
//! get a counted 404; while the drain flag is set every response carries
//! `Connection: close`.

use crate::data::MetricType;
use crate::decoder::{
    CollectdJsonDecoder, Decoder, JsonDecoderV1, JsonDecoderV2, JsonEventDecoderV2,
    ProtobufDecoderV1, ProtobufDecoderV2, ProtobufEventDecoderV2,
};
use crate::drain::DrainFlag;
use crate::errors::DecodeError;
use crate::metrics_defs::{
    BACKPRESSURE_ERRORS, DECODE_ERRORS, HEALTH_CHECKS, HTTP_NOT_FOUND, REQUESTS_ACTIVE,
    REQUESTS_TOTAL, REQUEST_DURATION,
};
use crate::sink::{CountingSink, ItemSink};
use crate::stats::Stats;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_TYPE};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{make_error_response, text_response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Tokens are opaque bytes, but bounded.
const MAX_TOKEN_LEN: usize = 256;

struct Endpoint {
    decoder: Box<dyn Decoder>,
    sink: Arc<CountingSink>,
}

struct Route {
    path: &'static str,
    json: Endpoint,
    protobuf: Option<Endpoint>,
}

impl Route {
    /// The endpoint path picks the decoder; the content type only picks
    /// the protobuf variant where one exists.
    fn select(&self, headers: &HeaderMap) -> &Endpoint {
        if let Some(protobuf) = &self.protobuf {
            if is_protobuf(headers) {
                return protobuf;
            }
        }
        &self.json
    }
}

fn is_protobuf(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|content_type| {
            content_type.contains("application/x-protobuf")
                || content_type.contains("application/octet-stream")
        })
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct IngressService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    routes: Vec<Route>,
    counters: Vec<Arc<CountingSink>>,
    stats: Arc<Stats>,
    drain: Arc<DrainFlag>,
    cancel: CancellationToken,
    standard_headers: Vec<(HeaderName, HeaderValue)>,
    token_header: String,
}

impl IngressService {
    pub fn new(
        sink: Arc<dyn ItemSink>,
        stats: Arc<Stats>,
        drain: Arc<DrainFlag>,
        cancel: CancellationToken,
        token_header: String,
        standard_headers: Vec<(HeaderName, HeaderValue)>,
    ) -> Self {
        let json_v1 = Arc::new(CountingSink::new("sfx_json_v1", sink.clone()));
        let protobuf_v1 = Arc::new(CountingSink::new("sfx_protobuf_v1", sink.clone()));
        let json_v2 = Arc::new(CountingSink::new("sfx_json_v2", sink.clone()));
        let protobuf_v2 = Arc::new(CountingSink::new("sfx_protobuf_v2", sink.clone()));
        let collectd = Arc::new(CountingSink::new("sfx_collectd_v1", sink));

        let routes = vec![
            Route {
                path: "/v1/datapoint",
                json: Endpoint {
                    decoder: Box::new(JsonDecoderV1::new(MetricType::Gauge)),
                    sink: json_v1.clone(),
                },
                protobuf: Some(Endpoint {
                    decoder: Box::new(ProtobufDecoderV1::new(MetricType::Gauge)),
                    sink: protobuf_v1.clone(),
                }),
            },
            Route {
                path: "/v2/datapoint",
                json: Endpoint {
                    decoder: Box::new(JsonDecoderV2),
                    sink: json_v2.clone(),
                },
                protobuf: Some(Endpoint {
                    decoder: Box::new(ProtobufDecoderV2),
                    sink: protobuf_v2.clone(),
                }),
            },
            Route {
                path: "/v2/event",
                json: Endpoint {
                    decoder: Box::new(JsonEventDecoderV2),
                    sink: json_v2.clone(),
                },
                protobuf: Some(Endpoint {
                    decoder: Box::new(ProtobufEventDecoderV2),
                    sink: protobuf_v2.clone(),
                }),
            },
            Route {
                path: "/v1/collectd",
                json: Endpoint {
                    decoder: Box::new(CollectdJsonDecoder),
                    sink: collectd.clone(),
                },
                protobuf: None,
            },
        ];

        Self {
            inner: Arc::new(ServiceInner {
                routes,
                counters: vec![json_v1, protobuf_v1, json_v2, protobuf_v2, collectd],
                stats,
                drain,
                cancel,
                standard_headers,
                token_header,
            }),
        }
    }

    /// Items counted into the sink for one protocol tag.
    pub fn protocol_received(&self, protocol: &str) -> i64 {
        self.inner
            .counters
            .iter()
            .filter(|counter| counter.protocol() == protocol)
            .map(|counter| counter.received())
            .sum()
    }
}

impl<B> Service<Request<B>> for IngressService
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.handle(req).await) })
    }
}

impl ServiceInner {
    async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let path = req.uri().path().to_string();

        let mut response = if req.method() == Method::GET && path == "/healthz" {
            self.health_response()
        } else {
            match self.routes.iter().find(|route| route.path == path) {
                Some(route) if req.method() == Method::POST => {
                    self.handle_data(route, req).await
                }
                _ => self.not_found_response(),
            }
        };

        for (name, value) in &self.standard_headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
        if self.drain.is_set() {
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }

    async fn handle_data<B>(&self, route: &Route, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let Some(token) = extract_token(req.headers(), &self.token_header) else {
            tracing::warn!(path = route.path, "authentication failed (no usable token)");
            return text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        };

        let endpoint = route.select(req.headers());

        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!(REQUESTS_ACTIVE.name).increment(1.0);
        let started = Instant::now();

        let span = tracing::info_span!(
            "data_request",
            path = route.path,
            protocol = endpoint.decoder.protocol()
        );
        let response = self
            .decode_and_submit(endpoint, &token, req)
            .instrument(span)
            .await;

        let elapsed = started.elapsed();
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!(REQUESTS_ACTIVE.name).decrement(1.0);
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(REQUESTS_TOTAL.name).increment(1);
        self.stats
            .total_processing_ns
            .fetch_add(elapsed.as_nanos() as i64, Ordering::Relaxed);
        self.stats.latency.observe(elapsed);
        metrics::histogram!(REQUEST_DURATION.name, "path" => route.path)
            .record(elapsed.as_secs_f64());

        response
    }

    async fn decode_and_submit<B>(
        &self,
        endpoint: &Endpoint,
        token: &str,
        req: Request<B>,
    ) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return self.decode_failure(DecodeError::Body(e.to_string()));
            }
        };

        let items = match endpoint.decoder.decode(&body) {
            Ok(items) => items,
            Err(e) => return self.decode_failure(e),
        };
        if items.is_empty() {
            return ok_response();
        }

        match endpoint.sink.submit(token, items, &self.cancel).await {
            Ok(()) => ok_response(),
            Err(e) => {
                self.stats
                    .backpressure_errors
                    .fetch_add(1, Ordering::Relaxed);
                metrics::counter!(BACKPRESSURE_ERRORS.name).increment(1);
                tracing::error!(error = %e, "unable to enqueue decoded items");
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "buffer full; retry later",
                )
            }
        }
    }

    fn decode_failure(&self, error: DecodeError) -> Response<Full<Bytes>> {
        self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(DECODE_ERRORS.name).increment(1);
        tracing::debug!(error = %error, "request body rejected");

        let mut response = Response::new(Full::new(Bytes::from(error.to_string())));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        response
    }

    fn health_response(&self) -> Response<Full<Bytes>> {
        if self.drain.is_set() {
            return text_response(StatusCode::NOT_FOUND, "graceful shutdown");
        }
        self.stats.health_checks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(HEALTH_CHECKS.name).increment(1);
        text_response(StatusCode::OK, "OK")
    }

    fn not_found_response(&self) -> Response<Full<Bytes>> {
        self.stats.not_found.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(HTTP_NOT_FOUND.name, "http_code" => "404").increment(1);
        make_error_response(StatusCode::NOT_FOUND)
    }
}

fn ok_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"\"OK\"")));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=UTF-8"),
    );
    response
}

/// Token from the configured header, falling back to HTTP Basic where the
/// username is empty or the literal `auth` and the password is the token.
fn extract_token(headers: &HeaderMap, token_header: &str) -> Option<String> {
    let header_token = headers
        .get(token_header)
        .and_then(|value| value.to_str().ok())
        .filter(|token| !token.is_empty())
        .map(str::to_string);

    let token = header_token.or_else(|| basic_auth_token(headers))?;
    (!token.is_empty() && token.len() <= MAX_TOKEN_LEN).then_some(token)
}

fn basic_auth_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    (username.is_empty() || username == "auth").then(|| password.to_string())
}
