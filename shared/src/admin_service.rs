use crate::http::{make_error_response, text_response};
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

/// Introspection listener for orchestration probes, separate from the data
/// listener so probes keep working while data traffic is saturated.
///
/// `/health` answers as long as the process is alive; `/ready` consults the
/// supplied closure, so a draining instance can drop out of rotation.
pub struct AdminService<F> {
    is_ready: F,
}

impl<F> AdminService<F>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self { is_ready }
    }
}

impl<F, B> Service<Request<B>> for AdminService<F>
where
    F: Fn() -> bool + Send + Sync + 'static,
    B: Body + Send + 'static,
{
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let is_ready = (self.is_ready)();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            let res = match path.as_str() {
                "/health" => text_response(StatusCode::OK, "ok\n"),
                "/ready" => match is_ready {
                    true => text_response(StatusCode::OK, "ok\n"),
                    false => make_error_response(StatusCode::SERVICE_UNAVAILABLE),
                },
                _ => make_error_response(StatusCode::NOT_FOUND),
            };
            Ok(res)
        })
    }
}
