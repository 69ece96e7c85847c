use axum::http::Request;
use signaling::SESSION_HEADER;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::{MakeSpan, TraceLayer},
};
use tracing::{Span, info_span};

pub type HttpTraceLayer = TraceLayer<SharedClassifier<ServerErrorsAsFailures>, HttpMakeSpan>;

pub fn http_trace_layer() -> HttpTraceLayer {
    TraceLayer::new_for_http().make_span_with(HttpMakeSpan)
}

/// 为每个请求创建 `http.request` span，附带发起请求的会话 ID（若有）
#[derive(Clone, Debug, Default)]
pub struct HttpMakeSpan;

impl<B> MakeSpan<B> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let session_id = request
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");

        info_span!(
            "http.request",
            method = %request.method(),
            uri = %request.uri(),
            version = ?request.version(),
            session_id = %session_id
        )
    }
}
