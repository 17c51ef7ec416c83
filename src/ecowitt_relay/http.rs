// ecowitt_relay - Prometheus metrics relay for Ecowitt weather stations
//
// Copyright 2023 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::metrics::RelayMetrics;
use crate::report::{or_unknown, Form, Report};
use crate::watchdog::Activity;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const REPORT_PATH: &str = "/data/report";
pub const METRICS_PATH: &str = "/metrics";

const TEXT_FORMAT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// State shared by every request handler.
#[derive(Debug)]
pub struct RequestContext {
    metrics: RelayMetrics,
    activity: Activity,
    source_ip_header: Option<HeaderName>,
}

impl RequestContext {
    /// Create a new context. When `source_ip_header` is set, the value of that header
    /// is added to every series as the `source_ip` label.
    pub fn new(metrics: RelayMetrics, activity: Activity, source_ip_header: Option<HeaderName>) -> Self {
        RequestContext {
            metrics,
            activity,
            source_ip_header,
        }
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    fn source_ip(&self, headers: &HeaderMap) -> Option<String> {
        self.source_ip_header
            .as_ref()
            .map(|h| or_unknown(headers.get(h).and_then(|v| v.to_str().ok())))
    }
}

/// Build the router for station reports and Prometheus scrapes.
///
/// Reports are accepted at `/data/report` and any path below it, only with `POST`.
/// Everything else besides `/metrics` is a 404.
pub fn app(context: Arc<RequestContext>) -> Router {
    Router::new()
        .route(METRICS_PATH, get(text_metrics_handler))
        .fallback(http_route)
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

fn is_report_path(path: &str) -> bool {
    path.strip_prefix(REPORT_PATH)
        .map(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(false)
}

async fn http_route(
    State(context): State<Arc<RequestContext>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> StatusCode {
    match (&method, is_report_path(uri.path())) {
        (&Method::POST, true) => handle_report(&context, &uri, &headers, body),
        (_, true) => {
            tracing::info!(message = "method not allowed", method = %method, uri = %uri, headers = ?headers);
            StatusCode::METHOD_NOT_ALLOWED
        }
        _ => {
            tracing::info!(message = "unknown path", method = %method, uri = %uri, headers = ?headers);
            StatusCode::NOT_FOUND
        }
    }
}

fn handle_report(
    context: &RequestContext,
    uri: &Uri,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> StatusCode {
    let body = match body {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(message = "failed to read body stream", uri = %uri, error = %e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    tracing::debug!(
        message = "received report",
        uri = %uri,
        headers = ?headers,
        body = %String::from_utf8_lossy(&body),
    );

    // The station gets a success response once the body is read, bad payloads are only logged
    let form = match Form::parse(&body) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(message = "failed to parse as url encoded body", error = %e);
            return StatusCode::OK;
        }
    };

    let report = Report::from_form(form, context.source_ip(headers));
    let updated = context.metrics.observe(&report);
    context.activity.record();

    tracing::debug!(
        message = "processed report",
        model = %report.model,
        station_type = %report.station_type,
        updated = updated,
        rejected = report.rejected.len(),
    );

    StatusCode::OK
}

async fn text_metrics_handler(State(context): State<Arc<RequestContext>>) -> Response {
    match context.metrics.encode() {
        Ok(buf) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", num_bytes = buf.len());
            ([(CONTENT_TYPE, TEXT_FORMAT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod test {
    use super::{app, is_report_path, RequestContext};
    use crate::metrics::RelayMetrics;
    use crate::watchdog::Activity;
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{HeaderName, Method, Request, StatusCode};
    use axum::Router;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn setup(source_ip_header: Option<&'static str>) -> (Router, Arc<RequestContext>) {
        let context = Arc::new(RequestContext::new(
            RelayMetrics::new(source_ip_header.is_some()),
            Activity::default(),
            source_ip_header.map(HeaderName::from_static),
        ));

        (app(context.clone()), context)
    }

    fn post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    async fn scrape(router: &Router) -> String {
        let res = router
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(StatusCode::OK, res.status());
        let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_report_emits_gauges() {
        let (router, context) = setup(None);
        let res = router
            .clone()
            .oneshot(post("/data/report", "model=X&stationtype=Y&tempf=72.5&PASSKEY=abc"))
            .await
            .unwrap();

        assert_eq!(StatusCode::OK, res.status());
        assert_eq!(1, context.activity().count());

        let text = scrape(&router).await;
        assert!(text.contains("ecowitt_relay_tempf_raw{model=\"X\",stationType=\"Y\"} 72.5\n"));
        assert!(!text.contains("PASSKEY"));
        assert!(!text.contains("model_raw"));
        assert!(!text.contains("stationtype_raw"));
    }

    #[tokio::test]
    async fn test_report_below_prefix() {
        let (router, context) = setup(None);

        for uri in ["/data/report/", "/data/report/gw1000", "/data/report/a/b"] {
            let res = router.clone().oneshot(post(uri, "humidity=40")).await.unwrap();
            assert_eq!(StatusCode::OK, res.status(), "uri {}", uri);
        }

        assert_eq!(3, context.activity().count());
        assert_eq!(1, context.metrics().num_gauges());
    }

    #[tokio::test]
    async fn test_report_malformed_body() {
        let (router, context) = setup(None);
        let res = router
            .clone()
            .oneshot(post("/data/report", "tempf=72.5&humidity=%zz"))
            .await
            .unwrap();

        assert_eq!(StatusCode::OK, res.status());
        assert_eq!(0, context.activity().count());
        assert_eq!(0, context.metrics().num_gauges());
        assert!(!scrape(&router).await.contains("tempf"));
    }

    #[tokio::test]
    async fn test_report_body_read_failure() {
        let (router, context) = setup(None);
        let (sender, body) = Body::channel();
        sender.abort();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/data/report")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .unwrap();
        let res = router.clone().oneshot(req).await.unwrap();

        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, res.status());
        assert_eq!(0, context.activity().count());
        assert_eq!(0, context.metrics().num_gauges());
    }

    #[tokio::test]
    async fn test_report_non_utf8_value() {
        let (router, context) = setup(None);
        let res = router
            .clone()
            .oneshot(post("/data/report", "model=X&stationtype=Y&tempf=72.5&humidity=40&name=%FF"))
            .await
            .unwrap();

        assert_eq!(StatusCode::OK, res.status());
        assert_eq!(1, context.activity().count());
        assert_eq!(2, context.metrics().num_gauges());

        let text = scrape(&router).await;
        assert!(text.contains("ecowitt_relay_tempf_raw{model=\"X\",stationType=\"Y\"} 72.5\n"));
        assert!(text.contains("ecowitt_relay_humidity_raw{model=\"X\",stationType=\"Y\"} 40.0\n"));
    }

    #[tokio::test]
    async fn test_report_partial_numeric() {
        let (router, context) = setup(None);
        let res = router
            .clone()
            .oneshot(post("/data/report", "tempf=72.5&winddir=north&humidity=40"))
            .await
            .unwrap();

        assert_eq!(StatusCode::OK, res.status());
        assert_eq!(2, context.metrics().num_gauges());

        let text = scrape(&router).await;
        assert!(text.contains("ecowitt_relay_humidity_raw{model=\"unknown\",stationType=\"unknown\"} 40.0\n"));
        assert!(!text.contains("winddir"));
    }

    #[tokio::test]
    async fn test_report_wrong_method() {
        let (router, context) = setup(None);
        let res = router
            .oneshot(Request::builder().uri("/data/report?tempf=1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, res.status());
        assert_eq!(0, context.activity().count());
        assert_eq!(0, context.metrics().num_gauges());
    }

    #[tokio::test]
    async fn test_report_source_ip() {
        let (router, _context) = setup(Some("x-real-ip"));
        let mut req = post("/data/report", "model=X&stationtype=Y&tempf=60");
        req.headers_mut().insert("x-real-ip", "10.1.2.3".parse().unwrap());
        router.clone().oneshot(req).await.unwrap();
        router
            .clone()
            .oneshot(post("/data/report", "model=X&stationtype=Y&tempf=61"))
            .await
            .unwrap();

        let text = scrape(&router).await;
        assert!(text.contains("ecowitt_relay_tempf_raw{model=\"X\",stationType=\"Y\",source_ip=\"10.1.2.3\"} 60.0\n"));
        assert!(text.contains("ecowitt_relay_tempf_raw{model=\"X\",stationType=\"Y\",source_ip=\"unknown\"} 61.0\n"));
        assert!(text.contains(
            "ecowitt_relay_report_count_total{model=\"X\",stationType=\"Y\",source_ip=\"10.1.2.3\"} 1\n"
        ));
    }

    #[tokio::test]
    async fn test_metrics_content_type() {
        let (router, _context) = setup(None);
        let res = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(StatusCode::OK, res.status());
        let content_type = res.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        assert!(content_type.is_some_and(|ct| ct.starts_with("application/openmetrics-text")));
    }

    #[tokio::test]
    async fn test_metrics_wrong_method() {
        let (router, _context) = setup(None);
        let res = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, res.status());
    }

    #[test]
    fn test_is_report_path() {
        assert!(is_report_path("/data/report"));
        assert!(is_report_path("/data/report/"));
        assert!(is_report_path("/data/report/gw1000"));
        assert!(!is_report_path("/data/reports"));
        assert!(!is_report_path("/data"));
        assert!(!is_report_path("/"));
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let (router, _context) = setup(None);
        let res = router
            .oneshot(post("/weatherstation/updateweatherstation.php", "tempf=1"))
            .await
            .unwrap();

        assert_eq!(StatusCode::NOT_FOUND, res.status());
    }
}
