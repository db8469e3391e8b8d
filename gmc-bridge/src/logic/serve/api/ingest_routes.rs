use crate::logic::serve::ingest::{IngestHandler, IngestOutcome, IngestRequest};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use warp::{
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    path::FullPath,
    reply::with_status,
    Filter, Rejection,
};

/// Longest a request may take to be processed and answered
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers attached to every response of the bridge
pub fn security_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    headers.insert(
        "x-permitted-cross-domain-policies",
        HeaderValue::from_static("none"),
    );
    // hide server information
    headers.insert(header::SERVER, HeaderValue::from_static(""));
    headers
}

/// Raw query string, empty when the request has none
fn raw_query() -> impl Filter<Extract = (String,), Error = Infallible> + Clone {
    warp::query::raw()
        .or(warp::any().map(String::new))
        .unify()
}

/// `GET|HEAD /<any path>?GID=..&CPM=..` report endpoint
///
/// Method, size and health-check decisions are made by the handler, so this
/// filter matches every request. The handler runs on its own task: a client
/// that hangs up or a request that outlives [`REQUEST_TIMEOUT`] never cuts a
/// report off halfway.
pub fn ingest(
    handler: Arc<IngestHandler>,
) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(warp::addr::remote())
        .and(warp::header::optional::<u64>("content-length"))
        .and(raw_query())
        .and_then(
            move |method: Method,
                  path: FullPath,
                  remote: Option<SocketAddr>,
                  content_length: Option<u64>,
                  query: String| {
                let handler = handler.clone();
                async move {
                    let request = IngestRequest {
                        method,
                        path: path.as_str().to_string(),
                        remote,
                        content_length,
                        query,
                    };
                    let task = tokio::spawn(async move { handler.handle(request).await });
                    let reply = match tokio::time::timeout(REQUEST_TIMEOUT, task).await {
                        Ok(Ok(outcome)) => {
                            if let IngestOutcome::Accepted { device_id, published } = &outcome {
                                debug!(device = %device_id, published, "report forwarded");
                            }
                            with_status(outcome.body(), outcome.status())
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "report handler task failed");
                            with_status("", StatusCode::INTERNAL_SERVER_ERROR)
                        }
                        Err(_) => {
                            warn!(
                                timeout = ?REQUEST_TIMEOUT,
                                "report still processing, answering early"
                            );
                            with_status("", StatusCode::SERVICE_UNAVAILABLE)
                        }
                    };
                    Ok::<_, Rejection>(reply)
                }
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::serve::api::api_routes;
    use crate::logic::serve::presence::PresenceTracker;
    use crate::logic::serve::publisher::testing::RecordingPublisher;
    use crate::logic::serve::rate_limit::TokenBucket;

    fn routes_with(
        limiter: TokenBucket,
    ) -> (
        Arc<RecordingPublisher>,
        impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone,
    ) {
        let publisher = Arc::new(RecordingPublisher::default());
        let tracker = Arc::new(PresenceTracker::new(
            publisher.clone(),
            "params",
            Duration::from_secs(1800),
        ));
        let handler = Arc::new(IngestHandler::new(
            tracker,
            publisher.clone(),
            Arc::new(limiter),
            "params",
        ));
        (publisher, api_routes(handler))
    }

    fn remote() -> SocketAddr {
        "198.51.100.20:34567".parse().unwrap()
    }

    #[tokio::test]
    async fn test_report_round_trip() {
        let (publisher, routes) = routes_with(TokenBucket::default());
        let res = warp::test::request()
            .method("GET")
            .path("/?GID=ABC123&CPM=17")
            .remote_addr(remote())
            .reply(&routes)
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "OK.ERR0");
        assert_eq!(publisher.on_topic("params/ABC123/CPM")[0].payload, "17");
        assert_eq!(publisher.on_topic("params/ABC123/last_update").len(), 1);
    }

    #[tokio::test]
    async fn test_hardening_headers_present() {
        let (_publisher, routes) = routes_with(TokenBucket::default());
        let res = warp::test::request()
            .method("GET")
            .path("/?CPM=x")
            .remote_addr(remote())
            .reply(&routes)
            .await;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let headers = res.headers();
        assert_eq!(headers["content-type"], "text/plain; charset=utf-8");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["content-security-policy"], "default-src 'none'");
        assert_eq!(headers["referrer-policy"], "no-referrer");
        assert_eq!(headers["server"], "");
    }

    #[tokio::test]
    async fn test_health_check_from_loopback() {
        let (publisher, routes) = routes_with(TokenBucket::default());
        let res = warp::test::request()
            .method("GET")
            .path("/")
            .remote_addr("127.0.0.1:40000".parse().unwrap())
            .reply(&routes)
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "HEALTHY");
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn test_post_not_allowed() {
        let (publisher, routes) = routes_with(TokenBucket::default());
        let res = warp::test::request()
            .method("POST")
            .path("/?CPM=1")
            .remote_addr(remote())
            .reply(&routes)
            .await;

        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (publisher, routes) = routes_with(TokenBucket::default());
        let res = warp::test::request()
            .method("GET")
            .path("/?CPM=1")
            .header("content-length", (200 * 1024).to_string())
            .remote_addr(remote())
            .reply(&routes)
            .await;

        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn test_burst_exhaustion_returns_429() {
        let (_publisher, routes) = routes_with(TokenBucket::default());
        let mut statuses = Vec::new();
        for _ in 0..120 {
            let res = warp::test::request()
                .method("GET")
                .path("/")
                .remote_addr("127.0.0.1:40000".parse().unwrap())
                .reply(&routes)
                .await;
            statuses.push(res.status());
        }

        assert!(statuses[..100].iter().all(|s| *s == StatusCode::OK));
        assert!(statuses[100..].contains(&StatusCode::TOO_MANY_REQUESTS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_broker_answers_503_and_report_completes() {
        let publisher = Arc::new(RecordingPublisher::delayed(Duration::from_secs(4)));
        let tracker = Arc::new(PresenceTracker::new(
            publisher.clone(),
            "params",
            Duration::from_secs(1800),
        ));
        let handler = Arc::new(IngestHandler::new(
            tracker.clone(),
            publisher.clone(),
            Arc::new(TokenBucket::default()),
            "params",
        ));
        let routes = api_routes(handler);

        let res = warp::test::request()
            .method("GET")
            .path("/?GID=ABC123&CPM=17&uSV=0.11")
            .remote_addr(remote())
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(res.headers()["x-frame-options"], "DENY");

        // status + two readings + last_update, 4 s each
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(publisher.on_topic("params/ABC123/status")[0].payload, "online");
        assert_eq!(publisher.on_topic("params/ABC123/CPM")[0].payload, "17");
        assert_eq!(publisher.on_topic("params/ABC123/last_update").len(), 1);
        assert!(tracker.snapshot().await[0].online);
    }

    #[tokio::test]
    async fn test_malformed_content_length_is_bad_request() {
        let (publisher, routes) = routes_with(TokenBucket::default());
        let res = warp::test::request()
            .method("GET")
            .path("/?CPM=1")
            .header("content-length", "lots")
            .remote_addr(remote())
            .reply(&routes)
            .await;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.headers()["x-frame-options"], "DENY");
        assert!(publisher.messages().is_empty());
    }
}
