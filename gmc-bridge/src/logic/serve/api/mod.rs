pub mod ingest_routes;

use crate::logic::serve::api::ingest_routes::{ingest, security_headers};
use crate::logic::serve::ingest::IngestHandler;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;
use warp::{http::StatusCode, reply::with_status, Filter, Rejection};

/// Compose the bridge's HTTP surface into one filter.
///
/// Reports are accepted on every path, so the ingest route is the whole API;
/// anything the filters reject (e.g. an unparsable `Content-Length`) becomes a
/// bare 400 carrying the same hardening headers.
pub fn api_routes(
    handler: Arc<IngestHandler>,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
    ingest(handler)
        .recover(|err: Rejection| async move {
            debug!(rejection = ?err, "request rejected before reaching the handler");
            Ok::<_, Infallible>(with_status("", StatusCode::BAD_REQUEST))
        })
        .with(warp::reply::with::headers(security_headers()))
}
