//! `GET /metrics` (§6 "External interfaces"): the scrape endpoint's only
//! real handler. Produces the Prometheus text-exposition bytes `collect()`
//! already rendered; errors are made rare by design (§4.4 "a single
//! corrupt cell does not fail a scrape"), so the only failure path left
//! here is exposition encoding itself, already folded into `collect()`
//! returning an empty body on that rare failure.

use crate::multiproc::collector::MultiProcessCollector;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::debug;

#[tracing::instrument(skip(collector), fields(http.route = "/metrics"))]
pub async fn metrics(Extension(collector): Extension<Arc<MultiProcessCollector>>) -> impl IntoResponse {
    let (body, content_type) = collector.collect().await;
    debug!(bytes = body.len(), "scrape collected");

    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_str(content_type).unwrap_or_else(|_| HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8")),
    );

    if body.is_empty() {
        return (StatusCode::INTERNAL_SERVER_ERROR, headers, "failed to encode metrics exposition".as_bytes().to_vec());
    }

    (StatusCode::OK, headers, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiproc::file_dict::FileStorageDict;
    use crate::multiproc::dict::StorageDict;
    use dashmap::DashSet;

    #[tokio::test]
    async fn empty_store_returns_ok_with_internal_family() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dict: Arc<dyn StorageDict> = Arc::new(FileStorageDict::open(tmp.path(), 1001).expect("open"));
        let collector = Arc::new(MultiProcessCollector::new(dict, vec![], Arc::new(DashSet::new())));

        let response = metrics(Extension(collector)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
