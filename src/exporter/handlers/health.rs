//! `GET /health`: liveness probe for the scrape server itself. There is no
//! database to ping here — reaching this handler at all means the Tokio
//! runtime serving it is alive, which is everything a sidecar's liveness
//! probe needs.

use crate::build_info::GIT_COMMIT_HASH;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
    name: String,
    version: String,
}

#[tracing::instrument(fields(http.route = "/health"))]
pub async fn health() -> impl IntoResponse {
    Json(Health {
        commit: (GIT_COMMIT_HASH != ":-(").then(|| GIT_COMMIT_HASH.to_string()),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn health_reports_package_name() {
        let response = health().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
