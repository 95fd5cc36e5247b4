use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use axum::{Router, routing};
use edgecache_service::DeliveryRequest;
use edgecache_service::backend::Credentials;
use serde::Deserialize;

use crate::endpoints::common::{ApiResult, delivery_response};
use crate::state::ServiceState;

/// The `mode` query value that requests an attachment download.
const MODE_DOWNLOAD: &str = "download";

pub fn router() -> Router<ServiceState> {
    Router::new()
        .route("/{bucket}", routing::get(object_get_missing))
        .route("/{bucket}/", routing::get(object_get_missing))
        .route("/{bucket}/{*path}", routing::get(object_get))
}

/// Query parameters of an object request.
#[derive(Debug, Default, Deserialize)]
struct ObjectQuery {
    mode: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
}

impl ObjectQuery {
    fn download(&self) -> bool {
        self.mode.as_deref() == Some(MODE_DOWNLOAD)
    }

    /// Credentials given in the query, if both keys are present.
    fn credentials(&self) -> Option<Credentials> {
        match (self.access_key.as_deref(), self.secret_key.as_deref()) {
            (Some(access_key), Some(secret_key))
                if !access_key.is_empty() && !secret_key.is_empty() =>
            {
                Some(Credentials::new(access_key, secret_key))
            }
            _ => None,
        }
    }
}

async fn object_get(
    State(state): State<ServiceState>,
    Path((bucket, path)): Path<(String, String)>,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    sentry::configure_scope(|s| {
        s.set_tag("bucket", &bucket);
        s.set_extra("key", path.clone().into());
    });

    let range = headers
        .get(header::RANGE)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

    let request = DeliveryRequest {
        bucket,
        key: path,
        range,
        download: query.download(),
        credentials: query.credentials(),
    };

    let delivery = state.engine.deliver(request).await?;
    Ok(delivery_response(delivery))
}

async fn object_get_missing(
    State(state): State<ServiceState>,
    Path(bucket): Path<String>,
) -> ApiResult<Response> {
    let request = DeliveryRequest {
        bucket,
        ..Default::default()
    };

    let delivery = state.engine.deliver(request).await?;
    Ok(delivery_response(delivery))
}
