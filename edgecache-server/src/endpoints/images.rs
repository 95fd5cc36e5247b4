use axum::extract::{Path, State};
use axum::response::Response;
use axum::{Router, routing};
use edgecache_service::ImageRequest;

use crate::endpoints::common::{ApiResult, delivery_response};
use crate::state::ServiceState;

pub fn router() -> Router<ServiceState> {
    Router::new()
        .route("/images/", routing::get(image_get_missing))
        .route("/images/{*path}", routing::get(image_get))
}

async fn image_get(
    State(state): State<ServiceState>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    sentry::configure_scope(|s| s.set_extra("key", path.clone().into()));

    let delivery = state.engine.deliver_image(ImageRequest { key: path }).await?;
    Ok(delivery_response(delivery))
}

async fn image_get_missing(State(state): State<ServiceState>) -> ApiResult<Response> {
    let delivery = state
        .engine
        .deliver_image(ImageRequest::default())
        .await?;
    Ok(delivery_response(delivery))
}
