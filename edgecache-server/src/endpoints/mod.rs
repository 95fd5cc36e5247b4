//! Contains all HTTP endpoint handlers.
//!
//! Use [`routes`] to create a router with all endpoints.

use axum::Router;

use crate::state::ServiceState;

pub mod common;
pub mod health;
mod images;
mod objects;

/// Creates the router for all endpoints.
///
/// Health and image routes are matched before the generic `/{bucket}/{*path}` route.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .merge(health::router())
        .merge(images::router())
        .merge(objects::router())
}
