//! hostspool-api — REST API for the hosts pool.
//!
//! Axum route handlers for location configurations and the hosts of a
//! hosts pool location. Every body is JSON and every response uses the
//! `{success, data, error}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/locations` | List locations |
//! | GET | `/locations/{name}` | Get a location |
//! | PUT | `/locations/{name}` | Create a location |
//! | PATCH | `/locations/{name}` | Update a location |
//! | DELETE | `/locations/{name}` | Delete a location and its hosts |
//! | GET | `/hosts_pool/{location}` | List hosts (`?filter=` repeatable) |
//! | PUT | `/hosts_pool/{location}` | Apply a whole pool declaration |
//! | GET | `/hosts_pool/{location}/{host}` | Get a host |
//! | PUT | `/hosts_pool/{location}/{host}` | Add a host |
//! | PATCH | `/hosts_pool/{location}/{host}` | Update connection and labels |
//! | DELETE | `/hosts_pool/{location}/{host}` | Remove a free host |

pub mod handlers;

use axum::Router;
use axum::routing::get;
use hostspool_manager::HostsPoolManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: HostsPoolManager,
}

/// Build the API router.
pub fn build_router(manager: HostsPoolManager) -> Router {
    let api_state = ApiState { manager };

    Router::new()
        .route("/locations", get(handlers::list_locations))
        .route(
            "/locations/{name}",
            get(handlers::get_location)
                .put(handlers::create_location)
                .patch(handlers::update_location)
                .delete(handlers::delete_location),
        )
        .route(
            "/hosts_pool/{location}",
            get(handlers::list_hosts).put(handlers::apply_hosts),
        )
        .route(
            "/hosts_pool/{location}/{host}",
            get(handlers::get_host)
                .put(handlers::add_host)
                .patch(handlers::update_host)
                .delete(handlers::remove_host),
        )
        .with_state(api_state)
}
