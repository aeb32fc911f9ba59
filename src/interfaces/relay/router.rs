use axum::{
    Router,
    http::Method,
    middleware,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use super::auth;
use super::handlers::{client, device, pairing, worker};

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

pub fn build_relay_router(state: AppState) -> Router {
    // Reachable before pairing.
    let pairing_routes = Router::new()
        .route("/pairing/status", get(pairing::status))
        .route("/pairing/claim", post(pairing::claim))
        .route("/pairing/confirm", post(pairing::confirm))
        .route("/pairing/qr", get(pairing::qr))
        .route("/health", get(|| async { "ok" }));

    // Device signatures and worker credentials are checked by the handlers.
    let signed_routes = Router::new()
        .route("/device/session", post(device::create_session))
        .route(
            "/device/worker-join-token",
            post(device::create_worker_join_token),
        )
        .route("/worker/join", post(worker::join))
        .route("/worker", get(worker::socket));

    let session_routes = Router::new()
        .route("/session", post(client::create_realtime_session))
        .route("/workers", get(worker::list))
        .route("/connect", post(client::connect_call))
        .route("/events", get(client::events))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    let gated_routes = signed_routes
        .merge(session_routes)
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_paired,
        ));

    Router::new()
        .merge(pairing_routes)
        .merge(gated_routes)
        .layer(build_cors())
        .with_state(state)
}
