pub mod appresult;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod lifecycle;
pub mod models;
pub mod observer;
pub mod registry;
pub mod rooms;
pub mod session;
pub mod store;

use std::sync::Arc;

use axum::{
    Router,
    extract::FromRef,
    routing::post,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};

pub use appresult::{AppError, AppResult};

use crate::{
    config::Config,
    dispatch::Dispatcher,
    events::EventRouter,
    lifecycle::RoomLifecycle,
    registry::ConnectionRegistry,
    store::DocumentStore,
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub lifecycle: Arc<RoomLifecycle>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires the components together and starts the change observers and the teardown task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(store: Arc<dyn DocumentStore>, config: Config) -> Self {
        let (dispatcher, dropped) = Dispatcher::new(Arc::new(ConnectionRegistry::new()));
        let dispatcher = Arc::new(dispatcher);
        let router = Arc::new(EventRouter::new(store.clone()));
        let lifecycle = Arc::new(RoomLifecycle::new(
            store.clone(),
            dispatcher.clone(),
            config.owner_grace,
        ));

        let _ = observer::spawn_observers(&store, &router, &dispatcher);
        let _ = tokio::spawn(lifecycle.clone().run(dropped));

        Self {
            store,
            dispatcher,
            lifecycle,
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.dispatcher.registry()
    }
}

/// The full HTTP surface under `/api/v1`.
pub fn app(state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(
            state.config.session_expiry_minutes,
        )));

    let api = rooms::router().route(
        "/session",
        post(session::sign_in).delete(session::sign_out),
    );

    Router::new()
        .nest("/api/v1", api)
        .with_state(state)
        .layer(session_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
