use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::{Json, Response},
    routing::{get, post},
    Router,
};

pub mod handler;

pub use handler::WebSocketHandler;

use crate::announcement::Audience;
use crate::engine::{SyncEngine, SyncState};

/// Axum state wrapper for a sync engine
#[derive(Clone)]
pub struct BulletinState {
    engine: SyncEngine,
    audience: Audience,
}

impl BulletinState {
    /// Create a state serving `engine` to clients of `audience`
    pub fn new(engine: SyncEngine, audience: Audience) -> Self {
        Self { engine, audience }
    }

    /// Get the sync engine
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Audience used for refreshes
    pub fn audience(&self) -> Audience {
        self.audience
    }
}

/// Create a router exposing the engine's state and operations
///
/// - `GET  /announcements`             current state
/// - `POST /announcements/refresh`     re-run the bulk fetch
/// - `POST /announcements/{id}/read`   mark one announcement read
/// - `POST /announcements/read-all`    mark every listed announcement read
/// - `GET  /announcements/ws`          WebSocket pushing every state change
pub fn router_with_engine(engine: SyncEngine, audience: Audience) -> Router {
    router_with_state(BulletinState::new(engine, audience))
}

/// Create the same router from an existing `BulletinState`
pub fn router_with_state(state: BulletinState) -> Router {
    Router::new()
        .route("/announcements", get(get_state))
        .route("/announcements/refresh", post(refresh))
        .route("/announcements/read-all", post(mark_all_read))
        .route("/announcements/{id}/read", post(mark_read))
        .route("/announcements/ws", get(websocket_handler))
        .with_state(state)
}

async fn get_state(State(state): State<BulletinState>) -> Json<SyncState> {
    Json(state.engine.state())
}

async fn refresh(State(state): State<BulletinState>) -> Json<SyncState> {
    Json(state.engine.fetch(state.audience).await)
}

async fn mark_read(State(state): State<BulletinState>, Path(id): Path<String>) -> Json<SyncState> {
    Json(state.engine.mark_read(&id).await)
}

async fn mark_all_read(State(state): State<BulletinState>) -> Json<SyncState> {
    Json(state.engine.mark_all_read().await)
}

/// WebSocket handler endpoint
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<BulletinState>) -> Response {
    ws.on_upgrade(move |socket| WebSocketHandler::new(socket, state).handle())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announcement::Announcement;
    use crate::feed::MemoryFeed;
    use crate::ledger::MemoryMedium;
    use crate::source::MemorySource;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_engine() -> SyncEngine {
        let at = |h| Utc.with_ymd_and_hms(2024, 10, 7, h, 0, 0).unwrap();
        let source = MemorySource::with_rows(vec![
            Announcement::new("x", "Timetable", Audience::All, at(8)),
            Announcement::new("y", "Field trip", Audience::Student, at(9)),
            Announcement::new("z", "Staff lunch", Audience::Teacher, at(10)),
        ]);
        SyncEngine::new(
            Arc::new(source),
            Arc::new(MemoryFeed::new()),
            Arc::new(MemoryMedium::new()),
        )
    }

    async fn call(app: &Router, request: Request<Body>) -> SyncState {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_and_read_routes() {
        let app = router_with_engine(test_engine(), Audience::Student);

        let state = call(&app, Request::get("/announcements").body(Body::empty()).unwrap()).await;
        assert!(state.is_empty());

        let state = call(
            &app,
            Request::post("/announcements/refresh")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(state.ids(), vec!["y", "x"]);
        assert_eq!(state.unread_count(), 2);

        let state = call(
            &app,
            Request::post("/announcements/y/read")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(state.unread_count(), 1);
        assert_eq!(state.is_read("y"), Some(true));

        let state = call(
            &app,
            Request::post("/announcements/read-all")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(state.unread_count(), 0);
    }
}
