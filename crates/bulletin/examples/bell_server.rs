use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, post},
    Router,
};
use bulletin::{
    Announcement, AnnouncementPatch, AnnouncementSource, Audience, BulletinState, FeedEvent,
    FileMedium, MemoryFeed, MemorySource, SyncEngine,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use uuid::Uuid;

/// Stands in for the external store and its real-time layer
#[derive(Clone)]
struct Backend {
    source: MemorySource,
    feed: MemoryFeed,
}

#[derive(Debug, Deserialize)]
pub struct CreateAnnouncementRequest {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub important: bool,
    #[serde(default)]
    pub audience: Audience,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAnnouncementRequest {
    pub title: Option<String>,
    pub body: Option<String>,
    pub important: Option<bool>,
}

async fn create_announcement(
    State(backend): State<Backend>,
    Json(request): Json<CreateAnnouncementRequest>,
) -> Result<Json<Announcement>, StatusCode> {
    let mut announcement = Announcement::new(
        Uuid::new_v4().to_string(),
        request.title,
        request.audience,
        chrono::Utc::now(),
    );
    announcement.body = request.body;
    announcement.important = request.important;
    announcement.created_by = "admin".to_string();

    backend.source.upsert(announcement.clone());
    backend
        .feed
        .publish_event(&FeedEvent::Create(announcement.clone()))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("Created announcement: {}", announcement.id);
    Ok(Json(announcement))
}

async fn update_announcement(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    Json(request): Json<UpdateAnnouncementRequest>,
) -> Result<StatusCode, StatusCode> {
    let mut patch = AnnouncementPatch::new(id.clone());
    patch.title = request.title;
    patch.body = request.body;
    patch.important = request.important;

    let mut rows = backend
        .source
        .query_announcements(Audience::All)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let row = rows
        .iter_mut()
        .find(|row| row.id == id)
        .ok_or(StatusCode::NOT_FOUND)?;
    row.merge(&patch);
    backend.source.upsert(row.clone());

    backend
        .feed
        .publish_event(&FeedEvent::Update(patch))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("Updated announcement: {}", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_announcement(
    State(backend): State<Backend>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    backend.source.remove(&id);
    backend
        .feed
        .publish_event(&FeedEvent::Delete { id: id.clone() })
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("Deleted announcement: {}", id);
    Ok(StatusCode::NO_CONTENT)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting Bell Server with Bulletin...");

    let backend = Backend {
        source: MemorySource::with_rows(vec![Announcement::new(
            "welcome",
            "Welcome back to school",
            Audience::All,
            chrono::Utc::now(),
        )]),
        feed: MemoryFeed::new(),
    };

    let medium = FileMedium::open("./data/bulletin").await?;
    let engine = SyncEngine::new(
        Arc::new(backend.source.clone()),
        Arc::new(backend.feed.clone()),
        Arc::new(medium),
    );

    let state = engine.fetch(Audience::All).await;
    info!(
        "Loaded {} announcements, {} unread",
        state.len(),
        state.unread_count()
    );
    let _subscription = engine.subscribe(Audience::All);

    let admin = Router::new()
        .route("/admin/announcements", post(create_announcement))
        .route(
            "/admin/announcements/{id}",
            delete(delete_announcement).put(update_announcement),
        )
        .with_state(backend);

    let app = bulletin::router_with_state(BulletinState::new(engine, Audience::All)).merge(admin);

    // Start server
    let listener = TcpListener::bind("127.0.0.1:3001").await?;
    info!("Server running on http://127.0.0.1:3001");
    info!("WebSocket endpoint available at ws://127.0.0.1:3001/announcements/ws");
    info!("API endpoints:");
    info!("  GET    /announcements              - Current list and unread count");
    info!("  POST   /announcements/refresh      - Re-fetch from the store");
    info!("  POST   /announcements/:id/read     - Mark one announcement read");
    info!("  POST   /announcements/read-all     - Mark everything read");
    info!("  POST   /admin/announcements        - Publish an announcement");
    info!("  PUT    /admin/announcements/:id    - Edit an announcement");
    info!("  DELETE /admin/announcements/:id    - Delete an announcement");

    axum::serve(listener, app).await?;

    Ok(())
}
