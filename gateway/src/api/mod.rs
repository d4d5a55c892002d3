use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use skyblock_common::models::island::IslandStatus;
use tracing::instrument;
use uuid::Uuid;

use crate::bus::ClientRegistry;
use crate::dal::Dal;
use crate::service::{IslandService, ReadySelector, StartOutcome};
use crate::{Error, ErrorKind};

/// State shared by every handler.
pub struct RouterState<D: Dal> {
    pub service: IslandService<D>,
    pub registry: ClientRegistry,
    pub admin_key: String,
}

impl<D: Dal> Clone for RouterState<D> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            registry: self.registry.clone(),
            admin_key: self.admin_key.clone(),
        }
    }
}

pub struct ApiBuilder<D: Dal> {
    service: Option<IslandService<D>>,
    registry: ClientRegistry,
    admin_key: String,
}

impl<D: Dal> Default for ApiBuilder<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dal> ApiBuilder<D> {
    pub fn new() -> Self {
        Self {
            service: None,
            registry: ClientRegistry::default(),
            admin_key: String::new(),
        }
    }

    pub fn with_service(mut self, service: IslandService<D>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_registry(mut self, registry: ClientRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_admin_key(mut self, admin_key: impl Into<String>) -> Self {
        self.admin_key = admin_key.into();
        self
    }

    pub fn into_router(self) -> Router {
        let state = RouterState {
            service: self.service.expect("service is required"),
            registry: self.registry,
            admin_key: self.admin_key,
        };

        let admin = Router::new()
            .route("/islands", get(list_islands::<D>))
            .route("/islands/:island_id", delete(delete_island::<D>))
            .route("/islands/:island_id/update", post(queue_update::<D>))
            .route("/islands/:island_id/snapshots", get(list_snapshots::<D>))
            .route("/updates/queue_all", post(queue_all_updates::<D>))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                admin_guard::<D>,
            ));

        Router::new()
            .route("/", get(get_status))
            .route("/islands/:player_uuid", get(get_island::<D>))
            .route("/islands/:player_uuid/start", post(start_island::<D>))
            .route("/islands/:player_uuid/stop", post(stop_island::<D>))
            .route("/islands/:player_uuid/freeze", post(freeze_island::<D>))
            .route("/islands/:player_uuid/ready", post(mark_ready_solo::<D>))
            .route("/islands/team/:team_id/ready", post(mark_ready_team::<D>))
            .route("/teams/solo", post(create_solo::<D>))
            .route("/teams/my_team/:player_uuid", get(get_my_team::<D>))
            .route("/teams/join", post(join_team::<D>))
            .route("/teams/:team_id/leave", post(leave_team::<D>))
            .route("/teams/:team_id/rename", patch(rename_team::<D>))
            .route("/ws/:client_id", get(websocket::<D>))
            .nest("/admin", admin)
            .with_state(state)
    }
}

async fn admin_guard<D: Dal>(
    State(state): State<RouterState<D>>,
    request: Request<axum::body::Body>,
    next: Next<axum::body::Body>,
) -> Result<Response, StatusCode> {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {}", state.admin_key))
        .unwrap_or(false);

    if !state.admin_key.is_empty() && authorized {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn get_status() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[instrument(skip_all, fields(%player_uuid))]
async fn get_island<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(player_uuid): Path<Uuid>,
) -> Result<Response, Error> {
    let island = state
        .service
        .island_for_player(&player_uuid)
        .await?
        .ok_or(ErrorKind::IslandNotFound)?;

    Ok(Json(island).into_response())
}

#[derive(Deserialize)]
struct StartParams {
    player_name: String,
}

#[instrument(skip_all, fields(%player_uuid))]
async fn start_island<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(player_uuid): Path<Uuid>,
    Query(StartParams { player_name }): Query<StartParams>,
) -> Result<Response, Error> {
    let outcome = state.service.start_island(player_uuid, &player_name).await?;

    let response = match outcome {
        StartOutcome::Island(island) => (StatusCode::ACCEPTED, Json(island)).into_response(),
        StartOutcome::Queued(queue) => (
            StatusCode::ACCEPTED,
            Json(json!({ "queued": queue.to_string() })),
        )
            .into_response(),
    };

    Ok(response)
}

#[instrument(skip_all, fields(%player_uuid))]
async fn stop_island<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(player_uuid): Path<Uuid>,
) -> Result<Response, Error> {
    let island = state.service.stop_island(player_uuid).await?;

    Ok((StatusCode::ACCEPTED, Json(island)).into_response())
}

#[instrument(skip_all, fields(%player_uuid))]
async fn freeze_island<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(player_uuid): Path<Uuid>,
) -> Result<Response, Error> {
    let island = state.service.freeze_island(player_uuid).await?;

    Ok((StatusCode::ACCEPTED, Json(island)).into_response())
}

#[instrument(skip_all, fields(%player_uuid))]
async fn mark_ready_solo<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(player_uuid): Path<Uuid>,
) -> Result<Response, Error> {
    let island = state
        .service
        .mark_ready(ReadySelector::Player(player_uuid))
        .await?;

    Ok(Json(island).into_response())
}

#[instrument(skip_all, fields(team_id))]
async fn mark_ready_team<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(team_id): Path<i64>,
) -> Result<Response, Error> {
    let island = state.service.mark_ready(ReadySelector::Team(team_id)).await?;

    Ok(Json(island).into_response())
}

#[derive(Deserialize)]
struct SoloRequest {
    player_uuid: Uuid,
    player_name: String,
}

#[instrument(skip_all)]
async fn create_solo<D: Dal>(
    State(state): State<RouterState<D>>,
    Json(request): Json<SoloRequest>,
) -> Result<Response, Error> {
    let view = state
        .service
        .create_solo_island(request.player_uuid, &request.player_name)
        .await?;

    Ok((StatusCode::CREATED, Json(view)).into_response())
}

#[instrument(skip_all, fields(%player_uuid))]
async fn get_my_team<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(player_uuid): Path<Uuid>,
) -> Result<Response, Error> {
    let view = state.service.team_view_for_player(&player_uuid).await?;

    Ok(Json(view).into_response())
}

#[derive(Deserialize)]
struct JoinRequest {
    player_uuid: Uuid,
    team_name: String,
}

#[instrument(skip_all)]
async fn join_team<D: Dal>(
    State(state): State<RouterState<D>>,
    Json(request): Json<JoinRequest>,
) -> Result<Response, Error> {
    let view = state
        .service
        .join_team(request.player_uuid, &request.team_name)
        .await?;

    Ok(Json(view).into_response())
}

#[derive(Deserialize)]
struct MemberRequest {
    player_uuid: Uuid,
}

#[instrument(skip_all, fields(team_id))]
async fn leave_team<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(team_id): Path<i64>,
    Json(request): Json<MemberRequest>,
) -> Result<Response, Error> {
    state.service.leave_team(team_id, request.player_uuid).await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
struct RenameRequest {
    player_uuid: Uuid,
    name: String,
}

#[instrument(skip_all, fields(team_id))]
async fn rename_team<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(team_id): Path<i64>,
    Json(request): Json<RenameRequest>,
) -> Result<Response, Error> {
    let view = state
        .service
        .rename_team(team_id, request.player_uuid, &request.name)
        .await?;

    Ok(Json(view).into_response())
}

#[derive(Deserialize)]
struct StatusFilter {
    status: Option<IslandStatus>,
}

#[instrument(skip_all)]
async fn list_islands<D: Dal>(
    State(state): State<RouterState<D>>,
    Query(StatusFilter { status }): Query<StatusFilter>,
) -> Result<Response, Error> {
    let statuses = match status {
        Some(status) => vec![status],
        None => IslandStatus::ALL.to_vec(),
    };
    let islands = state.service.dal().islands_with_statuses(&statuses).await?;

    Ok(Json(islands).into_response())
}

#[instrument(skip_all, fields(island_id))]
async fn delete_island<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(island_id): Path<i64>,
) -> Result<Response, Error> {
    let island = state.service.delete_island(island_id).await?;

    Ok((StatusCode::ACCEPTED, Json(island)).into_response())
}

#[instrument(skip_all, fields(island_id))]
async fn queue_update<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(island_id): Path<i64>,
) -> Result<Response, Error> {
    let entry = state.service.queue_update(island_id).await?;

    Ok((StatusCode::ACCEPTED, Json(entry)).into_response())
}

#[instrument(skip_all, fields(island_id))]
async fn list_snapshots<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(island_id): Path<i64>,
) -> Result<Response, Error> {
    let snapshots = state.service.list_snapshots(island_id).await?;

    Ok(Json(snapshots).into_response())
}

#[instrument(skip_all)]
async fn queue_all_updates<D: Dal>(
    State(state): State<RouterState<D>>,
) -> Result<Response, Error> {
    let queued = state.service.queue_all_updates().await?;

    Ok(Json(json!({ "queued": queued })).into_response())
}

async fn websocket<D: Dal>(
    State(state): State<RouterState<D>>,
    Path(client_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_client(socket, client_id, state.registry))
}

/// Pump bus events to one connected client until either side goes away.
async fn serve_client(mut socket: WebSocket, client_id: String, registry: ClientRegistry) {
    let (token, mut events) = registry.register(&client_id).await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(payload) => {
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                // Replaced by a reconnect.
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    registry.unregister(&client_id, token).await;
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::Request;
    use skyblock_common::models::island::Island;
    use tower::ServiceExt;

    use super::*;
    use crate::dal::Sqlite;
    use crate::tests::World;

    async fn test_router(world: &World) -> Router {
        ApiBuilder::<Sqlite>::new()
            .with_service(world.service.clone())
            .with_admin_key("test-key")
            .into_router()
    }

    #[tokio::test]
    async fn status_endpoint_is_public() {
        let world = World::new().await;
        let router = test_router(&world).await;

        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_island_is_a_404() {
        let world = World::new().await;
        let router = test_router(&world).await;

        let response = router
            .oneshot(
                Request::get(format!("/islands/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_is_accepted_asynchronously() {
        let world = World::new().await;
        let router = test_router(&world).await;
        let player = World::player();

        let response = router
            .oneshot(
                Request::post(format!("/islands/{player}/start?player_name=Alice"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let island: Island = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            island.status,
            skyblock_common::models::island::IslandStatus::PendingCreation
        );
    }

    #[tokio::test]
    async fn illegal_transitions_are_conflicts() {
        let world = World::new().await;
        let player = World::player();
        let island = world.service.create_island(player, "Alice").await.unwrap();
        world
            .wait_for_status(island.id, skyblock_common::models::island::IslandStatus::Stopped)
            .await;

        let router = test_router(&world).await;
        let response = router
            .oneshot(
                Request::post(format!("/islands/{player}/freeze"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn admin_routes_require_the_key() {
        let world = World::new().await;

        let router = test_router(&world).await;
        let response = router
            .oneshot(Request::get("/admin/islands").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let router = test_router(&world).await;
        let response = router
            .oneshot(
                Request::get("/admin/islands")
                    .header("Authorization", "Bearer test-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
