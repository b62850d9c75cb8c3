use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use exchange_core::country::countries;
use exchange_core::{
    roster_overview, stage_view, Assignment, Envelope, Event, ExchangeError, MemoryStore,
    MessageKind, Notifier, ParticipantStore, SignupDetails, SignupOutcome, Stage,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod error;

pub use error::ApiError;

/// Header carrying the login of the participant making the request. The host
/// in front of this service is responsible for authenticating it.
pub const IDENTITY_HEADER: &str = "x-participant";

#[derive(Clone)]
pub struct AppState {
    registry: Arc<RwLock<Registry>>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Delivery>>>>,
    persist_path: Option<PathBuf>,
    persist_lock: Arc<Mutex<()>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            persist_path: None,
            persist_lock: Arc::new(Mutex::new(())),
        }
    }
}

impl AppState {
    pub async fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut state = Self::default();
        state.persist_path = Some(path.clone());
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Registry>(&bytes) {
                Ok(saved) => {
                    let mut channels = state.channels.write().await;
                    for event_id in saved.events.keys() {
                        let (tx, _) = broadcast::channel(32);
                        channels.insert(event_id.clone(), tx);
                    }
                    info!(events = saved.events.len(), path = %path.display(), "loaded snapshot");
                    *state.registry.write().await = saved;
                }
                Err(err) => warn!(%err, path = %path.display(), "ignoring unreadable snapshot"),
            },
            Err(err) => debug!(%err, path = %path.display(), "no snapshot loaded"),
        }
        state
    }

    /// Writes the registry to disk. Snapshot and write happen under one lock so
    /// the last file written is always the newest snapshot.
    async fn persist(&self) {
        if let Some(path) = &self.persist_path {
            let _writing = self.persist_lock.lock().await;
            let snapshot = {
                let registry = self.registry.read().await;
                registry.clone()
            };
            match serde_json::to_vec_pretty(&snapshot) {
                Ok(json) => {
                    if let Err(err) = tokio::fs::write(path, json).await {
                        error!(%err, path = %path.display(), "persist error");
                    }
                }
                Err(err) => error!(%err, "snapshot serialization failed"),
            }
        }
    }

    async fn live_channel(&self, event_id: &str) -> Option<broadcast::Sender<Delivery>> {
        self.channels.read().await.get(event_id).cloned()
    }
}

/// Everything that survives a restart: event stages, rosters and mailboxes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Registry {
    events: HashMap<String, EventRecord>,
    participants: MemoryStore,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: Event,
    pub created_at: u64,
    #[serde(default)]
    pub mailbox: Vec<Delivery>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub delivered_at: u64,
    #[serde(flatten)]
    pub envelope: Envelope,
}

/// Stores each message in the event's mailbox and pushes it to any open
/// socket of the addressee.
struct Mailbox<'a> {
    deliveries: &'a mut Vec<Delivery>,
    live: Option<broadcast::Sender<Delivery>>,
}

impl Notifier for Mailbox<'_> {
    fn deliver(&mut self, envelope: Envelope) -> Result<(), ExchangeError> {
        let delivery = Delivery {
            id: Uuid::new_v4().to_string(),
            delivered_at: now_millis(),
            envelope,
        };
        if let Some(tx) = &self.live {
            // No subscribers is fine; the mailbox still has it.
            let _ = tx.send(delivery.clone());
        }
        self.deliveries.push(delivery);
        Ok(())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/countries", get(list_countries))
        .route("/event", post(create_event))
        .route("/event/:id", get(get_event))
        .route("/event/:id/stage", post(set_stage))
        .route("/event/:id/advance", post(advance_stage))
        .route("/event/:id/signup", post(signup))
        .route("/event/:id/view", get(view))
        .route("/event/:id/assign", post(draw))
        .route(
            "/event/:id/assignments",
            get(get_assignments).put(put_assignments),
        )
        .route("/event/:id/roster", get(roster))
        .route("/event/:id/message/recipient", post(message_recipient))
        .route("/event/:id/message/sender", post(message_sender))
        .route("/event/:id/inbox", get(inbox))
        .route("/ws/:id", get(ws_handler))
        .with_state(state)
}

fn identity(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn require_identity(headers: &HeaderMap) -> Result<String, ApiError> {
    identity(headers).ok_or(ApiError::LoginRequired)
}

fn valid_slug(slug: &str) -> bool {
    slug.len() <= 64
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Serialize)]
struct CountryEntry {
    code: &'static str,
    name: &'static str,
}

async fn list_countries() -> impl IntoResponse {
    let list: Vec<CountryEntry> = countries()
        .iter()
        .map(|&(code, name)| CountryEntry { code, name })
        .collect();
    Json(list)
}

#[derive(Deserialize, Default)]
struct CreateEventRequest {
    slug: Option<String>,
}

#[derive(Serialize)]
struct CreateEventResponse {
    event_id: String,
    stage: Stage,
}

async fn create_event(
    State(state): State<AppState>,
    body: Option<Json<CreateEventRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let event_id = match request
        .slug
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        Some(slug) if valid_slug(&slug) => slug,
        Some(_) => return Err(ApiError::InvalidEventId),
        None => Uuid::new_v4().to_string(),
    };

    let mut registry = state.registry.write().await;
    if registry.events.contains_key(&event_id) {
        return Err(ApiError::EventExists);
    }
    registry.events.insert(
        event_id.clone(),
        EventRecord {
            event: Event::new(event_id.clone()),
            created_at: now_millis(),
            mailbox: Vec::new(),
        },
    );
    drop(registry);

    let (tx, _) = broadcast::channel(32);
    state.channels.write().await.insert(event_id.clone(), tx);
    state.persist().await;
    info!(event = %event_id, "event created");

    Ok((
        StatusCode::CREATED,
        Json(CreateEventResponse {
            event_id,
            stage: Stage::Signup,
        }),
    ))
}

#[derive(Serialize)]
struct EventSummary {
    id: String,
    stage: Stage,
    participants: usize,
    assigned: usize,
}

fn summary(store: &MemoryStore, record: &EventRecord) -> EventSummary {
    let roster = store.roster(&record.event.id);
    EventSummary {
        id: record.event.id.clone(),
        stage: record.event.stage,
        participants: roster.len(),
        assigned: roster.iter().filter(|p| p.shipping_to.is_some()).count(),
    }
}

async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.registry.read().await;
    let record = registry
        .events
        .get(&event_id)
        .ok_or(ApiError::EventNotFound)?;
    Ok(Json(summary(&registry.participants, record)))
}

#[derive(Deserialize)]
struct StageRequest {
    stage: i64,
}

/// Organizer override: stores whatever stage is given, including unknown values.
async fn set_stage(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Json(payload): Json<StageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut registry = state.registry.write().await;
    let Registry {
        events,
        participants,
    } = &mut *registry;
    let record = events.get_mut(&event_id).ok_or(ApiError::EventNotFound)?;

    let stage = Stage::from_code(payload.stage);
    if !stage.is_valid() {
        warn!(event = %event_id, code = payload.stage, "event set to unknown stage");
    }
    record.event.stage = stage;
    let response = summary(participants, record);
    drop(registry);
    state.persist().await;
    info!(event = %event_id, stage = stage.code(), "stage set");

    Ok(Json(response))
}

async fn advance_stage(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut registry = state.registry.write().await;
    let Registry {
        events,
        participants,
    } = &mut *registry;
    let record = events.get_mut(&event_id).ok_or(ApiError::EventNotFound)?;

    record.event.stage = exchange_core::advance(record.event.stage)?;
    let response = summary(participants, record);
    drop(registry);
    state.persist().await;
    info!(event = %event_id, stage = response.stage.code(), "stage advanced");

    Ok(Json(response))
}

#[derive(Serialize)]
struct SignupResponse {
    outcome: SignupOutcome,
}

async fn signup(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Json(details): Json<SignupDetails>,
) -> Result<impl IntoResponse, ApiError> {
    let me = require_identity(&headers)?;
    let mut registry = state.registry.write().await;
    let Registry {
        events,
        participants,
    } = &mut *registry;
    let record = events.get(&event_id).ok_or(ApiError::EventNotFound)?;

    let outcome = exchange_core::sign_up(participants, &record.event, &me, details)?;
    drop(registry);
    state.persist().await;

    Ok(Json(SignupResponse { outcome }))
}

async fn view(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let viewer = identity(&headers);
    let registry = state.registry.read().await;
    let record = registry
        .events
        .get(&event_id)
        .ok_or(ApiError::EventNotFound)?;

    Ok(Json(stage_view(
        record.event.stage,
        viewer.as_deref(),
        &record.event.id,
        &registry.participants,
    )))
}

#[derive(Deserialize)]
struct DrawParams {
    seed: Option<u64>,
}

#[derive(Serialize)]
struct AssignmentsResponse {
    assignments: Assignment,
    count: usize,
    message: String,
}

impl AssignmentsResponse {
    fn saved(assignments: Assignment) -> Self {
        let count = assignments.len();
        Self {
            assignments,
            count,
            message: format!("{count} assignments saved"),
        }
    }
}

/// Draws and stores a fresh assignment. The draw and the write happen under
/// one registry lock so the roster cannot change in between.
async fn draw(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Query(params): Query<DrawParams>,
) -> Result<impl IntoResponse, ApiError> {
    let mut rng = params
        .seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(ChaCha8Rng::from_entropy);

    let mut registry = state.registry.write().await;
    let Registry {
        events,
        participants,
    } = &mut *registry;
    let record = events.get(&event_id).ok_or(ApiError::EventNotFound)?;

    let assignment = exchange_core::draw_assignments(participants, &record.event, &mut rng)?;
    drop(registry);
    state.persist().await;

    Ok(Json(AssignmentsResponse::saved(assignment)))
}

async fn get_assignments(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.registry.read().await;
    if !registry.events.contains_key(&event_id) {
        return Err(ApiError::EventNotFound);
    }
    let links = registry
        .participants
        .roster(&event_id)
        .into_iter()
        .filter_map(|p| p.shipping_to.map(|to| (p.id, to)))
        .collect();
    Ok(Json(Assignment::from_links(links)))
}

async fn put_assignments(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Json(assignment): Json<Assignment>,
) -> Result<impl IntoResponse, ApiError> {
    let mut registry = state.registry.write().await;
    let Registry {
        events,
        participants,
    } = &mut *registry;
    let record = events.get(&event_id).ok_or(ApiError::EventNotFound)?;

    let assignment = exchange_core::override_assignments(participants, &record.event, assignment)?;
    drop(registry);
    state.persist().await;

    Ok(Json(AssignmentsResponse::saved(assignment)))
}

async fn roster(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.registry.read().await;
    if !registry.events.contains_key(&event_id) {
        return Err(ApiError::EventNotFound);
    }
    Ok(Json(roster_overview(&registry.participants, &event_id)))
}

#[derive(Deserialize)]
struct MessageRequest {
    body: String,
}

#[derive(Serialize)]
struct MessageResponse {
    kind: MessageKind,
}

async fn message_recipient(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<MessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    send_message(state, event_id, headers, payload, MessageKind::ToRecipient).await
}

async fn message_sender(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<MessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    send_message(state, event_id, headers, payload, MessageKind::ToSender).await
}

/// The response never names the addressee: a recipient must not learn who
/// ships to them before the reveal.
async fn send_message(
    state: AppState,
    event_id: String,
    headers: HeaderMap,
    payload: MessageRequest,
    kind: MessageKind,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let me = require_identity(&headers)?;
    let live = state.live_channel(&event_id).await;

    let mut registry = state.registry.write().await;
    let Registry {
        events,
        participants,
    } = &mut *registry;
    let record = events.get_mut(&event_id).ok_or(ApiError::EventNotFound)?;

    {
        let mut mailbox = Mailbox {
            deliveries: &mut record.mailbox,
            live,
        };
        match kind {
            MessageKind::ToRecipient => exchange_core::message_recipient(
                &*participants,
                &mut mailbox,
                &record.event,
                &me,
                &payload.body,
            )?,
            MessageKind::ToSender => exchange_core::message_sender(
                &*participants,
                &mut mailbox,
                &record.event,
                &me,
                &payload.body,
            )?,
        };
    }
    drop(registry);
    state.persist().await;

    Ok((StatusCode::ACCEPTED, Json(MessageResponse { kind })))
}

async fn inbox(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let me = require_identity(&headers)?;
    let registry = state.registry.read().await;
    let record = registry
        .events
        .get(&event_id)
        .ok_or(ApiError::EventNotFound)?;

    let mine: Vec<Delivery> = record
        .mailbox
        .iter()
        .filter(|d| d.envelope.recipient == me)
        .cloned()
        .collect();
    Ok(Json(mine))
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Inbox { deliveries: Vec<Delivery> },
    Delivery(Delivery),
}

/// Live inbox for the logged-in participant. The socket only ever carries
/// deliveries addressed to the identity in the request headers.
async fn ws_handler(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let me = require_identity(&headers)?;
    {
        let registry = state.registry.read().await;
        if !registry.events.contains_key(&event_id) {
            return Err(ApiError::EventNotFound);
        }
        if registry.participants.get(&event_id, &me).is_none() {
            return Err(ExchangeError::UnknownParticipant(me).into());
        }
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, event_id, me)))
}

async fn handle_socket(stream: WebSocket, state: AppState, event_id: String, participant: String) {
    let (mut sender, mut receiver) = stream.split();

    let backlog = {
        let registry = state.registry.read().await;
        let Some(record) = registry.events.get(&event_id) else {
            return;
        };
        record
            .mailbox
            .iter()
            .filter(|d| d.envelope.recipient == participant)
            .cloned()
            .collect::<Vec<_>>()
    };

    let mut rx = {
        let mut channels = state.channels.write().await;
        channels
            .entry(event_id.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(32);
                tx
            })
            .subscribe()
    };

    if send_json(&mut sender, &ServerMessage::Inbox { deliveries: backlog })
        .await
        .is_err()
    {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(delivery) if delivery.envelope.recipient == participant => {
                    if send_json(&mut sender, &ServerMessage::Delivery(delivery))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "socket fell behind; missed deliveries remain in the inbox");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn test_app() -> (Router, AppState) {
        let state = AppState::default();
        (app(state.clone()), state)
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        who: Option<&str>,
        body: Option<Value>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(who) = who {
            builder = builder.header(IDENTITY_HEADER, who);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        app.clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn create(app: &Router, slug: &str) {
        let res = call(app, Method::POST, "/event", None, Some(json!({ "slug": slug }))).await;
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    async fn join(app: &Router, event: &str, who: &str, country: &str) -> StatusCode {
        call(
            app,
            Method::POST,
            &format!("/event/{event}/signup"),
            Some(who),
            Some(json!({
                "display_name": who.to_uppercase(),
                "shipping_address": format!("{who} road"),
                "shipping_country": country,
            })),
        )
        .await
        .status()
    }

    async fn set_stage(app: &Router, event: &str, stage: i64) {
        let res = call(
            app,
            Method::POST,
            &format!("/event/{event}/stage"),
            None,
            Some(json!({ "stage": stage })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    async fn view_of(app: &Router, event: &str, who: Option<&str>) -> Value {
        let res = call(app, Method::GET, &format!("/event/{event}/view"), who, None).await;
        assert_eq!(res.status(), StatusCode::OK);
        json_body(res).await
    }

    #[tokio::test]
    async fn create_event_with_and_without_slug() {
        let (app, _) = test_app();
        let res = call(&app, Method::POST, "/event", None, None).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body = json_body(res).await;
        assert!(body["event_id"].as_str().is_some());
        assert_eq!(body["stage"], 1);

        create(&app, "office-2026").await;
        let res = call(
            &app,
            Method::POST,
            "/event",
            None,
            Some(json!({ "slug": "office-2026" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = call(
            &app,
            Method::POST,
            "/event",
            None,
            Some(json!({ "slug": "no spaces/please" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = call(&app, Method::GET, "/event/unknown", None, None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn signup_requires_login_valid_details_and_open_stage() {
        let (app, _) = test_app();
        create(&app, "club").await;

        let res = call(
            &app,
            Method::POST,
            "/event/club/signup",
            None,
            Some(json!({ "display_name": "A", "shipping_address": "x", "shipping_country": "US" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(join(&app, "club", "alice", "XX").await, StatusCode::BAD_REQUEST);
        assert_eq!(join(&app, "club", "alice", "us").await, StatusCode::OK);

        let view = view_of(&app, "club", Some("alice")).await;
        assert_eq!(view["view"], "show_signup_form");
        assert_eq!(view["mode"], "update");
        assert_eq!(view["defaults"]["shipping_country"], "US");

        let view = view_of(&app, "club", Some("bob")).await;
        assert_eq!(view["mode"], "create");

        set_stage(&app, "club", 2).await;
        assert_eq!(join(&app, "club", "bob", "US").await, StatusCode::CONFLICT);
        assert_eq!(view_of(&app, "club", Some("bob")).await["view"], "not_signed_up");
        assert_eq!(
            view_of(&app, "club", Some("alice")).await["view"],
            "already_signed_up"
        );
    }

    #[tokio::test]
    async fn full_exchange_with_seeded_draw() {
        let (app, state) = test_app();
        create(&app, "office").await;
        for who in ["alice", "bob", "carol", "dave"] {
            assert_eq!(join(&app, "office", who, "GB").await, StatusCode::OK);
        }

        // Drawing is closed during sign-up.
        let res = call(&app, Method::POST, "/event/office/assign", None, None).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = call(&app, Method::POST, "/event/office/advance", None, None).await;
        assert_eq!(json_body(res).await["stage"], 2);

        let res = call(&app, Method::POST, "/event/office/assign?seed=42", None, None).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["count"], 4);
        assert_eq!(body["message"], "4 assignments saved");

        let roster = state.registry.read().await.participants.roster("office");
        let expected =
            exchange_core::assign(&roster, &mut ChaCha8Rng::seed_from_u64(42)).unwrap();
        for (giver, recipient) in expected.iter() {
            assert_eq!(body["assignments"][giver], recipient);
        }

        let res = call(&app, Method::POST, "/event/office/advance", None, None).await;
        assert_eq!(json_body(res).await["stage"], 3);

        let view = view_of(&app, "office", Some("alice")).await;
        assert_eq!(view["view"], "show_shipping");
        let alice_ships_to = expected.recipient_of("alice").unwrap();
        assert_eq!(view["recipient"]["id"], alice_ships_to);
        assert_eq!(view["recipient"]["country_name"], "United Kingdom");
        assert_eq!(view["messages"]["to_recipient"], true);

        let res = call(
            &app,
            Method::POST,
            "/event/office/message/recipient",
            Some("alice"),
            Some(json!({ "body": "what size are you?" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let body = json_body(res).await;
        assert_eq!(body, json!({ "kind": "to_recipient" }));

        let res = call(
            &app,
            Method::GET,
            "/event/office/inbox",
            Some(alice_ships_to),
            None,
        )
        .await;
        let inbox = json_body(res).await;
        assert_eq!(inbox.as_array().unwrap().len(), 1);
        assert_eq!(inbox[0]["body"], "what size are you?");
        assert_eq!(inbox[0]["sender"], Value::Null);
        assert_eq!(inbox[0]["kind"], "to_recipient");

        let res = call(
            &app,
            Method::POST,
            "/event/office/message/sender",
            Some("alice"),
            Some(json!({ "body": "thank you!" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let alice_sender = expected.sender_of("alice").unwrap();
        let res = call(&app, Method::GET, "/event/office/inbox", Some(alice_sender), None).await;
        let inbox = json_body(res).await;
        let signed = inbox
            .as_array()
            .unwrap()
            .iter()
            .find(|d| d["kind"] == "to_sender")
            .unwrap();
        assert_eq!(signed["sender"], "alice");

        let res = call(&app, Method::POST, "/event/office/advance", None, None).await;
        assert_eq!(json_body(res).await["stage"], 4);

        let view = view_of(&app, "office", Some("alice")).await;
        assert_eq!(view["view"], "show_reveal");
        assert_eq!(view["sender"]["id"], alice_sender);
        assert_eq!(view["recipient"]["id"], alice_ships_to);

        let res = call(
            &app,
            Method::POST,
            "/event/office/message/recipient",
            Some("alice"),
            Some(json!({ "body": "too late" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn draw_refuses_small_roster_and_writes_nothing() {
        let (app, _) = test_app();
        create(&app, "duo").await;
        join(&app, "duo", "alice", "US").await;
        join(&app, "duo", "bob", "US").await;
        set_stage(&app, "duo", 2).await;

        let res = call(&app, Method::POST, "/event/duo/assign", None, None).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = call(&app, Method::GET, "/event/duo", None, None).await;
        let body = json_body(res).await;
        assert_eq!(body["participants"], 2);
        assert_eq!(body["assigned"], 0);
    }

    #[tokio::test]
    async fn logged_out_and_invalid_stage_views() {
        let (app, _) = test_app();
        create(&app, "party").await;
        assert_eq!(view_of(&app, "party", None).await["view"], "prompt_login");

        set_stage(&app, "party", 99).await;
        let view = view_of(&app, "party", Some("alice")).await;
        assert_eq!(view, json!({ "view": "invalid_stage", "code": 99 }));

        let res = call(&app, Method::POST, "/event/party/advance", None, None).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn manual_override_is_validated_and_shown_in_roster() {
        let (app, _) = test_app();
        create(&app, "family").await;
        for who in ["alice", "bob", "carol"] {
            join(&app, "family", who, "NL").await;
        }

        let res = call(
            &app,
            Method::PUT,
            "/event/family/assignments",
            None,
            Some(json!({ "alice": "alice", "bob": "carol", "carol": "bob" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = call(
            &app,
            Method::PUT,
            "/event/family/assignments",
            None,
            Some(json!({ "alice": "bob", "bob": "carol", "carol": "alice" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = call(&app, Method::GET, "/event/family/assignments", None, None).await;
        assert_eq!(
            json_body(res).await,
            json!({ "alice": "bob", "bob": "carol", "carol": "alice" })
        );

        let res = call(&app, Method::GET, "/event/family/roster", None, None).await;
        let rows = json_body(res).await;
        let bob = rows
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["participant"]["id"] == "bob")
            .unwrap();
        assert_eq!(bob["shipping_to"]["id"], "carol");
        assert_eq!(bob["receiving_from"]["id"], "alice");
        assert_eq!(bob["participant"]["country_name"], "Netherlands");
    }

    #[tokio::test]
    async fn countries_are_listed() {
        let (app, _) = test_app();
        let res = call(&app, Method::GET, "/countries", None, None).await;
        let list = json_body(res).await;
        assert!(list
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c["code"] == "JP" && c["name"] == "Japan"));
    }

    #[tokio::test]
    async fn persistence_writes_and_loads_events() {
        let path = std::env::temp_dir().join(format!("exchange_state_{}.json", Uuid::new_v4()));
        let state = AppState::with_persistence(path.clone()).await;
        let app = app(state.clone());

        create(&app, "saved").await;
        join(&app, "saved", "alice", "US").await;
        set_stage(&app, "saved", 3).await;

        assert!(tokio::fs::metadata(&path).await.is_ok());

        let loaded = AppState::with_persistence(path.clone()).await;
        let registry = loaded.registry.read().await;
        assert_eq!(registry.events.len(), 1);
        assert_eq!(registry.events["saved"].event.stage, Stage::Shipping);
        assert!(registry.participants.get("saved", "alice").is_some());
        assert!(loaded.channels.read().await.contains_key("saved"));
        drop(registry);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn concurrent_writes_leave_the_newest_snapshot() {
        let path = std::env::temp_dir().join(format!("exchange_state_{}.json", Uuid::new_v4()));
        let state = AppState::with_persistence(path.clone()).await;
        let app = app(state.clone());
        create(&app, "rush").await;

        let joins: Vec<_> = (0..16)
            .map(|i| {
                let app = app.clone();
                tokio::spawn(async move { join(&app, "rush", &format!("p{i}"), "US").await })
            })
            .collect();
        for handle in joins {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }

        let loaded = AppState::with_persistence(path.clone()).await;
        assert_eq!(loaded.registry.read().await.participants.roster("rush").len(), 16);

        let _ = tokio::fs::remove_file(&path).await;
    }

    mod live {
        use super::*;
        use std::net::SocketAddr;
        use std::time::Duration;
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
        use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

        type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

        async fn serve(router: Router) -> SocketAddr {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            addr
        }

        async fn connect(
            addr: SocketAddr,
            event: &str,
            who: Option<&str>,
        ) -> Result<Client, tungstenite::Error> {
            let mut request = format!("ws://{addr}/ws/{event}")
                .into_client_request()
                .unwrap();
            if let Some(who) = who {
                request
                    .headers_mut()
                    .insert(IDENTITY_HEADER, who.parse().unwrap());
            }
            connect_async(request).await.map(|(socket, _)| socket)
        }

        async fn next_frame(socket: &mut Client) -> Value {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .unwrap();
            match frame {
                WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            }
        }

        fn refused_with(result: Result<Client, tungstenite::Error>) -> StatusCode {
            match result {
                Err(tungstenite::Error::Http(response)) => response.status(),
                Err(other) => panic!("unexpected error {other}"),
                Ok(_) => panic!("upgrade was accepted"),
            }
        }

        /// alice -> bob -> carol -> alice, in Shipping.
        async fn shipping_trio(app: &Router) {
            create(app, "trio").await;
            for who in ["alice", "bob", "carol"] {
                assert_eq!(join(app, "trio", who, "US").await, StatusCode::OK);
            }
            let res = call(
                app,
                Method::PUT,
                "/event/trio/assignments",
                None,
                Some(json!({ "alice": "bob", "bob": "carol", "carol": "alice" })),
            )
            .await;
            assert_eq!(res.status(), StatusCode::OK);
            set_stage(app, "trio", 3).await;
        }

        async fn send(app: &Router, who: &str, to: &str, body: &str) {
            let res = call(
                app,
                Method::POST,
                &format!("/event/trio/message/{to}"),
                Some(who),
                Some(json!({ "body": body })),
            )
            .await;
            assert_eq!(res.status(), StatusCode::ACCEPTED);
        }

        #[tokio::test]
        async fn socket_carries_only_own_deliveries() {
            let (app, _) = test_app();
            shipping_trio(&app).await;
            let addr = serve(app.clone()).await;

            // Already in alice's mailbox before bob connects.
            send(&app, "bob", "sender", "hi santa").await;

            let mut bob = connect(addr, "trio", Some("bob")).await.unwrap();
            let backlog = next_frame(&mut bob).await;
            assert_eq!(backlog, json!({ "type": "inbox", "deliveries": [] }));

            send(&app, "carol", "recipient", "for alice").await;
            send(&app, "alice", "recipient", "for bob").await;

            let frame = next_frame(&mut bob).await;
            assert_eq!(frame["type"], "delivery");
            assert_eq!(frame["recipient"], "bob");
            assert_eq!(frame["body"], "for bob");
            assert_eq!(frame["sender"], Value::Null);

            let mut alice = connect(addr, "trio", Some("alice")).await.unwrap();
            let backlog = next_frame(&mut alice).await;
            let bodies: Vec<&str> = backlog["deliveries"]
                .as_array()
                .unwrap()
                .iter()
                .map(|d| d["body"].as_str().unwrap())
                .collect();
            assert_eq!(bodies, ["hi santa", "for alice"]);
        }

        #[tokio::test]
        async fn socket_requires_a_known_identity() {
            let (app, _) = test_app();
            shipping_trio(&app).await;
            let addr = serve(app).await;

            assert_eq!(
                refused_with(connect(addr, "trio", None).await),
                StatusCode::UNAUTHORIZED
            );
            assert_eq!(
                refused_with(connect(addr, "trio", Some("mallory")).await),
                StatusCode::NOT_FOUND
            );
            assert_eq!(
                refused_with(connect(addr, "elsewhere", Some("bob")).await),
                StatusCode::NOT_FOUND
            );
        }
    }
}
