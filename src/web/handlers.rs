//! `/api/v1` route handlers.
//!
//! Every response is a JSON envelope: `{"success": true, "data": ...}` or
//! `{"success": false, "error": {"code", "message"}}`. Builds and store reads
//! are blocking and run on the blocking pool.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::server::AppState;
use crate::doctor::{CheckContext, Doctor};
use crate::mail::{MAYOR_ADDRESS, SearchOptions};
use crate::status::{AgentRuntime, ConvoyReader, ConvoyStatusFilter, StatusBuilder};
use crate::townlog::{self, EventFilter, TownEvent};
use crate::Error;

const DEFAULT_MAIL_LIMIT: usize = 10;
const MAX_MAIL_LIMIT: usize = 50;
const DEFAULT_EVENTS_LIMIT: usize = 20;
const MAX_EVENTS_LIMIT: usize = 100;
const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 100;

// ============================================================================
// Envelope
// ============================================================================

/// An error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: "internal server error".to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(message) => Self {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message,
            },
            Error::InvalidInput(message) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "bad_request",
                message,
            },
            other => {
                tracing::error!(error = %other, "request failed");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": { "code": self.code, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok(data: impl Serialize) -> ApiResult {
    let data = serde_json::to_value(data).map_err(|e| ApiError::from(Error::Json(e)))?;
    Ok(Json(serde_json::json!({ "success": true, "data": data })))
}

/// One page of a list.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

impl<T> Page<T> {
    fn slice(all: Vec<T>, offset: usize, limit: usize) -> Self {
        let total = all.len();
        let items = all.into_iter().skip(offset).take(limit).collect();
        Self {
            items,
            total,
            offset,
            limit,
            has_more: offset.saturating_add(limit) < total,
        }
    }
}

/// Parse a numeric query value within `1..=max`; anything else is `default`.
fn bounded(value: Option<&str>, default: usize, max: usize) -> usize {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| (1..=max).contains(v))
        .unwrap_or(default)
}

/// Run blocking work against the snapshot builder.
async fn blocking<T, F>(state: &AppState, work: F) -> Result<T, ApiError>
where
    F: FnOnce(&StatusBuilder) -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let builder = Arc::clone(&state.builder);
    tokio::task::spawn_blocking(move || work(&builder))
        .await
        .map_err(|e| Error::Other(format!("blocking task failed: {}", e)))?
        .map_err(ApiError::from)
}

// ============================================================================
// Status, rigs, agents
// ============================================================================

pub async fn get_status(State(state): State<AppState>) -> ApiResult {
    ok(blocking(&state, |b| b.build(false)).await?)
}

pub async fn get_summary(State(state): State<AppState>) -> ApiResult {
    ok(blocking(&state, |b| Ok(b.build(true)?.summary)).await?)
}

pub async fn list_rigs(State(state): State<AppState>) -> ApiResult {
    ok(blocking(&state, |b| Ok(b.build(true)?.rigs)).await?)
}

pub async fn get_rig(State(state): State<AppState>, AxumPath(name): AxumPath<String>) -> ApiResult {
    let rig = blocking(&state, move |b| {
        b.build(true)?
            .rigs
            .into_iter()
            .find(|rig| rig.name == name)
            .ok_or_else(|| Error::NotFound(format!("rig not found: {}", name)))
    })
    .await?;
    ok(rig)
}

pub async fn get_rig_agents(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> ApiResult {
    let agents = blocking(&state, move |b| {
        b.build(false)?
            .rigs
            .into_iter()
            .find(|rig| rig.name == name)
            .map(|rig| rig.agents)
            .ok_or_else(|| Error::NotFound(format!("rig not found: {}", name)))
    })
    .await?;
    ok(agents)
}

pub async fn list_agents(State(state): State<AppState>) -> ApiResult {
    let agents = blocking(&state, |b| {
        Ok(b.build(false)?.all_agents().cloned().collect::<Vec<_>>())
    })
    .await?;
    ok(agents)
}

#[derive(Debug, Default, Deserialize)]
pub struct DetailsQuery {
    mail_limit: Option<String>,
    events_limit: Option<String>,
}

/// Mail shown in agent details.
#[derive(Debug, Serialize)]
pub struct MailPreview {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub priority: String,
}

/// Feed activity shown in agent details.
#[derive(Debug, Serialize)]
pub struct AgentEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<TownEvent> for AgentEvent {
    fn from(event: TownEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            event_type: event.event_type,
            context: event.context,
            message: event.message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AgentDetails {
    pub agent: AgentRuntime,
    pub mail: Vec<MailPreview>,
    pub recent_events: Vec<AgentEvent>,
    pub total_mail: usize,
    pub total_unread: usize,
}

/// `GET /agents/{*address}`; a trailing `/details` selects the detail view.
pub async fn get_agent(
    State(state): State<AppState>,
    AxumPath(address): AxumPath<String>,
    Query(query): Query<DetailsQuery>,
) -> ApiResult {
    let address = address.trim_matches('/').to_string();
    if let Some(agent) = address.strip_suffix("/details").map(str::to_string) {
        return ok(blocking(&state, move |b| agent_details(b, &agent, &query)).await?);
    }

    let agent = blocking(&state, move |b| {
        b.build(false)?
            .find_agent(&address)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent not found: {}", address)))
    })
    .await?;
    ok(agent)
}

fn agent_details(builder: &StatusBuilder, address: &str, query: &DetailsQuery) -> crate::Result<AgentDetails> {
    let mail_limit = bounded(query.mail_limit.as_deref(), DEFAULT_MAIL_LIMIT, MAX_MAIL_LIMIT);
    let events_limit = bounded(
        query.events_limit.as_deref(),
        DEFAULT_EVENTS_LIMIT,
        MAX_EVENTS_LIMIT,
    );

    let status = builder.build(false)?;
    let agent = status
        .find_agent(address)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("agent not found: {}", address)))?;

    let mut details = AgentDetails {
        mail: Vec::new(),
        recent_events: Vec::new(),
        total_mail: 0,
        total_unread: 0,
        agent,
    };

    let mail = builder.mail();
    if let Ok(count) = mail.count(&details.agent.address) {
        details.total_mail = count.total;
        details.total_unread = count.unread;
    }
    if let Ok(messages) = mail.list(&details.agent.address) {
        details.mail = messages
            .into_iter()
            .take(mail_limit)
            .map(|m| MailPreview {
                id: m.id,
                from: m.from,
                subject: m.subject,
                timestamp: m.timestamp,
                read: m.read,
                priority: m.priority,
            })
            .collect();
    }

    match townlog::read_events(builder.town_root()) {
        Ok(events) => {
            let filter = EventFilter {
                agent: Some(details.agent.address.clone()),
                event_type: None,
            };
            details.recent_events = townlog::filter_events(events, &filter)
                .into_iter()
                .rev()
                .take(events_limit)
                .map(AgentEvent::from)
                .collect();
        }
        Err(e) => tracing::debug!(error = %e, "could not read town feed"),
    }

    Ok(details)
}

// ============================================================================
// Convoys
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ConvoyQuery {
    status: Option<String>,
}

pub async fn list_convoys(
    State(state): State<AppState>,
    Query(query): Query<ConvoyQuery>,
) -> ApiResult {
    let filter = ConvoyStatusFilter::parse(query.status.as_deref())?;
    let convoys = blocking(&state, move |b| {
        let config = b.load_config();
        ConvoyReader::new(b.town_root(), &config, b.stores().as_ref()).list(&filter)
    })
    .await?;
    ok(convoys)
}

pub async fn get_convoy(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    let convoy = blocking(&state, move |b| {
        let config = b.load_config();
        ConvoyReader::new(b.town_root(), &config, b.stores().as_ref()).get(&id)
    })
    .await?;
    ok(convoy)
}

// ============================================================================
// Mail
// ============================================================================

pub async fn mayor_inbox(State(state): State<AppState>) -> ApiResult {
    ok(blocking(&state, |b| b.mail().list(MAYOR_ADDRESS)).await?)
}

pub async fn agent_inbox(
    State(state): State<AppState>,
    AxumPath(address): AxumPath<String>,
) -> ApiResult {
    ok(blocking(&state, move |b| b.mail().list(&address)).await?)
}

pub async fn mail_count(State(state): State<AppState>) -> ApiResult {
    ok(blocking(&state, |b| b.mail().count(MAYOR_ADDRESS)).await?)
}

pub async fn get_message(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    ok(blocking(&state, move |b| b.mail().get(MAYOR_ADDRESS, &id)).await?)
}

pub async fn mark_read(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> ApiResult {
    let id = blocking(&state, move |b| {
        b.mail().mark_read(MAYOR_ADDRESS, &id)?;
        Ok(id)
    })
    .await?;
    ok(serde_json::json!({ "id": id, "read": true }))
}

pub async fn search_mail(
    State(state): State<AppState>,
    Json(options): Json<SearchOptions>,
) -> ApiResult {
    ok(blocking(&state, move |b| b.mail().search(MAYOR_ADDRESS, &options)).await?)
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    limit: Option<String>,
    offset: Option<String>,
}

/// Town feed, newest first.
pub async fn list_events(State(state): State<AppState>, Query(query): Query<PageQuery>) -> ApiResult {
    let limit = bounded(query.limit.as_deref(), DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT);
    let offset = query
        .offset
        .as_deref()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut events = blocking(&state, |b| townlog::read_events(b.town_root())).await?;
    events.reverse();
    ok(Page::slice(events, offset, limit))
}

// ============================================================================
// Doctor
// ============================================================================

fn check_context(builder: &StatusBuilder) -> CheckContext {
    CheckContext::new(builder.town_root(), Arc::clone(builder.stores()))
}

pub async fn run_doctor(State(state): State<AppState>) -> ApiResult {
    ok(blocking(&state, |b| Ok(Doctor::new().run(&check_context(b)))).await?)
}

pub async fn run_check(State(state): State<AppState>, AxumPath(check): AxumPath<String>) -> ApiResult {
    ok(blocking(&state, move |b| Doctor::new().run_check(&check_context(b), &check)).await?)
}

/// Run a check, fix it if violated, and return the re-run result.
pub async fn fix_check(State(state): State<AppState>, AxumPath(check): AxumPath<String>) -> ApiResult {
    ok(blocking(&state, move |b| Doctor::new().fix_check(&check_context(b), &check)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{JsonlMailRouter, MailMessage};
    use crate::models::{Issue, IssueStatus, TYPE_CONVOY};
    use crate::storage::JsonlStoreProvider;
    use crate::test_utils::TestTown;
    use crate::tmux::StaticSessions;
    use crate::web::hub::Hub;
    use crate::web::server::router;
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt as _;
    use serde_json::Value;
    use tower::ServiceExt; // for Router::oneshot

    fn app(town: &TestTown, sessions: &[&str]) -> Router {
        let builder = StatusBuilder::new(
            town.path(),
            Arc::new(StaticSessions::new(sessions.iter().copied())),
            Arc::new(JsonlStoreProvider),
            Arc::new(JsonlMailRouter::new(town.path())),
        );
        let (_hub, handle) = Hub::new();
        router(AppState::new(Arc::new(builder), handle), false)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn acme_town() -> TestTown {
        let town = TestTown::new();
        town.write_config("name \"gastown\"\nrig \"acme\" prefix=\"ac\"");
        town.add_rig("acme", &["fox"], &[], true, false);
        town
    }

    #[test]
    fn test_bounded_limits() {
        assert_eq!(bounded(None, 10, 50), 10);
        assert_eq!(bounded(Some("25"), 10, 50), 25);
        assert_eq!(bounded(Some("0"), 10, 50), 10);
        assert_eq!(bounded(Some("51"), 10, 50), 10);
        assert_eq!(bounded(Some("lots"), 10, 50), 10);
    }

    #[test]
    fn test_page_slice() {
        let page = Page::slice((0..5).collect::<Vec<_>>(), 1, 2);
        assert_eq!(page.items, vec![1, 2]);
        assert_eq!(page.total, 5);
        assert!(page.has_more);
        assert!(!Page::slice(vec![1, 2], 0, 50).has_more);

        let past_end = Page::slice(vec![1, 2, 3], usize::MAX, 50);
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 3);
        assert!(!past_end.has_more);
    }

    #[tokio::test]
    async fn test_status_and_summary() {
        let town = acme_town();
        let app = app(&town, &["gt-acme-fox"]);

        let (status, body) = call(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["name"], "gastown");

        let (_, body) = call(&app, "GET", "/api/v1/status/summary", None).await;
        assert_eq!(body["data"]["rig_count"], 1);
        assert_eq!(body["data"]["witness_count"], 1);
    }

    #[tokio::test]
    async fn test_rig_lookup() {
        let town = acme_town();
        let app = app(&town, &[]);

        let (status, body) = call(&app, "GET", "/api/v1/rigs/acme/agents", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let (status, body) = call(&app, "GET", "/api/v1/rigs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_agent_and_details() {
        let town = acme_town();
        let mail = JsonlMailRouter::new(town.path());
        for i in 0..3 {
            mail.send(
                "acme/fox",
                &MailMessage::new(format!("m-{}", i), "mayor", "acme/fox", "status?"),
            )
            .unwrap();
        }
        townlog::log_event(town.path(), &TownEvent::new("sling").with_actor("acme/fox")).unwrap();
        townlog::log_event(town.path(), &TownEvent::new("done").with_actor("acme/fox")).unwrap();
        let app = app(&town, &["gt-acme-fox"]);

        let (status, body) = call(&app, "GET", "/api/v1/agents/acme/fox", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["running"], true);
        assert_eq!(body["data"]["unread_mail"], 3);

        let (status, body) = call(
            &app,
            "GET",
            "/api/v1/agents/acme/fox/details?mail_limit=2",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let data = &body["data"];
        assert_eq!(data["agent"]["address"], "acme/fox");
        assert_eq!(data["mail"].as_array().unwrap().len(), 2);
        assert_eq!(data["total_mail"], 3);
        assert_eq!(data["recent_events"][0]["type"], "done");

        let (status, _) = call(&app, "GET", "/api/v1/agents/acme/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_convoys() {
        let town = acme_town();
        let mut convoy = Issue::new("hq-1", "Login overhaul");
        convoy.issue_type = TYPE_CONVOY.to_string();
        let mut shipped = Issue::new("hq-2", "Old convoy");
        shipped.issue_type = TYPE_CONVOY.to_string();
        shipped.status = IssueStatus::Closed;
        town.seed(town.path(), &[convoy, shipped, Issue::new("hq-3", "Task")]);
        let app = app(&town, &[]);

        let (_, body) = call(&app, "GET", "/api/v1/convoys", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        let (_, body) = call(&app, "GET", "/api/v1/convoys?status=all", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
        let (status, _) = call(&app, "GET", "/api/v1/convoys?status=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "GET", "/api/v1/convoys/hq-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["progress"], 1.0);
        let (status, _) = call(&app, "GET", "/api/v1/convoys/hq-3", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_convoys_without_beads_dir() {
        let town = acme_town();
        std::fs::remove_dir_all(town.path().join(".beads")).unwrap();
        let (status, body) = call(&app(&town, &[]), "GET", "/api/v1/convoys", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mail_routes() {
        let town = acme_town();
        let mail = JsonlMailRouter::new(town.path());
        mail.send("mayor", &MailMessage::new("m-1", "acme/fox", "mayor", "Done with login"))
            .unwrap();
        let app = app(&town, &[]);

        let (_, body) = call(&app, "GET", "/api/v1/mail/count", None).await;
        assert_eq!(body["data"]["unread"], 1);

        let (status, _) = call(&app, "POST", "/api/v1/mail/messages/m-1/read", None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, "GET", "/api/v1/mail/messages/m-1", None).await;
        assert_eq!(body["data"]["read"], true);

        let (status, _) = call(&app, "GET", "/api/v1/mail/messages/m-404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(
            &app,
            "POST",
            "/api/v1/mail/search",
            Some(serde_json::json!({"query": "login"})),
        )
        .await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/mail/search",
            Some(serde_json::json!({"query": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_events_paginated_newest_first() {
        let town = acme_town();
        for name in ["one", "two", "three"] {
            townlog::log_event(town.path(), &TownEvent::new(name)).unwrap();
        }
        let (_, body) = call(&app(&town, &[]), "GET", "/api/v1/events?limit=2", None).await;
        let data = &body["data"];
        assert_eq!(data["total"], 3);
        assert_eq!(data["has_more"], true);
        assert_eq!(data["items"][0]["type"], "three");
        assert_eq!(data["items"][1]["type"], "two");

        let (status, body) = call(
            &app(&town, &[]),
            "GET",
            "/api/v1/events?offset=18446744073709551615",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["items"], serde_json::json!([]));
        assert_eq!(body["data"]["has_more"], false);
    }

    #[tokio::test]
    async fn test_doctor_routes() {
        let town = acme_town();
        let mut molecule = Issue::new("hq-9", "Molecule");
        molecule.status = IssueStatus::Closed;
        let mut hook = Issue::new("hq-1", "Polecat Handoff");
        hook.status = IssueStatus::Pinned;
        hook.attached_molecule = Some("hq-9".to_string());
        town.seed(town.path(), &[molecule, hook]);
        let app = app(&town, &[]);

        let (_, body) = call(&app, "GET", "/api/v1/doctor", None).await;
        assert_eq!(body["data"]["ok"], false);

        let (_, body) = call(&app, "GET", "/api/v1/doctor/hook-attachment-valid", None).await;
        assert_eq!(body["data"]["status"], "error");
        assert_eq!(body["data"]["details"][0], "hq-1: attached molecule hq-9 is closed");

        let (status, body) =
            call(&app, "POST", "/api/v1/doctor/hook-attachment-valid/fix", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");

        let (status, _) = call(&app, "GET", "/api/v1/doctor/no-such-check", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_internal_errors_are_generic() {
        let town = TestTown::new();
        town.write_config("rig \"ghost\"");
        let (status, body) = call(&app(&town, &[]), "GET", "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "internal_error");
        assert_eq!(body["error"]["message"], "internal server error");
    }
}
