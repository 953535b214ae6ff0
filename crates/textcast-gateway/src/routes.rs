//! API route handlers for the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use textcast_core::TextcastError;
use textcast_core::time::{parse_optional, parse_str, parse_value, start_of_day};
use textcast_scheduler::{
    Actor, BulkMode, Delivery, DueItem, FailureReason, MessageKind, MessageRef, Outcome,
    PendingFilter, StudyDueItem, TimeRange,
};

use crate::server::{AppState, Caller};

const STUDY_LIMIT_DEFAULT: usize = 100;
const STUDY_LIMIT_MAX: usize = 500;

/// Error response: `{success: false, error}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

impl From<TextcastError> for ApiError {
    fn from(e: TextcastError) -> Self {
        let status = match &e {
            TextcastError::InvalidInput(_) | TextcastError::Validation(_) => StatusCode::BAD_REQUEST,
            TextcastError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            TextcastError::Forbidden(_) => StatusCode::FORBIDDEN,
            TextcastError::NotFound(_) => StatusCode::NOT_FOUND,
            TextcastError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {e}");
        }
        Self { status, message: e.to_string() }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"success": false, "error": self.message}))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn flag(params: &HashMap<String, String>, name: &str) -> bool {
    params
        .get(name)
        .is_some_and(|v| matches!(v.as_str(), "true" | "1" | "yes"))
}

/// `messageIds: [..]` or a single `messageId`.
fn message_ids(body: &Value) -> Result<Vec<String>, ApiError> {
    if let Some(ids) = body.get("messageIds") {
        let ids = ids
            .as_array()
            .and_then(|a| a.iter().map(|v| v.as_str().map(String::from)).collect::<Option<Vec<_>>>())
            .ok_or_else(|| ApiError::bad_request("messageIds must be an array of strings"))?;
        if ids.is_empty() {
            return Err(ApiError::bad_request("messageIds is empty"));
        }
        return Ok(ids);
    }
    match body.get("messageId").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(vec![id.to_string()]),
        _ => Err(ApiError::bad_request("messageId or messageIds is required")),
    }
}

fn bulk_mode(body: &Value) -> BulkMode {
    if body.get("atomic").and_then(Value::as_bool) == Some(true) {
        BulkMode::ValidateFirst
    } else {
        BulkMode::PartialApply
    }
}

fn opt_string(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
}

/// Apply one report to every id in the body, owner-gated.
fn apply_report<F>(state: &AppState, caller: &Caller, kind: MessageKind, body: &Value, apply: F) -> ApiResult
where
    F: Fn(&mut Delivery) -> Outcome,
{
    let ids = message_ids(body)?;
    let report = state
        .db
        .bulk_update(&caller.owner_id, kind, &ids, bulk_mode(body), apply)?;
    Ok(Json(json!({
        "success": true,
        "updated": report.applied,
        "unchanged": report.unchanged,
    })))
}

fn due_item_json(item: DueItem) -> Value {
    json!({
        "id": item.id,
        "message": item.message,
        "contact": {"name": item.contact_name, "phoneNumber": item.phone_number},
        "group": item.group.map(|g| json!({"id": g.id, "name": g.name, "color": g.color})),
        "recipients": item.recipients,
        "scheduledFor": item.scheduled_at.timestamp_millis(),
        "scheduledForIso": iso(item.scheduled_at),
        "category": item.category,
        "messageIds": item.message_ids,
    })
}

fn study_item_json(item: StudyDueItem) -> Value {
    json!({
        "id": item.id,
        "lessonId": item.lesson_id,
        "lessonTitle": item.lesson_title,
        "message": item.message,
        "phoneNumber": item.phone_number,
        "scheduledFor": item.scheduled_at.timestamp_millis(),
        "scheduledForIso": iso(item.scheduled_at),
        "messageIds": item.message_ids,
    })
}

/// Health check (public).
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

/// Mark the calling key verified.
pub async fn verify(State(state): State<Arc<AppState>>, Extension(caller): Extension<Caller>) -> ApiResult {
    let (at, first) = state.keys.mark_verified(&caller.key_id, Utc::now())?;
    if first {
        tracing::info!("✅ API key {} verified for owner {}", caller.key_id, caller.owner_id);
    }
    Ok(Json(json!({
        "success": true,
        "ownerId": caller.owner_id,
        "verifiedAt": iso(at),
        "firstVerification": first,
    })))
}

// ─── Manual messages ──────────────────────────────────────────

/// Due manual work for the caller, broadcasts reconciled and aggregated.
pub async fn pending_messages(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let now = Utc::now();
    let filter = PendingFilter {
        category: params.get("category").filter(|c| !c.is_empty()).cloned(),
        since: flag(&params, "todayOnly").then(|| start_of_day(now)),
        group_only: flag(&params, "groupOnly"),
    };
    let items = state.db.pending_work(&caller.owner_id, now, &filter)?;
    let count = items.len();
    let messages: Vec<Value> = items.into_iter().map(due_item_json).collect();
    Ok(Json(json!({
        "success": true,
        "messages": messages,
        "count": count,
        "serverNow": now.timestamp_millis(),
        "serverNowIso": iso(now),
        "timezone": "UTC",
    })))
}

/// Report manual messages as sent.
pub async fn report_sent(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let at = parse_optional(body.get("sentAt"))?.unwrap_or_else(Utc::now);
    let external = opt_string(&body, "externalMessageId");
    apply_report(&state, &caller, MessageKind::Scheduled, &body, |d| {
        d.mark_sent(at, external.clone())
    })
}

/// Report manual messages as failed. Agent-reported failures are transport
/// failures and eligible for retry.
pub async fn report_failed(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let at = parse_optional(body.get("failedAt"))?.unwrap_or_else(Utc::now);
    let error = opt_string(&body, "error").unwrap_or_default();
    apply_report(&state, &caller, MessageKind::Scheduled, &body, |d| {
        d.mark_failed(FailureReason::Transport, &error, at)
    })
}

/// Failed rows of both families for the caller.
pub async fn failed_messages(State(state): State<Arc<AppState>>, Extension(caller): Extension<Caller>) -> ApiResult {
    let now = Utc::now();
    let rows = state
        .db
        .failed_messages(Some(&caller.owner_id), now, &state.retry_policy)?;
    let messages: Vec<Value> = rows
        .into_iter()
        .map(|f| {
            json!({
                "id": f.message.id,
                "kind": f.message.kind.as_str(),
                "message": f.summary,
                "scheduledFor": f.scheduled_at.map(|t| t.timestamp_millis()),
                "attempts": f.delivery.attempts,
                "lastAttemptAt": f.delivery.last_attempt_at.map(iso),
                "error": f.delivery.error,
                "failureReason": f.delivery.failure_reason.map(|r| r.as_str()),
                "retryEligible": f.retry_eligible,
            })
        })
        .collect();
    Ok(Json(json!({"success": true, "count": messages.len(), "messages": messages})))
}

/// Schedule a message to a contact, or a broadcast to a group.
pub async fn create_message(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let text = opt_string(&body, "message").ok_or_else(|| ApiError::bad_request("message is required"))?;
    let at = match body.get("scheduledFor") {
        Some(v) => parse_value(v)?,
        None => return Err(ApiError::bad_request("scheduledFor is required")),
    };
    let category = opt_string(&body, "category");
    let notes = opt_string(&body, "notes");

    let rows = match (opt_string(&body, "contactId"), opt_string(&body, "groupId")) {
        (Some(contact), None) => vec![state.db.schedule_message(
            &caller.owner_id,
            &contact,
            &text,
            at,
            category.as_deref(),
            notes.as_deref(),
        )?],
        (None, Some(group)) => {
            state
                .db
                .schedule_broadcast(&caller.owner_id, &group, &text, at, category.as_deref())?
        }
        _ => return Err(ApiError::bad_request("exactly one of contactId or groupId is required")),
    };
    let ids: Vec<&str> = rows.iter().map(|m| m.id.as_str()).collect();
    Ok(Json(json!({
        "success": true,
        "messageIds": ids,
        "count": ids.len(),
        "scheduledForIso": iso(at),
    })))
}

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult {
    state.db.delete_scheduled(&Actor::Owner(caller.owner_id), &id)?;
    Ok(Json(json!({"success": true})))
}

fn cancel(state: &AppState, caller: Caller, r: MessageRef) -> ApiResult {
    let outcome = state.db.cancel(&Actor::Owner(caller.owner_id), &r)?;
    Ok(Json(json!({"success": true, "changed": outcome == Outcome::Applied})))
}

fn reschedule(state: &AppState, caller: Caller, r: MessageRef, body: &Value) -> ApiResult {
    let at = match body.get("scheduledFor") {
        Some(v) => parse_value(v)?,
        None => return Err(ApiError::bad_request("scheduledFor is required")),
    };
    state.db.reschedule(&Actor::Owner(caller.owner_id), &r, at)?;
    Ok(Json(json!({"success": true, "scheduledForIso": iso(at)})))
}

pub async fn cancel_message(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult {
    cancel(&state, caller, MessageRef::scheduled(&id))
}

pub async fn reschedule_message(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    reschedule(&state, caller, MessageRef::scheduled(&id), &body)
}

fn stats(state: &AppState, caller: &Caller, kind: MessageKind, params: &HashMap<String, String>) -> ApiResult {
    let range = match params.get("timeRange") {
        Some(r) => TimeRange::parse(r)?,
        None => TimeRange::default(),
    };
    let stats = state
        .db
        .stats(&caller.owner_id, kind, range.since(Utc::now()))?;
    Ok(Json(json!({
        "success": true,
        "timeRange": params.get("timeRange").map(String::as_str).unwrap_or("7d"),
        "successRate": stats.success_rate(),
        "stats": stats,
    })))
}

pub async fn message_stats(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    stats(&state, &caller, MessageKind::Scheduled, &params)
}

// ─── Study messages ───────────────────────────────────────────

/// Due study work for the caller, grouped by lesson, time, and content.
pub async fn study_pending(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let now = Utc::now();
    let limit = match params.get("limit") {
        Some(l) => l
            .parse::<usize>()
            .map_err(|_| ApiError::bad_request(format!("invalid limit '{l}'")))?
            .clamp(1, STUDY_LIMIT_MAX),
        None => STUDY_LIMIT_DEFAULT,
    };
    let since = params
        .get("startOfDay")
        .filter(|s| !s.is_empty())
        .map(|s| parse_str(s))
        .transpose()?;

    let items = state.db.study_pending(&caller.owner_id, now, since, limit)?;
    let count = items.len();
    let messages: Vec<Value> = items.into_iter().map(study_item_json).collect();
    Ok(Json(json!({
        "success": true,
        "messages": messages,
        "count": count,
        "serverNow": now.timestamp_millis(),
        "serverNowIso": iso(now),
    })))
}

pub async fn study_delivered(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let at = parse_optional(body.get("deliveredAt"))?.unwrap_or_else(Utc::now);
    let external = opt_string(&body, "externalMessageId");
    apply_report(&state, &caller, MessageKind::Study, &body, |d| {
        d.mark_sent(at, external.clone())
    })
}

pub async fn study_failed(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let at = parse_optional(body.get("failedAt"))?.unwrap_or_else(Utc::now);
    let error = opt_string(&body, "error").unwrap_or_default();
    apply_report(&state, &caller, MessageKind::Study, &body, |d| {
        d.mark_failed(FailureReason::Transport, &error, at)
    })
}

pub async fn study_stats(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    stats(&state, &caller, MessageKind::Study, &params)
}

pub async fn cancel_study(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult {
    cancel(&state, caller, MessageRef::study(&id))
}

pub async fn reschedule_study(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    reschedule(&state, caller, MessageRef::study(&id), &body)
}
