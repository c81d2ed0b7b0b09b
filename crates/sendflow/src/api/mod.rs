use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::BatchProcessor;
use crate::queue::{
    BatchReceipt, BatchStatusTracker, BulkRecipient, EnqueueError, EnqueueOptions, Priority,
    QueueEnqueuer, QueueEntry, StatusCounts,
};
use crate::resilience::CircuitState;

#[derive(Clone)]
pub struct ApiState {
    pub enqueuer: Arc<QueueEnqueuer>,
    pub processor: Arc<BatchProcessor>,
    pub tracker: BatchStatusTracker,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Enqueue
        .route("/messages", post(enqueue_message))
        .route("/batches", post(enqueue_batch))
        .route("/segments/:id/messages", post(enqueue_segment))
        .route("/users/:id/messages", post(enqueue_all_contacts))
        // Cancel
        .route("/batches/:id/cancel", post(cancel_batch))
        .route("/segments/:id/cancel", post(cancel_segment))
        .route("/users/:id/cancel", post(cancel_user))
        // Inspect
        .route("/batches/:id", get(batch_status))
        .route("/batches/:id/entries", get(batch_entries))
        .route("/stats", get(stats))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn internal_err(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "admin api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {e}"),
    )
}

fn enqueue_err(e: EnqueueError) -> ApiError {
    match e {
        EnqueueError::EmptyMessage
        | EnqueueError::InvalidPhoneNumber(_)
        | EnqueueError::NoValidRecipients { .. }
        | EnqueueError::InvalidMaxAttempts(_) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        EnqueueError::DirectoryUnavailable => (StatusCode::NOT_IMPLEMENTED, e.to_string()),
        EnqueueError::Directory(_) => (StatusCode::BAD_GATEWAY, e.to_string()),
        EnqueueError::Store(inner) => internal_err(inner),
    }
}

/// Fields shared by every enqueue request.
#[derive(Debug, Default, Deserialize)]
pub struct SendOptions {
    pub priority: Option<Priority>,
    pub user_id: Option<Uuid>,
    pub segment_id: Option<Uuid>,
    pub sender_name: Option<String>,
    pub max_attempts: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl From<SendOptions> for EnqueueOptions {
    fn from(o: SendOptions) -> Self {
        EnqueueOptions {
            priority: o.priority.unwrap_or_default(),
            user_id: o.user_id,
            segment_id: o.segment_id,
            sender_name: o.sender_name,
            max_attempts: o.max_attempts,
            scheduled_at: o.scheduled_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EnqueueMessageRequest {
    pub phone_number: String,
    pub message: String,
    #[serde(flatten)]
    pub options: SendOptions,
}

pub async fn enqueue_message(
    State(state): State<ApiState>,
    Json(body): Json<EnqueueMessageRequest>,
) -> Result<(StatusCode, Json<QueueEntry>), ApiError> {
    let entry = state
        .enqueuer
        .enqueue(&body.phone_number, &body.message, body.options.into())
        .await
        .map_err(enqueue_err)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
pub struct RecipientItem {
    pub phone_number: String,
    pub priority: Option<Priority>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBatchRequest {
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    /// Recipients with their own priority, in addition to `phone_numbers`.
    #[serde(default)]
    pub recipients: Vec<RecipientItem>,
    pub message: String,
    #[serde(flatten)]
    pub options: SendOptions,
}

pub async fn enqueue_batch(
    State(state): State<ApiState>,
    Json(body): Json<EnqueueBatchRequest>,
) -> Result<(StatusCode, Json<BatchReceipt>), ApiError> {
    let recipients: Vec<BulkRecipient> = body
        .phone_numbers
        .into_iter()
        .map(BulkRecipient::from)
        .chain(body.recipients.into_iter().map(|r| BulkRecipient {
            phone_number: r.phone_number,
            priority: r.priority,
        }))
        .collect();

    let receipt = state
        .enqueuer
        .enqueue_bulk(recipients, &body.message, body.options.into())
        .await
        .map_err(enqueue_err)?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Debug, Deserialize)]
pub struct AudienceMessageRequest {
    pub message: String,
    #[serde(flatten)]
    pub options: SendOptions,
}

pub async fn enqueue_segment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AudienceMessageRequest>,
) -> Result<(StatusCode, Json<BatchReceipt>), ApiError> {
    let receipt = state
        .enqueuer
        .enqueue_segment(id, &body.message, body.options.into())
        .await
        .map_err(enqueue_err)?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn enqueue_all_contacts(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AudienceMessageRequest>,
) -> Result<(StatusCode, Json<BatchReceipt>), ApiError> {
    let receipt = state
        .enqueuer
        .enqueue_all_contacts(id, &body.message, body.options.into())
        .await
        .map_err(enqueue_err)?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: u64,
}

fn cancel_reason(body: &Option<Json<CancelRequest>>) -> Option<&str> {
    body.as_ref().and_then(|Json(b)| b.reason.as_deref())
}

pub async fn cancel_batch(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state
        .processor
        .cancel_pending_by_batch_id(id, cancel_reason(&body))
        .await
        .map_err(internal_err)?;
    Ok(Json(CancelResponse { cancelled }))
}

pub async fn cancel_segment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state
        .processor
        .cancel_pending_by_segment(id, cancel_reason(&body))
        .await
        .map_err(internal_err)?;
    Ok(Json(CancelResponse { cancelled }))
}

pub async fn cancel_user(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state
        .processor
        .cancel_pending_by_user(id, cancel_reason(&body))
        .await
        .map_err(internal_err)?;
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Debug, Serialize)]
pub struct BatchStatusResponse {
    pub batch_id: Uuid,
    pub counts: StatusCounts,
    pub settled: bool,
}

pub async fn batch_status(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchStatusResponse>, ApiError> {
    let counts = state.tracker.batch_status(id).await.map_err(internal_err)?;
    if counts.total == 0 {
        return Err((StatusCode::NOT_FOUND, format!("batch {id} not found")));
    }
    Ok(Json(BatchStatusResponse {
        batch_id: id,
        counts,
        settled: counts.is_settled(),
    }))
}

pub async fn batch_entries(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<QueueEntry>>, ApiError> {
    let entries = state.tracker.batch_entries(id).await.map_err(internal_err)?;
    Ok(Json(entries))
}

#[derive(Debug, Serialize)]
pub struct CircuitView {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_transition_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub now_utc: DateTime<Utc>,
    pub queue: StatusCounts,
    pub provider: String,
    pub circuit: CircuitView,
}

pub async fn stats(State(state): State<ApiState>) -> Result<Json<StatsResponse>, ApiError> {
    let queue = state.tracker.queue_stats().await.map_err(internal_err)?;
    let client = state.processor.client();
    let breaker = client.breaker();
    let snap = breaker.snapshot().await.map_err(internal_err)?;

    Ok(Json(StatsResponse {
        now_utc: Utc::now(),
        queue,
        provider: client.provider().to_string(),
        circuit: CircuitView {
            name: breaker.name().to_string(),
            state: snap.state,
            failure_count: snap.failure_count,
            last_transition_at: snap.last_transition_at,
        },
    }))
}

pub async fn health() -> &'static str {
    "ok"
}
