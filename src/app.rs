use std::{collections::HashMap, env, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::{postgres::PgPoolOptions, Row};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::autoreply;
use crate::error::PipelineError;
use crate::normalize;
use crate::outbound::{GraphClient, PlatformSender, DEFAULT_GRAPH_BASE_URL};
use crate::types::*;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn parse_json_text(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or(Value::Null)
}

fn config_text(config: &Value, key: &str) -> String {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}

fn auto_reply_enabled(config: &Value) -> bool {
    config
        .get("autoReply")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn validate_connection_config(platform: Platform, config: &Value) -> Result<(), String> {
    if platform == Platform::Direct {
        return Err("direct chats do not use a platform connection".to_string());
    }
    let required = ["accessToken", "verifyToken", "accountId"];
    let missing = required
        .iter()
        .filter_map(|key| {
            if config_text(config, key).is_empty() {
                Some(*key)
            } else {
                None
            }
        })
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "missing {} config fields: {}",
            platform,
            missing.join(", ")
        ))
    }
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "inbox".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn verify_webhook_signature(
    app_secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn webhook_challenge(params: &HashMap<String, String>, expected_token: &str) -> Option<String> {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    if mode == "subscribe"
        && !challenge.is_empty()
        && !expected_token.is_empty()
        && token == expected_token
    {
        Some(challenge)
    } else {
        None
    }
}

/// An event only belongs to a connection when its recipient account id
/// matches the one configured there. Blank on either side means the
/// platform omitted the metadata; those are let through.
fn recipient_matches(expected_account: &str, recipient_id: &str) -> bool {
    expected_account.is_empty() || recipient_id.is_empty() || recipient_id == expected_account
}

/// Webhooks only exist for the hosted platforms.
fn webhook_platform(raw: &str) -> Option<Platform> {
    match Platform::parse(raw) {
        Some(Platform::Direct) | None => None,
        platform => platform,
    }
}

fn fallback_display_name(platform: Platform, external_id: &str) -> String {
    match platform {
        Platform::Instagram => format!("@{external_id}"),
        _ => format!("Customer {external_id}"),
    }
}

fn parse_connection_row(row: sqlx::postgres::PgRow) -> PlatformConnection {
    let platform: String = row.get("platform");
    PlatformConnection {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        platform: Platform::parse(&platform).unwrap_or(Platform::Direct),
        name: row.get("name"),
        config: parse_json_text(&row.get::<String, _>("config")),
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_customer_row(row: sqlx::postgres::PgRow) -> Customer {
    let platform: String = row.get("platform");
    Customer {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        platform: Platform::parse(&platform).unwrap_or(Platform::Direct),
        external_id: row.get("external_id"),
        display_name: row.get("display_name"),
        email: row.get("email"),
        phone: row.get("phone"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_chat_row(row: sqlx::postgres::PgRow) -> Chat {
    let platform: String = row.get("platform");
    Chat {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        customer_id: row.get("customer_id"),
        platform: Platform::parse(&platform).unwrap_or(Platform::Direct),
        last_message: row.get("last_message"),
        unread_count: row.get("unread_count"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_message_row(row: sqlx::postgres::PgRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        sender_type: row.get("sender_type"),
        content: row.get("content"),
        message_type: row.get("message_type"),
        platform_message_id: row.get("platform_message_id"),
        is_read: row.get("is_read"),
        created_at: row.get("created_at"),
    }
}

async fn find_connection(state: &Arc<AppState>, connection_id: &str) -> Option<PlatformConnection> {
    let row = sqlx::query(
        "SELECT id, tenant_id, platform, name, config, enabled, created_at, updated_at \
         FROM platform_connections WHERE id = $1",
    )
    .bind(connection_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()?;
    Some(parse_connection_row(row))
}

async fn find_enabled_connection(
    state: &Arc<AppState>,
    tenant_id: &str,
    platform: Platform,
) -> Option<PlatformConnection> {
    let row = sqlx::query(
        "SELECT id, tenant_id, platform, name, config, enabled, created_at, updated_at \
         FROM platform_connections \
         WHERE tenant_id = $1 AND platform = $2 AND enabled = TRUE \
         ORDER BY created_at ASC LIMIT 1",
    )
    .bind(tenant_id)
    .bind(platform.as_str())
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()?;
    Some(parse_connection_row(row))
}

async fn find_chat(state: &Arc<AppState>, chat_id: &str) -> Option<Chat> {
    let row = sqlx::query(
        "SELECT id, tenant_id, customer_id, platform, last_message, unread_count, status, created_at, updated_at \
         FROM chats WHERE id = $1",
    )
    .bind(chat_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()?;
    Some(parse_chat_row(row))
}

async fn find_customer(state: &Arc<AppState>, customer_id: &str) -> Option<Customer> {
    let row = sqlx::query(
        "SELECT id, tenant_id, platform, external_id, display_name, email, phone, status, created_at, updated_at \
         FROM customers WHERE id = $1",
    )
    .bind(customer_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()?;
    Some(parse_customer_row(row))
}

/// Find-or-create the customer behind an inbound event. The insert races
/// against concurrent deliveries from the same never-seen sender, so the
/// whole lookup is one conflict-safe statement; a real display name
/// backfills a placeholder on later messages.
async fn resolve_customer(
    state: &Arc<AppState>,
    tenant_id: &str,
    inbound: &InboundMessage,
) -> Result<Customer, PipelineError> {
    let fallback_name = fallback_display_name(inbound.platform, &inbound.sender_id);
    let display_name = inbound
        .sender_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback_name.clone());
    let phone = if inbound.platform == Platform::Whatsapp {
        format!("+{}", inbound.sender_id)
    } else {
        String::new()
    };

    let row = sqlx::query(
        "INSERT INTO customers \
         (id, tenant_id, platform, external_id, display_name, email, phone, status, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,'',$6,'active',$7,$7) \
         ON CONFLICT (tenant_id, platform, external_id) DO UPDATE SET \
             display_name = CASE \
                 WHEN (customers.display_name = '' OR customers.display_name = $8) \
                      AND excluded.display_name <> $8 \
                 THEN excluded.display_name \
                 ELSE customers.display_name \
             END, \
             updated_at = excluded.updated_at \
         RETURNING id, tenant_id, platform, external_id, display_name, email, phone, status, created_at, updated_at",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(tenant_id)
    .bind(inbound.platform.as_str())
    .bind(&inbound.sender_id)
    .bind(&display_name)
    .bind(&phone)
    .bind(now_iso())
    .bind(&fallback_name)
    .fetch_one(&state.db)
    .await
    .map_err(PipelineError::IdentityResolution)?;

    Ok(parse_customer_row(row))
}

/// Find-or-create the chat and append the inbound message. Returns the chat
/// and the message, or `None` for the message when this delivery was a
/// replay of one already recorded.
async fn reconcile_chat(
    state: &Arc<AppState>,
    customer: &Customer,
    inbound: &InboundMessage,
) -> Result<(Chat, Option<ChatMessage>), PipelineError> {
    let now = now_iso();
    let row = sqlx::query(
        "INSERT INTO chats \
         (id, tenant_id, customer_id, platform, last_message, unread_count, status, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,'',0,'active',$5,$5) \
         ON CONFLICT (tenant_id, platform, customer_id) DO UPDATE SET updated_at = chats.updated_at \
         RETURNING id, tenant_id, customer_id, platform, last_message, unread_count, status, created_at, updated_at",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&customer.tenant_id)
    .bind(&customer.id)
    .bind(customer.platform.as_str())
    .bind(&now)
    .fetch_one(&state.db)
    .await
    .map_err(PipelineError::Reconciliation)?;
    let mut chat = parse_chat_row(row);

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        chat_id: chat.id.clone(),
        sender_type: "customer".to_string(),
        content: inbound.text.clone(),
        message_type: inbound.message_type.as_str().to_string(),
        platform_message_id: inbound.platform_message_id.clone(),
        is_read: false,
        created_at: inbound.timestamp.clone().unwrap_or_else(|| now.clone()),
    };

    // NULL idempotency keys never conflict, so the same statement covers
    // platforms that omit a message id.
    let inserted = sqlx::query(
        "INSERT INTO messages \
         (id, chat_id, sender_type, content, message_type, platform_message_id, is_read, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8) \
         ON CONFLICT (chat_id, platform_message_id) DO NOTHING",
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(&message.sender_type)
    .bind(&message.content)
    .bind(&message.message_type)
    .bind(&message.platform_message_id)
    .bind(message.is_read)
    .bind(&message.created_at)
    .execute(&state.db)
    .await
    .map_err(PipelineError::Reconciliation)?
    .rows_affected()
        > 0;

    if !inserted {
        return Ok((chat, None));
    }

    sqlx::query(
        "UPDATE chats SET last_message = $1, unread_count = unread_count + 1, updated_at = $2 \
         WHERE id = $3",
    )
    .bind(&message.content)
    .bind(&now)
    .bind(&chat.id)
    .execute(&state.db)
    .await
    .map_err(PipelineError::Reconciliation)?;

    chat.last_message = message.content.clone();
    chat.unread_count += 1;
    chat.updated_at = now;
    Ok((chat, Some(message)))
}

/// Record a message we sent (business reply or auto-reply) and refresh the
/// chat summary. Outbound messages never touch the unread counter.
async fn append_outbound_message(
    state: &Arc<AppState>,
    chat_id: &str,
    sender_type: &str,
    content: &str,
    platform_message_id: Option<String>,
) -> Result<ChatMessage, sqlx::Error> {
    let now = now_iso();
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        chat_id: chat_id.to_string(),
        sender_type: sender_type.to_string(),
        content: content.to_string(),
        message_type: "text".to_string(),
        platform_message_id,
        is_read: true,
        created_at: now.clone(),
    };
    sqlx::query(
        "INSERT INTO messages \
         (id, chat_id, sender_type, content, message_type, platform_message_id, is_read, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(&message.sender_type)
    .bind(&message.content)
    .bind(&message.message_type)
    .bind(&message.platform_message_id)
    .bind(message.is_read)
    .bind(&message.created_at)
    .execute(&state.db)
    .await?;

    sqlx::query("UPDATE chats SET last_message = $1, updated_at = $2 WHERE id = $3")
        .bind(&message.content)
        .bind(&now)
        .bind(chat_id)
        .execute(&state.db)
        .await?;

    Ok(message)
}

async fn send_auto_reply(
    state: &Arc<AppState>,
    connection: &PlatformConnection,
    chat: &Chat,
    customer: &Customer,
    inbound_text: &str,
) -> Result<(), PipelineError> {
    let (bucket, reply) = autoreply::render_reply(inbound_text, &customer.display_name);
    // Deliver first; an undelivered reply must leave no message row behind.
    let platform_message_id = state
        .sender
        .send_text(connection, &customer.external_id, &reply)
        .await
        .map_err(PipelineError::OutboundSend)?;
    append_outbound_message(state, &chat.id, "auto", &reply, Some(platform_message_id))
        .await
        .map_err(PipelineError::Reconciliation)?;
    tracing::info!(chat_id = %chat.id, bucket, "auto-reply sent");
    Ok(())
}

/// Run one normalized event through the pipeline. Returns whether a new
/// message was recorded (false for deduplicated redeliveries).
async fn process_inbound(
    state: &Arc<AppState>,
    connection: &PlatformConnection,
    inbound: InboundMessage,
) -> Result<bool, PipelineError> {
    let customer = resolve_customer(state, &connection.tenant_id, &inbound).await?;
    let (chat, message) = reconcile_chat(state, &customer, &inbound).await?;
    let Some(message) = message else {
        tracing::debug!(chat_id = %chat.id, "duplicate delivery ignored");
        return Ok(false);
    };

    if auto_reply_enabled(&connection.config) {
        if let Err(err) = send_auto_reply(state, connection, &chat, &customer, &message.content).await
        {
            tracing::warn!(chat_id = %chat.id, error = %err, "auto-reply failed");
        }
    }
    Ok(true)
}

async fn webhook_verify(
    Path((connection_id, platform_raw)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(platform) = webhook_platform(&platform_raw) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown webhook platform" })),
        )
            .into_response();
    };
    let Some(connection) = find_connection(&state, &connection_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "connection not found" })),
        )
            .into_response();
    };
    if connection.platform != platform {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!(
                    "connection exists but platform is '{}', expected '{}'",
                    connection.platform, platform
                )
            })),
        )
            .into_response();
    }

    let expected_token = config_text(&connection.config, "verifyToken");
    match webhook_challenge(&params, &expected_token) {
        Some(challenge) => (StatusCode::OK, challenge).into_response(),
        None => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid webhook verification token" })),
        )
            .into_response(),
    }
}

async fn webhook_event(
    Path((connection_id, platform_raw)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(platform) = webhook_platform(&platform_raw) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown webhook platform" })),
        )
            .into_response();
    };
    let Some(connection) = find_connection(&state, &connection_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "connection not found" })),
        )
            .into_response();
    };
    if connection.platform != platform {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!(
                    "connection exists but platform is '{}', expected '{}'",
                    connection.platform, platform
                )
            })),
        )
            .into_response();
    }

    let app_secret = config_text(&connection.config, "appSecret");
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_webhook_signature(&app_secret, signature_header, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "invalid json payload" })),
        )
            .into_response();
    };

    let mut processed = 0usize;
    if connection.enabled {
        let expected_account = config_text(&connection.config, "accountId");
        for inbound in normalize::normalize(platform, &payload) {
            // Never attribute an unmatched recipient to some other tenant;
            // drop the event and say so.
            if !recipient_matches(&expected_account, &inbound.recipient_id) {
                tracing::warn!(
                    connection_id = %connection.id,
                    recipient = %inbound.recipient_id,
                    "event for unmatched recipient account, skipping"
                );
                continue;
            }
            match process_inbound(&state, &connection, inbound).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        connection_id = %connection.id,
                        error = %err,
                        "inbound event processing failed"
                    );
                }
            }
        }
    } else {
        tracing::warn!(connection_id = %connection.id, "delivery for disabled connection ignored");
    }

    (
        StatusCode::OK,
        Json(json!({ "received": true, "processed": processed })),
    )
        .into_response()
}

async fn get_chats(
    Query(query): Query<TenantQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rows = sqlx::query(
        "SELECT c.id, c.tenant_id, c.customer_id, c.platform, c.last_message, c.unread_count, \
                c.status, c.created_at, c.updated_at, \
                cu.display_name AS customer_name, cu.external_id AS customer_external_id \
         FROM chats c \
         INNER JOIN customers cu ON cu.id = c.customer_id \
         WHERE c.tenant_id = $1 \
         ORDER BY c.updated_at DESC",
    )
    .bind(&query.tenant_id)
    .fetch_all(&state.db)
    .await
    .ok()
    .unwrap_or_default();

    let chats = rows
        .into_iter()
        .map(|row| {
            let platform: String = row.get("platform");
            ChatSummary {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                customer_id: row.get("customer_id"),
                customer_name: row.get("customer_name"),
                customer_external_id: row.get("customer_external_id"),
                platform: Platform::parse(&platform).unwrap_or(Platform::Direct),
                last_message: row.get("last_message"),
                unread_count: row.get("unread_count"),
                status: row.get("status"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            }
        })
        .collect::<Vec<_>>();

    Json(json!({ "chats": chats }))
}

async fn get_chat_messages(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if find_chat(&state, &chat_id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "chat not found" })),
        )
            .into_response();
    }

    let rows = sqlx::query(
        "SELECT id, chat_id, sender_type, content, message_type, platform_message_id, is_read, created_at \
         FROM messages WHERE chat_id = $1 \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(&chat_id)
    .fetch_all(&state.db)
    .await
    .ok()
    .unwrap_or_default();

    let messages = rows.into_iter().map(parse_message_row).collect::<Vec<_>>();
    Json(json!({ "messages": messages })).into_response()
}

async fn post_chat_message(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    let text = body.text.trim().to_string();
    if text.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text is required" })),
        )
            .into_response();
    }
    let Some(chat) = find_chat(&state, &chat_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "chat not found" })),
        )
            .into_response();
    };

    // Dashboard-native threads have no upstream to deliver to.
    if chat.platform == Platform::Direct {
        return match append_outbound_message(&state, &chat.id, "business", &text, None).await {
            Ok(message) => {
                (StatusCode::CREATED, Json(json!({ "message": message }))).into_response()
            }
            Err(err) => {
                tracing::error!(chat_id = %chat.id, error = %err, "failed to persist message");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "failed to persist message" })),
                )
                    .into_response()
            }
        };
    }

    let Some(customer) = find_customer(&state, &chat.customer_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "customer not found" })),
        )
            .into_response();
    };
    let Some(connection) = find_enabled_connection(&state, &chat.tenant_id, chat.platform).await
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("no enabled {} connection for this workspace", chat.platform)
            })),
        )
            .into_response();
    };

    match state
        .sender
        .send_text(&connection, &customer.external_id, &text)
        .await
    {
        Ok(platform_message_id) => {
            match append_outbound_message(
                &state,
                &chat.id,
                "business",
                &text,
                Some(platform_message_id),
            )
            .await
            {
                Ok(message) => {
                    (StatusCode::CREATED, Json(json!({ "message": message }))).into_response()
                }
                Err(err) => {
                    tracing::error!(chat_id = %chat.id, error = %err, "failed to persist message");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": "failed to persist message" })),
                    )
                        .into_response()
                }
            }
        }
        Err(err) => {
            tracing::warn!(chat_id = %chat.id, error = %err, "outbound delivery failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn mark_chat_read(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(chat) = find_chat(&state, &chat_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "chat not found" })),
        )
            .into_response();
    };

    let updated = sqlx::query(
        "UPDATE messages SET is_read = TRUE \
         WHERE chat_id = $1 AND sender_type = 'customer' AND is_read = FALSE",
    )
    .bind(&chat.id)
    .execute(&state.db)
    .await;
    let updated = match updated {
        Ok(result) => result.rows_affected(),
        Err(err) => {
            tracing::error!(chat_id = %chat.id, error = %err, "failed to mark messages read");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to mark messages read" })),
            )
                .into_response();
        }
    };

    let _ = sqlx::query("UPDATE chats SET unread_count = 0, updated_at = $1 WHERE id = $2")
        .bind(now_iso())
        .bind(&chat.id)
        .execute(&state.db)
        .await;

    Json(json!({ "updated": updated })).into_response()
}

async fn get_customers(
    Query(query): Query<TenantQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rows = sqlx::query(
        "SELECT id, tenant_id, platform, external_id, display_name, email, phone, status, created_at, updated_at \
         FROM customers WHERE tenant_id = $1 \
         ORDER BY updated_at DESC",
    )
    .bind(&query.tenant_id)
    .fetch_all(&state.db)
    .await
    .ok()
    .unwrap_or_default();

    let customers = rows.into_iter().map(parse_customer_row).collect::<Vec<_>>();
    Json(json!({ "customers": customers }))
}

async fn list_connections(
    Query(query): Query<TenantQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let rows = sqlx::query(
        "SELECT id, tenant_id, platform, name, config, enabled, created_at, updated_at \
         FROM platform_connections WHERE tenant_id = $1 \
         ORDER BY created_at ASC",
    )
    .bind(&query.tenant_id)
    .fetch_all(&state.db)
    .await
    .ok()
    .unwrap_or_default();

    let connections = rows
        .into_iter()
        .map(parse_connection_row)
        .collect::<Vec<_>>();
    Json(json!({ "connections": connections }))
}

async fn create_connection(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateConnectionBody>,
) -> impl IntoResponse {
    if body.tenant_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "tenantId is required" })),
        )
            .into_response();
    }
    let Some(platform) = Platform::parse(&body.platform) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown platform '{}'", body.platform) })),
        )
            .into_response();
    };
    let config = body.config.unwrap_or_else(|| json!({}));
    if let Err(err) = validate_connection_config(platform, &config) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": err }))).into_response();
    }

    let now = now_iso();
    let connection = PlatformConnection {
        id: Uuid::new_v4().to_string(),
        tenant_id: body.tenant_id.trim().to_string(),
        platform,
        name: body
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{platform} connection")),
        config,
        enabled: true,
        created_at: now.clone(),
        updated_at: now,
    };
    let inserted = sqlx::query(
        "INSERT INTO platform_connections \
         (id, tenant_id, platform, name, config, enabled, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(&connection.id)
    .bind(&connection.tenant_id)
    .bind(connection.platform.as_str())
    .bind(&connection.name)
    .bind(connection.config.to_string())
    .bind(connection.enabled)
    .bind(&connection.created_at)
    .bind(&connection.updated_at)
    .execute(&state.db)
    .await;

    match inserted {
        Ok(_) => (
            StatusCode::CREATED,
            Json(json!({ "connection": connection })),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to create connection");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to create connection" })),
            )
                .into_response()
        }
    }
}

async fn update_connection(
    Path(connection_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateConnectionBody>,
) -> impl IntoResponse {
    let Some(mut connection) = find_connection(&state, &connection_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "connection not found" })),
        )
            .into_response();
    };

    if let Some(name) = body.name {
        let name = name.trim().to_string();
        if !name.is_empty() {
            connection.name = name;
        }
    }
    if let Some(config) = body.config {
        if let Err(err) = validate_connection_config(connection.platform, &config) {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": err }))).into_response();
        }
        connection.config = config;
    }
    if let Some(enabled) = body.enabled {
        connection.enabled = enabled;
    }
    connection.updated_at = now_iso();

    let updated = sqlx::query(
        "UPDATE platform_connections SET name = $1, config = $2, enabled = $3, updated_at = $4 \
         WHERE id = $5",
    )
    .bind(&connection.name)
    .bind(connection.config.to_string())
    .bind(connection.enabled)
    .bind(&connection.updated_at)
    .bind(&connection.id)
    .execute(&state.db)
    .await;

    match updated {
        Ok(_) => Json(json!({ "connection": connection })).into_response(),
        Err(err) => {
            tracing::error!(connection_id = %connection.id, error = %err, "failed to update connection");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to update connection" })),
            )
                .into_response()
        }
    }
}

async fn delete_connection(
    Path(connection_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let deleted = sqlx::query("DELETE FROM platform_connections WHERE id = $1")
        .bind(&connection_id)
        .execute(&state.db)
        .await
        .map(|result| result.rows_affected() > 0)
        .unwrap_or(false);

    if deleted {
        Json(json!({ "deleted": true })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "connection not found" })),
        )
            .into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

pub async fn run() {
    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let graph_base_url =
        env::var("GRAPH_API_BASE_URL").unwrap_or_else(|_| DEFAULT_GRAPH_BASE_URL.to_string());

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let state = Arc::new(AppState {
        db,
        sender: Arc::new(GraphClient::new(&graph_base_url)),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route(
            "/api/connections",
            get(list_connections).post(create_connection),
        )
        .route(
            "/api/connections/{connection_id}",
            patch(update_connection).delete(delete_connection),
        )
        .route(
            "/api/connections/{connection_id}/{platform}/webhook",
            get(webhook_verify).post(webhook_event),
        )
        .route("/api/chats", get(get_chats))
        .route(
            "/api/chats/{chat_id}/messages",
            get(get_chat_messages).post(post_chat_message),
        )
        .route("/api/chats/{chat_id}/read", post(mark_chat_read))
        .route("/api/customers", get(get_customers))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(port, "inbox server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify_params(mode: &str, token: &str, challenge: &str) -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert("hub.mode".to_string(), mode.to_string());
        params.insert("hub.verify_token".to_string(), token.to_string());
        params.insert("hub.challenge".to_string(), challenge.to_string());
        params
    }

    #[test]
    fn matching_verify_token_echoes_challenge() {
        let params = verify_params("subscribe", "secret-token", "challenge-123");
        assert_eq!(
            webhook_challenge(&params, "secret-token").as_deref(),
            Some("challenge-123")
        );
    }

    #[test]
    fn wrong_verify_token_is_rejected() {
        let params = verify_params("subscribe", "wrong", "challenge-123");
        assert!(webhook_challenge(&params, "secret-token").is_none());
    }

    #[test]
    fn non_subscribe_mode_is_rejected() {
        let params = verify_params("unsubscribe", "secret-token", "challenge-123");
        assert!(webhook_challenge(&params, "secret-token").is_none());
    }

    #[test]
    fn unconfigured_verify_token_rejects_everything() {
        let params = verify_params("subscribe", "", "challenge-123");
        assert!(webhook_challenge(&params, "").is_none());
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_verifies_with_and_without_prefix() {
        let body = br#"{"entry":[]}"#;
        let sig = sign("app-secret", body);
        assert!(verify_webhook_signature(
            "app-secret",
            Some(&format!("sha256={sig}")),
            body
        ));
        assert!(verify_webhook_signature("app-secret", Some(&sig), body));
    }

    #[test]
    fn tampered_body_fails_signature_check() {
        let sig = sign("app-secret", br#"{"entry":[]}"#);
        assert!(!verify_webhook_signature(
            "app-secret",
            Some(&format!("sha256={sig}")),
            br#"{"entry":[{}]}"#
        ));
    }

    #[test]
    fn missing_signature_fails_when_secret_configured() {
        assert!(!verify_webhook_signature("app-secret", None, b"{}"));
    }

    #[test]
    fn empty_secret_skips_signature_check() {
        assert!(verify_webhook_signature("", None, b"{}"));
    }

    #[test]
    fn connection_config_requires_platform_fields() {
        let err = validate_connection_config(Platform::Whatsapp, &json!({})).unwrap_err();
        assert!(err.contains("accessToken"));
        assert!(err.contains("verifyToken"));
        assert!(err.contains("accountId"));

        let ok = validate_connection_config(
            Platform::Whatsapp,
            &json!({
                "accessToken": "token",
                "verifyToken": "verify",
                "accountId": "1098765"
            }),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn direct_connections_are_rejected() {
        assert!(validate_connection_config(Platform::Direct, &json!({})).is_err());
    }

    #[test]
    fn webhook_platform_rejects_direct_and_unknown() {
        assert_eq!(webhook_platform("whatsapp"), Some(Platform::Whatsapp));
        assert_eq!(webhook_platform("instagram"), Some(Platform::Instagram));
        assert_eq!(webhook_platform("direct"), None);
        assert_eq!(webhook_platform("telegram"), None);
    }

    #[test]
    fn recipient_matching_drops_other_accounts() {
        assert!(recipient_matches("1098765", "1098765"));
        assert!(!recipient_matches("1098765", "2222222"));
        assert!(recipient_matches("", "2222222"));
        assert!(recipient_matches("1098765", ""));
    }

    #[test]
    fn fallback_names_per_platform() {
        assert_eq!(
            fallback_display_name(Platform::Instagram, "889900"),
            "@889900"
        );
        assert_eq!(
            fallback_display_name(Platform::Whatsapp, "15551234567"),
            "Customer 15551234567"
        );
    }

    #[test]
    fn auto_reply_flag_defaults_off() {
        assert!(!auto_reply_enabled(&json!({})));
        assert!(!auto_reply_enabled(&json!({ "autoReply": "yes" })));
        assert!(auto_reply_enabled(&json!({ "autoReply": true })));
    }

    #[test]
    fn config_text_trims_and_defaults() {
        let config = json!({ "accessToken": "  token  " });
        assert_eq!(config_text(&config, "accessToken"), "token");
        assert_eq!(config_text(&config, "missing"), "");
    }
}
