use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use anyhow::anyhow;
use pasetors::{keys::SymmetricKey, version4::V4};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::{mpsc, watch, OnceCell, RwLock};
use ulid::Ulid;
use uuid::Uuid;
use weft_core::{MessagePayload, ParticipantPair, UserId, Username};
use weft_protocol::SenderWire;

use super::{
    auth::build_token_key,
    db::ensure_db_schema,
    errors::ServiceError,
    presence::PresenceRegistry,
};

pub(crate) type ConversationListeners = HashMap<Uuid, mpsc::Sender<String>>;
pub(crate) type Subscriptions = HashMap<String, ConversationListeners>;

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 60;
pub const ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;
pub const DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW: u32 = 20;
pub const DEFAULT_GATEWAY_INGRESS_WINDOW_SECS: u64 = 10;
pub const DEFAULT_GATEWAY_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_GATEWAY_EVENT_BYTES: usize = weft_protocol::MAX_EVENT_BYTES;
pub(crate) const DEFAULT_HISTORY_LIMIT: usize = 20;
pub(crate) const MAX_HISTORY_LIMIT: usize = 100;
pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub(crate) static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) ws_disconnects: Mutex<HashMap<&'static str, u64>>,
    pub(crate) gateway_events_emitted: Mutex<HashMap<(String, String), u64>>,
    pub(crate) gateway_events_dropped: Mutex<HashMap<(String, String, String), u64>>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub gateway_ingress_events_per_window: u32,
    pub gateway_ingress_window: Duration,
    pub gateway_outbound_queue: usize,
    pub max_gateway_event_bytes: usize,
    pub token_key_b64: Option<String>,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            gateway_ingress_events_per_window: DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW,
            gateway_ingress_window: Duration::from_secs(DEFAULT_GATEWAY_INGRESS_WINDOW_SECS),
            gateway_outbound_queue: DEFAULT_GATEWAY_OUTBOUND_QUEUE,
            max_gateway_event_bytes: DEFAULT_MAX_GATEWAY_EVENT_BYTES,
            token_key_b64: None,
            database_url: None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) gateway_ingress_events_per_window: u32,
    pub(crate) gateway_ingress_window: Duration,
    pub(crate) gateway_outbound_queue: usize,
    pub(crate) max_gateway_event_bytes: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) db_init: Arc<OnceCell<()>>,
    pub(crate) users: Arc<RwLock<HashMap<String, UserRecord>>>,
    pub(crate) conversations: Arc<RwLock<HashMap<String, ConversationRecord>>>,
    pub(crate) token_key: Arc<SymmetricKey<V4>>,
    pub(crate) presence: Arc<PresenceRegistry>,
    pub(crate) subscriptions: Arc<RwLock<Subscriptions>>,
    pub(crate) connection_senders: Arc<RwLock<HashMap<Uuid, mpsc::Sender<String>>>>,
    pub(crate) connection_controls: Arc<RwLock<HashMap<Uuid, watch::Sender<ConnectionControl>>>>,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let token_key = build_token_key(config)?;
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };

        Ok(Self {
            db_pool,
            db_init: Arc::new(OnceCell::new()),
            users: Arc::new(RwLock::new(HashMap::new())),
            conversations: Arc::new(RwLock::new(HashMap::new())),
            token_key: Arc::new(token_key),
            presence: Arc::new(PresenceRegistry::new()),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connection_senders: Arc::new(RwLock::new(HashMap::new())),
            connection_controls: Arc::new(RwLock::new(HashMap::new())),
            runtime: Arc::new(RuntimeConfig {
                gateway_ingress_events_per_window: config.gateway_ingress_events_per_window,
                gateway_ingress_window: config.gateway_ingress_window,
                gateway_outbound_queue: config.gateway_outbound_queue,
                max_gateway_event_bytes: config.max_gateway_event_bytes,
            }),
        })
    }

    /// Write seam of the external user-profile store. The engine itself never
    /// registers users; deployments and tests provision them through here.
    ///
    /// # Errors
    /// Returns `InvalidRequest` when the username is already taken and
    /// `TransientStorage` when the backing store is unreachable.
    pub async fn create_user(
        &self,
        username: Username,
        avatar_ref: Option<String>,
    ) -> Result<UserId, ServiceError> {
        let user_id = UserId::new();
        if let Some(pool) = &self.db_pool {
            ensure_db_schema(self).await?;
            let result = sqlx::query(
                "INSERT INTO users (user_id, username, avatar_ref)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (username) DO NOTHING",
            )
            .bind(user_id.to_string())
            .bind(username.as_str())
            .bind(avatar_ref.as_deref())
            .execute(pool)
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
            if result.rows_affected() == 0 {
                return Err(ServiceError::InvalidRequest);
            }
            return Ok(user_id);
        }

        let mut users = self.users.write().await;
        if users
            .values()
            .any(|user| user.username.as_str() == username.as_str())
        {
            return Err(ServiceError::InvalidRequest);
        }
        users.insert(
            user_id.to_string(),
            UserRecord {
                id: user_id,
                username,
                avatar_ref,
                last_seen_at_unix: None,
            },
        );
        Ok(user_id)
    }

    /// Read seam of the user-profile store: when the user was last seen
    /// going fully offline, if ever.
    pub async fn last_seen_of(&self, user_id: UserId) -> Option<i64> {
        if let Some(pool) = &self.db_pool {
            let row = sqlx::query("SELECT last_seen_at_unix FROM users WHERE user_id = $1")
                .bind(user_id.to_string())
                .fetch_optional(pool)
                .await
                .ok()??;
            return row.try_get("last_seen_at_unix").ok()?;
        }
        self.users
            .read()
            .await
            .get(&user_id.to_string())
            .and_then(|user| user.last_seen_at_unix)
    }
}

/// Looks up a user and normalizes it into the canonical resolved-sender
/// shape. Everything downstream of this works with `SenderWire`, never with
/// a bare id.
pub(crate) async fn fetch_sender(
    state: &AppState,
    user_id: UserId,
) -> Result<SenderWire, ServiceError> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let row = sqlx::query("SELECT username, avatar_ref FROM users WHERE user_id = $1")
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|_| ServiceError::TransientStorage)?
            .ok_or(ServiceError::NotFound)?;
        return Ok(SenderWire {
            user_id: user_id.to_string(),
            username: row
                .try_get("username")
                .map_err(|_| ServiceError::Internal)?,
            avatar_ref: row
                .try_get("avatar_ref")
                .map_err(|_| ServiceError::Internal)?,
        });
    }

    let users = state.users.read().await;
    let user = users
        .get(&user_id.to_string())
        .ok_or(ServiceError::NotFound)?;
    Ok(SenderWire {
        user_id: user.id.to_string(),
        username: user.username.as_str().to_owned(),
        avatar_ref: user.avatar_ref.clone(),
    })
}

pub(crate) async fn user_exists(state: &AppState, user_id: UserId) -> Result<bool, ServiceError> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let row = sqlx::query("SELECT 1 AS present FROM users WHERE user_id = $1")
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
        return Ok(row.is_some());
    }
    Ok(state.users.read().await.contains_key(&user_id.to_string()))
}

/// Records the last-seen timestamp on the offline presence edge.
pub(crate) async fn record_last_seen(
    state: &AppState,
    user_id: UserId,
    seen_at_unix: i64,
) -> Result<(), ServiceError> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        sqlx::query("UPDATE users SET last_seen_at_unix = $2 WHERE user_id = $1")
            .bind(user_id.to_string())
            .bind(seen_at_unix)
            .execute(pool)
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
        return Ok(());
    }

    let mut users = state.users.write().await;
    if let Some(user) = users.get_mut(&user_id.to_string()) {
        user.last_seen_at_unix = Some(seen_at_unix);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub(crate) id: UserId,
    pub(crate) username: Username,
    pub(crate) avatar_ref: Option<String>,
    pub(crate) last_seen_at_unix: Option<i64>,
}

#[derive(Debug, Clone)]
pub(crate) struct ConversationRecord {
    pub(crate) id: String,
    pub(crate) pair: ParticipantPair,
    pub(crate) messages: Vec<MessageRecord>,
    pub(crate) last_activity_unix: i64,
    pub(crate) hidden_by: HashSet<UserId>,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageRecord {
    pub(crate) id: String,
    pub(crate) sender_id: UserId,
    pub(crate) payload: MessagePayload,
    pub(crate) read_by: HashSet<UserId>,
    pub(crate) liked_by: HashSet<UserId>,
    pub(crate) created_at_unix: i64,
}

impl MessageRecord {
    pub(crate) fn new(sender_id: UserId, payload: MessagePayload, created_at_unix: i64) -> Self {
        Self {
            id: Ulid::new().to_string(),
            sender_id,
            payload,
            read_by: HashSet::from([sender_id]),
            liked_by: HashSet::new(),
            created_at_unix,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub(crate) user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionControl {
    Open,
    Close,
}
