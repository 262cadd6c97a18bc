use super::{core::AppState, errors::ServiceError};

const CREATE_USERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
                    user_id TEXT PRIMARY KEY,
                    username TEXT UNIQUE NOT NULL,
                    avatar_ref TEXT NULL,
                    last_seen_at_unix BIGINT NULL
                )";
const CREATE_CONVERSATIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS conversations (
                    conversation_id TEXT PRIMARY KEY,
                    user_lo TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    user_hi TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    last_activity_unix BIGINT NOT NULL,
                    UNIQUE (user_lo, user_hi)
                )";
const CREATE_MESSAGES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                    sender_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    text_content TEXT NULL,
                    image_ref TEXT NULL,
                    voice_ref TEXT NULL,
                    voice_duration_secs INT NULL,
                    created_at_unix BIGINT NOT NULL
                )";
const CREATE_MESSAGE_READS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS message_reads (
                    message_id TEXT NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    PRIMARY KEY (message_id, user_id)
                )";
const CREATE_MESSAGE_LIKES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS message_likes (
                    message_id TEXT NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    PRIMARY KEY (message_id, user_id)
                )";
const CREATE_CONVERSATION_HIDES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS conversation_hides (
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    hidden_at_unix BIGINT NOT NULL,
                    PRIMARY KEY (conversation_id, user_id)
                )";
const CREATE_MESSAGES_CONVERSATION_CREATED_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
                    ON messages(conversation_id, created_at_unix DESC, message_id DESC)";
const CREATE_CONVERSATIONS_PARTICIPANT_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_conversations_user_hi
                    ON conversations(user_hi)";

/// Lazily creates the schema once per process. The advisory lock keeps
/// concurrent replicas from racing on the DDL statements.
pub(crate) async fn ensure_db_schema(state: &AppState) -> Result<(), ServiceError> {
    const SCHEMA_INIT_LOCK_ID: i64 = 0x5745_4654_5f44_4d53;
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };

    state
        .db_init
        .get_or_try_init(|| async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(SCHEMA_INIT_LOCK_ID)
                .execute(&mut *tx)
                .await?;

            for statement in [
                CREATE_USERS_TABLE_SQL,
                CREATE_CONVERSATIONS_TABLE_SQL,
                CREATE_MESSAGES_TABLE_SQL,
                CREATE_MESSAGE_READS_TABLE_SQL,
                CREATE_MESSAGE_LIKES_TABLE_SQL,
                CREATE_CONVERSATION_HIDES_TABLE_SQL,
                CREATE_MESSAGES_CONVERSATION_CREATED_INDEX_SQL,
                CREATE_CONVERSATIONS_PARTICIPANT_INDEX_SQL,
            ] {
                sqlx::query(statement).execute(&mut *tx).await?;
            }

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|error| {
            tracing::error!(event = "db.schema.init", error = %error);
            ServiceError::TransientStorage
        })?;
    Ok(())
}
