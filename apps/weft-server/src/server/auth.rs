use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    keys::SymmetricKey,
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};
use rand::{rngs::SysRng, TryRng};
use serde::Serialize;
use weft_core::UserId;
use weft_protocol::{Envelope, EventType, PROTOCOL_VERSION};

use super::{
    core::{user_exists, AppConfig, AppState, AuthContext, ACCESS_TOKEN_TTL_SECS},
    errors::ServiceError,
};

/// Builds the symmetric token key: the configured one shared with the
/// external credential issuer, or a fresh per-process key when none is set.
pub(crate) fn build_token_key(config: &AppConfig) -> anyhow::Result<SymmetricKey<V4>> {
    let key_bytes: [u8; 32] = if let Some(encoded) = &config.token_key_b64 {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| anyhow!("token key decode failed: {e}"))?;
        decoded
            .try_into()
            .map_err(|_| anyhow!("token key must be exactly 32 bytes"))?
    } else {
        let mut key_bytes = [0_u8; 32];
        SysRng
            .try_fill_bytes(&mut key_bytes)
            .map_err(|e| anyhow!("os rng failed: {e}"))?;
        key_bytes
    };
    SymmetricKey::<V4>::from(&key_bytes).map_err(|e| anyhow!("token key init failed: {e}"))
}

/// Mints a short-lived access token for a user. This is the hand-off point
/// from the external credential issuer; the engine itself only ever verifies.
///
/// # Errors
/// Returns an error when claim construction or encryption fails.
pub fn issue_access_token(state: &AppState, user_id: UserId) -> anyhow::Result<String> {
    let mut claims = Claims::new_expires_in(&Duration::from_secs(ACCESS_TOKEN_TTL_SECS as u64))
        .map_err(|e| anyhow!("claims init failed: {e}"))?;
    claims
        .subject(&user_id.to_string())
        .map_err(|e| anyhow!("claim sub failed: {e}"))?;

    local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("access token mint failed: {e}"))
}

pub(crate) fn verify_access_token(state: &AppState, token: &str) -> anyhow::Result<Claims> {
    let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(|e| anyhow!("{e}"))?;
    let validation_rules = ClaimsValidationRules::new();
    let trusted = local::decrypt(&state.token_key, &untrusted, &validation_rules, None, None)
        .map_err(|e| anyhow!("token decrypt failed: {e}"))?;
    trusted
        .payload_claims()
        .cloned()
        .ok_or_else(|| anyhow!("token claims missing"))
}

pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ServiceError> {
    let access_token = bearer_token(headers).ok_or(ServiceError::Unauthorized)?;
    authenticate_with_token(state, access_token).await
}

pub(crate) async fn authenticate_with_token(
    state: &AppState,
    access_token: &str,
) -> Result<AuthContext, ServiceError> {
    let claims =
        verify_access_token(state, access_token).map_err(|_| ServiceError::Unauthorized)?;
    let subject = claims
        .get_claim("sub")
        .and_then(serde_json::Value::as_str)
        .ok_or(ServiceError::Unauthorized)?;
    let user_id =
        UserId::try_from(subject.to_owned()).map_err(|_| ServiceError::Unauthorized)?;
    if !user_exists(state, user_id).await? {
        return Err(ServiceError::Unauthorized);
    }
    Ok(AuthContext { user_id })
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

pub(crate) fn outbound_event<T: Serialize>(event_type: &str, data: T) -> String {
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        t: EventType::try_from(event_type.to_owned()).unwrap_or_else(|_| {
            EventType::try_from(String::from("ready")).expect("valid event type")
        }),
        d: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
    };

    serde_json::to_string(&envelope)
        .unwrap_or_else(|_| String::from(r#"{"v":1,"t":"ready","d":{}}"#))
}

#[cfg(test)]
mod tests {
    use weft_core::{UserId, Username};

    use super::{
        authenticate_with_token, build_token_key, issue_access_token,
    };
    use crate::server::core::{AppConfig, AppState};
    use crate::server::errors::ServiceError;

    #[tokio::test]
    async fn minted_token_authenticates_a_provisioned_user() {
        let state = AppState::new(&AppConfig::default()).unwrap();
        let user_id = state
            .create_user(Username::try_from(String::from("alice_1")).unwrap(), None)
            .await
            .unwrap();
        let token = issue_access_token(&state, user_id).unwrap();

        let auth = authenticate_with_token(&state, &token).await.unwrap();
        assert_eq!(auth.user_id, user_id);
    }

    #[tokio::test]
    async fn tokens_for_unknown_users_are_rejected() {
        let state = AppState::new(&AppConfig::default()).unwrap();
        let token = issue_access_token(&state, UserId::new()).unwrap();
        assert_eq!(
            authenticate_with_token(&state, &token).await.unwrap_err(),
            ServiceError::Unauthorized
        );
    }

    #[tokio::test]
    async fn tokens_do_not_verify_across_key_boundaries() {
        let state_a = AppState::new(&AppConfig::default()).unwrap();
        let state_b = AppState::new(&AppConfig::default()).unwrap();
        let user_id = state_a
            .create_user(Username::try_from(String::from("alice_1")).unwrap(), None)
            .await
            .unwrap();
        let token = issue_access_token(&state_a, user_id).unwrap();
        assert_eq!(
            authenticate_with_token(&state_b, &token).await.unwrap_err(),
            ServiceError::Unauthorized
        );
    }

    #[test]
    fn configured_token_key_must_be_32_bytes() {
        let config = AppConfig {
            token_key_b64: Some(String::from("dG9vLXNob3J0")),
            ..AppConfig::default()
        };
        assert!(build_token_key(&config).is_err());
    }
}
