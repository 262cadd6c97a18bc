#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "weft"
}

pub const MAX_MESSAGE_TEXT_BYTES: usize = 2000;
pub const MAX_MEDIA_REF_BYTES: usize = 512;
pub const MAX_VOICE_DURATION_SECS: u32 = 600;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("username is invalid")]
    InvalidUsername,
    #[error("message payload has no content")]
    EmptyPayload,
    #[error("message text is out of bounds")]
    InvalidText,
    #[error("media reference is invalid")]
    InvalidMediaRef,
    #[error("voice duration is out of bounds")]
    InvalidVoiceDuration,
    #[error("conversation participants must differ")]
    SelfConversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for UserId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidUserId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_username(&value)?;
        Ok(Self(value))
    }
}

fn validate_username(value: &str) -> Result<(), DomainError> {
    if !(3..=32).contains(&value.len()) {
        return Err(DomainError::InvalidUsername);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Ok(());
    }

    Err(DomainError::InvalidUsername)
}

/// The unordered participant pair of a two-party conversation, stored in a
/// canonical (lo, hi) order so the pair has exactly one representation
/// regardless of which side initiated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    lo: UserId,
    hi: UserId,
}

impl ParticipantPair {
    /// Normalizes two distinct user ids into the canonical pair.
    ///
    /// # Errors
    /// Returns [`DomainError::SelfConversation`] when both ids are equal.
    pub fn new(a: UserId, b: UserId) -> Result<Self, DomainError> {
        if a == b {
            return Err(DomainError::SelfConversation);
        }
        if a < b {
            Ok(Self { lo: a, hi: b })
        } else {
            Ok(Self { lo: b, hi: a })
        }
    }

    #[must_use]
    pub fn lo(&self) -> UserId {
        self.lo
    }

    #[must_use]
    pub fn hi(&self) -> UserId {
        self.hi
    }

    #[must_use]
    pub fn contains(&self, user_id: UserId) -> bool {
        self.lo == user_id || self.hi == user_id
    }

    /// Returns the participant opposite to `user_id`, or `None` when the user
    /// is not part of the pair.
    #[must_use]
    pub fn counterpart_of(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.lo {
            Some(self.hi)
        } else if user_id == self.hi {
            Some(self.lo)
        } else {
            None
        }
    }
}

/// A voice recording reference plus its playback length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceNote {
    pub media_ref: String,
    pub duration_secs: u32,
}

/// The content of a message. At least one part must be present; carrying
/// more than one is allowed but unusual.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceNote>,
}

impl MessagePayload {
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            text: Some(value.into()),
            image_ref: None,
            voice: None,
        }
    }

    /// Validates payload bounds and the at-least-one-part rule.
    ///
    /// # Errors
    /// Returns [`DomainError::EmptyPayload`] when no part is present, or the
    /// matching bounds error for an invalid part.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.text.is_none() && self.image_ref.is_none() && self.voice.is_none() {
            return Err(DomainError::EmptyPayload);
        }
        if let Some(text) = &self.text {
            if text.is_empty() || text.len() > MAX_MESSAGE_TEXT_BYTES {
                return Err(DomainError::InvalidText);
            }
        }
        if let Some(image_ref) = &self.image_ref {
            validate_media_ref(image_ref)?;
        }
        if let Some(voice) = &self.voice {
            validate_media_ref(&voice.media_ref)?;
            if voice.duration_secs == 0 || voice.duration_secs > MAX_VOICE_DURATION_SECS {
                return Err(DomainError::InvalidVoiceDuration);
            }
        }
        Ok(())
    }

    /// One-line preview used by conversation list entries. Text wins over
    /// media placeholders when several parts are present.
    #[must_use]
    pub fn preview(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        if self.image_ref.is_some() {
            return String::from("\u{1f4f7} Photo");
        }
        String::from("\u{1f3a4} Voice message")
    }
}

fn validate_media_ref(value: &str) -> Result<(), DomainError> {
    if value.is_empty() || value.len() > MAX_MEDIA_REF_BYTES {
        return Err(DomainError::InvalidMediaRef);
    }
    if value.chars().any(char::is_control) {
        return Err(DomainError::InvalidMediaRef);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        project_name, DomainError, MessagePayload, ParticipantPair, UserId, Username, VoiceNote,
        MAX_MESSAGE_TEXT_BYTES,
    };

    #[test]
    fn project_name_is_stable() {
        assert_eq!(project_name(), "weft");
    }

    #[test]
    fn user_id_round_trip_and_parse_validation() {
        let id = UserId::new();
        let parsed = UserId::try_from(id.to_string()).unwrap();
        assert_eq!(id, parsed);

        let invalid = UserId::try_from(String::from("not-a-ulid")).unwrap_err();
        assert_eq!(invalid, DomainError::InvalidUserId);
    }

    #[test]
    fn username_enforces_charset_and_bounds() {
        assert!(Username::try_from(String::from("alice_1")).is_ok());
        assert!(Username::try_from(String::from("ab")).is_err());
        assert!(Username::try_from(String::from("has space")).is_err());
    }

    #[test]
    fn participant_pair_is_order_independent() {
        let a = UserId::new();
        let b = UserId::new();
        let forward = ParticipantPair::new(a, b).unwrap();
        let reverse = ParticipantPair::new(b, a).unwrap();
        assert_eq!(forward, reverse);
        assert_eq!(forward.lo(), reverse.lo());
        assert!(forward.contains(a));
        assert_eq!(forward.counterpart_of(a), Some(b));
        assert_eq!(forward.counterpart_of(UserId::new()), None);
    }

    #[test]
    fn participant_pair_rejects_self_conversation() {
        let a = UserId::new();
        assert_eq!(
            ParticipantPair::new(a, a).unwrap_err(),
            DomainError::SelfConversation
        );
    }

    #[test]
    fn payload_requires_at_least_one_part() {
        let empty = MessagePayload::default();
        assert_eq!(empty.validate().unwrap_err(), DomainError::EmptyPayload);
    }

    #[test]
    fn payload_bounds_are_enforced() {
        let oversized = MessagePayload::text("x".repeat(MAX_MESSAGE_TEXT_BYTES + 1));
        assert_eq!(oversized.validate().unwrap_err(), DomainError::InvalidText);

        let bad_voice = MessagePayload {
            text: None,
            image_ref: None,
            voice: Some(VoiceNote {
                media_ref: String::from("voice/abc.ogg"),
                duration_secs: 0,
            }),
        };
        assert_eq!(
            bad_voice.validate().unwrap_err(),
            DomainError::InvalidVoiceDuration
        );
    }

    #[test]
    fn preview_prefers_text_over_media_placeholders() {
        assert_eq!(MessagePayload::text("hello").preview(), "hello");

        let image = MessagePayload {
            text: None,
            image_ref: Some(String::from("img/1.png")),
            voice: None,
        };
        assert_eq!(image.preview(), "\u{1f4f7} Photo");

        let voice = MessagePayload {
            text: None,
            image_ref: None,
            voice: Some(VoiceNote {
                media_ref: String::from("voice/1.ogg"),
                duration_secs: 3,
            }),
        };
        assert_eq!(voice.preview(), "\u{1f3a4} Voice message");
    }
}
