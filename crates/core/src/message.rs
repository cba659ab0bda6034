use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::ActorRole;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("{field} must be a positive integer")]
    NonPositiveId { field: &'static str },
    #[error("message, file_url and voice_url are all empty")]
    EmptyPayload,
}

/// Wire payload for a client-submitted message event.
///
/// The upstream UI only promises ids that parse as integers, so the id
/// fields accept either a JSON number or a numeric string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(deserialize_with = "lenient_i64")]
    pub sender_id: i64,
    pub sender_role: ActorRole,
    #[serde(deserialize_with = "lenient_i64")]
    pub receiver_id: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_url: Option<String>,
}

impl OutgoingMessage {
    /// Reject payloads the persistence step would turn into malformed rows.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.sender_id <= 0 {
            return Err(PayloadError::NonPositiveId {
                field: "sender_id",
            });
        }
        if self.receiver_id <= 0 {
            return Err(PayloadError::NonPositiveId {
                field: "receiver_id",
            });
        }

        let has_text = self
            .message
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty());
        let has_attachment = self.file_url.as_deref().is_some_and(|url| !url.is_empty())
            || self.voice_url.as_deref().is_some_and(|url| !url.is_empty());
        if !has_text && !has_attachment {
            return Err(PayloadError::EmptyPayload);
        }

        Ok(())
    }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        Text(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(value) => Ok(value),
        NumberOrString::Text(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| D::Error::custom(format!("'{text}' is not an integer"))),
    }
}
