//! Delivery adapter contract consumed by both engines.
//!
//! The trait is the only door to the message transport — callers never
//! talk to Telegram directly. The adapter owns retry/backoff for
//! transient failures and the shared global rate limit; callers must
//! treat `send` as potentially blocking while it waits for budget.

pub mod telegram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::core::errors::{BotError, DeliveryError};

/// Shape of a message's content, stored as TEXT in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Photo,
    Video,
    Album,
}

/// Type tag of a stored media reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

/// Opaque, stable reference into the media store.
///
/// For the Telegram transport this is a cached `file_id`; resolution to
/// bytes is the media service's concern, not ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub file_ref: String,
    pub kind: MediaKind,
}

/// Inline button attached to a message. Only two action kinds exist in
/// this domain, so they are a closed variant, not a dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    #[serde(flatten)]
    pub action: ButtonAction,
}

/// What pressing a button does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "kebab-case")]
pub enum ButtonAction {
    /// Open an external URL.
    OpenLink(String),
    /// Send a canned reply back into the chat.
    SendReply(String),
}

/// One rendered message addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub content_type: ContentType,
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
    pub buttons: Vec<Button>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            text: Some(text.into()),
            media: Vec::new(),
            buttons: Vec::new(),
        }
    }
}

/// Addressing information for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Recipient {
    pub project_id: i64,
    pub chat_id: i64,
}

/// Transport acknowledgement of a successful delivery.
#[derive(Debug, Clone, Default)]
pub struct DeliveryAck {
    /// Transport-side message id of the first message sent, if reported.
    pub message_id: Option<i32>,
}

/// Narrow interface to the external message transport.
///
/// Implementations must enforce the transport's global outbound rate
/// limit across all concurrent callers, and must retry transient
/// failures internally before surfacing `DeliveryError::Transient`.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    async fn send(
        &self,
        to: &Recipient,
        message: &OutboundMessage,
    ) -> Result<DeliveryAck, DeliveryError>;
}

/// Validate that content fields are consistent with the content type.
/// Called at write time; the engines assume stored rows already passed.
pub fn validate_content(
    content_type: ContentType,
    text: Option<&str>,
    media: &[MediaRef],
    buttons: &[Button],
) -> Result<(), BotError> {
    match content_type {
        ContentType::Text => {
            if text.map_or(true, |t| t.trim().is_empty()) {
                return Err(BotError::Validation(
                    "text content requires non-empty content_text".into(),
                ));
            }
            if !media.is_empty() {
                return Err(BotError::Validation(
                    "text content cannot carry media refs".into(),
                ));
            }
        }
        ContentType::Photo | ContentType::Video => {
            let expected = match content_type {
                ContentType::Photo => MediaKind::Photo,
                _ => MediaKind::Video,
            };
            if media.len() != 1 {
                return Err(BotError::Validation(format!(
                    "{content_type} content requires exactly one media ref"
                )));
            }
            if media[0].kind != expected {
                return Err(BotError::Validation(format!(
                    "{content_type} content requires a {expected} media ref"
                )));
            }
        }
        ContentType::Album => {
            if media.is_empty() {
                return Err(BotError::Validation(
                    "album content requires at least one media ref".into(),
                ));
            }
        }
    }

    for button in buttons {
        if button.label.trim().is_empty() {
            return Err(BotError::Validation("button label cannot be empty".into()));
        }
        if let ButtonAction::OpenLink(url) = &button.action {
            if url::Url::parse(url).is_err() {
                return Err(BotError::Validation(format!(
                    "open-link button has invalid url: {url}"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_json_uses_action_value_shape() {
        let button = Button {
            label: "Подробнее".to_string(),
            action: ButtonAction::OpenLink("https://example.com/offer".to_string()),
        };
        let json = serde_json::to_value(&button).unwrap();
        assert_eq!(json["action"], "open-link");
        assert_eq!(json["value"], "https://example.com/offer");

        let parsed: Button =
            serde_json::from_str(r#"{"label":"Да","action":"send-reply","value":"yes"}"#).unwrap();
        assert_eq!(parsed.action, ButtonAction::SendReply("yes".to_string()));
    }

    #[test]
    fn text_step_requires_body() {
        let err = validate_content(ContentType::Text, None, &[], &[]);
        assert!(err.is_err());
        assert!(validate_content(ContentType::Text, Some("hi"), &[], &[]).is_ok());
    }

    #[test]
    fn photo_step_requires_single_photo_ref() {
        let photo = MediaRef {
            file_ref: "AgACAgIAAx".to_string(),
            kind: MediaKind::Photo,
        };
        let video = MediaRef {
            file_ref: "BAACAgIAAx".to_string(),
            kind: MediaKind::Video,
        };
        assert!(validate_content(ContentType::Photo, None, &[photo.clone()], &[]).is_ok());
        assert!(validate_content(ContentType::Photo, None, &[video], &[]).is_err());
        assert!(validate_content(ContentType::Photo, None, &[], &[]).is_err());
        assert!(validate_content(ContentType::Album, None, &[photo], &[]).is_ok());
    }

    #[test]
    fn open_link_button_must_be_a_url() {
        let bad = Button {
            label: "Go".to_string(),
            action: ButtonAction::OpenLink("not a url".to_string()),
        };
        assert!(validate_content(ContentType::Text, Some("hi"), &[], &[bad]).is_err());
    }
}
