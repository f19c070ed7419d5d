#![forbid(unsafe_code)]

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::{SecretString, StreamEventKind};

/// EventSub webhook header names.
pub const MESSAGE_TYPE_HEADER: &str = "Twitch-Eventsub-Message-Type";
pub const MESSAGE_ID_HEADER: &str = "Twitch-Eventsub-Message-Id";
pub const MESSAGE_TIMESTAMP_HEADER: &str = "Twitch-Eventsub-Message-Timestamp";
pub const MESSAGE_SIGNATURE_HEADER: &str = "Twitch-Eventsub-Message-Signature";

/// Decode failures get their own kinds so ingest can log precisely and
/// answer with the right status instead of crashing on a surprise shape.
#[derive(Debug, Error)]
pub enum WebhookDecodeError {
	#[error("unrecognized message type: {0:?}")]
	UnknownMessageType(String),

	#[error("notification for untracked subscription type: {0}")]
	UnsupportedSubscriptionType(String),

	#[error("malformed payload: {0}")]
	Json(#[from] serde_json::Error),
}

/// A validated inbound webhook message.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookMessage {
	Notification(StreamNotification),

	/// Handshake for a pending subscription; the challenge must be echoed
	/// back verbatim as the response body.
	Verification { challenge: String },

	/// The subscription is implicitly gone; the next reconciliation pass
	/// re-creates it.
	Revocation { subscription_type: String, status: String },
}

/// A stream.online / stream.offline notification.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamNotification {
	pub kind: StreamEventKind,
	pub broadcaster_user_id: String,

	/// Platform-reported stream start (epoch ms); online only.
	pub started_at_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NotificationPayload {
	subscription: PayloadSubscription,
	event: PayloadEvent,
}

#[derive(Debug, Deserialize)]
struct PayloadSubscription {
	#[serde(rename = "type")]
	r#type: String,

	#[serde(default)]
	status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayloadEvent {
	broadcaster_user_id: String,

	#[serde(default)]
	started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerificationPayload {
	challenge: String,
}

#[derive(Debug, Deserialize)]
struct RevocationPayload {
	subscription: PayloadSubscription,
}

/// Decode one webhook request given its message-type header and raw body.
pub fn decode_message(message_type: &str, body: &[u8]) -> Result<WebhookMessage, WebhookDecodeError> {
	match message_type {
		"notification" => {
			let payload: NotificationPayload = serde_json::from_slice(body)?;
			let Some(kind) = StreamEventKind::parse(&payload.subscription.r#type) else {
				return Err(WebhookDecodeError::UnsupportedSubscriptionType(payload.subscription.r#type));
			};
			let started_at_ms = match kind {
				StreamEventKind::Online => payload.event.started_at.as_deref().and_then(crate::rfc3339_to_epoch_ms),
				StreamEventKind::Offline => None,
			};
			Ok(WebhookMessage::Notification(StreamNotification {
				kind,
				broadcaster_user_id: payload.event.broadcaster_user_id,
				started_at_ms,
			}))
		}
		"webhook_callback_verification" => {
			let payload: VerificationPayload = serde_json::from_slice(body)?;
			Ok(WebhookMessage::Verification {
				challenge: payload.challenge,
			})
		}
		"revocation" => {
			let payload: RevocationPayload = serde_json::from_slice(body)?;
			Ok(WebhookMessage::Revocation {
				subscription_type: payload.subscription.r#type,
				status: payload.subscription.status.unwrap_or_default(),
			})
		}
		other => Err(WebhookDecodeError::UnknownMessageType(other.to_string())),
	}
}

/// Verify `Twitch-Eventsub-Message-Signature` (HMAC-SHA256 over
/// message id + timestamp + raw body, hex digest with a `sha256=` prefix).
pub fn verify_signature(secret: &SecretString, message_id: &str, timestamp: &str, body: &[u8], signature_header: &str) -> bool {
	let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
		return false;
	};
	let Some(expected) = decode_hex(hex_digest) else {
		return false;
	};

	let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.expose().as_bytes()) else {
		return false;
	};
	mac.update(message_id.as_bytes());
	mac.update(timestamp.as_bytes());
	mac.update(body);

	mac.verify_slice(&expected).is_ok()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
	if s.len() % 2 != 0 {
		return None;
	}
	let mut out = Vec::with_capacity(s.len() / 2);
	let bytes = s.as_bytes();
	for pair in bytes.chunks_exact(2) {
		let hi = (pair[0] as char).to_digit(16)?;
		let lo = (pair[1] as char).to_digit(16)?;
		out.push(((hi << 4) | lo) as u8);
	}
	Some(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	const ONLINE_BODY: &str = r#"{
		"subscription": {
			"id": "sub-1",
			"type": "stream.online",
			"status": "enabled",
			"condition": { "broadcaster_user_id": "123" }
		},
		"event": {
			"broadcaster_user_id": "123",
			"broadcaster_user_login": "alice",
			"started_at": "1970-01-01T00:00:01Z"
		}
	}"#;

	#[test]
	fn decodes_online_notification() {
		let msg = decode_message("notification", ONLINE_BODY.as_bytes()).unwrap();
		match msg {
			WebhookMessage::Notification(n) => {
				assert_eq!(n.kind, StreamEventKind::Online);
				assert_eq!(n.broadcaster_user_id, "123");
				assert_eq!(n.started_at_ms, Some(1000));
			}
			other => panic!("expected notification, got {other:?}"),
		}
	}

	#[test]
	fn decodes_offline_notification_without_start_time() {
		let body = r#"{
			"subscription": { "type": "stream.offline" },
			"event": { "broadcaster_user_id": "123" }
		}"#;
		let msg = decode_message("notification", body.as_bytes()).unwrap();
		match msg {
			WebhookMessage::Notification(n) => {
				assert_eq!(n.kind, StreamEventKind::Offline);
				assert_eq!(n.started_at_ms, None);
			}
			other => panic!("expected notification, got {other:?}"),
		}
	}

	#[test]
	fn decodes_verification_challenge() {
		let body = r#"{
			"challenge": "pogchamp-kappa-360noscope-vohiyo",
			"subscription": { "type": "stream.online" }
		}"#;
		let msg = decode_message("webhook_callback_verification", body.as_bytes()).unwrap();
		assert_eq!(
			msg,
			WebhookMessage::Verification {
				challenge: "pogchamp-kappa-360noscope-vohiyo".to_string()
			}
		);
	}

	#[test]
	fn rejects_unknown_message_type() {
		let err = decode_message("surprise", b"{}").unwrap_err();
		assert!(matches!(err, WebhookDecodeError::UnknownMessageType(_)));
	}

	#[test]
	fn rejects_untracked_subscription_type() {
		let body = r#"{
			"subscription": { "type": "channel.follow" },
			"event": { "broadcaster_user_id": "123" }
		}"#;
		let err = decode_message("notification", body.as_bytes()).unwrap_err();
		assert!(matches!(err, WebhookDecodeError::UnsupportedSubscriptionType(t) if t == "channel.follow"));
	}

	#[test]
	fn signature_verifies_and_rejects_tampering() {
		let secret = SecretString::new("s3cre7");
		let id = "msg-1";
		let ts = "2024-01-01T00:00:00Z";
		let body = b"{\"hello\":true}";

		let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose().as_bytes()).unwrap();
		mac.update(id.as_bytes());
		mac.update(ts.as_bytes());
		mac.update(body);
		let digest = mac.finalize().into_bytes();
		let header = format!("sha256={}", digest.iter().map(|b| format!("{b:02x}")).collect::<String>());

		assert!(verify_signature(&secret, id, ts, body, &header));
		assert!(!verify_signature(&secret, id, ts, b"{\"hello\":false}", &header));
		assert!(!verify_signature(&SecretString::new("other"), id, ts, body, &header));
		assert!(!verify_signature(&secret, id, ts, body, "md5=abcd"));
	}
}
