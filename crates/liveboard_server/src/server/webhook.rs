#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use liveboard_domain::UserId;
use liveboard_twitch::eventsub::{
	MESSAGE_ID_HEADER, MESSAGE_SIGNATURE_HEADER, MESSAGE_TIMESTAMP_HEADER, MESSAGE_TYPE_HEADER, WebhookMessage, decode_message,
	verify_signature,
};
use liveboard_twitch::helix::UserDirectory;
use liveboard_twitch::identity::IdentityResolver;
use liveboard_twitch::{SecretString, StreamEventKind, epoch_ms};
use tracing::{info, warn};

use crate::server::registry::GroupRegistry;

/// Everything webhook ingest needs; generic over the user directory so
/// dispatch can be exercised against a stub.
pub struct WebhookContext<D> {
	pub registry: Arc<GroupRegistry>,
	pub identity: Arc<IdentityResolver<D>>,

	/// When set, requests with a missing or wrong signature are rejected.
	pub secret: Option<SecretString>,
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from(body)));
	*resp.status_mut() = status;
	resp
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> &'h str {
	headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

/// Handle one `POST /api/webhook` request (headers + collected body).
pub async fn handle_webhook<D: UserDirectory>(headers: &HeaderMap, body: &Bytes, ctx: &WebhookContext<D>) -> Response<Full<Bytes>> {
	metrics::counter!("liveboard_webhook_requests_total").increment(1);

	if let Some(secret) = &ctx.secret {
		let message_id = header(headers, MESSAGE_ID_HEADER);
		let timestamp = header(headers, MESSAGE_TIMESTAMP_HEADER);
		let signature = header(headers, MESSAGE_SIGNATURE_HEADER);

		if !verify_signature(secret, message_id, timestamp, body, signature) {
			metrics::counter!("liveboard_webhook_signature_invalid_total").increment(1);
			warn!(message_id, "webhook signature rejected");
			return empty_response(StatusCode::FORBIDDEN);
		}
	}

	let message_type = header(headers, MESSAGE_TYPE_HEADER);
	let message = match decode_message(message_type, body) {
		Ok(m) => m,
		Err(e) => {
			metrics::counter!("liveboard_webhook_decode_errors_total").increment(1);
			warn!(message_type, error = %e, "webhook decode failed");
			return empty_response(StatusCode::BAD_REQUEST);
		}
	};

	match message {
		WebhookMessage::Notification(n) => {
			let Ok(broadcaster_id) = UserId::new(n.broadcaster_user_id.clone()) else {
				warn!("webhook notification with empty broadcaster id dropped");
				return empty_response(StatusCode::NO_CONTENT);
			};

			let Some(username) = ctx.identity.username_for(&broadcaster_id).await else {
				metrics::counter!("liveboard_webhook_unknown_identity_total").increment(1);
				warn!(broadcaster_id = %broadcaster_id, kind = %n.kind, "webhook for unmapped broadcaster dropped");
				return empty_response(StatusCode::NO_CONTENT);
			};

			info!(%username, broadcaster_id = %broadcaster_id, kind = %n.kind, "stream notification");
			match n.kind {
				StreamEventKind::Online => {
					let started_at_ms = n.started_at_ms.unwrap_or_else(epoch_ms);
					ctx.registry.mark_online_all(&username, started_at_ms).await;
				}
				StreamEventKind::Offline => {
					ctx.registry.mark_offline_all(&username).await;
				}
			}
			empty_response(StatusCode::NO_CONTENT)
		}
		WebhookMessage::Verification { challenge } => {
			info!("webhook verification challenge answered");
			text_response(StatusCode::OK, challenge)
		}
		WebhookMessage::Revocation {
			subscription_type,
			status,
		} => {
			// Nothing to clean up here; the next reconciliation re-creates it.
			warn!(subscription_type, status, "subscription revoked");
			empty_response(StatusCode::NO_CONTENT)
		}
	}
}
