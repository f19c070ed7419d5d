#![forbid(unsafe_code)]

pub mod cache;
pub mod eventsub;
pub mod helix;
pub mod identity;
pub mod reconcile;

use core::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The two EventSub subscription types this service tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
	Online,
	Offline,
}

impl StreamEventKind {
	pub const ALL: [StreamEventKind; 2] = [StreamEventKind::Online, StreamEventKind::Offline];

	/// Wire name of the subscription type.
	pub const fn as_str(self) -> &'static str {
		match self {
			StreamEventKind::Online => "stream.online",
			StreamEventKind::Offline => "stream.offline",
		}
	}

	/// Parse a wire subscription type; `None` for anything untracked.
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"stream.online" => Some(StreamEventKind::Online),
			"stream.offline" => Some(StreamEventKind::Offline),
			_ => None,
		}
	}
}

impl fmt::Display for StreamEventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Settings for the Helix client and webhook transport.
#[derive(Debug, Clone)]
pub struct TwitchConfig {
	/// Twitch App Client ID.
	pub client_id: String,
	/// OAuth bearer token used for all Helix calls.
	pub bearer_token: SecretString,
	/// Helix base URL (overridable for tests).
	pub helix_base_url: String,
	/// Public webhook callback, e.g. `https://host/api/webhook`.
	pub callback_url: String,
	/// Shared secret for webhook transport and signature checks.
	pub subscription_secret: SecretString,
	/// Per-request timeout for remote calls.
	pub request_timeout: Duration,
}

impl TwitchConfig {
	pub fn new(client_id: String, bearer_token: SecretString, callback_url: String, subscription_secret: SecretString) -> Self {
		Self {
			client_id,
			bearer_token,
			helix_base_url: "https://api.twitch.tv".to_string(),
			callback_url,
			subscription_secret,
			request_timeout: Duration::from_secs(10),
		}
	}
}

/// Wall-clock epoch milliseconds.
pub fn epoch_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

/// Parse a platform RFC3339 timestamp into epoch milliseconds.
pub fn rfc3339_to_epoch_ms(ts: &str) -> Option<i64> {
	chrono::DateTime::parse_from_rfc3339(ts)
		.ok()
		.map(|dt| dt.with_timezone(&chrono::Utc).timestamp_millis())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stream_event_kind_roundtrip() {
		assert_eq!(StreamEventKind::parse("stream.online"), Some(StreamEventKind::Online));
		assert_eq!(StreamEventKind::parse("stream.offline"), Some(StreamEventKind::Offline));
		assert_eq!(StreamEventKind::parse("channel.ban"), None);
		assert_eq!(StreamEventKind::Online.to_string(), "stream.online");
	}

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.to_string(), "<redacted>");
		assert_eq!(s.expose(), "hunter2");
	}

	#[test]
	fn parses_rfc3339_timestamps() {
		assert_eq!(rfc3339_to_epoch_ms("1970-01-01T00:00:01Z"), Some(1000));
		assert_eq!(rfc3339_to_epoch_ms("not a timestamp"), None);
	}
}
