#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Twitch login name, normalized to trimmed lowercase.
///
/// Group membership, presence entries and client frames all key on this
/// form, so normalization happens once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

impl Username {
	/// Create a non-empty, lowercased `Username`.
	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let name = name.as_ref().trim().to_ascii_lowercase();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s)
	}
}

impl Serialize for Username {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for Username {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		Username::new(raw).map_err(D::Error::custom)
	}
}

/// Twitch's opaque numeric account identifier, kept as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

impl Serialize for UserId {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for UserId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		UserId::new(raw).map_err(D::Error::custom)
	}
}

/// Stable group identifier used in URLs and client frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupSlug(String);

impl GroupSlug {
	/// Create a non-empty `GroupSlug`.
	pub fn new(slug: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let slug = slug.as_ref().trim().to_string();
		if slug.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(slug))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for GroupSlug {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for GroupSlug {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		GroupSlug::new(s)
	}
}

impl Serialize for GroupSlug {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for GroupSlug {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		GroupSlug::new(raw).map_err(D::Error::custom)
	}
}

/// One currently-live member of a group.
///
/// `started_at_ms` is the platform-reported stream start (epoch
/// milliseconds), not local discovery time, so clients render correct
/// uptime even after the server restarts and rediscovers a running stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
	pub username: Username,

	#[serde(rename = "startedAt")]
	pub started_at_ms: i64,
}

/// JSON frame pushed to attached clients.
///
/// `Sync` is emitted once per joined group on connect; `Online`/`Offline`
/// follow as presence changes. There are no client-to-server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PresenceEvent {
	Sync {
		group: GroupSlug,
		online: Vec<PresenceEntry>,
	},
	Online {
		username: Username,
		#[serde(rename = "startedAt")]
		started_at_ms: i64,
	},
	Offline {
		username: Username,
	},
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn username_normalizes_case_and_whitespace() {
		let u = Username::new("  Alice ").unwrap();
		assert_eq!(u.as_str(), "alice");
		assert_eq!("BOB".parse::<Username>().unwrap().as_str(), "bob");
	}

	#[test]
	fn rejects_empty_ids() {
		assert_eq!(Username::new("   "), Err(ParseIdError::Empty));
		assert_eq!(UserId::new(""), Err(ParseIdError::Empty));
		assert_eq!(GroupSlug::new(" "), Err(ParseIdError::Empty));
	}

	#[test]
	fn username_deserialize_normalizes() {
		let u: Username = serde_json::from_str("\" MixedCase \"").unwrap();
		assert_eq!(u.as_str(), "mixedcase");
		assert!(serde_json::from_str::<Username>("\"\"").is_err());
	}

	#[test]
	fn presence_event_wire_shape() {
		let ev = PresenceEvent::Online {
			username: Username::new("alice").unwrap(),
			started_at_ms: 1000,
		};
		assert_eq!(
			serde_json::to_string(&ev).unwrap(),
			r#"{"event":"online","username":"alice","startedAt":1000}"#
		);

		let ev = PresenceEvent::Sync {
			group: GroupSlug::new("a").unwrap(),
			online: vec![],
		};
		assert_eq!(serde_json::to_string(&ev).unwrap(), r#"{"event":"sync","group":"a","online":[]}"#);

		let ev = PresenceEvent::Offline {
			username: Username::new("alice").unwrap(),
		};
		assert_eq!(serde_json::to_string(&ev).unwrap(), r#"{"event":"offline","username":"alice"}"#);
	}
}
