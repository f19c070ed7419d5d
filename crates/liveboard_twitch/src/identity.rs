#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::Context;
use liveboard_domain::{UserId, Username};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::helix::{USER_BATCH_LIMIT, UserDirectory};

/// Bidirectional username <-> platform id table.
///
/// Append-only: pairs are never evicted once learned. Usernames only change
/// platform-side on account rename, which is an accepted staleness risk.
#[derive(Debug, Default)]
pub struct IdentityMap {
	id_by_username: HashMap<Username, UserId>,
	username_by_id: HashMap<UserId, Username>,
}

impl IdentityMap {
	pub fn insert(&mut self, username: Username, id: UserId) {
		self.id_by_username.insert(username.clone(), id.clone());
		self.username_by_id.insert(id, username);
	}

	pub fn id_for(&self, username: &Username) -> Option<&UserId> {
		self.id_by_username.get(username)
	}

	pub fn username_for(&self, id: &UserId) -> Option<&Username> {
		self.username_by_id.get(id)
	}

	pub fn len(&self) -> usize {
		self.id_by_username.len()
	}

	pub fn is_empty(&self) -> bool {
		self.id_by_username.is_empty()
	}

	fn to_document(&self) -> BTreeMap<String, String> {
		self.id_by_username
			.iter()
			.map(|(username, id)| (username.as_str().to_string(), id.as_str().to_string()))
			.collect()
	}

	fn from_document(doc: BTreeMap<String, String>) -> Self {
		let mut map = Self::default();
		for (username, id) in doc {
			match (Username::new(&username), UserId::new(id)) {
				(Ok(username), Ok(id)) => map.insert(username, id),
				_ => warn!(username, "identity cache: skipping malformed entry"),
			}
		}
		map
	}
}

/// Read-through username -> id resolver backed by the identity cache.
///
/// Cached names resolve locally; the remainder goes to the directory in
/// chunks of at most [`USER_BATCH_LIMIT`] logins, and newly learned pairs
/// are persisted before the call returns.
pub struct IdentityResolver<D> {
	directory: D,
	path: PathBuf,
	map: Mutex<IdentityMap>,
}

impl<D: UserDirectory> IdentityResolver<D> {
	/// Load the persisted mapping (missing file means an empty map).
	pub async fn load(directory: D, path: PathBuf) -> anyhow::Result<Self> {
		let map = match tokio::fs::read_to_string(&path).await {
			Ok(raw) => {
				let doc: BTreeMap<String, String> =
					serde_json::from_str(&raw).with_context(|| format!("parse identity cache {}", path.display()))?;
				IdentityMap::from_document(doc)
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => IdentityMap::default(),
			Err(e) => return Err(anyhow::Error::new(e).context(format!("read identity cache {}", path.display()))),
		};
		info!(entries = map.len(), path = %path.display(), "identity cache loaded");

		Ok(Self {
			directory,
			path,
			map: Mutex::new(map),
		})
	}

	/// Resolve usernames to platform ids.
	///
	/// Unresolvable names are simply absent from the result; callers must
	/// tolerate partial results.
	pub async fn resolve(&self, usernames: &[Username]) -> anyhow::Result<HashMap<Username, UserId>> {
		let mut map = self.map.lock().await;

		let missing: Vec<String> = usernames
			.iter()
			.filter(|u| map.id_for(u).is_none())
			.map(|u| u.as_str().to_string())
			.collect();

		if !missing.is_empty() {
			debug!(count = missing.len(), "identity cache: looking up unresolved logins");
			let mut learned = 0usize;

			for chunk in missing.chunks(USER_BATCH_LIMIT) {
				let users = self
					.directory
					.users_by_login(chunk)
					.await
					.context("identity lookup batch")?;
				for user in users {
					match (Username::new(&user.login), UserId::new(user.id)) {
						(Ok(username), Ok(id)) => {
							map.insert(username, id);
							learned += 1;
						}
						_ => warn!(login = user.login, "identity lookup returned malformed user"),
					}
				}
			}

			if learned > 0 {
				metrics::counter!("liveboard_identity_resolved_total").increment(learned as u64);
				self.persist(&map).await;
			}
		}

		Ok(usernames
			.iter()
			.filter_map(|u| map.id_for(u).map(|id| (u.clone(), id.clone())))
			.collect())
	}

	/// Reverse lookup used by webhook ingest; never hits the network.
	pub async fn username_for(&self, id: &UserId) -> Option<Username> {
		let map = self.map.lock().await;
		map.username_for(id).cloned()
	}

	pub async fn len(&self) -> usize {
		self.map.lock().await.len()
	}

	async fn persist(&self, map: &IdentityMap) {
		let doc = map.to_document();
		let serialized = match serde_json::to_vec_pretty(&doc) {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "identity cache: serialize failed");
				return;
			}
		};

		if let Some(parent) = self.path.parent()
			&& let Err(e) = tokio::fs::create_dir_all(parent).await
		{
			warn!(error = %e, path = %self.path.display(), "identity cache: create dir failed");
			return;
		}

		// Durability is best-effort; in-memory state must not lag a failed write.
		if let Err(e) = tokio::fs::write(&self.path, serialized).await {
			warn!(error = %e, path = %self.path.display(), "identity cache: persist failed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::helix::HelixUser;
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct StubDirectory {
		known: Vec<(&'static str, &'static str)>,
		calls: AtomicUsize,
	}

	#[async_trait]
	impl UserDirectory for StubDirectory {
		async fn users_by_login(&self, logins: &[String]) -> anyhow::Result<Vec<HelixUser>> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			assert!(logins.len() <= USER_BATCH_LIMIT);
			Ok(self
				.known
				.iter()
				.filter(|(login, _)| logins.iter().any(|l| l == login))
				.map(|(login, id)| HelixUser {
					id: (*id).to_string(),
					login: (*login).to_string(),
					display_name: None,
					profile_image_url: None,
				})
				.collect())
		}
	}

	fn names(names: &[&str]) -> Vec<Username> {
		names.iter().map(|n| Username::new(n).unwrap()).collect()
	}

	#[tokio::test]
	async fn resolve_returns_partial_results_for_unknown_logins() {
		let dir = tempfile::tempdir().unwrap();
		let resolver = IdentityResolver::load(
			StubDirectory {
				known: vec![("alice", "1"), ("bob", "2")],
				calls: AtomicUsize::new(0),
			},
			dir.path().join("uids.json"),
		)
		.await
		.unwrap();

		let resolved = resolver.resolve(&names(&["alice", "bob", "charlie"])).await.unwrap();
		assert_eq!(resolved.len(), 2);
		assert_eq!(resolved[&Username::new("alice").unwrap()].as_str(), "1");
		assert_eq!(resolved[&Username::new("bob").unwrap()].as_str(), "2");
		assert!(!resolved.contains_key(&Username::new("charlie").unwrap()));
	}

	#[tokio::test]
	async fn resolve_skips_remote_lookup_for_cached_names() {
		let dir = tempfile::tempdir().unwrap();
		let stub = StubDirectory {
			known: vec![("alice", "1")],
			calls: AtomicUsize::new(0),
		};
		let resolver = IdentityResolver::load(stub, dir.path().join("uids.json")).await.unwrap();

		resolver.resolve(&names(&["alice"])).await.unwrap();
		assert_eq!(resolver.directory.calls.load(Ordering::SeqCst), 1);

		resolver.resolve(&names(&["alice"])).await.unwrap();
		assert_eq!(resolver.directory.calls.load(Ordering::SeqCst), 1, "cached name must not refetch");
	}

	#[tokio::test]
	async fn reverse_lookup_follows_resolution() {
		let dir = tempfile::tempdir().unwrap();
		let resolver = IdentityResolver::load(
			StubDirectory {
				known: vec![("alice", "1")],
				calls: AtomicUsize::new(0),
			},
			dir.path().join("uids.json"),
		)
		.await
		.unwrap();

		assert_eq!(resolver.username_for(&UserId::new("1").unwrap()).await, None);
		resolver.resolve(&names(&["alice"])).await.unwrap();
		assert_eq!(
			resolver.username_for(&UserId::new("1").unwrap()).await,
			Some(Username::new("alice").unwrap())
		);
	}

	#[tokio::test]
	async fn persisted_map_survives_reload() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("uids.json");

		{
			let resolver = IdentityResolver::load(
				StubDirectory {
					known: vec![("alice", "1"), ("bob", "2")],
					calls: AtomicUsize::new(0),
				},
				path.clone(),
			)
			.await
			.unwrap();
			resolver.resolve(&names(&["alice", "bob"])).await.unwrap();
		}

		let resolver = IdentityResolver::load(
			StubDirectory {
				known: vec![],
				calls: AtomicUsize::new(0),
			},
			path,
		)
		.await
		.unwrap();
		assert_eq!(resolver.len().await, 2);

		// No remote call needed: both names come from the reloaded document.
		let resolved = resolver.resolve(&names(&["alice", "bob"])).await.unwrap();
		assert_eq!(resolved.len(), 2);
		assert_eq!(resolver.directory.calls.load(Ordering::SeqCst), 0);
	}
}
