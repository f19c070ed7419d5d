#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use liveboard_domain::{GroupSlug, PresenceEntry, PresenceEvent, Username};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Configuration for [`GroupRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Maximum number of queued frames per attached connection.
	pub connection_queue_capacity: usize,

	/// Delay between per-group sync snapshots on attach.
	pub sync_stagger: Duration,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			connection_queue_capacity: 256,
			sync_stagger: Duration::from_secs(1),
		}
	}
}

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("unknown group slug: {0}")]
	UnknownGroup(String),

	#[error("no group slugs given")]
	NoGroups,
}

/// Persisted shape of one group (groups.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredGroup {
	pub slug: GroupSlug,
	pub name: String,
	pub members: Vec<Username>,
}

/// Group state served on `/api/groups`; connections never leave the registry.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
	pub slug: GroupSlug,
	pub name: String,
	pub members: Vec<Username>,
	pub online: Vec<PresenceEntry>,
}

struct Subscriber {
	id: u64,
	tx: mpsc::Sender<PresenceEvent>,
}

struct GroupState {
	slug: GroupSlug,
	name: String,
	members: Vec<Username>,
	online: Vec<PresenceEntry>,
	connections: Vec<Subscriber>,
}

impl GroupState {
	fn is_member(&self, username: &Username) -> bool {
		self.members.contains(username)
	}

	fn is_online(&self, username: &Username) -> bool {
		self.online.iter().any(|e| &e.username == username)
	}

	/// Online entries mirror the member list order for display.
	fn sort_online(&mut self) {
		let members = &self.members;
		self.online
			.sort_by_key(|e| members.iter().position(|m| m == &e.username).unwrap_or(usize::MAX));
	}

	fn fanout(&mut self, event: &PresenceEvent) {
		self.connections.retain(|sub| match sub.tx.try_send(event.clone()) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("liveboard_fanout_dropped_total").increment(1);
				debug!(group = %self.slug, conn_id = sub.id, "connection queue full; frame dropped");
				true
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		});
	}

	fn stored(&self) -> StoredGroup {
		StoredGroup {
			slug: self.slug.clone(),
			name: self.name.clone(),
			members: self.members.clone(),
		}
	}
}

struct Inner {
	groups: Vec<GroupState>,
	next_conn_id: u64,
}

/// One attached client connection; frames arrive on `events`.
#[derive(Debug)]
pub struct Attachment {
	pub conn_id: u64,
	pub events: mpsc::Receiver<PresenceEvent>,
}

/// In-memory group and presence state, fanning out frames to attached
/// connections.
///
/// Every mutation primitive completes its read-modify-write and fanout under
/// one lock acquisition and never awaits remote I/O while holding it; fanout
/// is non-blocking (`try_send`, drop-on-full). Membership changes are
/// persisted after the lock is released, best-effort.
pub struct GroupRegistry {
	path: PathBuf,
	cfg: RegistryConfig,
	inner: Mutex<Inner>,
}

impl GroupRegistry {
	/// Load groups.json (missing file means no groups). Presence always
	/// starts empty and is rebuilt by startup discovery.
	pub async fn load(path: PathBuf, cfg: RegistryConfig) -> anyhow::Result<Self> {
		let stored: Vec<StoredGroup> = match tokio::fs::read_to_string(&path).await {
			Ok(raw) => serde_json::from_str(&raw).with_context(|| format!("parse groups file {}", path.display()))?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				warn!(path = %path.display(), "groups file missing; starting with no groups");
				Vec::new()
			}
			Err(e) => return Err(anyhow::Error::new(e).context(format!("read groups file {}", path.display()))),
		};

		let groups: Vec<GroupState> = stored
			.into_iter()
			.map(|g| GroupState {
				slug: g.slug,
				name: g.name,
				members: g.members,
				online: Vec::new(),
				connections: Vec::new(),
			})
			.collect();

		for g in &groups {
			info!(slug = %g.slug, members = g.members.len(), "group loaded");
		}

		Ok(Self {
			path,
			cfg,
			inner: Mutex::new(Inner { groups, next_conn_id: 1 }),
		})
	}

	/// Groups without their connection state, in file order.
	pub async fn group_snapshots(&self) -> Vec<GroupSnapshot> {
		let inner = self.inner.lock().await;
		inner
			.groups
			.iter()
			.map(|g| GroupSnapshot {
				slug: g.slug.clone(),
				name: g.name.clone(),
				members: g.members.clone(),
				online: g.online.clone(),
			})
			.collect()
	}

	/// Every distinct member across all groups.
	pub async fn member_usernames(&self) -> Vec<Username> {
		let inner = self.inner.lock().await;
		let mut out: Vec<Username> = Vec::new();
		for g in &inner.groups {
			for m in &g.members {
				if !out.contains(m) {
					out.push(m.clone());
				}
			}
		}
		out
	}

	/// Mark a member online in one group. No-op (logged) if the user is not
	/// a member or already online; duplicate webhooks must not double-fan-out
	/// and the first `started_at` wins.
	pub async fn mark_online(&self, slug: &GroupSlug, username: &Username, started_at_ms: i64) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(group) = inner.groups.iter_mut().find(|g| &g.slug == slug) else {
			debug!(%slug, "mark_online: unknown group");
			return false;
		};
		if !group.is_member(username) {
			debug!(%slug, %username, "mark_online: not a member");
			return false;
		}
		Self::mark_online_in(group, username, started_at_ms)
	}

	/// Mark a member offline in one group. No-op (logged) if not online.
	pub async fn mark_offline(&self, slug: &GroupSlug, username: &Username) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(group) = inner.groups.iter_mut().find(|g| &g.slug == slug) else {
			debug!(%slug, "mark_offline: unknown group");
			return false;
		};
		Self::mark_offline_in(group, username)
	}

	/// Apply an online notification to every group with this member, under
	/// one lock acquisition. Returns the number of groups that changed.
	pub async fn mark_online_all(&self, username: &Username, started_at_ms: i64) -> usize {
		let mut inner = self.inner.lock().await;
		let mut changed = 0;
		for group in &mut inner.groups {
			if Self::mark_online_in(group, username, started_at_ms) {
				changed += 1;
			}
		}
		changed
	}

	/// Apply an offline notification to every group with this member.
	pub async fn mark_offline_all(&self, username: &Username) -> usize {
		let mut inner = self.inner.lock().await;
		let mut changed = 0;
		for group in &mut inner.groups {
			if Self::mark_offline_in(group, username) {
				changed += 1;
			}
		}
		changed
	}

	fn mark_online_in(group: &mut GroupState, username: &Username, started_at_ms: i64) -> bool {
		if !group.is_member(username) {
			return false;
		}
		if group.is_online(username) {
			debug!(group = %group.slug, %username, "mark_online: already online");
			return false;
		}

		group.online.push(PresenceEntry {
			username: username.clone(),
			started_at_ms,
		});
		group.sort_online();
		info!(group = %group.slug, %username, started_at_ms, "member online");

		group.fanout(&PresenceEvent::Online {
			username: username.clone(),
			started_at_ms,
		});
		true
	}

	fn mark_offline_in(group: &mut GroupState, username: &Username) -> bool {
		if !group.is_online(username) {
			if group.is_member(username) {
				debug!(group = %group.slug, %username, "mark_offline: not online");
			}
			return false;
		}

		group.online.retain(|e| &e.username != username);
		info!(group = %group.slug, %username, "member offline");

		group.fanout(&PresenceEvent::Offline {
			username: username.clone(),
		});
		true
	}

	/// Replace a group's member list. Online users excluded by the new list
	/// go through the offline transition first, so clients see the events.
	pub async fn set_members(&self, slug: &GroupSlug, members: Vec<Username>) -> Result<(), RegistryError> {
		let doc = {
			let mut inner = self.inner.lock().await;
			let Some(group) = inner.groups.iter_mut().find(|g| &g.slug == slug) else {
				return Err(RegistryError::UnknownGroup(slug.as_str().to_string()));
			};

			let excluded: Vec<Username> = group
				.online
				.iter()
				.filter(|e| !members.contains(&e.username))
				.map(|e| e.username.clone())
				.collect();
			for username in &excluded {
				Self::mark_offline_in(group, username);
			}

			group.members = members;
			group.sort_online();
			info!(%slug, members = group.members.len(), "group members replaced");

			Self::document(&inner)
		};
		self.persist(&doc).await;
		Ok(())
	}

	/// Insert a member at `index` (clamped; end when omitted). Duplicate add
	/// is a no-op; returns whether the list changed.
	pub async fn add_member(&self, slug: &GroupSlug, username: &Username, index: Option<usize>) -> Result<bool, RegistryError> {
		let doc = {
			let mut inner = self.inner.lock().await;
			let Some(group) = inner.groups.iter_mut().find(|g| &g.slug == slug) else {
				return Err(RegistryError::UnknownGroup(slug.as_str().to_string()));
			};

			if group.is_member(username) {
				return Ok(false);
			}

			let index = index.unwrap_or(group.members.len()).min(group.members.len());
			group.members.insert(index, username.clone());
			info!(%slug, %username, index, "group member added");

			Self::document(&inner)
		};
		self.persist(&doc).await;
		Ok(true)
	}

	/// Remove a member; a user absent from the list is a no-op. Removal
	/// marks the user offline in every group that had them online.
	pub async fn remove_member(&self, slug: &GroupSlug, username: &Username) -> Result<bool, RegistryError> {
		let doc = {
			let mut inner = self.inner.lock().await;
			let Some(group) = inner.groups.iter_mut().find(|g| &g.slug == slug) else {
				return Err(RegistryError::UnknownGroup(slug.as_str().to_string()));
			};

			if !group.is_member(username) {
				return Ok(false);
			}

			group.members.retain(|m| m != username);
			info!(%slug, %username, "group member removed");

			for group in &mut inner.groups {
				Self::mark_offline_in(group, username);
			}

			Self::document(&inner)
		};
		self.persist(&doc).await;
		Ok(true)
	}

	/// Register a connection on each slug and queue one sync snapshot per
	/// group, staggered [`RegistryConfig::sync_stagger`] apart (pacing, not
	/// correctness).
	pub async fn attach(&self, slugs: &[GroupSlug]) -> Result<Attachment, RegistryError> {
		if slugs.is_empty() {
			return Err(RegistryError::NoGroups);
		}

		// A slug listed twice must not double-register the connection.
		let mut slugs_deduped: Vec<&GroupSlug> = Vec::with_capacity(slugs.len());
		for slug in slugs {
			if !slugs_deduped.contains(&slug) {
				slugs_deduped.push(slug);
			}
		}

		let (tx, rx) = mpsc::channel(self.cfg.connection_queue_capacity);

		let (conn_id, syncs) = {
			let mut inner = self.inner.lock().await;

			for slug in &slugs_deduped {
				if !inner.groups.iter().any(|g| &g.slug == *slug) {
					return Err(RegistryError::UnknownGroup(slug.as_str().to_string()));
				}
			}

			let conn_id = inner.next_conn_id;
			inner.next_conn_id += 1;

			let mut syncs = Vec::with_capacity(slugs_deduped.len());
			for slug in slugs_deduped {
				let Some(group) = inner.groups.iter_mut().find(|g| &g.slug == slug) else {
					continue;
				};
				group.connections.push(Subscriber { id: conn_id, tx: tx.clone() });
				info!(group = %group.slug, conn_id, connections = group.connections.len(), "connection attached");
				syncs.push(PresenceEvent::Sync {
					group: group.slug.clone(),
					online: group.online.clone(),
				});
			}

			(conn_id, syncs)
		};

		metrics::counter!("liveboard_connections_total").increment(1);

		let stagger = self.cfg.sync_stagger;
		tokio::spawn(async move {
			for (i, event) in syncs.into_iter().enumerate() {
				if i > 0 {
					tokio::time::sleep(stagger).await;
				}
				if tx.send(event).await.is_err() {
					break;
				}
			}
		});

		Ok(Attachment { conn_id, events: rx })
	}

	/// Remove a connection from every group; called on disconnect.
	pub async fn detach(&self, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		for group in &mut inner.groups {
			let before = group.connections.len();
			group.connections.retain(|sub| sub.id != conn_id);
			if group.connections.len() != before {
				info!(group = %group.slug, conn_id, connections = group.connections.len(), "connection detached");
			}
		}
	}

	fn document(inner: &Inner) -> Vec<StoredGroup> {
		inner.groups.iter().map(GroupState::stored).collect()
	}

	/// Best-effort write-back; in-memory state must not lag a failed write.
	async fn persist(&self, doc: &[StoredGroup]) {
		let serialized = match serde_json::to_vec_pretty(doc) {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "groups file: serialize failed");
				return;
			}
		};

		if let Some(parent) = self.path.parent()
			&& let Err(e) = tokio::fs::create_dir_all(parent).await
		{
			warn!(error = %e, path = %self.path.display(), "groups file: create dir failed");
			return;
		}

		if let Err(e) = tokio::fs::write(&self.path, serialized).await {
			warn!(error = %e, path = %self.path.display(), "groups file: persist failed");
		}
	}
}
