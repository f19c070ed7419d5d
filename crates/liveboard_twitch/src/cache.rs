#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use liveboard_domain::UserId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::epoch_ms;
use crate::helix::ScheduleSegment;

/// On-air schedules go stale within a day.
pub const SCHEDULE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Profile icons rarely change; refresh weekly.
pub const PROFILE_ICON_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub type ScheduleCache = TtlStore<Vec<ScheduleSegment>>;
pub type ProfileIconCache = TtlStore<String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
	#[serde(rename = "cachedAt")]
	pub cached_at_ms: i64,
	pub value: V,
}

/// Keyed read-through store with lazy in-place refresh and disk write-back.
///
/// Entries past their TTL are not evicted; they are overwritten on the next
/// read that refreshes them, so there is never a window with no data to
/// serve. The whole document is persisted after any refresh. The store
/// mutex is held across the fetch so concurrent refreshes of one store
/// collapse into a single in-flight call.
pub struct TtlStore<V> {
	path: PathBuf,
	ttl: Option<Duration>,
	entries: Mutex<HashMap<UserId, CacheEntry<V>>>,
}

impl<V> TtlStore<V>
where
	V: Clone + Serialize + DeserializeOwned,
{
	/// Load the persisted document (missing file means an empty store).
	/// `ttl: None` means entries never go stale once written.
	pub async fn load(path: PathBuf, ttl: Option<Duration>) -> anyhow::Result<Self> {
		let entries = match tokio::fs::read_to_string(&path).await {
			Ok(raw) => {
				let doc: BTreeMap<String, CacheEntry<V>> =
					serde_json::from_str(&raw).with_context(|| format!("parse cache document {}", path.display()))?;
				let mut entries = HashMap::with_capacity(doc.len());
				for (key, entry) in doc {
					match UserId::new(key) {
						Ok(id) => {
							entries.insert(id, entry);
						}
						Err(_) => warn!(path = %path.display(), "cache document: skipping empty key"),
					}
				}
				entries
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
			Err(e) => return Err(anyhow::Error::new(e).context(format!("read cache document {}", path.display()))),
		};
		info!(entries = entries.len(), path = %path.display(), "cache document loaded");

		Ok(Self {
			path,
			ttl,
			entries: Mutex::new(entries),
		})
	}

	/// Read-through get: refresh absent-or-stale keys via `fetch`, then
	/// return a value for every requested key that has one.
	///
	/// A failed fetch is logged and the stale values (if any) are served;
	/// remote errors surface to clients only as staleness.
	pub async fn get<F, Fut>(&self, keys: &[UserId], fetch: F) -> HashMap<UserId, V>
	where
		F: FnOnce(Vec<UserId>) -> Fut,
		Fut: Future<Output = anyhow::Result<HashMap<UserId, V>>>,
	{
		self.get_at(epoch_ms(), keys, fetch).await
	}

	fn is_stale(&self, cached_at_ms: i64, now_ms: i64) -> bool {
		match self.ttl {
			Some(ttl) => now_ms.saturating_sub(cached_at_ms) >= ttl.as_millis() as i64,
			None => false,
		}
	}

	pub(crate) async fn get_at<F, Fut>(&self, now_ms: i64, keys: &[UserId], fetch: F) -> HashMap<UserId, V>
	where
		F: FnOnce(Vec<UserId>) -> Fut,
		Fut: Future<Output = anyhow::Result<HashMap<UserId, V>>>,
	{
		let mut entries = self.entries.lock().await;

		let mut to_fetch = Vec::new();
		for key in keys {
			match entries.get(key) {
				Some(entry) if !self.is_stale(entry.cached_at_ms, now_ms) => {}
				_ => to_fetch.push(key.clone()),
			}
		}

		if !to_fetch.is_empty() {
			metrics::counter!("liveboard_cache_refresh_keys_total").increment(to_fetch.len() as u64);
			match fetch(to_fetch).await {
				Ok(fresh) => {
					for (key, value) in fresh {
						entries.insert(
							key,
							CacheEntry {
								cached_at_ms: now_ms,
								value,
							},
						);
					}
					self.persist(&entries).await;
				}
				Err(e) => {
					metrics::counter!("liveboard_cache_refresh_errors_total").increment(1);
					warn!(error = %e, path = %self.path.display(), "cache refresh failed; serving stale entries");
				}
			}
		}

		keys.iter()
			.filter_map(|key| entries.get(key).map(|entry| (key.clone(), entry.value.clone())))
			.collect()
	}

	pub async fn len(&self) -> usize {
		self.entries.lock().await.len()
	}

	async fn persist(&self, entries: &HashMap<UserId, CacheEntry<V>>) {
		let doc: BTreeMap<&str, &CacheEntry<V>> = entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
		let serialized = match serde_json::to_vec_pretty(&doc) {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "cache document: serialize failed");
				return;
			}
		};

		if let Some(parent) = self.path.parent()
			&& let Err(e) = tokio::fs::create_dir_all(parent).await
		{
			warn!(error = %e, path = %self.path.display(), "cache document: create dir failed");
			return;
		}

		if let Err(e) = tokio::fs::write(&self.path, serialized).await {
			warn!(error = %e, path = %self.path.display(), "cache document: persist failed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).unwrap()
	}

	async fn icon_store(path: PathBuf, ttl: Option<Duration>) -> TtlStore<String> {
		TtlStore::load(path, ttl).await.unwrap()
	}

	#[tokio::test]
	async fn fetches_missing_keys_and_serves_cached_ones() {
		let dir = tempfile::tempdir().unwrap();
		let store = icon_store(dir.path().join("icons.json"), Some(Duration::from_secs(60))).await;

		let got = store
			.get_at(1_000, &[uid("1"), uid("2")], |missing| async move {
				assert_eq!(missing.len(), 2);
				Ok(missing.into_iter().map(|k| (k.clone(), format!("icon-{k}"))).collect())
			})
			.await;
		assert_eq!(got[&uid("1")], "icon-1");
		assert_eq!(got[&uid("2")], "icon-2");

		// Within TTL: the fetch must not run at all.
		let got = store
			.get_at(30_000, &[uid("1")], |_| async move { panic!("unexpected fetch") })
			.await;
		assert_eq!(got[&uid("1")], "icon-1");
	}

	#[tokio::test]
	async fn stale_entries_are_refreshed_in_place() {
		let dir = tempfile::tempdir().unwrap();
		let store = icon_store(dir.path().join("icons.json"), Some(Duration::from_secs(60))).await;

		store
			.get_at(0, &[uid("1")], |keys| async move {
				Ok(keys.into_iter().map(|k| (k, "old".to_string())).collect())
			})
			.await;

		let got = store
			.get_at(60_000, &[uid("1")], |keys| async move {
				Ok(keys.into_iter().map(|k| (k, "new".to_string())).collect())
			})
			.await;
		assert_eq!(got[&uid("1")], "new");
		assert_eq!(store.len().await, 1);
	}

	#[tokio::test]
	async fn failed_refresh_serves_stale_value() {
		let dir = tempfile::tempdir().unwrap();
		let store = icon_store(dir.path().join("icons.json"), Some(Duration::from_secs(60))).await;

		store
			.get_at(0, &[uid("1")], |keys| async move {
				Ok(keys.into_iter().map(|k| (k, "old".to_string())).collect())
			})
			.await;

		let got = store
			.get_at(120_000, &[uid("1")], |_| async move { anyhow::bail!("remote down") })
			.await;
		assert_eq!(got[&uid("1")], "old", "stale value must still be served");
	}

	#[tokio::test]
	async fn unresolvable_keys_are_omitted() {
		let dir = tempfile::tempdir().unwrap();
		let store = icon_store(dir.path().join("icons.json"), Some(Duration::from_secs(60))).await;

		let got = store
			.get_at(0, &[uid("1"), uid("404")], |keys| async move {
				Ok(keys
					.into_iter()
					.filter(|k| k.as_str() == "1")
					.map(|k| (k, "icon".to_string()))
					.collect())
			})
			.await;
		assert_eq!(got.len(), 1);
		assert!(got.contains_key(&uid("1")));
	}

	#[tokio::test]
	async fn document_round_trips_through_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("schedules.json");

		{
			let store: ScheduleCache = TtlStore::load(path.clone(), Some(SCHEDULE_TTL)).await.unwrap();
			store
				.get_at(1_000, &[uid("1")], |keys| async move {
					Ok(keys
						.into_iter()
						.map(|k| {
							(
								k,
								vec![ScheduleSegment {
									id: "seg-1".to_string(),
									start_time: "2024-01-01T18:00:00Z".to_string(),
									end_time: "2024-01-01T20:00:00Z".to_string(),
									title: "weekly show".to_string(),
									canceled_until: None,
									category: None,
									is_recurring: true,
								}],
							)
						})
						.collect())
				})
				.await;
		}

		let store: ScheduleCache = TtlStore::load(path, Some(SCHEDULE_TTL)).await.unwrap();
		assert_eq!(store.len().await, 1);
		let got = store
			.get_at(2_000, &[uid("1")], |_| async move { panic!("unexpected fetch") })
			.await;
		assert_eq!(got[&uid("1")][0].title, "weekly show");
	}

	#[tokio::test]
	async fn unbounded_ttl_never_goes_stale() {
		let dir = tempfile::tempdir().unwrap();
		let store = icon_store(dir.path().join("icons.json"), None).await;

		store
			.get_at(0, &[uid("1")], |keys| async move {
				Ok(keys.into_iter().map(|k| (k, "v".to_string())).collect())
			})
			.await;

		let far_future = i64::MAX / 2;
		let got = store
			.get_at(far_future, &[uid("1")], |_| async move { panic!("unexpected fetch") })
			.await;
		assert_eq!(got[&uid("1")], "v");
	}
}
