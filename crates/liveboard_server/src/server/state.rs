#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use liveboard_domain::{UserId, Username};
use liveboard_twitch::SecretString;
use liveboard_twitch::cache::{ProfileIconCache, ScheduleCache};
use liveboard_twitch::helix::{HelixClient, USER_BATCH_LIMIT};
use liveboard_twitch::identity::IdentityResolver;
use liveboard_twitch::reconcile::Reconciler;
use liveboard_twitch::rfc3339_to_epoch_ms;
use tracing::{info, warn};

use crate::server::registry::GroupRegistry;

/// Shared services behind every HTTP route.
pub struct AppState {
	pub registry: Arc<GroupRegistry>,
	pub helix: Arc<HelixClient>,
	pub identity: Arc<IdentityResolver<HelixClient>>,
	pub schedules: Arc<ScheduleCache>,
	pub profile_icons: Arc<ProfileIconCache>,
	pub reconciler: Arc<Reconciler>,
	pub webhook_secret: Option<SecretString>,
	pub modify_password: Option<SecretString>,
}

impl AppState {
	/// Platform ids for every tracked member (resolvable ones).
	pub async fn tracked_ids(&self) -> anyhow::Result<Vec<UserId>> {
		let usernames = self.registry.member_usernames().await;
		let resolved = self.identity.resolve(&usernames).await?;
		Ok(resolved.into_values().collect())
	}

	/// Full reconciliation pass against the current tracked set. Failures
	/// are logged; the next pass repairs.
	pub async fn reconcile_tracked(&self) {
		match self.tracked_ids().await {
			Ok(ids) => {
				if let Err(e) = self.reconciler.reconcile(&ids).await {
					warn!(error = %e, "subscription reconciliation failed");
				}
			}
			Err(e) => warn!(error = %e, "could not resolve tracked ids for reconciliation"),
		}
	}

	/// Query live streams for the given logins and mark them online with
	/// the platform-reported start times.
	pub async fn discover_online(&self, usernames: &[Username]) {
		let logins: Vec<String> = usernames.iter().map(|u| u.as_str().to_string()).collect();

		for chunk in logins.chunks(USER_BATCH_LIMIT) {
			let streams = match self.helix.get_live_streams(chunk).await {
				Ok(s) => s,
				Err(e) => {
					warn!(error = %e, "live stream discovery batch failed");
					continue;
				}
			};

			for stream in streams {
				if stream.stream_type != "live" {
					continue;
				}
				let Ok(username) = Username::new(&stream.user_login) else {
					continue;
				};
				let started_at_ms = rfc3339_to_epoch_ms(&stream.started_at).unwrap_or_else(liveboard_twitch::epoch_ms);
				let marked = self.registry.mark_online_all(&username, started_at_ms).await;
				if marked > 0 {
					info!(%username, started_at_ms, groups = marked, "discovered live member");
				}
			}
		}
	}

	/// Read-through schedule lookup keyed back to usernames.
	pub async fn schedules_for(
		&self,
		usernames: &[Username],
	) -> anyhow::Result<HashMap<Username, Vec<liveboard_twitch::helix::ScheduleSegment>>> {
		let resolved = self.identity.resolve(usernames).await?;
		let ids: Vec<UserId> = resolved.values().cloned().collect();

		let helix = Arc::clone(&self.helix);
		let by_id = self
			.schedules
			.get(&ids, |missing| async move {
				let mut out = HashMap::new();
				for id in missing {
					match helix.get_schedule(&id).await {
						Ok(segments) => {
							out.insert(id, segments);
						}
						Err(e) => warn!(broadcaster_id = %id, error = %e, "schedule fetch failed"),
					}
				}
				Ok(out)
			})
			.await;

		Ok(resolved
			.into_iter()
			.filter_map(|(username, id)| by_id.get(&id).map(|segments| (username, segments.clone())))
			.collect())
	}

	/// Read-through profile icon lookup; every requested username gets an
	/// entry, empty string when unknown.
	pub async fn profile_icons_for(&self, usernames: &[Username]) -> anyhow::Result<HashMap<Username, String>> {
		let resolved = self.identity.resolve(usernames).await?;
		let ids: Vec<UserId> = resolved.values().cloned().collect();

		let helix = Arc::clone(&self.helix);
		let by_id = self
			.profile_icons
			.get(&ids, |missing| async move {
				let mut out = HashMap::new();
				for chunk in missing.chunks(USER_BATCH_LIMIT) {
					let raw: Vec<String> = chunk.iter().map(|id| id.as_str().to_string()).collect();
					let users = helix.get_users_by_id(&raw).await?;
					for user in users {
						if let Ok(id) = UserId::new(user.id) {
							out.insert(id, user.profile_image_url.unwrap_or_default());
						}
					}
				}
				Ok(out)
			})
			.await;

		let mut results: HashMap<Username, String> = usernames.iter().map(|u| (u.clone(), String::new())).collect();
		for (username, id) in resolved {
			if let Some(url) = by_id.get(&id) {
				results.insert(username, url.clone());
			}
		}
		Ok(results)
	}
}
