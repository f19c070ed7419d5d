#![forbid(unsafe_code)]

use std::collections::HashSet;
use core::fmt;

use liveboard_domain::UserId;
use tracing::{info, warn};

use crate::helix::{HelixClient, HelixSubscription};
use crate::{SecretString, StreamEventKind};

/// Why a remote subscription no longer belongs to the desired set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsoleteReason {
	/// The broadcaster is not a member of any registered group.
	UntrackedBroadcaster,
	/// The subscription type is not stream.online / stream.offline.
	WrongType,
	/// The remote status is neither enabled nor pending verification.
	FailedStatus,
	/// The transport callback points at another deployment.
	CallbackMismatch,
}

impl fmt::Display for ObsoleteReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ObsoleteReason::UntrackedBroadcaster => "untracked broadcaster",
			ObsoleteReason::WrongType => "wrong subscription type",
			ObsoleteReason::FailedStatus => "failed status",
			ObsoleteReason::CallbackMismatch => "callback mismatch",
		})
	}
}

#[derive(Debug)]
pub struct ObsoleteSubscription {
	pub subscription: HelixSubscription,
	pub reasons: Vec<ObsoleteReason>,
}

impl ObsoleteSubscription {
	fn reasons_joined(&self) -> String {
		self.reasons.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeededSubscription {
	pub user_id: UserId,
	pub kind: StreamEventKind,
}

/// Diff between the remote subscription set and the desired one.
#[derive(Debug, Default)]
pub struct Plan {
	pub obsolete: Vec<ObsoleteSubscription>,
	pub needed: Vec<NeededSubscription>,
}

impl Plan {
	pub fn is_empty(&self) -> bool {
		self.obsolete.is_empty() && self.needed.is_empty()
	}
}

/// Diff `remote` against the desired set: every tracked broadcaster carries
/// one subscription per event kind, webhook transport, pointing at
/// `callback_url`.
///
/// A subscription with any defect is obsolete in full; a broadcaster covered
/// only by an obsolete subscription shows up again under `needed`, so a
/// delete-then-create apply converges in one pass.
pub fn plan(remote: &[HelixSubscription], targets: &[UserId], callback_url: &str) -> Plan {
	let tracked: HashSet<&str> = targets.iter().map(UserId::as_str).collect();

	let mut obsolete = Vec::new();
	let mut covered: HashSet<(&str, StreamEventKind)> = HashSet::new();

	for sub in remote {
		let mut reasons = Vec::new();

		let kind = StreamEventKind::parse(&sub.r#type);
		if kind.is_none() {
			reasons.push(ObsoleteReason::WrongType);
		}

		let broadcaster = sub.condition.broadcaster_user_id.as_deref();
		if !broadcaster.is_some_and(|id| tracked.contains(id)) {
			reasons.push(ObsoleteReason::UntrackedBroadcaster);
		}

		if !sub.status.is_healthy() {
			reasons.push(ObsoleteReason::FailedStatus);
		}

		if sub.transport.callback.as_deref() != Some(callback_url) {
			reasons.push(ObsoleteReason::CallbackMismatch);
		}

		if reasons.is_empty() {
			if let (Some(id), Some(kind)) = (broadcaster, kind) {
				covered.insert((id, kind));
			}
		} else {
			obsolete.push(ObsoleteSubscription {
				subscription: sub.clone(),
				reasons,
			});
		}
	}

	let mut needed = Vec::new();
	for target in targets {
		for kind in StreamEventKind::ALL {
			if !covered.contains(&(target.as_str(), kind)) {
				needed.push(NeededSubscription {
					user_id: target.clone(),
					kind,
				});
			}
		}
	}

	Plan { obsolete, needed }
}

/// Drives the remote subscription set toward the desired one.
///
/// Apply is sequential and never aborts mid-pass: a single failed call is
/// logged and the next reconciliation picks the stragglers up.
pub struct Reconciler {
	client: HelixClient,
	callback_url: String,
	secret: SecretString,
}

impl Reconciler {
	pub fn new(client: HelixClient, callback_url: String, secret: SecretString) -> Self {
		Self {
			client,
			callback_url,
			secret,
		}
	}

	/// List the full remote set and diff it against `targets`.
	pub async fn plan_remote(&self, targets: &[UserId]) -> anyhow::Result<Plan> {
		let remote = self.client.list_all_subscriptions().await?;
		let plan = plan(&remote, targets, &self.callback_url);
		info!(
			remote = remote.len(),
			obsolete = plan.obsolete.len(),
			needed = plan.needed.len(),
			"subscription plan computed"
		);
		Ok(plan)
	}

	/// Delete every obsolete subscription in the plan.
	pub async fn delete_obsolete(&self, plan: &Plan) {
		for entry in &plan.obsolete {
			let sub = &entry.subscription;
			match self.client.delete_subscription(&sub.id).await {
				Ok(()) => {
					metrics::counter!("liveboard_subscriptions_deleted_total").increment(1);
					info!(
						id = %sub.id,
						r#type = %sub.r#type,
						reasons = %entry.reasons_joined(),
						"deleted obsolete subscription"
					);
				}
				Err(e) => {
					metrics::counter!("liveboard_reconcile_errors_total").increment(1);
					warn!(id = %sub.id, error = %e, "failed to delete obsolete subscription");
				}
			}
		}
	}

	/// Create every needed subscription in the plan.
	pub async fn create_needed(&self, plan: &Plan) {
		for entry in &plan.needed {
			match self
				.client
				.create_subscription(entry.kind, &entry.user_id, &self.callback_url, &self.secret)
				.await
			{
				Ok(()) => {
					metrics::counter!("liveboard_subscriptions_created_total").increment(1);
					info!(broadcaster_id = %entry.user_id, kind = %entry.kind, "created subscription");
				}
				Err(e) => {
					metrics::counter!("liveboard_reconcile_errors_total").increment(1);
					warn!(broadcaster_id = %entry.user_id, kind = %entry.kind, error = %e, "failed to create subscription");
				}
			}
		}
	}

	/// One full delete-then-create pass against the current remote set.
	pub async fn reconcile(&self, targets: &[UserId]) -> anyhow::Result<()> {
		let plan = self.plan_remote(targets).await?;
		if plan.is_empty() {
			return Ok(());
		}
		self.delete_obsolete(&plan).await;
		self.create_needed(&plan).await;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::helix::{HelixSubscriptionCondition, HelixSubscriptionTransport, SubscriptionStatus};
	use proptest::prelude::*;

	const CALLBACK: &str = "https://host/api/webhook";

	fn uid(s: &str) -> UserId {
		UserId::new(s).unwrap()
	}

	fn sub(id: &str, r#type: &str, broadcaster: &str, status: SubscriptionStatus, callback: &str) -> HelixSubscription {
		let raw = serde_json::json!({
			"id": id,
			"status": "enabled",
			"type": r#type,
			"condition": { "broadcaster_user_id": broadcaster },
			"transport": { "method": "webhook", "callback": callback }
		});
		let mut sub: HelixSubscription = serde_json::from_value(raw).unwrap();
		sub.status = status;
		sub
	}

	fn healthy(id: &str, r#type: &str, broadcaster: &str) -> HelixSubscription {
		sub(id, r#type, broadcaster, SubscriptionStatus::Enabled, CALLBACK)
	}

	#[test]
	fn empty_remote_needs_both_kinds_per_target() {
		let plan = plan(&[], &[uid("1"), uid("2")], CALLBACK);
		assert!(plan.obsolete.is_empty());
		assert_eq!(plan.needed.len(), 4);
		assert_eq!(
			plan.needed[0],
			NeededSubscription {
				user_id: uid("1"),
				kind: StreamEventKind::Online
			}
		);
	}

	#[test]
	fn fully_covered_target_needs_nothing() {
		let remote = vec![healthy("a", "stream.online", "1"), healthy("b", "stream.offline", "1")];
		let plan = plan(&remote, &[uid("1")], CALLBACK);
		assert!(plan.is_empty());
	}

	#[test]
	fn untracked_broadcaster_is_obsolete() {
		let remote = vec![healthy("a", "stream.online", "99")];
		let plan = plan(&remote, &[uid("1")], CALLBACK);
		assert_eq!(plan.obsolete.len(), 1);
		assert_eq!(plan.obsolete[0].reasons, vec![ObsoleteReason::UntrackedBroadcaster]);
	}

	#[test]
	fn wrong_type_is_obsolete_even_for_tracked_broadcaster() {
		let remote = vec![healthy("a", "channel.follow", "1")];
		let plan = plan(&remote, &[uid("1")], CALLBACK);
		assert_eq!(plan.obsolete.len(), 1);
		assert!(plan.obsolete[0].reasons.contains(&ObsoleteReason::WrongType));
		// The broadcaster still needs both real subscriptions.
		assert_eq!(plan.needed.len(), 2);
	}

	#[test]
	fn failed_status_is_deleted_and_recreated() {
		let remote = vec![
			sub(
				"a",
				"stream.online",
				"1",
				SubscriptionStatus::WebhookCallbackVerificationFailed,
				CALLBACK,
			),
			healthy("b", "stream.offline", "1"),
		];
		let plan = plan(&remote, &[uid("1")], CALLBACK);
		assert_eq!(plan.obsolete.len(), 1);
		assert_eq!(plan.obsolete[0].reasons, vec![ObsoleteReason::FailedStatus]);
		assert_eq!(
			plan.needed,
			vec![NeededSubscription {
				user_id: uid("1"),
				kind: StreamEventKind::Online
			}]
		);
	}

	#[test]
	fn pending_verification_counts_as_covered() {
		let remote = vec![
			sub(
				"a",
				"stream.online",
				"1",
				SubscriptionStatus::WebhookCallbackVerificationPending,
				CALLBACK,
			),
			healthy("b", "stream.offline", "1"),
		];
		let plan = plan(&remote, &[uid("1")], CALLBACK);
		assert!(plan.is_empty());
	}

	#[test]
	fn foreign_callback_is_always_obsolete() {
		let remote = vec![sub(
			"a",
			"stream.online",
			"1",
			SubscriptionStatus::Enabled,
			"https://elsewhere/api/webhook",
		)];
		let plan = plan(&remote, &[uid("1")], CALLBACK);
		assert_eq!(plan.obsolete.len(), 1);
		assert_eq!(plan.obsolete[0].reasons, vec![ObsoleteReason::CallbackMismatch]);
	}

	#[test]
	fn reasons_accumulate() {
		let remote = vec![sub(
			"a",
			"channel.follow",
			"99",
			SubscriptionStatus::AuthorizationRevoked,
			"https://elsewhere/api/webhook",
		)];
		let plan = plan(&remote, &[uid("1")], CALLBACK);
		assert_eq!(
			plan.obsolete[0].reasons,
			vec![
				ObsoleteReason::WrongType,
				ObsoleteReason::UntrackedBroadcaster,
				ObsoleteReason::FailedStatus,
				ObsoleteReason::CallbackMismatch,
			]
		);
	}

	proptest! {
		/// Applying a plan (drop obsolete, add needed as healthy subs) must
		/// leave nothing to do on the next pass.
		#[test]
		fn plan_apply_converges(target_ids in proptest::collection::hash_set("[1-9][0-9]{0,4}", 0..8)) {
			let targets: Vec<UserId> = target_ids.iter().map(|s| uid(s)).collect();
			let first = plan(&[], &targets, CALLBACK);

			let mut next_id = 0usize;
			let applied: Vec<HelixSubscription> = first
				.needed
				.iter()
				.map(|n| {
					next_id += 1;
					healthy(&format!("sub-{next_id}"), n.kind.as_str(), n.user_id.as_str())
				})
				.collect();

			let second = plan(&applied, &targets, CALLBACK);
			prop_assert!(second.is_empty());
		}

		/// A healthy, tracked, matching subscription is never marked obsolete.
		#[test]
		fn matching_subscriptions_survive(id in "[0-9]{1,5}", online in proptest::bool::ANY) {
			let kind = if online { "stream.online" } else { "stream.offline" };
			let remote = vec![healthy("a", kind, &id)];
			let result = plan(&remote, &[uid(&id)], CALLBACK);
			prop_assert!(result.obsolete.is_empty());
		}
	}
}
