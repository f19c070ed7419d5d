#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use url::Url;

use liveboard_domain::UserId;

use crate::{SecretString, StreamEventKind};

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const USERS_PATH: &str = "/helix/users";
const STREAMS_PATH: &str = "/helix/streams";
const SCHEDULE_PATH: &str = "/helix/schedule";

/// Helix caps batched user/stream lookups at 100, but the webhook transport
/// API keys everything on 50-wide batches in practice; callers chunk to this.
pub const USER_BATCH_LIMIT: usize = 50;

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// Thin Helix REST client scoped to the endpoints the presence engine needs.
#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: SecretString,
}

impl HelixClient {
	pub fn new(base_url: &str, client_id: String, bearer_token: SecretString, request_timeout: Duration) -> anyhow::Result<Self> {
		let base_url = Url::parse(base_url).context("parse helix base url")?;
		let http = reqwest::Client::builder()
			.user_agent("liveboard/0.x (helix)")
			.timeout(request_timeout)
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id,
			bearer_token,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token.expose()))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	async fn get_users(&self, param: &str, values: &[String]) -> anyhow::Result<Vec<HelixUser>> {
		if values.is_empty() {
			return Ok(Vec::new());
		}
		if values.len() > USER_BATCH_LIMIT {
			anyhow::bail!("helix GET /helix/users called with {} values (max {USER_BATCH_LIMIT})", values.len());
		}

		let mut path = String::from(USERS_PATH);
		for (i, v) in values.iter().enumerate() {
			path.push(if i == 0 { '?' } else { '&' });
			path.push_str(param);
			path.push('=');
			path.push_str(&urlencoding::encode(v));
		}
		let url = self.url(&path)?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/users")
			.await
			.context("helix GET /helix/users send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users failed: status={status} body={body}");
		}

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users parse json")?;
		Ok(parsed.data)
	}

	/// Batch lookup by login, at most [`USER_BATCH_LIMIT`] per call.
	///
	/// Unknown logins are simply absent from the response.
	pub async fn get_users_by_login(&self, logins: &[String]) -> anyhow::Result<Vec<HelixUser>> {
		self.get_users("login", logins).await
	}

	/// Batch lookup by id, at most [`USER_BATCH_LIMIT`] per call.
	pub async fn get_users_by_id(&self, ids: &[String]) -> anyhow::Result<Vec<HelixUser>> {
		self.get_users("id", ids).await
	}

	/// Live streams for the given logins, pagination fully drained.
	pub async fn get_live_streams(&self, logins: &[String]) -> anyhow::Result<Vec<HelixStream>> {
		if logins.is_empty() {
			return Ok(Vec::new());
		}
		if logins.len() > USER_BATCH_LIMIT {
			anyhow::bail!("helix GET /helix/streams called with {} logins (max {USER_BATCH_LIMIT})", logins.len());
		}

		let mut out: Vec<HelixStream> = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let mut path = String::from(STREAMS_PATH);
			for (i, login) in logins.iter().enumerate() {
				path.push(if i == 0 { '?' } else { '&' });
				path.push_str("user_login=");
				path.push_str(&urlencoding::encode(login));
			}
			if let Some(cursor) = after.as_deref() {
				path.push_str("&after=");
				path.push_str(&urlencoding::encode(cursor));
			}
			let url = self.url(&path)?;

			let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/streams")
				.await
				.context("helix GET /helix/streams send")?;

			let status = resp.status();
			let body = resp.text().await.context("helix GET /helix/streams read body")?;

			if !status.is_success() {
				anyhow::bail!("helix GET /helix/streams failed: status={status} body={body}");
			}

			let page: HelixStreamsResponse = serde_json::from_str(&body).context("helix streams parse json")?;
			out.extend(page.data.into_iter());

			let next = page.pagination.and_then(|p| p.cursor);
			if next.is_none() {
				break;
			}
			after = next;
		}

		Ok(out)
	}

	/// Broadcast schedule for one broadcaster; a 404 means no schedule.
	pub async fn get_schedule(&self, broadcaster_id: &UserId) -> anyhow::Result<Vec<ScheduleSegment>> {
		let url = self.url(&format!(
			"{SCHEDULE_PATH}?broadcaster_id={}",
			urlencoding::encode(broadcaster_id.as_str())
		))?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/schedule")
			.await
			.context("helix GET /helix/schedule send")?;

		let status = resp.status();
		if status == StatusCode::NOT_FOUND {
			return Ok(Vec::new());
		}

		let body = resp.text().await.context("helix GET /helix/schedule read body")?;
		if !status.is_success() {
			anyhow::bail!("helix GET /helix/schedule failed: status={status} body={body}");
		}

		let parsed: HelixScheduleResponse = serde_json::from_str(&body).context("helix schedule parse json")?;
		Ok(parsed.data.segments.unwrap_or_default())
	}

	/// One page of EventSub subscriptions.
	pub async fn list_subscriptions(&self, after: Option<&str>) -> anyhow::Result<HelixListSubscriptionsResponse> {
		let mut path = String::from(EVENTSUB_SUBSCRIPTIONS_PATH);
		if let Some(after) = after {
			path.push_str("?after=");
			path.push_str(&urlencoding::encode(after));
		}
		let url = self.url(&path)?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/eventsub/subscriptions")
			.await
			.context("helix GET /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.context("helix GET /helix/eventsub/subscriptions read body")?;

		if !status.is_success() {
			anyhow::bail!("helix list subscriptions failed: status={status} body={body}");
		}

		serde_json::from_str(&body).context("helix list subscriptions parse json")
	}

	/// All EventSub subscriptions, pagination fully drained.
	///
	/// The reconciler relies on the full set; a partial page would produce
	/// spurious "needed" entries and duplicate remote registrations.
	pub async fn list_all_subscriptions(&self) -> anyhow::Result<Vec<HelixSubscription>> {
		let mut out: Vec<HelixSubscription> = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let page = self.list_subscriptions(after.as_deref()).await?;
			out.extend(page.data.into_iter());

			let next = page.pagination.and_then(|p| p.cursor);
			if next.is_none() {
				break;
			}
			after = next;
		}

		Ok(out)
	}

	/// Register a webhook-transport subscription for one broadcaster.
	pub async fn create_subscription(
		&self,
		kind: StreamEventKind,
		broadcaster_id: &UserId,
		callback_url: &str,
		secret: &SecretString,
	) -> anyhow::Result<()> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;

		let req = HelixCreateSubscriptionRequest {
			r#type: kind.as_str(),
			version: "1",
			condition: HelixBroadcasterCondition {
				broadcaster_user_id: broadcaster_id.as_str(),
			},
			transport: HelixWebhookTransport {
				method: "webhook",
				callback: callback_url,
				secret: secret.expose(),
			},
		};

		let resp = send_with_retry(
			self.authed(self.http.post(url)).json(&req),
			"POST /helix/eventsub/subscriptions",
		)
		.await
		.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={kind})"))?;

		let status = resp.status();
		if status.is_success() {
			return Ok(());
		}

		let body = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={kind})"))?;

		if status == StatusCode::CONFLICT {
			anyhow::bail!("helix create subscription conflict (type={kind}): body={body}");
		}
		anyhow::bail!("helix create subscription failed (type={kind}): status={status} body={body}");
	}

	pub async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{EVENTSUB_SUBSCRIPTIONS_PATH}?id={}",
			urlencoding::encode(subscription_id)
		))?;

		let resp = send_with_retry(self.authed(self.http.delete(url)), "DELETE /helix/eventsub/subscriptions")
			.await
			.context("helix DELETE /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		if status == StatusCode::NO_CONTENT || status.is_success() {
			return Ok(());
		}

		let body = resp
			.text()
			.await
			.context("helix DELETE /helix/eventsub/subscriptions read body")?;
		anyhow::bail!("helix delete subscription failed: status={status} body={body}");
	}
}

/// User lookup seam so the identity resolver can be exercised without a
/// live Helix endpoint.
#[async_trait]
pub trait UserDirectory: Send + Sync {
	async fn users_by_login(&self, logins: &[String]) -> anyhow::Result<Vec<HelixUser>>;
}

#[async_trait]
impl UserDirectory for HelixClient {
	async fn users_by_login(&self, logins: &[String]) -> anyhow::Result<Vec<HelixUser>> {
		self.get_users_by_login(logins).await
	}
}

#[derive(Debug, Deserialize)]
struct HelixUsersResponse {
	data: Vec<HelixUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
	pub id: String,
	pub login: String,

	#[serde(default)]
	pub display_name: Option<String>,

	#[serde(default)]
	pub profile_image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixStreamsResponse {
	data: Vec<HelixStream>,
	#[serde(default)]
	pagination: Option<HelixPagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixStream {
	pub user_login: String,

	#[serde(rename = "type")]
	#[serde(default)]
	pub stream_type: String,

	/// RFC3339 stream start.
	pub started_at: String,
}

#[derive(Debug, Deserialize)]
struct HelixScheduleResponse {
	data: HelixScheduleData,
}

#[derive(Debug, Deserialize)]
struct HelixScheduleData {
	#[serde(default)]
	segments: Option<Vec<ScheduleSegment>>,
}

/// One planned broadcast, as served to clients and cached on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSegment {
	pub id: String,
	pub start_time: String,
	pub end_time: String,
	pub title: String,
	#[serde(default)]
	pub canceled_until: Option<String>,
	#[serde(default)]
	pub category: Option<ScheduleCategory>,
	#[serde(default)]
	pub is_recurring: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleCategory {
	pub id: String,
	pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct HelixListSubscriptionsResponse {
	pub data: Vec<HelixSubscription>,
	#[serde(default)]
	pub pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
pub struct HelixPagination {
	#[serde(default)]
	pub cursor: Option<String>,
}

/// Remote EventSub subscription as observed via list.
///
/// The engine never owns these records; it only diffs them against the
/// desired set.
#[derive(Debug, Clone, Deserialize)]
pub struct HelixSubscription {
	pub id: String,
	pub status: SubscriptionStatus,

	#[serde(rename = "type")]
	pub r#type: String,

	#[serde(default)]
	pub condition: HelixSubscriptionCondition,

	#[serde(default)]
	pub transport: HelixSubscriptionTransport,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelixSubscriptionCondition {
	#[serde(default)]
	pub broadcaster_user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelixSubscriptionTransport {
	#[serde(default)]
	pub method: Option<String>,
	#[serde(default)]
	pub callback: Option<String>,
}

/// Remote subscription status, decoded from the wire strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
	Enabled,
	WebhookCallbackVerificationPending,
	WebhookCallbackVerificationFailed,
	NotificationFailuresExceeded,
	AuthorizationRevoked,
	UserRemoved,
	VersionRemoved,

	#[serde(other)]
	Unknown,
}

impl SubscriptionStatus {
	/// Enabled and pending-verification subscriptions are the only ones
	/// worth keeping; everything else is dead weight on the remote side.
	pub fn is_healthy(self) -> bool {
		matches!(
			self,
			SubscriptionStatus::Enabled | SubscriptionStatus::WebhookCallbackVerificationPending
		)
	}
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'static str,
	version: &'static str,
	condition: HelixBroadcasterCondition<'a>,
	transport: HelixWebhookTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixBroadcasterCondition<'a> {
	broadcaster_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixWebhookTransport<'a> {
	method: &'static str,
	callback: &'a str,
	secret: &'a str,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn subscription_status_decodes_wire_strings() {
		let s: SubscriptionStatus = serde_json::from_str("\"enabled\"").unwrap();
		assert_eq!(s, SubscriptionStatus::Enabled);
		assert!(s.is_healthy());

		let s: SubscriptionStatus = serde_json::from_str("\"webhook_callback_verification_pending\"").unwrap();
		assert!(s.is_healthy());

		let s: SubscriptionStatus = serde_json::from_str("\"authorization_revoked\"").unwrap();
		assert!(!s.is_healthy());

		let s: SubscriptionStatus = serde_json::from_str("\"some_future_status\"").unwrap();
		assert_eq!(s, SubscriptionStatus::Unknown);
		assert!(!s.is_healthy());
	}

	#[test]
	fn subscription_decodes_list_payload() {
		let raw = r#"{
			"id": "sub-1",
			"status": "enabled",
			"type": "stream.online",
			"version": "1",
			"condition": { "broadcaster_user_id": "123" },
			"transport": { "method": "webhook", "callback": "https://host/api/webhook" }
		}"#;
		let sub: HelixSubscription = serde_json::from_str(raw).unwrap();
		assert_eq!(sub.id, "sub-1");
		assert_eq!(sub.condition.broadcaster_user_id.as_deref(), Some("123"));
		assert_eq!(sub.transport.callback.as_deref(), Some("https://host/api/webhook"));
	}

	#[test]
	fn schedule_segments_tolerate_nulls() {
		let raw = r#"{
			"data": {
				"segments": [
					{
						"id": "seg-1",
						"start_time": "2024-01-01T18:00:00Z",
						"end_time": "2024-01-01T20:00:00Z",
						"title": "weekly show",
						"canceled_until": null,
						"category": null,
						"is_recurring": true
					}
				],
				"broadcaster_id": "123",
				"vacation": null
			}
		}"#;
		let parsed: HelixScheduleResponse = serde_json::from_str(raw).unwrap();
		let segments = parsed.data.segments.unwrap();
		assert_eq!(segments.len(), 1);
		assert_eq!(segments[0].title, "weekly show");
		assert!(segments[0].category.is_none());
	}
}
