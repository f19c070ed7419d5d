#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use liveboard_domain::{GroupSlug, Username};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::registry::RegistryError;
use crate::server::state::AppState;
use crate::server::webhook::{WebhookContext, handle_webhook};
use crate::server::ws;

/// Accept loop; each connection gets its own task. Upgrades stay enabled
/// for the websocket route.
pub async fn run_http_server(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = Arc::clone(&state);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
				warn!(error = %err, "http connection error");
			}
		});
	}
}

pub(crate) fn query_params(uri: &Uri) -> Vec<(String, String)> {
	url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
		.into_owned()
		.collect()
}

fn param<'p>(params: &'p [(String, String)], name: &str) -> Option<&'p str> {
	params
		.iter()
		.find(|(k, v)| k == name && !v.trim().is_empty())
		.map(|(_, v)| v.as_str())
}

fn usernames_param(params: &[(String, String)]) -> Vec<Username> {
	params
		.iter()
		.filter(|(k, _)| k == "usernames")
		.filter_map(|(_, v)| Username::new(v).ok())
		.collect()
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from(body.into())));
	*resp.status_mut() = status;
	resp
}

fn json<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
	match serde_json::to_vec(value) {
		Ok(body) => {
			let mut resp = Response::new(Full::new(Bytes::from(body)));
			resp.headers_mut()
				.insert("content-type", hyper::header::HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			warn!(error = %e, "response serialization failed");
			empty(StatusCode::INTERNAL_SERVER_ERROR)
		}
	}
}

fn registry_error(err: RegistryError) -> Response<Full<Bytes>> {
	match err {
		RegistryError::UnknownGroup(slug) => text(StatusCode::BAD_REQUEST, format!("Invalid Group Slug: {slug}")),
		RegistryError::NoGroups => text(StatusCode::BAD_REQUEST, "Missing group"),
	}
}

/// Membership routes are open only when a password is configured.
fn check_password(state: &AppState, params: &[(String, String)]) -> Option<Response<Full<Bytes>>> {
	let Some(expected) = &state.modify_password else {
		return Some(text(StatusCode::FORBIDDEN, "Modification not enabled"));
	};
	if param(params, "password") != Some(expected.expose()) {
		return Some(text(StatusCode::FORBIDDEN, "Invalid password"));
	}
	None
}

async fn handle_request(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let resp = match (method, path.as_str()) {
		(Method::GET, "/api/ws") => ws::handle_ws(req, Arc::clone(&state.registry)).await,
		(Method::POST, "/api/webhook") => {
			let (parts, body) = req.into_parts();
			let body = match body.collect().await {
				Ok(collected) => collected.to_bytes(),
				Err(e) => {
					warn!(error = %e, "webhook body read failed");
					return Ok(empty(StatusCode::BAD_REQUEST));
				}
			};
			let ctx = WebhookContext {
				registry: Arc::clone(&state.registry),
				identity: Arc::clone(&state.identity),
				secret: state.webhook_secret.clone(),
			};
			handle_webhook(&parts.headers, &body, &ctx).await
		}
		(Method::GET, "/api/groups") => json(&state.registry.group_snapshots().await),
		(Method::GET, "/api/schedule") => {
			let usernames = usernames_param(&query_params(req.uri()));
			match state.schedules_for(&usernames).await {
				Ok(map) => json(&map),
				Err(e) => {
					warn!(error = %e, "schedule lookup failed");
					empty(StatusCode::INTERNAL_SERVER_ERROR)
				}
			}
		}
		(Method::GET, "/api/profile-icons") => {
			let usernames = usernames_param(&query_params(req.uri()));
			match state.profile_icons_for(&usernames).await {
				Ok(map) => json(&map),
				Err(e) => {
					warn!(error = %e, "profile icon lookup failed");
					empty(StatusCode::INTERNAL_SERVER_ERROR)
				}
			}
		}
		(Method::PUT, "/api/group/member") => {
			let params = query_params(req.uri());
			if let Some(denied) = check_password(&state, &params) {
				return Ok(denied);
			}
			add_group_member(&state, &params).await
		}
		(Method::PUT, "/api/group/members") => {
			let params = query_params(req.uri());
			if let Some(denied) = check_password(&state, &params) {
				return Ok(denied);
			}
			set_group_members(&state, &params).await
		}
		(Method::DELETE, "/api/group/member") => {
			let params = query_params(req.uri());
			if let Some(denied) = check_password(&state, &params) {
				return Ok(denied);
			}
			remove_group_member(&state, &params).await
		}
		_ => empty(StatusCode::NOT_FOUND),
	};

	Ok(resp)
}

async fn add_group_member(state: &AppState, params: &[(String, String)]) -> Response<Full<Bytes>> {
	let (Some(group), Some(username)) = (param(params, "group"), param(params, "username")) else {
		return text(StatusCode::BAD_REQUEST, "Missing group and username");
	};
	let (Ok(slug), Ok(username)) = (GroupSlug::new(group), Username::new(username)) else {
		return text(StatusCode::BAD_REQUEST, "Missing group and username");
	};
	let index = param(params, "index").and_then(|v| v.parse::<usize>().ok());

	match state.registry.add_member(&slug, &username, index).await {
		Ok(true) => {
			// Presence of the new member is unknown until discovered.
			state.discover_online(std::slice::from_ref(&username)).await;
			state.reconcile_tracked().await;
			empty(StatusCode::OK)
		}
		Ok(false) => empty(StatusCode::OK),
		Err(e) => registry_error(e),
	}
}

async fn set_group_members(state: &AppState, params: &[(String, String)]) -> Response<Full<Bytes>> {
	let Some(group) = param(params, "group") else {
		return text(StatusCode::BAD_REQUEST, "Missing group");
	};
	let Ok(slug) = GroupSlug::new(group) else {
		return text(StatusCode::BAD_REQUEST, "Missing group");
	};

	let members: Vec<Username> = params
		.iter()
		.filter(|(k, _)| k == "members")
		.filter_map(|(_, v)| Username::new(v).ok())
		.collect();
	if members.is_empty() {
		return text(StatusCode::BAD_REQUEST, "Missing members");
	}

	match state.registry.set_members(&slug, members.clone()).await {
		Ok(()) => {
			state.discover_online(&members).await;
			state.reconcile_tracked().await;
			empty(StatusCode::OK)
		}
		Err(e) => registry_error(e),
	}
}

async fn remove_group_member(state: &AppState, params: &[(String, String)]) -> Response<Full<Bytes>> {
	let (Some(group), Some(username)) = (param(params, "group"), param(params, "username")) else {
		return text(StatusCode::BAD_REQUEST, "Missing group and username");
	};
	let (Ok(slug), Ok(username)) = (GroupSlug::new(group), Username::new(username)) else {
		return text(StatusCode::BAD_REQUEST, "Missing group and username");
	};

	match state.registry.remove_member(&slug, &username).await {
		Ok(true) => {
			state.reconcile_tracked().await;
			empty(StatusCode::OK)
		}
		Ok(false) => empty(StatusCode::OK),
		Err(e) => registry_error(e),
	}
}
