#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use liveboard_domain::GroupSlug;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use tungstenite::Message;
use tungstenite::handshake::derive_accept_key;
use tungstenite::protocol::Role;

use crate::server::registry::{GroupRegistry, RegistryError};

/// `GET /api/ws?group=a&group=b`: upgrade, attach to the named groups, then
/// forward queued presence frames until either side closes.
///
/// Slug validation happens after the upgrade so the client gets a text error
/// frame instead of a failed handshake.
pub async fn handle_ws(req: Request<Incoming>, registry: Arc<GroupRegistry>) -> Response<Full<Bytes>> {
	let slugs: Vec<GroupSlug> = crate::server::http::query_params(req.uri())
		.into_iter()
		.filter(|(k, _)| k == "group")
		.filter_map(|(_, v)| GroupSlug::new(v).ok())
		.collect();

	let Some(key) = req
		.headers()
		.get("Sec-WebSocket-Key")
		.and_then(|v| v.to_str().ok())
		.map(str::to_owned)
	else {
		let mut resp = Response::new(Full::new(Bytes::from_static(b"expected websocket upgrade")));
		*resp.status_mut() = StatusCode::BAD_REQUEST;
		return resp;
	};
	let accept_key = derive_accept_key(key.as_bytes());

	tokio::spawn(async move {
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => {
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
				drive_connection(ws, registry, slugs).await;
			}
			Err(e) => warn!(error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
	let headers = resp.headers_mut();
	headers.insert("connection", hyper::header::HeaderValue::from_static("Upgrade"));
	headers.insert("upgrade", hyper::header::HeaderValue::from_static("websocket"));
	if let Ok(v) = accept_key.parse() {
		headers.insert("sec-websocket-accept", v);
	}
	resp
}

async fn drive_connection(ws: WebSocketStream<TokioIo<Upgraded>>, registry: Arc<GroupRegistry>, slugs: Vec<GroupSlug>) {
	let (mut sink, mut stream) = ws.split();

	let attachment = match registry.attach(&slugs).await {
		Ok(a) => a,
		Err(e) => {
			let text = match e {
				RegistryError::NoGroups => "Group Slug Missing".to_string(),
				RegistryError::UnknownGroup(slug) => format!("Invalid Group Slug: {slug}"),
			};
			debug!(reason = %text, "websocket attach rejected");
			let _ = sink.send(Message::text(text)).await;
			let _ = sink.close().await;
			return;
		}
	};

	let conn_id = attachment.conn_id;
	let mut events = attachment.events;

	loop {
		tokio::select! {
			ev = events.recv() => match ev {
				Some(ev) => {
					let Ok(text) = serde_json::to_string(&ev) else { continue };
					if sink.send(Message::text(text)).await.is_err() {
						break;
					}
				}
				None => break,
			},
			msg = stream.next() => match msg {
				Some(Ok(Message::Close(_))) | None => break,
				Some(Ok(Message::Ping(payload))) => {
					let _ = sink.send(Message::Pong(payload)).await;
				}
				// There are no client-to-server frames.
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					debug!(conn_id, error = %e, "websocket read error");
					break;
				}
			},
		}
	}

	registry.detach(conn_id).await;
}
