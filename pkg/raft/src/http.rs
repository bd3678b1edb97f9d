//! HTTP transport: inbound server for peer RPCs and client proposals, and
//! the outbound side used to actually deliver a `Machine`'s outbox. Modeled
//! on the teacher crate's own `start_http_server`/`handle_request_guard`
//! pair (hyper + a ctrlc-driven graceful shutdown), updated from hyper 0.12
//! to hyper 1.x/async-await; outbound calls use `reqwest`, exactly as the
//! teacher's own upload client did.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::harness::{Harness, PeerRequest, ProposeOutcome};
use crate::machine::Role;
use crate::protos::{Action, LogEntry, LogIndex, NodeId, OutboundBody, Term};

type BoxBody = Full<Bytes>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum RequestWire {
	PreVote { term: Term, last_index: LogIndex, last_term: Term },
	Vote { term: Term, last_index: LogIndex, last_term: Term },
	AppendEntries { term: Term, prev_index: LogIndex, prev_term: Term, entries: Vec<LogEntry>, leader_commit: LogIndex },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum ReplyWire {
	PreVoteReply { term: Term, reject: bool },
	VoteReply { term: Term, reject: bool },
	AppendEntriesReply { term: Term, reject: bool, log_index: LogIndex },
}

impl From<OutboundBody> for RequestWire {
	fn from(body: OutboundBody) -> RequestWire {
		match body {
			OutboundBody::PreVote { term, last_index, last_term } => RequestWire::PreVote { term, last_index, last_term },
			OutboundBody::Vote { term, last_index, last_term } => RequestWire::Vote { term, last_index, last_term },
			OutboundBody::AppendEntries { term, prev_index, prev_term, entries, leader_commit } => {
				RequestWire::AppendEntries { term, prev_index, prev_term, entries, leader_commit }
			}
			other => unreachable!("{:?} is a reply body, not a request body", other),
		}
	}
}

impl From<OutboundBody> for ReplyWire {
	fn from(body: OutboundBody) -> ReplyWire {
		match body {
			OutboundBody::PreVoteReply { term, reject } => ReplyWire::PreVoteReply { term, reject },
			OutboundBody::VoteReply { term, reject } => ReplyWire::VoteReply { term, reject },
			OutboundBody::AppendEntriesReply { term, reject, log_index } => ReplyWire::AppendEntriesReply { term, reject, log_index },
			other => unreachable!("{:?} is a request body, not a reply body", other),
		}
	}
}

fn request_path(body: &OutboundBody) -> &'static str {
	match body {
		OutboundBody::PreVote { .. } => "pre-vote",
		OutboundBody::Vote { .. } => "request-vote",
		OutboundBody::AppendEntries { .. } => "append-entries",
		other => unreachable!("{:?} is a reply body, has no request path", other),
	}
}

/// Sends one outbound raft request to `addr` and, if a response arrives in
/// time, returns the `Inbound` reply the harness should feed back into the
/// Machine. Errors (timeout, connection refused, peer down) are swallowed —
/// a missing reply just means that peer's vote/ack doesn't count this round,
/// which Raft already tolerates.
pub async fn send_and_await_reply(
	client: &reqwest::Client,
	addr: &str,
	own_id: &NodeId,
	peer_id: &NodeId,
	body: &OutboundBody,
) -> Option<crate::protos::Inbound> {
	let path = request_path(body);
	let wire: RequestWire = body.clone().into();
	let url = format!("http://{addr}/{path}?from={own_id}");
	let resp = match client.post(&url).json(&wire).send().await {
		Ok(r) => r,
		Err(e) => {
			warn!(%addr, error = %e, "raft rpc failed");
			return None;
		}
	};
	let reply: ReplyWire = match resp.json().await {
		Ok(r) => r,
		Err(e) => {
			warn!(%addr, error = %e, "decoding raft rpc reply failed");
			return None;
		}
	};
	Some(match reply {
		ReplyWire::PreVoteReply { term, reject } => crate::protos::Inbound::PreVoteReply { from: peer_id.clone(), term, reject },
		ReplyWire::VoteReply { term, reject } => crate::protos::Inbound::VoteReply { from: peer_id.clone(), term, reject },
		ReplyWire::AppendEntriesReply { term, reject, log_index } => {
			crate::protos::Inbound::AppendEntriesReply { from: peer_id.clone(), term, reject, log_index }
		}
	})
}

#[derive(Debug, Serialize, Deserialize)]
struct ProposeRequestWire {
	action: Action,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result")]
enum ProposeResponseWire {
	Committed { index: LogIndex },
	NotLeader { leader: Option<NodeId> },
}

#[derive(Debug, Serialize)]
struct StatusWire {
	id: NodeId,
	term: Term,
	role: &'static str,
	commit_index: LogIndex,
	last_index: LogIndex,
	leader: Option<NodeId>,
}

fn role_name(role: Role) -> &'static str {
	match role {
		Role::Follower => "follower",
		Role::PreCandidate => "pre-candidate",
		Role::Candidate => "candidate",
		Role::Leader => "leader",
	}
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
	let bytes = serde_json::to_vec(value).unwrap_or_default();
	Response::builder().status(status).header("content-type", "application/json").body(Full::new(Bytes::from(bytes))).unwrap()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<BoxBody> {
	json_response(status, &serde_json::json!({"error": message.into()}))
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
	query.split('&').find_map(|pair| {
		let (k, v) = pair.split_once('=')?;
		(k == key).then_some(v)
	})
}

async fn route(harness: Arc<Harness>, req: Request<Incoming>) -> Response<BoxBody> {
	let path = req.uri().path().to_string();
	let query = req.uri().query().unwrap_or("").to_string();
	if req.method() != Method::POST && path != "/status" {
		return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
	}

	match path.as_str() {
		"/status" => {
			let snapshot = harness.status().await;
			json_response(
				StatusCode::OK,
				&StatusWire {
					id: snapshot.id,
					term: snapshot.term,
					role: role_name(snapshot.role),
					commit_index: snapshot.commit_index,
					last_index: snapshot.last_index,
					leader: snapshot.leader,
				},
			)
		}
		"/pre-vote" | "/request-vote" | "/append-entries" => {
			let Some(from) = query_param(&query, "from").map(|s| s.to_string()) else {
				return error_response(StatusCode::BAD_REQUEST, "missing ?from= sender id");
			};
			let body = match req.into_body().collect().await {
				Ok(collected) => collected.to_bytes(),
				Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("reading body: {e}")),
			};
			let wire: RequestWire = match serde_json::from_slice(&body) {
				Ok(w) => w,
				Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("decoding request: {e}")),
			};
			let peer_request = match wire {
				RequestWire::PreVote { term, last_index, last_term } => PeerRequest::PreVote { term, last_index, last_term },
				RequestWire::Vote { term, last_index, last_term } => PeerRequest::Vote { term, last_index, last_term },
				RequestWire::AppendEntries { term, prev_index, prev_term, entries, leader_commit } => {
					PeerRequest::AppendEntries { term, prev_index, prev_term, entries, leader_commit }
				}
			};
			match harness.handle_inbound(from, peer_request).await {
				Ok(reply_body) => {
					let wire: ReplyWire = reply_body.into();
					json_response(StatusCode::OK, &wire)
				}
				Err(e) => {
					error!(error = %e, "failed to handle raft rpc");
					error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
				}
			}
		}
		"/propose" => {
			let body = match req.into_body().collect().await {
				Ok(collected) => collected.to_bytes(),
				Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("reading body: {e}")),
			};
			let wire: ProposeRequestWire = match serde_json::from_slice(&body) {
				Ok(w) => w,
				Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("decoding request: {e}")),
			};
			match harness.propose(wire.action).await {
				Ok(ProposeOutcome::Committed { index }) => json_response(StatusCode::OK, &ProposeResponseWire::Committed { index }),
				Ok(ProposeOutcome::NotLeader { leader }) => json_response(StatusCode::OK, &ProposeResponseWire::NotLeader { leader }),
				Err(e) => {
					error!(error = %e, "failed to propose entry");
					error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
				}
			}
		}
		_ => error_response(StatusCode::NOT_FOUND, "no such route"),
	}
}

/// Binds `addr` and serves requests until `shutdown` resolves, mirroring the
/// teacher's `ctrlc`-driven graceful shutdown but expressed as a plain
/// future so the binary can also tie it to a signal handler.
pub async fn serve(harness: Arc<Harness>, addr: SocketAddr, shutdown: impl std::future::Future<Output = ()>) -> crate::errors::Result<()> {
	use crate::errors::ResultExt;

	let listener = TcpListener::bind(addr).await.chain_err(|| format!("binding {addr}"))?;
	info!(%addr, "listening for raft rpcs and client proposals");

	tokio::pin!(shutdown);
	loop {
		tokio::select! {
			_ = &mut shutdown => {
				info!("http server shutting down");
				return Ok(());
			}
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(v) => v,
					Err(e) => { warn!(error = %e, "accept failed"); continue; }
				};
				let harness = harness.clone();
				tokio::spawn(async move {
					let io = TokioIo::new(stream);
					let service = hyper::service::service_fn(move |req| {
						let harness = harness.clone();
						async move { Ok::<_, Infallible>(route(harness, req).await) }
					});
					if let Err(e) = ConnBuilder::new(hyper_util::rt::TokioExecutor::new()).serve_connection(io, service).await {
						warn!(%peer, error = %e, "connection error");
					}
				});
			}
		}
	}
}
