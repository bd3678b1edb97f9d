//! The async harness driving the pure `Machine`: timers, durable storage,
//! peer RPC dispatch, reducer application and the wait-for-commit registry
//! that lets a client call block until its proposal is actually committed.
//!
//! State mutation (stepping the Machine, writing to Storage, folding newly
//! committed entries into the Registry) all happens under a single
//! `tokio::sync::Mutex`, matching the "single cooperative critical section"
//! model. Storage's fsyncs run inside that lock via `spawn_blocking` rather
//! than being staged off to the side — simpler to reason about, and since
//! Raft already serializes commits one at a time the extra parallelism a
//! fully decoupled I/O path would buy is marginal. Only the peer HTTP calls
//! (which don't need to block anyone) run after the lock is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{Result, ResultExt};
use crate::machine::{Machine, Role};
use crate::protos::{Action, Inbound, LogIndex, NodeId, Outbound, OutboundBody, Term};
use crate::reducer::Registry;
use crate::storage::Storage;

struct Inner {
	machine: Machine,
	storage: Storage,
	registry: Registry,
	applied: LogIndex,
}

pub enum ProposeOutcome {
	Committed { index: LogIndex },
	NotLeader { leader: Option<NodeId> },
}

pub struct StatusSnapshot {
	pub id: NodeId,
	pub term: Term,
	pub role: Role,
	pub commit_index: LogIndex,
	pub last_index: LogIndex,
	pub leader: Option<NodeId>,
}

pub struct Harness {
	id: NodeId,
	peer_addrs: BTreeMap<NodeId, String>,
	client: reqwest::Client,
	webhooks: Vec<String>,
	tick_millis: u64,
	inner: Mutex<Inner>,
	waiters: std::sync::Mutex<BTreeMap<LogIndex, Vec<oneshot::Sender<()>>>>,
	/// Weak self-reference so spawned tasks can get an `Arc<Harness>` to
	/// recurse into `apply_and_dispatch` without every caller having to
	/// thread one through. Upgrading fails harmlessly once the harness has
	/// been dropped.
	self_ref: Weak<Harness>,
}

impl Harness {
	pub fn new(config: &Config) -> Result<Arc<Harness>> {
		let storage = Storage::open(&config.storage)?;
		let machine = Machine::new(
			config.node.identifier.clone(),
			config.peer_ids(),
			storage.current_term(),
			storage.voted_for().cloned(),
			storage.entries().to_vec(),
			0,
		);
		let inner = Inner { machine, storage, registry: Registry::new(), applied: 0 };
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(5))
			.build()
			.chain_err(|| "building http client")?;

		Ok(Arc::new_cyclic(|self_ref| Harness {
			id: config.node.identifier.clone(),
			peer_addrs: config.peers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
			client,
			webhooks: config.webhooks.clone(),
			tick_millis: config.tick_millis,
			inner: Mutex::new(inner),
			waiters: std::sync::Mutex::new(BTreeMap::new()),
			self_ref: self_ref.clone(),
		}))
	}

	pub fn id(&self) -> &NodeId {
		&self.id
	}

	/// Drives the election/heartbeat clock until `shutdown` resolves.
	pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
		let tick_millis = self.tick_millis;
		let ticker = async move {
			let mut interval = tokio::time::interval(Duration::from_millis(tick_millis));
			loop {
				interval.tick().await;
				self.apply_and_dispatch(Inbound::Tick).await;
			}
		};
		tokio::select! {
			_ = ticker => {}
			_ = shutdown => info!("harness shutting down"),
		}
	}

	/// Applies one inbound message, persisting whatever the Machine asked
	/// for and folding any newly committed entries into the Registry, all
	/// under the single state lock. Returns the effects so callers (HTTP
	/// handlers) can extract the message addressed back at the caller.
	async fn apply_step(&self, msg: Inbound) -> Result<crate::machine::Effects> {
		let mut inner = self.inner.lock().await;
		let was_leader = inner.machine.role() == Role::Leader;
		let effects = inner.machine.step(msg);

		for op in &effects.log_ops {
			match op {
				crate::protos::LogOp::Append(entries) => inner.storage.append(entries)?,
				crate::protos::LogOp::Rollback(index) => inner.storage.rollback(*index)?,
			}
		}
		if effects.persist_meta {
			let term = inner.machine.current_term();
			// Storage's voted_for mirrors whatever the Machine just decided;
			// re-derive it isn't exposed directly, so re-read from storage's
			// own bookkeeping isn't possible here — the Machine is the
			// source of truth, so we fetch it via a dedicated accessor.
			inner.storage.set_meta(term, inner.machine.voted_for_snapshot())?;
		}

		let mut newly_committed = Vec::new();
		if effects.commit_advanced {
			let commit_index = inner.machine.commit_index();
			while inner.applied < commit_index {
				inner.applied += 1;
				let entry = inner.storage.entries()[(inner.applied - 1) as usize].data.clone();
				inner.registry.dispatch(&entry);
				newly_committed.push(inner.applied);
			}
		}
		let commit_index = inner.machine.commit_index();
		let became_non_leader = was_leader && inner.machine.role() != Role::Leader;
		drop(inner);

		if became_non_leader {
			self.cancel_all_waiters();
		}
		if !newly_committed.is_empty() {
			self.wake_waiters_up_to(commit_index);
			self.notify_webhooks(commit_index);
		}

		Ok(effects)
	}

	async fn apply_and_dispatch(&self, msg: Inbound) {
		match self.apply_step(msg).await {
			Ok(effects) => self.dispatch_outbox(effects.outbox),
			Err(e) => warn!(error = %e, "failed to apply message"),
		}
	}

	/// Fires off one HTTP call per outbound message without waiting for
	/// them; each response is fed back into the Machine as its matching
	/// reply `Inbound` once it arrives.
	fn dispatch_outbox(&self, outbox: Vec<Outbound>) {
		for msg in outbox {
			let Some(addr) = self.peer_addrs.get(&msg.to).cloned() else {
				debug!(to = %msg.to, "dropping message to unknown peer");
				continue;
			};
			let client = self.client.clone();
			let own_id = self.id.clone();
			let peer_id = msg.to.clone();
			let Some(harness) = self.self_ref.upgrade() else { continue };
			tokio::spawn(async move {
				if let Some(reply) = crate::http::send_and_await_reply(&client, &addr, &own_id, &peer_id, &msg.body).await {
					harness.apply_and_dispatch(reply).await;
				}
			});
		}
	}

	fn notify_webhooks(&self, commit_index: LogIndex) {
		if self.webhooks.is_empty() {
			return;
		}
		let client = self.client.clone();
		let webhooks = self.webhooks.clone();
		tokio::spawn(async move {
			for url in webhooks {
				let _ = client.post(&url).json(&serde_json::json!({"commit_index": commit_index})).send().await;
			}
		});
	}

	fn cancel_all_waiters(&self) {
		let mut waiters = self.waiters.lock().unwrap();
		waiters.clear();
	}

	fn wake_waiters_up_to(&self, commit_index: LogIndex) {
		let mut waiters = self.waiters.lock().unwrap();
		let still_pending = waiters.split_off(&(commit_index + 1));
		let ready = std::mem::replace(&mut *waiters, still_pending);
		for (_, senders) in ready {
			for sender in senders {
				let _ = sender.send(());
			}
		}
	}

	async fn wait_for_commit(&self, index: LogIndex) {
		{
			let inner = self.inner.lock().await;
			if inner.applied >= index {
				return;
			}
		}
		let receiver = {
			let mut waiters = self.waiters.lock().unwrap();
			let (tx, rx) = oneshot::channel();
			waiters.entry(index).or_default().push(tx);
			rx
		};
		let _ = receiver.await;
	}

	pub async fn propose(&self, action: Action) -> Result<ProposeOutcome> {
		let index = {
			let mut inner = self.inner.lock().await;
			if inner.machine.role() != Role::Leader {
				return Ok(ProposeOutcome::NotLeader { leader: inner.machine.leader().cloned() });
			}
			let effects = inner.machine.propose(action).expect("checked role == Leader above");
			for op in &effects.log_ops {
				match op {
					crate::protos::LogOp::Append(entries) => inner.storage.append(entries)?,
					crate::protos::LogOp::Rollback(i) => inner.storage.rollback(*i)?,
				}
			}
			let index = inner.machine.last_index();
			let outbox = effects.outbox;
			drop(inner);
			self.dispatch_outbox(outbox);
			index
		};
		self.wait_for_commit(index).await;
		Ok(ProposeOutcome::Committed { index })
	}

	pub async fn handle_inbound(&self, from: NodeId, body: PeerRequest) -> Result<OutboundBody> {
		let msg = match body {
			PeerRequest::PreVote { term, last_index, last_term } => Inbound::PreVote { from: from.clone(), term, last_index, last_term },
			PeerRequest::Vote { term, last_index, last_term } => Inbound::Vote { from: from.clone(), term, last_index, last_term },
			PeerRequest::AppendEntries { term, prev_index, prev_term, entries, leader_commit } => {
				Inbound::AppendEntries { from: from.clone(), term, prev_index, prev_term, entries, leader_commit }
			}
		};
		let effects = self.apply_step(msg).await?;
		let mut reply = None;
		let mut rest = Vec::new();
		for out in effects.outbox {
			if out.to == from && reply.is_none() {
				reply = Some(out.body);
			} else {
				rest.push(out);
			}
		}
		self.dispatch_outbox(rest);
		reply.ok_or_else(|| "machine produced no reply for inbound request".into())
	}

	pub async fn status(&self) -> StatusSnapshot {
		let inner = self.inner.lock().await;
		StatusSnapshot {
			id: self.id.clone(),
			term: inner.machine.current_term(),
			role: inner.machine.role(),
			commit_index: inner.machine.commit_index(),
			last_index: inner.machine.last_index(),
			leader: inner.machine.leader().cloned(),
		}
	}
}

/// Inbound peer-RPC request bodies, decoded off the wire in `http.rs`.
#[derive(Debug, Clone)]
pub enum PeerRequest {
	PreVote { term: Term, last_index: LogIndex, last_term: Term },
	Vote { term: Term, last_index: LogIndex, last_term: Term },
	AppendEntries { term: Term, prev_index: LogIndex, prev_term: Term, entries: Vec<crate::protos::LogEntry>, leader_commit: LogIndex },
}
