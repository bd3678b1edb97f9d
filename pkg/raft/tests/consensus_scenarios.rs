//! End-to-end scenarios driven directly against three wired-together
//! `Machine`s, with no network or disk involved. This exercises the same
//! message-passing shape the harness uses, just with an in-test router
//! standing in for HTTP, which keeps these scenarios deterministic and fast.

use std::collections::VecDeque;

use registry_raft::machine::{Machine, Role};
use registry_raft::protos::{Action, BlobMounted, HashTagged, Inbound, LogEntryData, OutboundBody};
use registry_raft::reducer::Registry;

struct Cluster {
	nodes: Vec<Machine>,
	ids: Vec<String>,
}

impl Cluster {
	fn new(n: usize) -> Cluster {
		let ids: Vec<String> = (0..n).map(|i| format!("node{i}")).collect();
		let nodes = ids
			.iter()
			.map(|id| {
				let peers = ids.iter().filter(|p| *p != id).cloned().collect();
				Machine::new(id.clone(), peers, 0, None, vec![], 0)
			})
			.collect();
		Cluster { nodes, ids }
	}

	fn index_of(&self, id: &str) -> usize {
		self.ids.iter().position(|x| x == id).unwrap()
	}

	/// Runs ticks and routes every resulting message synchronously until no
	/// node produces further outbound traffic (a quiescent round).
	fn tick_all(&mut self) {
		let mut queue: VecDeque<(usize, Inbound)> = VecDeque::new();
		for i in 0..self.nodes.len() {
			queue.push_back((i, Inbound::Tick));
		}
		self.drain(queue);
	}

	fn drain(&mut self, mut queue: VecDeque<(usize, Inbound)>) {
		while let Some((i, msg)) = queue.pop_front() {
			let from_id = self.ids[i].clone();
			let effects = self.nodes[i].step(msg);
			for out in effects.outbox {
				let to = self.index_of(&out.to);
				let inbound = match out.body {
					OutboundBody::PreVote { term, last_index, last_term } => {
						Inbound::PreVote { from: from_id.clone(), term, last_index, last_term }
					}
					OutboundBody::PreVoteReply { term, reject } => Inbound::PreVoteReply { from: from_id.clone(), term, reject },
					OutboundBody::Vote { term, last_index, last_term } => Inbound::Vote { from: from_id.clone(), term, last_index, last_term },
					OutboundBody::VoteReply { term, reject } => Inbound::VoteReply { from: from_id.clone(), term, reject },
					OutboundBody::AppendEntries { term, prev_index, prev_term, entries, leader_commit } => {
						Inbound::AppendEntries { from: from_id.clone(), term, prev_index, prev_term, entries, leader_commit }
					}
					OutboundBody::AppendEntriesReply { term, reject, log_index } => {
						Inbound::AppendEntriesReply { from: from_id.clone(), term, reject, log_index }
					}
				};
				queue.push_back((to, inbound));
			}
		}
	}

	fn leader(&self) -> Option<usize> {
		self.nodes.iter().position(|n| n.role() == Role::Leader)
	}

	fn elect_leader(&mut self) -> usize {
		for _ in 0..40 {
			self.tick_all();
			if let Some(i) = self.leader() {
				return i;
			}
		}
		panic!("no leader elected after 40 rounds");
	}
}

#[test]
fn cluster_elects_exactly_one_leader() {
	let mut cluster = Cluster::new(3);
	let leader = cluster.elect_leader();
	let leaders: Vec<_> = cluster.nodes.iter().filter(|n| n.role() == Role::Leader).collect();
	assert_eq!(leaders.len(), 1);
	assert!(cluster.nodes[leader].last_index() >= 1, "leader should have committed its no-op entry");
}

#[test]
fn proposed_entry_replicates_and_commits_on_a_majority() {
	let mut cluster = Cluster::new(3);
	let leader = cluster.elect_leader();

	let action = Action::BlobMounted(BlobMounted {
		hash: "sha256:deadbeef".into(),
		repository: "library/alpine".into(),
		extra: Default::default(),
	});
	let effects = cluster.nodes[leader].propose(action).expect("leader should accept proposals");
	let mut queue = VecDeque::new();
	for out in effects.outbox {
		let to = cluster.index_of(&out.to);
		if let OutboundBody::AppendEntries { term, prev_index, prev_term, entries, leader_commit } = out.body {
			queue.push_back((to, Inbound::AppendEntries { from: cluster.ids[leader].clone(), term, prev_index, prev_term, entries, leader_commit }));
		}
	}
	cluster.drain(queue);
	// One more heartbeat round lets the leader learn the new match_index and
	// advance its commit index.
	cluster.tick_all();

	let commit_indices: Vec<_> = cluster.nodes.iter().map(|n| n.commit_index()).collect();
	let committed_everywhere = commit_indices.iter().filter(|&&c| c >= 2).count();
	assert!(committed_everywhere >= 2, "commit index should reach a majority: {:?}", commit_indices);
}

#[test]
fn reducer_sees_committed_entries_in_order_and_ignores_gaps() {
	let mut registry = Registry::new();
	registry.dispatch(&LogEntryData::Action(Action::HashTagged(HashTagged {
		repository: "library/alpine".into(),
		tag: "latest".into(),
		hash: "sha256:deadbeef".into(),
		extra: Default::default(),
	})));
	assert_eq!(registry.get_tag("library/alpine", "latest"), Some("sha256:deadbeef"));
	assert_eq!(registry.get_tag("library/alpine", "missing"), None);
}
