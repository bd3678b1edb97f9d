//! The pure Raft state machine: `Machine::step` takes the current state and
//! one `Inbound` message and returns the new state plus `Effects` describing
//! what to persist and what to send. It never touches the filesystem or the
//! network itself — see the harness for that half of the split.

use std::collections::HashSet;

use rand::Rng;

use crate::protos::{Inbound, LogEntry, LogEntryData, LogIndex, LogOp, NodeId, Outbound, OutboundBody, Term};

/// Election timeout range, in ticks. The harness drives `Tick` at a fixed
/// cadence (see config `tick_millis`), so this is unitless relative to that.
pub const ELECTION_TIMEOUT_TICKS: (u64, u64) = (10, 20);
/// How often a Leader re-sends AppendEntries in the absence of new proposals.
pub const HEARTBEAT_TICKS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Follower,
	PreCandidate,
	Candidate,
	Leader,
}

#[derive(Debug, Clone)]
struct PeerProgress {
	next_index: LogIndex,
	match_index: LogIndex,
}

/// Per-role bookkeeping. Kept private; callers only observe `Role` via
/// `Machine::role()`.
#[derive(Debug, Clone)]
enum RoleState {
	Follower { leader: Option<NodeId> },
	PreCandidate { votes: HashSet<NodeId> },
	Candidate { votes: HashSet<NodeId> },
	Leader { peers: std::collections::HashMap<NodeId, PeerProgress> },
}

impl RoleState {
	fn role(&self) -> Role {
		match self {
			RoleState::Follower { .. } => Role::Follower,
			RoleState::PreCandidate { .. } => Role::PreCandidate,
			RoleState::Candidate { .. } => Role::Candidate,
			RoleState::Leader { .. } => Role::Leader,
		}
	}
}

/// Effects produced by a single `step` call. The harness must persist
/// `log_ops` (and the new term/vote, if `persist_meta` is set) durably
/// *before* sending anything in `outbox` that depends on them, and before
/// letting a caller observe `commit_advanced`.
#[derive(Debug, Clone, Default)]
pub struct Effects {
	pub outbox: Vec<Outbound>,
	pub log_ops: Vec<LogOp>,
	pub persist_meta: bool,
	pub commit_advanced: bool,
}

impl Effects {
	fn send(&mut self, to: NodeId, body: OutboundBody) {
		self.outbox.push(Outbound { to, body });
	}
}

pub struct Machine {
	id: NodeId,
	peers: Vec<NodeId>,

	current_term: Term,
	voted_for: Option<NodeId>,
	log: Vec<LogEntry>,
	commit_index: LogIndex,

	/// Set on any AppendEntries accepted from the current term's leader;
	/// cleared whenever our own election timer fires. While set, we refuse
	/// to grant pre-votes/votes to challengers, since a live leader implies
	/// no election is actually needed (§4.2 "obedient").
	obedient: bool,

	tick: u64,
	election_timeout: u64,

	role: RoleState,
}

/// Returns the index of the first entry (1-indexed) at which `ours` and
/// `theirs` diverge in term, or `None` if `theirs` is entirely consistent
/// with (a prefix of, or equal to) `ours`. Pure function, trivial to
/// property-test independent of the rest of the Machine.
pub fn find_first_inconsistency(ours: &[LogEntry], theirs: &[(LogIndex, Term)]) -> Option<LogIndex> {
	for &(index, term) in theirs {
		match ours.get((index - 1) as usize) {
			Some(entry) if entry.term == term => continue,
			_ => return Some(index),
		}
	}
	None
}

impl Machine {
	pub fn new(
		id: NodeId,
		peers: Vec<NodeId>,
		current_term: Term,
		voted_for: Option<NodeId>,
		log: Vec<LogEntry>,
		commit_index: LogIndex,
	) -> Machine {
		let mut rng = rand::thread_rng();
		let election_timeout = rng.gen_range(ELECTION_TIMEOUT_TICKS.0..=ELECTION_TIMEOUT_TICKS.1);
		Machine {
			id,
			peers,
			current_term,
			voted_for,
			log,
			commit_index,
			obedient: false,
			tick: 0,
			election_timeout,
			role: RoleState::Follower { leader: None },
		}
	}

	pub fn role(&self) -> Role {
		self.role.role()
	}

	pub fn current_term(&self) -> Term {
		self.current_term
	}

	pub fn voted_for_snapshot(&self) -> Option<NodeId> {
		self.voted_for.clone()
	}

	pub fn commit_index(&self) -> LogIndex {
		self.commit_index
	}

	pub fn last_index(&self) -> LogIndex {
		self.log.len() as LogIndex
	}

	pub fn last_term(&self) -> Term {
		self.log.last().map(|e| e.term).unwrap_or(0)
	}

	pub fn leader(&self) -> Option<&NodeId> {
		match &self.role {
			RoleState::Leader { .. } => Some(&self.id),
			RoleState::Follower { leader } => leader.as_ref(),
			_ => None,
		}
	}

	fn quorum(&self) -> usize {
		(self.peers.len() + 1) / 2 + 1
	}

	fn term_at(&self, index: LogIndex) -> Term {
		if index == 0 {
			0
		} else {
			self.log.get((index - 1) as usize).map(|e| e.term).unwrap_or(0)
		}
	}

	fn new_election_timeout(&self) -> u64 {
		rand::thread_rng().gen_range(ELECTION_TIMEOUT_TICKS.0..=ELECTION_TIMEOUT_TICKS.1)
	}

	/// Shared eligibility check used by both the PreVote and Vote paths: a
	/// candidate may receive our vote only if its log is at least as
	/// up-to-date as ours (higher last term, or same last term and
	/// `last_index >= our last_index`).
	fn candidate_log_is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
		let our_last_term = self.last_term();
		last_term > our_last_term || (last_term == our_last_term && last_index >= self.last_index())
	}

	fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Effects {
		let mut effects = Effects::default();
		if term > self.current_term {
			self.current_term = term;
			self.voted_for = None;
			effects.persist_meta = true;
		}
		self.role = RoleState::Follower { leader };
		self.tick = 0;
		self.election_timeout = self.new_election_timeout();
		effects
	}

	/// Observes a term seen in an incoming message. If it's higher than
	/// ours, we step down to Follower immediately, per the Raft rule that no
	/// server may remain Candidate/Leader once it sees a higher term.
	fn observe_term(&mut self, term: Term) -> Option<Effects> {
		if term > self.current_term {
			Some(self.become_follower(term, None))
		} else {
			None
		}
	}

	fn become_pre_candidate(&mut self) -> Effects {
		let mut effects = Effects::default();
		self.role = RoleState::PreCandidate { votes: HashSet::from([self.id.clone()]) };
		self.tick = 0;
		self.election_timeout = self.new_election_timeout();
		self.obedient = false;
		for peer in self.peers.clone() {
			effects.send(
				peer,
				OutboundBody::PreVote { term: self.current_term + 1, last_index: self.last_index(), last_term: self.last_term() },
			);
		}
		effects
	}

	fn become_candidate(&mut self) -> Effects {
		let mut effects = Effects::default();
		self.current_term += 1;
		self.voted_for = Some(self.id.clone());
		effects.persist_meta = true;
		self.role = RoleState::Candidate { votes: HashSet::from([self.id.clone()]) };
		self.tick = 0;
		self.election_timeout = self.new_election_timeout();
		for peer in self.peers.clone() {
			effects.send(peer, OutboundBody::Vote { term: self.current_term, last_index: self.last_index(), last_term: self.last_term() });
		}
		effects
	}

	fn become_leader(&mut self) -> Effects {
		let mut effects = Effects::default();
		let next_index = self.last_index() + 1;
		let peers = self
			.peers
			.iter()
			.cloned()
			.map(|p| (p, PeerProgress { next_index, match_index: 0 }))
			.collect();
		self.role = RoleState::Leader { peers };
		// Commit a no-op immediately so that entries from previous terms
		// become indirectly committable (§4.2, "never commit a previous
		// term's entry by counting replicas directly").
		let entry = LogEntry { term: self.current_term, data: LogEntryData::Noop };
		self.log.push(entry.clone());
		effects.log_ops.push(LogOp::Append(vec![entry]));
		effects.outbox.extend(self.broadcast_append_entries());
		effects
	}

	fn broadcast_append_entries(&self) -> Vec<Outbound> {
		let peers = match &self.role {
			RoleState::Leader { peers } => peers,
			_ => return Vec::new(),
		};
		let mut out = Vec::new();
		for (peer, progress) in peers {
			let prev_index = progress.next_index - 1;
			let prev_term = self.term_at(prev_index);
			let entries = self.log[(prev_index as usize)..].to_vec();
			out.push(Outbound {
				to: peer.clone(),
				body: OutboundBody::AppendEntries { term: self.current_term, prev_index, prev_term, entries, leader_commit: self.commit_index },
			});
		}
		out
	}

	/// Advances `commit_index` as far as a majority of `match_index` values
	/// allow, but only ever commits an entry from the *current* term
	/// directly; earlier-term entries ride along once a current-term entry
	/// at a higher index is committed (the Raft §5.4.2 safety rule).
	fn advance_commit_index(&mut self) -> bool {
		let peers = match &self.role {
			RoleState::Leader { peers } => peers,
			_ => return false,
		};
		let mut match_indices: Vec<LogIndex> = peers.values().map(|p| p.match_index).collect();
		match_indices.push(self.last_index());
		match_indices.sort_unstable();
		let candidate = match_indices[match_indices.len() - self.quorum()];

		if candidate > self.commit_index && self.term_at(candidate) == self.current_term {
			self.commit_index = candidate;
			true
		} else {
			false
		}
	}

	pub fn propose(&mut self, action: crate::protos::Action) -> Option<Effects> {
		if !matches!(self.role, RoleState::Leader { .. }) {
			return None;
		}
		let mut effects = Effects::default();
		let entry = LogEntry { term: self.current_term, data: LogEntryData::Action(action) };
		self.log.push(entry.clone());
		effects.log_ops.push(LogOp::Append(vec![entry]));
		effects.outbox.extend(self.broadcast_append_entries());
		Some(effects)
	}

	pub fn step(&mut self, msg: Inbound) -> Effects {
		match msg {
			Inbound::Tick => self.on_tick(),
			Inbound::ProposeEntry(action) => self.propose(action).unwrap_or_default(),
			Inbound::PreVote { from, term, last_index, last_term } => self.on_pre_vote(from, term, last_index, last_term),
			Inbound::PreVoteReply { from, term, reject } => self.on_pre_vote_reply(from, term, reject),
			Inbound::Vote { from, term, last_index, last_term } => self.on_vote(from, term, last_index, last_term),
			Inbound::VoteReply { from, term, reject } => self.on_vote_reply(from, term, reject),
			Inbound::AppendEntries { from, term, prev_index, prev_term, entries, leader_commit } => {
				self.on_append_entries(from, term, prev_index, prev_term, entries, leader_commit)
			}
			Inbound::AppendEntriesReply { from, term, reject, log_index } => self.on_append_entries_reply(from, term, reject, log_index),
		}
	}

	fn on_tick(&mut self) -> Effects {
		self.tick += 1;
		match &self.role {
			RoleState::Leader { .. } => {
				if self.tick >= HEARTBEAT_TICKS {
					self.tick = 0;
					let mut effects = Effects::default();
					effects.outbox.extend(self.broadcast_append_entries());
					effects
				} else {
					Effects::default()
				}
			}
			_ => {
				if self.tick >= self.election_timeout {
					self.become_pre_candidate()
				} else {
					Effects::default()
				}
			}
		}
	}

	fn on_pre_vote(&mut self, from: NodeId, term: Term, last_index: LogIndex, last_term: Term) -> Effects {
		// PreVote never advances our own term; a prospective candidate's
		// term+1 must only beat an *obedient* follower if it's actually
		// allowed to disrupt it.
		let reject = self.obedient || term < self.current_term || !self.candidate_log_is_up_to_date(last_index, last_term);
		let mut effects = Effects::default();
		effects.send(from, OutboundBody::PreVoteReply { term: self.current_term, reject });
		effects
	}

	fn on_pre_vote_reply(&mut self, from: NodeId, term: Term, reject: bool) -> Effects {
		if let Some(effects) = self.observe_term(term) {
			return effects;
		}
		if reject {
			return Effects::default();
		}
		if let RoleState::PreCandidate { votes } = &mut self.role {
			votes.insert(from);
			if votes.len() >= self.quorum() {
				return self.become_candidate();
			}
		}
		Effects::default()
	}

	fn on_vote(&mut self, from: NodeId, term: Term, last_index: LogIndex, last_term: Term) -> Effects {
		let mut effects = Effects::default();
		if term > self.current_term {
			effects = self.become_follower(term, None);
		}
		let grant = term == self.current_term
			&& (self.voted_for.is_none() || self.voted_for.as_ref() == Some(&from))
			&& self.candidate_log_is_up_to_date(last_index, last_term);
		if grant {
			self.voted_for = Some(from.clone());
			effects.persist_meta = true;
			self.tick = 0;
		}
		effects.send(from, OutboundBody::VoteReply { term: self.current_term, reject: !grant });
		effects
	}

	fn on_vote_reply(&mut self, from: NodeId, term: Term, reject: bool) -> Effects {
		if let Some(effects) = self.observe_term(term) {
			return effects;
		}
		if reject || term != self.current_term {
			return Effects::default();
		}
		if let RoleState::Candidate { votes } = &mut self.role {
			votes.insert(from);
			if votes.len() >= self.quorum() {
				return self.become_leader();
			}
		}
		Effects::default()
	}

	fn on_append_entries(
		&mut self,
		from: NodeId,
		term: Term,
		prev_index: LogIndex,
		prev_term: Term,
		entries: Vec<LogEntry>,
		leader_commit: LogIndex,
	) -> Effects {
		let mut effects = Effects::default();
		if term < self.current_term {
			effects.send(from, OutboundBody::AppendEntriesReply { term: self.current_term, reject: true, log_index: 0 });
			return effects;
		}

		effects = self.become_follower(term, Some(from.clone()));
		self.obedient = true;
		self.tick = 0;

		if prev_index > self.last_index() || self.term_at(prev_index) != prev_term {
			effects.send(from, OutboundBody::AppendEntriesReply { term: self.current_term, reject: true, log_index: self.last_index() });
			return effects;
		}

		let theirs: Vec<(LogIndex, Term)> = entries.iter().enumerate().map(|(i, e)| (prev_index + 1 + i as LogIndex, e.term)).collect();
		if let Some(conflict_index) = find_first_inconsistency(&self.log, &theirs) {
			let keep = (conflict_index - 1) as usize;
			if keep < self.log.len() {
				self.log.truncate(keep);
				effects.log_ops.push(LogOp::Rollback(keep as LogIndex));
			}
			let new_entries: Vec<LogEntry> = entries[((conflict_index - prev_index - 1) as usize)..].to_vec();
			self.log.extend(new_entries.iter().cloned());
			if !new_entries.is_empty() {
				effects.log_ops.push(LogOp::Append(new_entries));
			}
		}

		if leader_commit > self.commit_index {
			self.commit_index = leader_commit.min(self.last_index());
			effects.commit_advanced = true;
		}

		effects.send(from, OutboundBody::AppendEntriesReply { term: self.current_term, reject: false, log_index: self.last_index() });
		effects
	}

	fn on_append_entries_reply(&mut self, from: NodeId, term: Term, reject: bool, log_index: LogIndex) -> Effects {
		if let Some(effects) = self.observe_term(term) {
			return effects;
		}
		let mut effects = Effects::default();
		let send_retry = if let RoleState::Leader { peers } = &mut self.role {
			if let Some(progress) = peers.get_mut(&from) {
				if reject {
					progress.next_index = progress.next_index.saturating_sub(1).max(1);
					true
				} else {
					progress.match_index = log_index;
					progress.next_index = log_index + 1;
					false
				}
			} else {
				false
			}
		} else {
			false
		};

		if send_retry {
			if let RoleState::Leader { peers } = &self.role {
				if let Some(progress) = peers.get(&from) {
					let prev_index = progress.next_index - 1;
					let prev_term = self.term_at(prev_index);
					let entries = self.log[(prev_index as usize)..].to_vec();
					effects.send(
						from,
						OutboundBody::AppendEntries { term: self.current_term, prev_index, prev_term, entries, leader_commit: self.commit_index },
					);
				}
			}
		} else if self.advance_commit_index() {
			effects.commit_advanced = true;
		}

		effects
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(term: Term) -> LogEntry {
		LogEntry { term, data: LogEntryData::Noop }
	}

	#[test]
	fn find_first_inconsistency_detects_term_mismatch() {
		let ours = vec![entry(1), entry(1), entry(2)];
		let theirs = vec![(1, 1), (2, 1), (3, 3)];
		assert_eq!(find_first_inconsistency(&ours, &theirs), Some(3));
	}

	#[test]
	fn find_first_inconsistency_none_when_consistent() {
		let ours = vec![entry(1), entry(1), entry(2)];
		let theirs = vec![(1, 1), (2, 1)];
		assert_eq!(find_first_inconsistency(&ours, &theirs), None);
	}

	#[test]
	fn find_first_inconsistency_missing_entry_is_inconsistent() {
		let ours = vec![entry(1)];
		let theirs = vec![(1, 1), (2, 2)];
		assert_eq!(find_first_inconsistency(&ours, &theirs), Some(2));
	}

	#[test]
	fn election_timeout_promotes_follower_to_pre_candidate() {
		let mut m = Machine::new("a".into(), vec!["b".into(), "c".into()], 0, None, vec![], 0);
		for _ in 0..=ELECTION_TIMEOUT_TICKS.1 {
			m.step(Inbound::Tick);
		}
		assert_eq!(m.role(), Role::PreCandidate);
	}

	#[test]
	fn quorum_of_pre_votes_advances_to_candidate_then_votes_to_leader() {
		let mut m = Machine::new("a".into(), vec!["b".into(), "c".into()], 0, None, vec![], 0);
		for _ in 0..=ELECTION_TIMEOUT_TICKS.1 {
			m.step(Inbound::Tick);
		}
		assert_eq!(m.role(), Role::PreCandidate);
		m.step(Inbound::PreVoteReply { from: "b".into(), term: 0, reject: false });
		assert_eq!(m.role(), Role::Candidate);
		assert_eq!(m.current_term(), 1);
		m.step(Inbound::VoteReply { from: "b".into(), term: 1, reject: false });
		assert_eq!(m.role(), Role::Leader);
		assert_eq!(m.last_index(), 1);
	}

	#[test]
	fn obedient_follower_rejects_pre_vote_from_challenger() {
		let mut m = Machine::new("a".into(), vec!["b".into(), "c".into()], 1, None, vec![], 0);
		m.step(Inbound::AppendEntries { from: "b".into(), term: 1, prev_index: 0, prev_term: 0, entries: vec![], leader_commit: 0 });
		let effects = m.step(Inbound::PreVote { from: "c".into(), term: 2, last_index: 0, last_term: 0 });
		match &effects.outbox[0].body {
			OutboundBody::PreVoteReply { reject, .. } => assert!(*reject),
			other => panic!("unexpected: {:?}", other),
		}
	}

	#[test]
	fn leader_commits_only_current_term_entries_directly() {
		let mut m = Machine::new("a".into(), vec!["b".into(), "c".into()], 5, None, vec![entry(4)], 0);
		m.role = RoleState::Leader {
			peers: std::collections::HashMap::from([
				("b".to_string(), PeerProgress { next_index: 2, match_index: 1 }),
				("c".to_string(), PeerProgress { next_index: 2, match_index: 0 }),
			]),
		};
		// Replicating the old-term entry to a majority must not commit it directly.
		assert!(!m.advance_commit_index());
		assert_eq!(m.commit_index(), 0);
	}
}
