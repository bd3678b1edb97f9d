//! Wire and log record types shared by the Machine, Storage and the HTTP
//! transport. Kept free of any I/O so that it can be used from pure unit
//! tests without touching a runtime.

use serde::de::{Deserializer, Error as DeError};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable identifier of a peer, e.g. `"node1"`. Assigned by configuration,
/// not auto-generated, since the peer set is fixed at start (see Non-goals).
pub type NodeId = String;

pub type Term = u64;

/// 1-indexed; index 0 is the sentinel empty-prefix entry with term 0.
pub type LogIndex = u64;

macro_rules! action_kind {
	($name:ident, $tag:literal, { $($field:ident : $ty:ty),* $(,)? }) => {
		#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
		pub struct $name {
			$(pub $field: $ty,)*
			/// Fields present on the wire that this node's schema doesn't know
			/// about. Preserved verbatim so that a mixed-version cluster never
			/// drops data a newer peer appended (see §6, "Unknown fields are
			/// preserved through the log").
			#[serde(flatten, default)]
			pub extra: Map<String, Value>,
		}

		impl $name {
			pub const TYPE: &'static str = $tag;
		}
	};
}

action_kind!(BlobMounted, "BLOB_MOUNTED", { hash: String, repository: String });
action_kind!(BlobUnmounted, "BLOB_UNMOUNTED", { hash: String, repository: String });
action_kind!(BlobInfo, "BLOB_INFO", { hash: String, content_type: String, dependencies: Vec<String> });
action_kind!(BlobStat, "BLOB_STAT", { hash: String, size: u64 });
action_kind!(BlobStored, "BLOB_STORED", { hash: String, location: NodeId });
action_kind!(BlobUnstored, "BLOB_UNSTORED", { hash: String, location: NodeId });
action_kind!(ManifestMounted, "MANIFEST_MOUNTED", { hash: String, repository: String });
action_kind!(ManifestUnmounted, "MANIFEST_UNMOUNTED", { hash: String, repository: String });
action_kind!(ManifestInfo, "MANIFEST_INFO", { hash: String, content_type: String, dependencies: Vec<String> });
action_kind!(ManifestStat, "MANIFEST_STAT", { hash: String, size: u64 });
action_kind!(ManifestStored, "MANIFEST_STORED", { hash: String, location: NodeId });
action_kind!(ManifestUnstored, "MANIFEST_UNSTORED", { hash: String, location: NodeId });
action_kind!(HashTagged, "HASH_TAGGED", { repository: String, tag: String, hash: String });

/// A single replicated registry action. Unrecognized `type` values (e.g. from
/// a newer peer during a rolling upgrade) deserialize into `Unknown` instead
/// of failing, so that the Reducer can remain a total function over the log
/// (see §4.3, "unknown action types are ignored").
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
	BlobMounted(BlobMounted),
	BlobUnmounted(BlobUnmounted),
	BlobInfo(BlobInfo),
	BlobStat(BlobStat),
	BlobStored(BlobStored),
	BlobUnstored(BlobUnstored),
	ManifestMounted(ManifestMounted),
	ManifestUnmounted(ManifestUnmounted),
	ManifestInfo(ManifestInfo),
	ManifestStat(ManifestStat),
	ManifestStored(ManifestStored),
	ManifestUnstored(ManifestUnstored),
	HashTagged(HashTagged),
	Unknown { kind: String, fields: Map<String, Value> },
}

impl Action {
	/// The `type` tag this action would serialize under.
	pub fn kind(&self) -> &str {
		match self {
			Action::BlobMounted(_) => BlobMounted::TYPE,
			Action::BlobUnmounted(_) => BlobUnmounted::TYPE,
			Action::BlobInfo(_) => BlobInfo::TYPE,
			Action::BlobStat(_) => BlobStat::TYPE,
			Action::BlobStored(_) => BlobStored::TYPE,
			Action::BlobUnstored(_) => BlobUnstored::TYPE,
			Action::ManifestMounted(_) => ManifestMounted::TYPE,
			Action::ManifestUnmounted(_) => ManifestUnmounted::TYPE,
			Action::ManifestInfo(_) => ManifestInfo::TYPE,
			Action::ManifestStat(_) => ManifestStat::TYPE,
			Action::ManifestStored(_) => ManifestStored::TYPE,
			Action::ManifestUnstored(_) => ManifestUnstored::TYPE,
			Action::HashTagged(_) => HashTagged::TYPE,
			Action::Unknown { kind, .. } => kind,
		}
	}

	fn from_map(mut map: Map<String, Value>) -> Result<Action, serde_json::Error> {
		let kind = match map.remove("type") {
			Some(Value::String(s)) => s,
			_ => return Err(DeError::custom("action object is missing a string \"type\" field")),
		};
		// Put "type" back so that each typed struct's `extra` flatten capture
		// doesn't retain it (it's represented structurally by the enum variant).
		macro_rules! try_kind {
			($ty:ty, $variant:ident) => {
				if kind == <$ty>::TYPE {
					let value = Value::Object(map);
					let parsed: $ty = serde_json::from_value(value)?;
					return Ok(Action::$variant(parsed));
				}
			};
		}
		try_kind!(BlobMounted, BlobMounted);
		try_kind!(BlobUnmounted, BlobUnmounted);
		try_kind!(BlobInfo, BlobInfo);
		try_kind!(BlobStat, BlobStat);
		try_kind!(BlobStored, BlobStored);
		try_kind!(BlobUnstored, BlobUnstored);
		try_kind!(ManifestMounted, ManifestMounted);
		try_kind!(ManifestUnmounted, ManifestUnmounted);
		try_kind!(ManifestInfo, ManifestInfo);
		try_kind!(ManifestStat, ManifestStat);
		try_kind!(ManifestStored, ManifestStored);
		try_kind!(ManifestUnstored, ManifestUnstored);
		try_kind!(HashTagged, HashTagged);

		Ok(Action::Unknown { kind, fields: map })
	}

	fn to_map(&self) -> Map<String, Value> {
		fn tagged<T: Serialize>(tag: &str, value: &T) -> Map<String, Value> {
			let mut map = match serde_json::to_value(value).expect("action fields always serialize") {
				Value::Object(m) => m,
				_ => Map::new(),
			};
			map.insert("type".to_string(), Value::String(tag.to_string()));
			map
		}

		match self {
			Action::BlobMounted(a) => tagged(BlobMounted::TYPE, a),
			Action::BlobUnmounted(a) => tagged(BlobUnmounted::TYPE, a),
			Action::BlobInfo(a) => tagged(BlobInfo::TYPE, a),
			Action::BlobStat(a) => tagged(BlobStat::TYPE, a),
			Action::BlobStored(a) => tagged(BlobStored::TYPE, a),
			Action::BlobUnstored(a) => tagged(BlobUnstored::TYPE, a),
			Action::ManifestMounted(a) => tagged(ManifestMounted::TYPE, a),
			Action::ManifestUnmounted(a) => tagged(ManifestUnmounted::TYPE, a),
			Action::ManifestInfo(a) => tagged(ManifestInfo::TYPE, a),
			Action::ManifestStat(a) => tagged(ManifestStat::TYPE, a),
			Action::ManifestStored(a) => tagged(ManifestStored::TYPE, a),
			Action::ManifestUnstored(a) => tagged(ManifestUnstored::TYPE, a),
			Action::HashTagged(a) => tagged(HashTagged::TYPE, a),
			Action::Unknown { kind, fields } => {
				let mut map = fields.clone();
				map.insert("type".to_string(), Value::String(kind.clone()));
				map
			}
		}
	}
}

impl Serialize for Action {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let map = self.to_map();
		let mut ser = serializer.serialize_map(Some(map.len()))?;
		for (k, v) in map.iter() {
			ser.serialize_entry(k, v)?;
		}
		ser.end()
	}
}

impl<'de> Deserialize<'de> for Action {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value = Map::<String, Value>::deserialize(deserializer)?;
		Action::from_map(value).map_err(DeError::custom)
	}
}

/// The payload of a single log entry. `Noop` is the empty marker a new
/// leader commits to make previous-term entries indirectly committable; it
/// carries no `type` field and the Reducer skips it entirely, matching the
/// original implementation's bare `{}` no-op entries.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntryData {
	Noop,
	Action(Action),
}

impl Serialize for LogEntryData {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			LogEntryData::Noop => {
				let ser = serializer.serialize_map(Some(0))?;
				ser.end()
			}
			LogEntryData::Action(a) => a.serialize(serializer),
		}
	}
}

impl<'de> Deserialize<'de> for LogEntryData {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let map = Map::<String, Value>::deserialize(deserializer)?;
		if !map.contains_key("type") {
			return Ok(LogEntryData::Noop);
		}
		Action::from_map(map).map(LogEntryData::Action).map_err(DeError::custom)
	}
}

/// A single entry of the replicated log: the term it was proposed under and
/// the action it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
	pub term: Term,
	pub data: LogEntryData,
}

/// An operation the Machine wants performed against the durable log. The
/// Machine itself never touches disk (§4.2); it only describes what should
/// happen, and the harness applies it to `Storage` before anything depending
/// on durability (a vote grant, an AppendEntries success reply) is allowed
/// to go out.
#[derive(Debug, Clone, PartialEq)]
pub enum LogOp {
	Append(Vec<LogEntry>),
	/// Truncate the tail so that `last_index() == new_last_index` afterwards.
	Rollback(LogIndex),
}

/// A message bound for a specific peer, queued in the Machine's outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
	pub to: NodeId,
	pub body: OutboundBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundBody {
	PreVote { term: Term, last_index: LogIndex, last_term: Term },
	PreVoteReply { term: Term, reject: bool },
	Vote { term: Term, last_index: LogIndex, last_term: Term },
	VoteReply { term: Term, reject: bool },
	AppendEntries {
		term: Term,
		prev_index: LogIndex,
		prev_term: Term,
		entries: Vec<LogEntry>,
		leader_commit: LogIndex,
	},
	AppendEntriesReply { term: Term, reject: bool, log_index: LogIndex },
}

/// A single `Msg` fed into `Machine::step`. `Tick` and `ProposeEntry` are
/// locally generated by the harness; everything else originates from a peer
/// and carries its sender.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
	Tick,
	ProposeEntry(Action),
	PreVote { from: NodeId, term: Term, last_index: LogIndex, last_term: Term },
	PreVoteReply { from: NodeId, term: Term, reject: bool },
	Vote { from: NodeId, term: Term, last_index: LogIndex, last_term: Term },
	VoteReply { from: NodeId, term: Term, reject: bool },
	AppendEntries {
		from: NodeId,
		term: Term,
		prev_index: LogIndex,
		prev_term: Term,
		entries: Vec<LogEntry>,
		leader_commit: LogIndex,
	},
	AppendEntriesReply { from: NodeId, term: Term, reject: bool, log_index: LogIndex },
}
