//! The deterministic reducer: folds committed log entries into the registry
//! graph. Grounded directly on the original `RegistryState` reducer, which
//! builds the same graph with `networkx.DiGraph`; here it's a plain
//! adjacency map since the graph is small, append-mostly, and the only
//! traversal we need is "neighbors of a node".
//!
//! `dispatch` must be total (unknown action types are silently ignored) and
//! idempotent (re-applying an already-applied entry, e.g. after a restart
//! replays the log, must not change the result).

use std::collections::{HashMap, HashSet};

use crate::protos::{Action, LogEntryData};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
	Blob(String),
	Manifest(String),
	Tag { repository: String, tag: String },
}

#[derive(Debug, Clone, Default)]
struct ObjectInfo {
	content_type: Option<String>,
	dependencies: Vec<String>,
	size: Option<u64>,
	locations: HashSet<String>,
	repositories: HashSet<String>,
}

/// The replicated registry graph. Nodes are blobs, manifests and tags; edges
/// record "depends on" (manifest -> blob/manifest) and "tagged as"
/// (tag -> manifest). A node with no incoming edges that isn't itself a tag
/// is orphaned and eligible for garbage collection.
#[derive(Debug, Default)]
pub struct Registry {
	blobs: HashMap<String, ObjectInfo>,
	manifests: HashMap<String, ObjectInfo>,
	/// tag (repository, tag) -> manifest hash it points at.
	tags: HashMap<(String, String), String>,
}

impl Registry {
	pub fn new() -> Registry {
		Registry::default()
	}

	pub fn is_blob_available(&self, repository: &str, hash: &str) -> bool {
		self.blobs.get(hash).map(|o| o.repositories.contains(repository) && !o.locations.is_empty()).unwrap_or(false)
	}

	pub fn is_manifest_available(&self, repository: &str, hash: &str) -> bool {
		self.manifests
			.get(hash)
			.map(|o| o.repositories.contains(repository) && !o.locations.is_empty() && o.content_type.is_some())
			.unwrap_or(false)
	}

	pub fn get_blob(&self, repository: &str, hash: &str) -> Option<BlobView<'_>> {
		self.blobs.get(hash).filter(|o| o.repositories.contains(repository)).map(|info| BlobView { hash, info })
	}

	pub fn get_manifest(&self, repository: &str, hash: &str) -> Option<BlobView<'_>> {
		self.manifests.get(hash).filter(|o| o.repositories.contains(repository)).map(|info| BlobView { hash, info })
	}

	pub fn get_tag(&self, repository: &str, tag: &str) -> Option<&str> {
		self.tags.get(&(repository.to_string(), tag.to_string())).map(|s| s.as_str())
	}

	/// Empty means either an untagged repository or one that doesn't exist —
	/// same as the original's lookup-miss, just without a distinct error.
	pub fn get_tags(&self, repository: &str) -> Vec<&str> {
		self.tags.iter().filter(|((repo, _), _)| repo == repository).map(|((_, tag), _)| tag.as_str()).collect()
	}

	/// Nodes with zero references pointing at them that are not tags
	/// themselves — candidates for garbage collection.
	pub fn get_orphaned_objects(&self) -> Vec<NodeKey> {
		let mut referenced: HashSet<String> = HashSet::new();
		for hash in self.tags.values() {
			referenced.insert(hash.clone());
		}
		for info in self.blobs.values().chain(self.manifests.values()) {
			for dep in &info.dependencies {
				referenced.insert(dep.clone());
			}
		}
		let mut orphans = Vec::new();
		for hash in self.blobs.keys() {
			if !referenced.contains(hash) {
				orphans.push(NodeKey::Blob(hash.clone()));
			}
		}
		for hash in self.manifests.keys() {
			if !referenced.contains(hash) {
				orphans.push(NodeKey::Manifest(hash.clone()));
			}
		}
		orphans
	}

	pub fn dispatch(&mut self, data: &LogEntryData) {
		let action = match data {
			LogEntryData::Noop => return,
			LogEntryData::Action(a) => a,
		};
		match action {
			Action::BlobMounted(a) => {
				self.blobs.entry(a.hash.clone()).or_default().repositories.insert(a.repository.clone());
			}
			Action::BlobUnmounted(a) => {
				if let Some(info) = self.blobs.get_mut(&a.hash) {
					info.repositories.remove(&a.repository);
				}
			}
			Action::BlobInfo(a) => {
				let info = self.blobs.entry(a.hash.clone()).or_default();
				info.content_type = Some(a.content_type.clone());
				info.dependencies = a.dependencies.clone();
			}
			Action::BlobStat(a) => {
				self.blobs.entry(a.hash.clone()).or_default().size = Some(a.size);
			}
			Action::BlobStored(a) => {
				self.blobs.entry(a.hash.clone()).or_default().locations.insert(a.location.clone());
			}
			Action::BlobUnstored(a) => {
				if let std::collections::hash_map::Entry::Occupied(mut e) = self.blobs.entry(a.hash.clone()) {
					e.get_mut().locations.remove(&a.location);
					if e.get().locations.is_empty() {
						e.remove();
					}
				}
			}
			Action::ManifestMounted(a) => {
				self.manifests.entry(a.hash.clone()).or_default().repositories.insert(a.repository.clone());
			}
			Action::ManifestUnmounted(a) => {
				if let Some(info) = self.manifests.get_mut(&a.hash) {
					info.repositories.remove(&a.repository);
				}
				// Removing a manifest from a repository also removes any tag
				// in that repository still pointing at it, mirroring the
				// original reducer's symmetric MANIFEST_UNMOUNTED handling.
				self.tags.retain(|(repo, _), target| !(repo == &a.repository && target == &a.hash));
			}
			Action::ManifestInfo(a) => {
				let info = self.manifests.entry(a.hash.clone()).or_default();
				info.content_type = Some(a.content_type.clone());
				info.dependencies = a.dependencies.clone();
			}
			Action::ManifestStat(a) => {
				self.manifests.entry(a.hash.clone()).or_default().size = Some(a.size);
			}
			Action::ManifestStored(a) => {
				self.manifests.entry(a.hash.clone()).or_default().locations.insert(a.location.clone());
			}
			Action::ManifestUnstored(a) => {
				if let std::collections::hash_map::Entry::Occupied(mut e) = self.manifests.entry(a.hash.clone()) {
					e.get_mut().locations.remove(&a.location);
					if e.get().locations.is_empty() {
						e.remove();
					}
				}
			}
			Action::HashTagged(a) => {
				self.tags.insert((a.repository.clone(), a.tag.clone()), a.hash.clone());
			}
			Action::Unknown { .. } => {}
		}
	}
}

pub struct BlobView<'a> {
	hash: &'a str,
	info: &'a ObjectInfo,
}

impl<'a> BlobView<'a> {
	pub fn hash(&self) -> &str {
		self.hash
	}

	pub fn content_type(&self) -> Option<&str> {
		self.info.content_type.as_deref()
	}

	pub fn dependencies(&self) -> &[String] {
		&self.info.dependencies
	}

	pub fn size(&self) -> Option<u64> {
		self.info.size
	}

	pub fn locations(&self) -> impl Iterator<Item = &str> {
		self.info.locations.iter().map(|s| s.as_str())
	}

	pub fn repositories(&self) -> impl Iterator<Item = &str> {
		self.info.repositories.iter().map(|s| s.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protos::{BlobInfo, BlobMounted, BlobStored, BlobUnstored, HashTagged, ManifestInfo, ManifestMounted, ManifestStored, ManifestUnmounted, ManifestUnstored};
	use serde_json::Map;

	fn blob_mounted(hash: &str, repo: &str) -> LogEntryData {
		LogEntryData::Action(Action::BlobMounted(BlobMounted { hash: hash.into(), repository: repo.into(), extra: Map::new() }))
	}

	fn blob_stored(hash: &str, location: &str) -> LogEntryData {
		LogEntryData::Action(Action::BlobStored(BlobStored { hash: hash.into(), location: location.into(), extra: Map::new() }))
	}

	#[test]
	fn blob_becomes_available_once_stored_somewhere() {
		let mut reg = Registry::new();
		reg.dispatch(&blob_mounted("sha256:a", "library/x"));
		assert!(!reg.is_blob_available("library/x", "sha256:a"));
		reg.dispatch(&blob_stored("sha256:a", "node1"));
		assert!(reg.is_blob_available("library/x", "sha256:a"));
	}

	#[test]
	fn blob_unavailable_from_a_repository_it_was_never_mounted_in() {
		let mut reg = Registry::new();
		reg.dispatch(&blob_mounted("sha256:a", "library/x"));
		reg.dispatch(&blob_stored("sha256:a", "node1"));
		assert!(reg.is_blob_available("library/x", "sha256:a"));
		assert!(!reg.is_blob_available("library/other", "sha256:a"));
	}

	#[test]
	fn manifest_unavailable_without_content_type_even_if_stored() {
		let mut reg = Registry::new();
		reg.dispatch(&LogEntryData::Action(Action::ManifestMounted(ManifestMounted {
			hash: "sha256:m".into(),
			repository: "library/x".into(),
			extra: Map::new(),
		})));
		reg.dispatch(&LogEntryData::Action(Action::ManifestStored(ManifestStored {
			hash: "sha256:m".into(),
			location: "node1".into(),
			extra: Map::new(),
		})));
		assert!(!reg.is_manifest_available("library/x", "sha256:m"));
		reg.dispatch(&LogEntryData::Action(Action::ManifestInfo(ManifestInfo {
			hash: "sha256:m".into(),
			content_type: "application/vnd.oci.image.manifest.v1+json".into(),
			dependencies: vec![],
			extra: Map::new(),
		})));
		assert!(reg.is_manifest_available("library/x", "sha256:m"));
	}

	/// Scenario 5: a tagged manifest is fully unstored. The manifest node is
	/// deleted entirely (so `get_manifest` fails), but the tag itself is left
	/// dangling — it still resolves to the now-gone hash, exactly like the
	/// original reducer leaves a dangling edge rather than cleaning up tags
	/// on unstore (only on unmount).
	#[test]
	fn unstoring_a_tagged_manifest_deletes_the_node_but_leaves_the_tag_dangling() {
		let mut reg = Registry::new();
		reg.dispatch(&LogEntryData::Action(Action::ManifestMounted(ManifestMounted {
			hash: "sha256:m".into(),
			repository: "library/x".into(),
			extra: Map::new(),
		})));
		reg.dispatch(&LogEntryData::Action(Action::ManifestStored(ManifestStored {
			hash: "sha256:m".into(),
			location: "node1".into(),
			extra: Map::new(),
		})));
		reg.dispatch(&LogEntryData::Action(Action::HashTagged(HashTagged {
			repository: "library/x".into(),
			tag: "latest".into(),
			hash: "sha256:m".into(),
			extra: Map::new(),
		})));
		assert!(reg.get_manifest("library/x", "sha256:m").is_some());

		reg.dispatch(&LogEntryData::Action(Action::ManifestUnstored(ManifestUnstored {
			hash: "sha256:m".into(),
			location: "node1".into(),
			extra: Map::new(),
		})));
		assert!(reg.get_manifest("library/x", "sha256:m").is_none());
		assert_eq!(reg.get_tag("library/x", "latest"), Some("sha256:m"));
	}

	#[test]
	fn unstored_blob_no_longer_counts_as_orphan_bait_once_removed() {
		let mut reg = Registry::new();
		reg.dispatch(&blob_mounted("sha256:a", "library/x"));
		reg.dispatch(&blob_stored("sha256:a", "node1"));
		reg.dispatch(&LogEntryData::Action(Action::BlobUnstored(BlobUnstored { hash: "sha256:a".into(), location: "node1".into(), extra: Map::new() })));
		assert!(reg.get_orphaned_objects().is_empty());
	}

	#[test]
	fn blob_depended_on_by_another_blob_is_not_orphaned() {
		let mut reg = Registry::new();
		reg.dispatch(&LogEntryData::Action(Action::BlobInfo(BlobInfo {
			hash: "sha256:parent".into(),
			content_type: "application/octet-stream".into(),
			dependencies: vec!["sha256:child".into()],
			extra: Map::new(),
		})));
		reg.dispatch(&blob_stored("sha256:child", "node1"));
		let orphans = reg.get_orphaned_objects();
		assert!(!orphans.contains(&NodeKey::Blob("sha256:child".into())));
	}

	#[test]
	fn unmounting_manifest_drops_its_tags_in_that_repository() {
		let mut reg = Registry::new();
		reg.dispatch(&LogEntryData::Action(Action::ManifestMounted(ManifestMounted {
			hash: "sha256:m".into(),
			repository: "library/x".into(),
			extra: Map::new(),
		})));
		reg.dispatch(&LogEntryData::Action(Action::HashTagged(HashTagged {
			repository: "library/x".into(),
			tag: "latest".into(),
			hash: "sha256:m".into(),
			extra: Map::new(),
		})));
		assert_eq!(reg.get_tag("library/x", "latest"), Some("sha256:m"));
		reg.dispatch(&LogEntryData::Action(Action::ManifestUnmounted(ManifestUnmounted {
			hash: "sha256:m".into(),
			repository: "library/x".into(),
			extra: Map::new(),
		})));
		assert_eq!(reg.get_tag("library/x", "latest"), None);
	}

	#[test]
	fn unknown_action_type_is_ignored_without_error() {
		let mut reg = Registry::new();
		reg.dispatch(&LogEntryData::Action(Action::Unknown { kind: "SOMETHING_NEW".into(), fields: Map::new() }));
		assert!(reg.get_orphaned_objects().is_empty());
	}

	#[test]
	fn dispatch_is_idempotent() {
		let mut reg = Registry::new();
		reg.dispatch(&blob_mounted("sha256:a", "library/x"));
		let entry = blob_stored("sha256:a", "node1");
		reg.dispatch(&entry);
		reg.dispatch(&entry);
		assert_eq!(reg.get_blob("library/x", "sha256:a").unwrap().locations().count(), 1);
	}
}
