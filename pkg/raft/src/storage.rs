//! Durable, crash-consistent storage for the replicated log and the small
//! amount of metadata (current term, vote) that must survive a restart.
//!
//! The on-disk layout is two files under the configured data directory:
//!
//! * `meta` — the current term and who we voted for this term, rewritten
//!   atomically (write to `meta.tmp`, fsync, rename) so a crash never leaves
//!   a torn header behind.
//! * `log` — an append-only sequence of records, each
//!   `[u32 len][u32 crc32c][msgpack-encoded LogEntry]`. Appends are fsynced
//!   before `append()` returns. A record whose checksum doesn't match is
//!   only tolerated at the very end of the file (a crash mid-write); a
//!   corrupt record anywhere else is a hard error.
//!
//! All I/O here is blocking `std::fs`, matching the rest of the crate's
//! preference for simple synchronous file access; the harness keeps it off
//! the async critical path by running storage calls via `spawn_blocking`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ResultExt};
use crate::protos::{LogEntry, LogIndex, NodeId, Term};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Meta {
	current_term: Term,
	voted_for: Option<NodeId>,
}

impl Default for Meta {
	fn default() -> Self {
		Meta { current_term: 0, voted_for: None }
	}
}

/// One on-disk log record's framing: 4-byte little-endian length, 4-byte
/// little-endian CRC-32C of the payload, then the payload itself.
const RECORD_HEADER_LEN: usize = 8;

pub struct Storage {
	dir: PathBuf,
	log_file: File,
	meta: Meta,
	/// In-memory mirror of every entry on disk, 1-indexed (entries[0] is
	/// logical index 1). Rebuilt at `open()` and kept in sync with every
	/// `append`/`rollback` so callers never need to re-read the file.
	entries: Vec<LogEntry>,
	/// Byte offset in `log_file` at which each entry starts, parallel to
	/// `entries`, plus one trailing sentinel at the current end of file.
	/// Used to find the truncation point for `rollback`.
	offsets: Vec<u64>,
}

impl Storage {
	pub fn open(dir: impl AsRef<Path>) -> Result<Storage> {
		let dir = dir.as_ref().to_path_buf();
		fs::create_dir_all(&dir).chain_err(|| format!("creating data directory {}", dir.display()))?;

		let meta = Self::read_meta(&dir)?;

		let log_path = dir.join("log");
		let mut log_file = OpenOptions::new()
			.create(true)
			.read(true)
			.append(true)
			.open(&log_path)
			.chain_err(|| format!("opening log file {}", log_path.display()))?;

		let (entries, offsets) = Self::replay(&mut log_file)?;

		Ok(Storage { dir, log_file, meta, entries, offsets })
	}

	fn meta_path(dir: &Path) -> PathBuf {
		dir.join("meta")
	}

	fn read_meta(dir: &Path) -> Result<Meta> {
		let path = Self::meta_path(dir);
		match fs::read(&path) {
			Ok(bytes) => {
				let meta: Meta = rmp_serde::from_slice(&bytes).chain_err(|| format!("decoding {}", path.display()))?;
				Ok(meta)
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Meta::default()),
			Err(e) => Err(e).chain_err(|| format!("reading {}", path.display())),
		}
	}

	/// Rewrites `meta` to a temp file, fsyncs it, then renames it over the
	/// real path. The rename is atomic on the filesystems this targets
	/// (ext4, xfs, apfs), so a crash either leaves the old header or the new
	/// one, never a mix.
	fn write_meta(&self) -> Result<()> {
		let tmp_path = self.dir.join("meta.tmp");
		let bytes = rmp_serde::to_vec(&self.meta).chain_err(|| "encoding metadata")?;
		{
			let mut tmp = File::create(&tmp_path).chain_err(|| format!("creating {}", tmp_path.display()))?;
			tmp.write_all(&bytes).chain_err(|| "writing metadata")?;
			tmp.sync_all().chain_err(|| "fsyncing metadata")?;
		}
		fs::rename(&tmp_path, Self::meta_path(&self.dir)).chain_err(|| "installing new metadata")?;
		Ok(())
	}

	fn replay(file: &mut File) -> Result<(Vec<LogEntry>, Vec<u64>)> {
		file.seek(SeekFrom::Start(0)).chain_err(|| "seeking to start of log")?;
		let mut entries = Vec::new();
		let mut offsets = Vec::new();
		let mut pos: u64 = 0;

		loop {
			offsets.push(pos);
			let mut header = [0u8; RECORD_HEADER_LEN];
			match file.read_exact(&mut header) {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
					offsets.pop();
					break;
				}
				Err(e) => return Err(e).chain_err(|| "reading log record header"),
			}
			let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
			let want_crc = u32::from_le_bytes(header[4..8].try_into().unwrap());

			let mut payload = vec![0u8; len];
			match file.read_exact(&mut payload) {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
					// Torn write at the tail from a crash mid-append: drop it
					// and reset the file length so the next append overwrites it.
					offsets.pop();
					file.set_len(pos).chain_err(|| "truncating torn log tail")?;
					break;
				}
				Err(e) => return Err(e).chain_err(|| "reading log record body"),
			}

			let got_crc = crc32c::crc32c(&payload);
			if got_crc != want_crc {
				offsets.pop();
				file.set_len(pos).chain_err(|| "truncating corrupt log tail")?;
				break;
			}

			let entry: LogEntry = rmp_serde::from_slice(&payload).chain_err(|| "decoding log entry")?;
			entries.push(entry);
			pos += (RECORD_HEADER_LEN + len) as u64;
		}

		file.seek(SeekFrom::End(0)).chain_err(|| "seeking to end of log")?;
		Ok((entries, offsets))
	}

	pub fn current_term(&self) -> Term {
		self.meta.current_term
	}

	pub fn voted_for(&self) -> Option<&NodeId> {
		self.meta.voted_for.as_ref()
	}

	/// Durably persists term/vote before returning. The Machine must not act
	/// on the new term (e.g. grant a vote) until this call completes.
	pub fn set_meta(&mut self, current_term: Term, voted_for: Option<NodeId>) -> Result<()> {
		self.meta = Meta { current_term, voted_for };
		self.write_meta()
	}

	pub fn entries(&self) -> &[LogEntry] {
		&self.entries
	}

	pub fn last_index(&self) -> LogIndex {
		self.entries.len() as LogIndex
	}

	/// Durably appends `new_entries`, fsyncing before returning. A reply that
	/// depends on these entries being durable (e.g. AppendEntriesReply with
	/// `reject: false`) must wait for this to complete.
	pub fn append(&mut self, new_entries: &[LogEntry]) -> Result<()> {
		if new_entries.is_empty() {
			return Ok(());
		}
		for entry in new_entries {
			let payload = rmp_serde::to_vec(entry).chain_err(|| "encoding log entry")?;
			let crc = crc32c::crc32c(&payload);
			let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
			record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
			record.extend_from_slice(&crc.to_le_bytes());
			record.extend_from_slice(&payload);

			let offset = self.log_file.stream_position().chain_err(|| "reading log position")?;
			self.log_file.write_all(&record).chain_err(|| "appending log record")?;
			self.offsets.push(offset);
			self.entries.push(entry.clone());
		}
		self.log_file.sync_all().chain_err(|| "fsyncing log")?;
		Ok(())
	}

	/// Truncates the log so that `last_index() == new_last_index` afterwards.
	/// `new_last_index` must not exceed the current last index.
	pub fn rollback(&mut self, new_last_index: LogIndex) -> Result<()> {
		let keep = new_last_index as usize;
		if keep > self.entries.len() {
			return Err(format!(
				"rollback target {} is beyond current last index {}",
				new_last_index,
				self.entries.len()
			)
			.into());
		}
		let byte_len = self.offsets[keep];
		self.log_file.set_len(byte_len).chain_err(|| "truncating log")?;
		self.log_file.sync_all().chain_err(|| "fsyncing truncated log")?;
		self.log_file.seek(SeekFrom::End(0)).chain_err(|| "seeking to end of log")?;
		self.offsets.truncate(keep + 1);
		self.entries.truncate(keep);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protos::LogEntryData;

	fn entry(term: Term) -> LogEntry {
		LogEntry { term, data: LogEntryData::Noop }
	}

	#[test]
	fn round_trips_entries_and_meta_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		{
			let mut storage = Storage::open(dir.path()).unwrap();
			storage.set_meta(3, Some("node2".to_string())).unwrap();
			storage.append(&[entry(1), entry(1), entry(2)]).unwrap();
		}
		let storage = Storage::open(dir.path()).unwrap();
		assert_eq!(storage.current_term(), 3);
		assert_eq!(storage.voted_for(), Some(&"node2".to_string()));
		assert_eq!(storage.last_index(), 3);
		assert_eq!(storage.entries()[2].term, 2);
	}

	#[test]
	fn rollback_truncates_tail() {
		let dir = tempfile::tempdir().unwrap();
		let mut storage = Storage::open(dir.path()).unwrap();
		storage.append(&[entry(1), entry(1), entry(2), entry(2)]).unwrap();
		storage.rollback(2).unwrap();
		assert_eq!(storage.last_index(), 2);
		storage.append(&[entry(3)]).unwrap();
		assert_eq!(storage.entries().iter().map(|e| e.term).collect::<Vec<_>>(), vec![1, 1, 3]);

		drop(storage);
		let reopened = Storage::open(dir.path()).unwrap();
		assert_eq!(reopened.entries().iter().map(|e| e.term).collect::<Vec<_>>(), vec![1, 1, 3]);
	}

	#[test]
	fn tolerates_torn_write_at_tail() {
		let dir = tempfile::tempdir().unwrap();
		{
			let mut storage = Storage::open(dir.path()).unwrap();
			storage.append(&[entry(1), entry(1)]).unwrap();
		}
		// Simulate a crash mid-append: append a few garbage bytes after the
		// last valid record.
		{
			let path = dir.path().join("log");
			let mut f = OpenOptions::new().append(true).open(&path).unwrap();
			f.write_all(&[1, 2, 3]).unwrap();
		}
		let storage = Storage::open(dir.path()).unwrap();
		assert_eq!(storage.last_index(), 2);
		// The torn bytes must have been trimmed so future appends aren't corrupt.
		let mut storage = storage;
		storage.append(&[entry(2)]).unwrap();
		assert_eq!(storage.last_index(), 3);
	}
}
