//! Filesystem-backed result store.
//!
//! Layout per run under `<root>/runs/`:
//!
//! - `<run_id>.json`: pretty-printed [`ResultSet`] snapshot, replaced
//!   atomically (temp file in the same directory, then rename).
//! - `<run_id>.jsonl`: journal of terminal outcomes recorded since the last
//!   snapshot, one [`PredictionOutcome`] per line.
//!
//! A terminal upsert appends one line, so its cost does not depend on the
//! size of the run. `flush` and `persist` fold the journal into a new
//! snapshot and remove it. Loading replays the journal over the snapshot.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::outcome::PredictionOutcome;
use crate::result_set::{Provenance, ResultSet, UpsertDisposition};
use crate::storage_traits::{ResultStore, RunId, StorageResult};

const SNAPSHOT_EXT: &str = "json";
const JOURNAL_EXT: &str = "jsonl";

#[derive(Debug)]
struct CachedRun {
    set: ResultSet,
    /// Non-terminal changes held only in memory.
    dirty: bool,
    /// Journal lines written since the last snapshot.
    journaled: usize,
}

impl CachedRun {
    fn needs_compaction(&self) -> bool {
        self.dirty || self.journaled > 0
    }
}

/// JSON-document result store with a write-through journal for terminal outcomes.
///
/// Terminal upserts are appended to the run's journal before `upsert`
/// returns; retry placeholders are buffered and written on `flush`/`persist`.
#[derive(Debug)]
pub struct FsResultStore {
    runs_dir: PathBuf,
    cache: Mutex<HashMap<RunId, CachedRun>>,
}

impl FsResultStore {
    /// Create a store rooted at `root`. Creates `root/runs/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let runs_dir = root.as_ref().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self {
            runs_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the snapshot document holding `run_id`.
    pub fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.path_with(run_id, SNAPSHOT_EXT)
    }

    /// Path of the journal of terminal outcomes not yet in the snapshot.
    pub fn journal_path(&self, run_id: &RunId) -> PathBuf {
        self.path_with(run_id, JOURNAL_EXT)
    }

    fn path_with(&self, run_id: &RunId, ext: &str) -> PathBuf {
        self.runs_dir
            .join(format!("{}.{ext}", encode_file_stem(run_id.as_str())))
    }

    /// Read a result set document from an arbitrary path.
    pub fn read_document(path: &Path) -> StorageResult<ResultSet> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomically write a result set document to an arbitrary path.
    pub fn write_document(path: &Path, set: &ResultSet) -> StorageResult<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_vec_pretty(set)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&content)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Snapshot plus replayed journal, or `None` when neither exists.
    fn read_from_disk(&self, run_id: &RunId) -> StorageResult<Option<(ResultSet, usize)>> {
        let snapshot = self.run_path(run_id);
        let set = if snapshot.exists() {
            let set = Self::read_document(&snapshot)?;
            if set.run_id() != run_id {
                return Err(StorageError::RunMismatch {
                    expected: run_id.to_string(),
                    found: set.run_id().to_string(),
                });
            }
            Some(set)
        } else {
            None
        };

        let journal = self.journal_path(run_id);
        let content = match fs::read_to_string(&journal) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(set.map(|s| (s, 0))),
            Err(e) => return Err(e.into()),
        };

        let mut set = set.unwrap_or_else(|| ResultSet::new(Provenance::empty(run_id.clone())));
        let mut replayed = 0;
        let mut lines = content.split('\n').peekable();
        while let Some(line) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PredictionOutcome>(line) {
                Ok(outcome) => {
                    set.upsert(outcome);
                    replayed += 1;
                }
                // Only the final, unterminated line can be a torn append.
                Err(e) if lines.peek().is_none() => {
                    warn!(run_id = %run_id, error = %e, "ignoring torn journal tail");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some((set, replayed)))
    }

    fn lock_cache(&self) -> StorageResult<MutexGuard<'_, HashMap<RunId, CachedRun>>> {
        self.cache
            .lock()
            .map_err(|_| StorageError::Backend("result cache lock poisoned".to_string()))
    }

    fn append_journal(&self, run_id: &RunId, outcome: &PredictionOutcome) -> StorageResult<()> {
        let mut line = serde_json::to_vec(outcome)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(run_id))?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Write `set` as the run's snapshot and drop the journal it now contains.
    fn compact(&self, set: &ResultSet) -> StorageResult<()> {
        let run_id = set.run_id();
        Self::write_document(&self.run_path(run_id), set)?;
        match fs::remove_file(self.journal_path(run_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(run_id = %run_id, outcomes = set.len(), "result set snapshot written");
        Ok(())
    }

    /// Fetch the cached run, loading it from disk (or creating it) on first use.
    fn cached<'a>(
        &self,
        cache: &'a mut HashMap<RunId, CachedRun>,
        run_id: &RunId,
    ) -> StorageResult<&'a mut CachedRun> {
        if !cache.contains_key(run_id) {
            let (set, journaled) = self
                .read_from_disk(run_id)?
                .unwrap_or_else(|| (ResultSet::new(Provenance::empty(run_id.clone())), 0));
            cache.insert(
                run_id.clone(),
                CachedRun {
                    set,
                    dirty: false,
                    journaled,
                },
            );
        }
        cache
            .get_mut(run_id)
            .ok_or_else(|| StorageError::Backend(format!("run {run_id} missing from cache")))
    }
}

#[async_trait]
impl ResultStore for FsResultStore {
    async fn load(&self, run_id: &RunId) -> StorageResult<Option<ResultSet>> {
        let cache = self.lock_cache()?;
        if let Some(run) = cache.get(run_id) {
            return Ok(Some(run.set.clone()));
        }
        drop(cache);
        Ok(self.read_from_disk(run_id)?.map(|(set, _)| set))
    }

    async fn upsert(
        &self,
        run_id: &RunId,
        outcome: PredictionOutcome,
    ) -> StorageResult<UpsertDisposition> {
        let mut cache = self.lock_cache()?;
        let run = self.cached(&mut cache, run_id)?;
        if !run.set.accepts(&outcome) {
            return Ok(UpsertDisposition::Ignored);
        }
        // The cache only changes once the outcome is durable.
        if outcome.is_terminal() {
            self.append_journal(run_id, &outcome)?;
            run.journaled += 1;
        } else {
            run.dirty = true;
        }
        Ok(run.set.upsert(outcome))
    }

    async fn persist(&self, set: &ResultSet) -> StorageResult<()> {
        let mut cache = self.lock_cache()?;
        let run = self.cached(&mut cache, set.run_id())?;
        let merged = ResultSet::merge(&run.set, set);
        self.compact(&merged)?;
        run.set = merged;
        run.dirty = false;
        run.journaled = 0;
        Ok(())
    }

    async fn flush(&self, run_id: &RunId) -> StorageResult<()> {
        let mut cache = self.lock_cache()?;
        if let Some(run) = cache.get_mut(run_id) {
            if run.needs_compaction() {
                self.compact(&run.set)?;
                run.dirty = false;
                run.journaled = 0;
            }
        }
        Ok(())
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunId>> {
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if ext != Some(SNAPSHOT_EXT) && ext != Some(JOURNAL_EXT) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_file_stem)
            {
                ids.insert(RunId(id));
            }
        }
        let cache = self.lock_cache()?;
        ids.extend(cache.keys().cloned());
        Ok(ids.into_iter().collect())
    }
}

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')
}

/// Percent-encode every byte outside `[A-Za-z0-9._-]`.
fn encode_file_stem(run_id: &str) -> String {
    let mut out = String::with_capacity(run_id.len());
    for b in run_id.bytes() {
        if is_plain(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_file_stem(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
