//! File-backed append-only log.
//!
//! Layout of `edits.log`:
//!
//! ```text
//! MAGIC (4) | FORMAT_VERSION (1) | schema version (u32 LE)
//! frame*    where frame = len (u32 LE) | MessagePack batch | CRC32 (u32 LE)
//! ```
//!
//! Each committed [`WriteBatch`] is one frame, so a torn write loses the whole
//! batch. Replay stops at the first frame that fails its checksum and the
//! tail is truncated.

use super::backend::{StorageBackend, WriteBatch, WriteOp};
use super::index::EditIndex;
use super::migrations::CURRENT_SCHEMA_VERSION;
use crate::error::{HistoryError, Result};
use crate::manifest::Manifest;
use crate::types::{EditKey, EditRecord, NoteId, Timestamp};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOG_MAGIC: &[u8; 4] = b"EDL\0";

const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: u64 = 9;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

const LOG_FILE: &str = "edits.log";
const LOCK_FILE: &str = "LOCK";

#[derive(Serialize, Deserialize)]
struct Frame {
    ops: Vec<WriteOp>,
}

struct OpenLog {
    writer: BufWriter<File>,
    schema_version: u32,
    _lock: File,
}

/// Durable backend storing every batch in a single log file.
pub struct LogBackend {
    dir: PathBuf,
    create_if_missing: bool,
    state: Mutex<Option<OpenLog>>,
    index: RwLock<EditIndex>,
}

impl LogBackend {
    pub fn new(dir: impl AsRef<Path>, create_if_missing: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            create_if_missing,
            state: Mutex::new(None),
            index: RwLock::new(EditIndex::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn acquire_lock(&self) -> Result<File> {
        let lock_file = File::create(self.dir.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            HistoryError::Concurrency(format!(
                "history store at {} is locked by another process",
                self.dir.display()
            ))
        })?;
        Ok(lock_file)
    }

    /// Rewrite the log from the live index, dropping overwritten frames.
    pub fn compact(&self) -> Result<()> {
        let version = self.schema_version()?;
        let records: Vec<EditRecord> = self.index.read().records().cloned().collect();
        self.rewrite(records, version)
    }

    fn write_header(file: &mut File, schema_version: u32) -> Result<()> {
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.write_all(&schema_version.to_le_bytes())?;
        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<u32> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(HistoryError::Corruption("invalid log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(HistoryError::Corruption(format!(
                "unsupported log format version: {}",
                version[0]
            )));
        }

        let mut schema = [0u8; 4];
        reader.read_exact(&mut schema)?;
        Ok(u32::from_le_bytes(schema))
    }

    fn write_frame(writer: &mut impl Write, frame: &Frame) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(frame)?;
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        Ok(())
    }

    /// Next frame, `Ok(None)` at a clean end of file.
    fn read_frame(reader: &mut impl Read) -> Result<Option<Frame>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(HistoryError::Corruption("log frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum = [0u8; 4];
        reader.read_exact(&mut checksum)?;
        if u32::from_le_bytes(checksum) != crc32fast::hash(&encoded) {
            return Err(HistoryError::Corruption("log frame checksum mismatch".into()));
        }

        Ok(Some(rmp_serde::from_slice(&encoded)?))
    }

    /// Replay every intact frame into a fresh index. Returns the schema
    /// version, the index and the offset just past the last good frame.
    fn replay(path: &Path) -> Result<(u32, EditIndex, u64)> {
        let mut reader = BufReader::new(File::open(path)?);
        let schema_version = Self::read_header(&mut reader)?;

        let mut index = EditIndex::new();
        let mut good_end = HEADER_LEN;
        let mut frames = 0usize;
        loop {
            match Self::read_frame(&mut reader) {
                Ok(Some(frame)) => {
                    index.apply(&WriteBatch::from_ops(frame.ops));
                    good_end = reader.stream_position()?;
                    frames += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, offset = good_end, "truncating log at damaged frame");
                    break;
                }
            }
        }
        debug!(frames, records = index.len(), "replayed edit log");
        Ok((schema_version, index, good_end))
    }

    fn commit_locked(&self, slot: &mut Option<OpenLog>, mut batch: WriteBatch) -> Result<()> {
        let open = slot.as_mut().ok_or(HistoryError::ConnectionClosed)?;
        let mut index = self.index.write();
        index.assign_sequences(&mut batch);

        let frame = Frame {
            ops: batch.ops().to_vec(),
        };
        let start = open.writer.get_ref().metadata()?.len();
        if let Err(e) = Self::append_frame(&mut open.writer, &frame) {
            if let Err(undo) = self.truncate_to(open, start) {
                warn!(error = %undo, offset = start, "cannot drop partial frame, closing store");
                *slot = None;
                *index = EditIndex::new();
            }
            return Err(e);
        }

        index.apply(&batch);
        Ok(())
    }

    fn append_frame(writer: &mut BufWriter<File>, frame: &Frame) -> Result<()> {
        Self::write_frame(writer, frame)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Cut the log back to `len` after a failed append so the next frame
    /// follows the last complete one.
    fn truncate_to(&self, open: &mut OpenLog, len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(self.log_path())?;
        let stale = std::mem::replace(&mut open.writer, BufWriter::new(file));
        // Buffered bytes of the failed frame are discarded, never flushed.
        let (_file, _unwritten) = stale.into_parts();

        let file = open.writer.get_mut();
        file.set_len(len)?;
        file.seek(SeekFrom::Start(len))?;
        file.sync_data()?;
        warn!(offset = len, "dropped partially written log frame");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().is_none() {
            return Err(HistoryError::ConnectionClosed);
        }
        Ok(())
    }
}

impl StorageBackend for LogBackend {
    fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        if !self.dir.exists() {
            if !self.create_if_missing {
                return Err(HistoryError::NotFound(format!(
                    "history store at {}",
                    self.dir.display()
                )));
            }
            fs::create_dir_all(&self.dir)?;
        }

        let lock = self.acquire_lock()?;
        let log_path = self.log_path();

        let schema_version = if log_path.exists() {
            let (version, index, good_end) = Self::replay(&log_path)?;
            let file = OpenOptions::new().write(true).open(&log_path)?;
            if file.metadata()?.len() > good_end {
                file.set_len(good_end)?;
                file.sync_all()?;
            }
            *self.index.write() = index;
            version
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&log_path)?;
            Self::write_header(&mut file, CURRENT_SCHEMA_VERSION)?;
            file.sync_all()?;
            *self.index.write() = EditIndex::new();
            CURRENT_SCHEMA_VERSION
        };

        let mut file = OpenOptions::new().write(true).open(&log_path)?;
        file.seek(SeekFrom::End(0))?;

        info!(path = %self.dir.display(), schema_version, "opened history store");
        *state = Some(OpenLog {
            writer: BufWriter::new(file),
            schema_version,
            _lock: lock,
        });
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if let Some(mut open) = state.take() {
            if let Err(e) = open.writer.flush() {
                warn!(error = %e, "failed to flush edit log on close");
            }
            *self.index.write() = EditIndex::new();
            info!(path = %self.dir.display(), "closed history store");
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    fn schema_version(&self) -> Result<u32> {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.schema_version)
            .ok_or(HistoryError::ConnectionClosed)
    }

    fn rewrite(&self, records: Vec<EditRecord>, version: u32) -> Result<()> {
        let mut state = self.state.lock();
        let open = state.as_mut().ok_or(HistoryError::ConnectionClosed)?;
        let mut index = self.index.write();

        let mut ops: Vec<WriteOp> = index
            .manifests()
            .map(|m| WriteOp::PutManifest(m.clone()))
            .collect();
        ops.extend(records.into_iter().map(WriteOp::PutEdit));

        let tmp_path = self.dir.join(format!("{LOG_FILE}.tmp"));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            Self::write_header(&mut file, version)?;
            let mut writer = BufWriter::new(file);
            Self::write_frame(&mut writer, &Frame { ops: ops.clone() })?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        open.writer.flush()?;
        fs::rename(&tmp_path, self.log_path())?;

        let mut file = OpenOptions::new().write(true).open(self.log_path())?;
        file.seek(SeekFrom::End(0))?;
        open.writer = BufWriter::new(file);
        open.schema_version = version;

        let mut rebuilt = EditIndex::new();
        rebuilt.apply(&WriteBatch::from_ops(ops));
        *index = rebuilt;

        info!(version, records = index.len(), "rewrote edit log");
        Ok(())
    }

    fn get(&self, key: &EditKey) -> Result<Option<EditRecord>> {
        self.ensure_open()?;
        Ok(self.index.read().get(key).cloned())
    }

    fn range(&self, note_id: &NoteId, branch: &str) -> Result<Vec<EditRecord>> {
        self.ensure_open()?;
        Ok(self.index.read().range(note_id, branch))
    }

    fn scan_note(&self, note_id: &NoteId) -> Result<Vec<EditRecord>> {
        self.ensure_open()?;
        Ok(self.index.read().scan_note(note_id))
    }

    fn scan_created_since(&self, since: Timestamp) -> Result<Vec<EditRecord>> {
        self.ensure_open()?;
        Ok(self.index.read().scan_created_since(since))
    }

    fn scan_all(&self) -> Result<Vec<EditRecord>> {
        self.ensure_open()?;
        Ok(self.index.read().records().cloned().collect())
    }

    fn get_manifest(&self, note_id: &NoteId) -> Result<Option<Manifest>> {
        self.ensure_open()?;
        Ok(self.index.read().manifest(note_id).cloned())
    }

    fn list_manifests(&self) -> Result<Vec<NoteId>> {
        self.ensure_open()?;
        Ok(self
            .index
            .read()
            .manifests()
            .map(|m| m.note_id.clone())
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.commit_locked(&mut state, batch)
    }

    fn delete_matching(
        &self,
        predicate: &dyn Fn(&EditRecord) -> bool,
        limit: usize,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        if state.is_none() {
            return Err(HistoryError::ConnectionClosed);
        }

        let keys = self.index.read().matching_keys(predicate, limit);
        if keys.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for key in &keys {
            batch.delete_edit(key.clone());
        }
        self.commit_locked(&mut state, batch)?;
        Ok(keys.len())
    }

    fn size_bytes(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(fs::metadata(self.log_path())?.len())
    }
}

impl Drop for LogBackend {
    fn drop(&mut self) {
        self.close();
    }
}
