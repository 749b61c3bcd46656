//! File-backed task store.
//!
//! The store image is one JSON document. Every call takes an advisory lock
//! on a sibling `.lock` file, shared for reads and exclusive for writes,
//! re-reads the document under that lock and, for writes, replaces it via a
//! temporary file renamed over the target. Several processes can therefore
//! share one store file and `compare_and_set` stays atomic across them. A
//! write whose save fails leaves the file as it was.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fd_lock::RwLock;

use super::{CasConflict, MemoryStore, RunState, TaskStore};
use crate::core::{
    ConflictRecord, LedgerEntry, Message, Task, TaskId, TaskPatch, TaskSnapshot, Worker, WorkerId,
};
use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};

pub struct FileStore {
    path: PathBuf,
    lock: Mutex<RwLock<File>>,
}

impl FileStore {
    /// Open the store at `path`, creating an empty one if the file is missing.
    ///
    /// The file is parsed once here so a corrupt store fails on open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        clog_debug!("FileStore::open path={}", path.display());
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(&path))?;
        let store = Self {
            path,
            lock: Mutex::new(RwLock::new(lock_file)),
        };
        let (tasks, workers) = store.shared(|memory| {
            Ok((memory.list_tasks()?.len(), memory.list_workers()?.len()))
        })?;
        clog_debug!("FileStore loaded {} task(s), {} worker(s)", tasks, workers);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the current image under a shared lock.
    fn shared<T>(&self, f: impl FnOnce(&MemoryStore) -> Result<T>) -> Result<T> {
        let mut lock = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = lock.read()?;
        f(&self.load()?)
    }

    /// Run `f` against the current image under an exclusive lock and write
    /// the result back.
    ///
    /// A failed mutation is not saved, except a stale write: its contention
    /// entry is part of the record.
    fn exclusive<T>(&self, f: impl FnOnce(&MemoryStore) -> Result<T>) -> Result<T> {
        let mut lock = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = lock.write()?;
        let memory = self.load()?;
        let result = f(&memory);
        if matches!(result, Ok(_) | Err(Error::StaleWrite { .. })) {
            self.save(&memory)?;
        }
        result
    }

    fn load(&self) -> Result<MemoryStore> {
        match fs::read_to_string(&self.path) {
            Ok(text) => MemoryStore::import(serde_json::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(MemoryStore::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, memory: &MemoryStore) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&memory.export())?).map_err(|e| {
            clog_warn!("FileStore: write to {} failed: {}", tmp.display(), e);
            Error::Io(e)
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            clog_warn!("FileStore: rename to {} failed: {}", self.path.display(), e);
            Error::Io(e)
        })
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

impl TaskStore for FileStore {
    fn create(&self, task: Task) -> Result<Task> {
        self.exclusive(|m| m.create(task))
    }

    fn read(&self, id: &TaskId) -> Result<Task> {
        self.shared(|m| m.read(id))
    }

    fn compare_and_set(
        &self,
        id: &TaskId,
        expected: TaskSnapshot,
        next: TaskSnapshot,
        patch: TaskPatch,
    ) -> Result<Task> {
        self.exclusive(|m| m.compare_and_set(id, expected, next, patch))
    }

    fn list_tasks(&self) -> Result<Vec<Task>> {
        self.shared(|m| m.list_tasks())
    }

    fn cas_conflicts(&self, id: &TaskId) -> Result<Vec<CasConflict>> {
        self.shared(|m| m.cas_conflicts(id))
    }

    fn put_worker(&self, worker: Worker) -> Result<()> {
        self.exclusive(|m| m.put_worker(worker))
    }

    fn read_worker(&self, id: &WorkerId) -> Result<Worker> {
        self.shared(|m| m.read_worker(id))
    }

    fn update_worker(&self, id: &WorkerId, f: &mut dyn FnMut(&mut Worker)) -> Result<Worker> {
        self.exclusive(|m| m.update_worker(id, f))
    }

    fn list_workers(&self) -> Result<Vec<Worker>> {
        self.shared(|m| m.list_workers())
    }

    fn append_message(&self, message: Message) -> Result<Message> {
        self.exclusive(|m| m.append_message(message))
    }

    fn messages(&self) -> Result<Vec<Message>> {
        self.shared(|m| m.messages())
    }

    fn append_ledger(&self, entry: LedgerEntry) -> Result<LedgerEntry> {
        self.exclusive(|m| m.append_ledger(entry))
    }

    fn ledger(&self) -> Result<Vec<LedgerEntry>> {
        self.shared(|m| m.ledger())
    }

    fn append_conflict(&self, record: ConflictRecord) -> Result<ConflictRecord> {
        self.exclusive(|m| m.append_conflict(record))
    }

    fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.shared(|m| m.conflicts())
    }

    fn run_state(&self) -> Result<RunState> {
        self.shared(|m| m.run_state())
    }

    fn put_run_state(&self, state: RunState) -> Result<()> {
        self.exclusive(|m| m.put_run_state(state))
    }
}
