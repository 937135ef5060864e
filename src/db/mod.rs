// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod iter;

pub use iter::DbIterator;

use crate::{
    batch::WriteBatch,
    db::iter::LevelIter,
    file::{
        log_file_path, parse_file_name, table_file_path, DbLock, FileType, CURRENT_FILE,
    },
    info_log::InfoLog,
    key::{lookup_key, InternalKey},
    memtable::{Memtable, MemtableGet},
    merge::{BoxedIterator, MergeIterator},
    snapshot::{Snapshot, SnapshotList},
    stop_signal::StopSignal,
    table::TableBuilder,
    table_cache::TableCache,
    value::{MAX_SEQNO, VALUE_TYPE_FOR_SEEK},
    version::{set as version_set, FileId, FileMetaData, GetOutcome, VersionEdit, VersionSet},
    compaction::Compaction,
    Config, HashSet, ReadOptions, SeqNo, UserKey, UserValue, ValueType, WriteOptions,
};
use std::{
    collections::VecDeque,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
};

/// Writers coalescing more than this many bytes stop growing the group.
const MAX_WRITE_GROUP_SIZE: usize = 1 << 20;

/// Small writes get a smaller coalescing bound, so a tiny sync write
/// is not taxed with a megabyte of followers.
const SMALL_WRITE_SIZE: usize = 128 << 10;

/// A queued write waiting for its turn (or for a leader to commit it)
struct WriterTicket {
    batch: Mutex<Option<WriteBatch>>,
    sync: bool,
    result: Mutex<Option<Result<(), Arc<crate::Error>>>>,
}

/// An in-flight manual compaction request
struct ManualCompaction {
    level: usize,
    done: bool,

    /// Remaining range; `begin` moves forward as chunks finish
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

/// State guarded by the engine lock
struct DbState {
    mem: Arc<Memtable>,
    imm: Option<Arc<Memtable>>,

    /// Write-ahead log of the active memtable.
    ///
    /// Taken out by the write leader while it appends without
    /// holding the lock; nobody else may rotate it meanwhile.
    wal: Option<crate::wal::Writer>,
    wal_number: FileId,

    versions: VersionSet,

    writers: VecDeque<Arc<WriterTicket>>,

    background_scheduled: bool,
    background_error: Option<Arc<crate::Error>>,
    manual: Option<ManualCompaction>,

    /// Files being written right now, protected from the GC sweep
    pending_outputs: HashSet<FileId>,

    shutting_down: bool,
}

pub(crate) struct DbInner {
    pub(crate) config: Config,
    path: PathBuf,

    pub(crate) table_cache: Arc<TableCache>,
    snapshots: Arc<SnapshotList>,

    state: Mutex<DbState>,

    /// Wakes the background worker
    work_cv: Condvar,

    /// Signals completion of background work (flushes, compactions)
    done_cv: Condvar,

    /// Signals changes of the writer queue
    writer_cv: Condvar,

    /// Fast path for the compaction loop to notice a pending flush
    has_imm: AtomicBool,

    stop: StopSignal,
    info_log: InfoLog,

    _lock: DbLock,
}

/// An embedded, persistent, ordered key-value store
///
/// All operations are thread-safe; writes are serialized through a
/// queue with group commit, reads run lock-free against immutable
/// state.
pub struct Db {
    inner: Arc<DbInner>,
    background: Option<std::thread::JoinHandle<()>>,
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.stop.send();

        {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut state = self.inner.state.lock().expect("lock is poisoned");
            state.shutting_down = true;

            // Writers cannot make progress anymore
            if let Some(wal) = &mut state.wal {
                let _ = wal.flush();
            }
        }

        self.inner.work_cv.notify_all();
        self.inner.done_cv.notify_all();

        if let Some(handle) = self.background.take() {
            let _ = handle.join();
        }
    }
}

impl Db {
    /// Opens (and possibly creates) the database in the given folder.
    pub fn open(config: Config) -> crate::Result<Self> {
        let path = config.path.clone();

        if config.create_if_missing {
            std::fs::create_dir_all(&path)?;
        } else if !path.is_dir() {
            return Err(crate::Error::InvalidArgument(format!(
                "database folder {} does not exist",
                path.display(),
            )));
        }

        let lock = DbLock::acquire(&path)?;
        let info_log = InfoLog::open(&path);

        let current_exists = path.join(CURRENT_FILE).exists();

        if current_exists {
            if config.error_if_exists {
                return Err(crate::Error::InvalidArgument(format!(
                    "database {} already exists",
                    path.display(),
                )));
            }
        } else {
            if !config.create_if_missing {
                return Err(crate::Error::InvalidArgument(format!(
                    "database {} does not exist",
                    path.display(),
                )));
            }

            info_log.write(&format!("creating new database at {}", path.display()));
            version_set::create_initial(&path)?;
        }

        let table_cache = Arc::new(TableCache::new(path.clone(), config.clone()));

        let mut versions = VersionSet::new(path.clone(), config.clone());
        versions.recover()?;

        // Replay write-ahead logs that are newer than the manifest state
        let min_log = versions.log_number;

        let mut log_numbers: Vec<FileId> = std::fs::read_dir(&path)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name();
                let (file_type, number) = parse_file_name(&name.to_string_lossy())?;

                (file_type == FileType::Log && number >= min_log).then_some(number)
            })
            .collect();
        log_numbers.sort_unstable();

        let mut edit = VersionEdit::default();
        let mut max_sequence = versions.last_sequence();
        let mut mem = Memtable::new();

        for log_number in &log_numbers {
            versions.mark_file_number_used(*log_number);

            replay_wal(
                &path,
                *log_number,
                &config,
                &info_log,
                &mut versions,
                &table_cache,
                &mut mem,
                &mut edit,
                &mut max_sequence,
            )?;
        }

        if !mem.is_empty() {
            write_recovery_table(&path, &config, &mut versions, &table_cache, &mem, &mut edit)?;
            mem = Memtable::new();
        }

        // Fresh log for the new lifetime
        let wal_number = versions.new_file_number();
        let wal = crate::wal::Writer::create(log_file_path(&path, wal_number))?;

        edit.set_log_number(wal_number);
        versions.set_last_sequence(max_sequence);
        versions.log_and_apply(edit)?;

        info_log.write(&format!(
            "recovered to sequence {max_sequence}, log {wal_number}, {}",
            versions.current().level_summary(),
        ));

        let inner = Arc::new(DbInner {
            config,
            path,
            table_cache,
            snapshots: Arc::new(SnapshotList::default()),
            state: Mutex::new(DbState {
                mem: Arc::new(mem),
                imm: None,
                wal: Some(wal),
                wal_number,
                versions,
                writers: VecDeque::new(),
                background_scheduled: false,
                background_error: None,
                manual: None,
                pending_outputs: HashSet::default(),
                shutting_down: false,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            writer_cv: Condvar::new(),
            has_imm: AtomicBool::new(false),
            stop: StopSignal::default(),
            info_log,
            _lock: lock,
        });

        {
            let mut state = inner.lock_state();
            inner.remove_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
        }

        let background = {
            let inner = inner.clone();

            std::thread::Builder::new()
                .name("kv-compaction".into())
                .spawn(move || inner.background_thread())?
        };

        Ok(Self {
            inner,
            background: Some(background),
        })
    }

    /// Inserts a key-value pair.
    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        opts: &WriteOptions,
    ) -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, opts)
    }

    /// Removes a key. Missing keys are not an error.
    pub fn delete<K: AsRef<[u8]>>(&self, key: K, opts: &WriteOptions) -> crate::Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, opts)
    }

    /// Applies an atomic batch of writes.
    pub fn write(&self, batch: WriteBatch, opts: &WriteOptions) -> crate::Result<()> {
        self.inner.write(batch, opts)
    }

    /// Point lookup.
    pub fn get<K: AsRef<[u8]>>(
        &self,
        key: K,
        opts: &ReadOptions,
    ) -> crate::Result<Option<UserValue>> {
        self.inner.get(key.as_ref(), opts)
    }

    /// Takes a consistent point-in-time snapshot.
    ///
    /// The snapshot is released when the last clone is dropped.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let seqno = self.inner.lock_state().versions.last_sequence();
        self.inner.snapshots.acquire(seqno)
    }

    /// Iterates the whole database in key order.
    pub fn iter(&self, opts: &ReadOptions) -> crate::Result<DbIterator> {
        self.inner
            .range_iter((Bound::Unbounded, Bound::Unbounded), opts)
    }

    /// Iterates a user-key range in key order.
    pub fn range<K: AsRef<[u8]>, R: std::ops::RangeBounds<K>>(
        &self,
        range: R,
        opts: &ReadOptions,
    ) -> crate::Result<DbIterator> {
        let lo = match range.start_bound() {
            Bound::Included(key) => Bound::Included(UserKey::from(key.as_ref())),
            Bound::Excluded(key) => Bound::Excluded(UserKey::from(key.as_ref())),
            Bound::Unbounded => Bound::Unbounded,
        };

        let hi = match range.end_bound() {
            Bound::Included(key) => Bound::Included(UserKey::from(key.as_ref())),
            Bound::Excluded(key) => Bound::Excluded(UserKey::from(key.as_ref())),
            Bound::Unbounded => Bound::Unbounded,
        };

        self.inner.range_iter((lo, hi), opts)
    }

    /// Compacts the given user-key range down the levels.
    ///
    /// `None` bounds mean "from the start" / "to the end". Blocks
    /// until the range has been merged as deep as it reaches.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> crate::Result<()> {
        self.inner.compact_range(begin, end)
    }

    /// Waits until no flush or compaction is pending or running.
    #[doc(hidden)]
    pub fn wait_for_background_work(&self) -> crate::Result<()> {
        let mut state = self.inner.lock_state();

        loop {
            if let Some(e) = &state.background_error {
                return Err(crate::Error::Background(e.clone()));
            }

            let busy = state.background_scheduled
                || state.imm.is_some()
                || state.versions.needs_compaction();

            if !busy {
                return Ok(());
            }

            self.inner.maybe_schedule_compaction(&mut state);

            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            {
                state = self
                    .inner
                    .done_cv
                    .wait(state)
                    .expect("lock is poisoned");
            }
        }
    }

    /// Number of table files at the given level.
    #[doc(hidden)]
    #[must_use]
    pub fn num_files_at_level(&self, level: usize) -> usize {
        self.inner.lock_state().versions.current().num_files(level)
    }

    /// Total bytes of the given level.
    #[doc(hidden)]
    #[must_use]
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.inner.lock_state().versions.current().level_bytes(level)
    }
}

/// Removes a database folder and the engine files inside it.
///
/// Foreign files are left alone, in which case the folder itself
/// remains as well.
pub fn destroy_db<P: AsRef<Path>>(path: P) -> crate::Result<()> {
    let path = path.as_ref();

    if !path.is_dir() {
        return Ok(());
    }

    // Hold the lock while deleting, so a live instance is not ripped apart
    let lock = DbLock::acquire(path)?;

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();

        let Some((file_type, _)) = parse_file_name(&name.to_string_lossy()) else {
            continue;
        };

        if file_type != FileType::Lock {
            std::fs::remove_file(entry.path())?;
        }
    }

    drop(lock);
    std::fs::remove_file(path.join(crate::file::LOCK_FILE))?;
    let _ = std::fs::remove_dir(path);

    Ok(())
}

impl DbInner {
    fn lock_state(&self) -> MutexGuard<'_, DbState> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.lock().expect("lock is poisoned")
    }

    fn wait_done<'a>(&self, state: MutexGuard<'a, DbState>) -> MutexGuard<'a, DbState> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.done_cv.wait(state).expect("lock is poisoned")
    }

    fn wait_writer<'a>(&self, state: MutexGuard<'a, DbState>) -> MutexGuard<'a, DbState> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.writer_cv.wait(state).expect("lock is poisoned")
    }

    fn record_background_error(&self, state: &mut DbState, error: crate::Error) {
        if state.background_error.is_none() {
            self.info_log
                .write(&format!("background error, database is read-only now: {error}"));

            state.background_error = Some(Arc::new(error));
            self.done_cv.notify_all();
            self.writer_cv.notify_all();
        }
    }

    /// Called by iterators when a read sample flagged a file.
    pub(crate) fn schedule_compaction(&self) {
        let mut state = self.lock_state();
        self.maybe_schedule_compaction(&mut state);
    }

    // ----------------------------------------------------------------
    // Write path

    fn write(&self, batch: WriteBatch, opts: &WriteOptions) -> crate::Result<()> {
        let ticket = Arc::new(WriterTicket {
            batch: Mutex::new(Some(batch)),
            sync: opts.sync,
            result: Mutex::new(None),
        });

        let mut state = self.lock_state();
        state.writers.push_back(ticket.clone());

        // Wait until the ticket is at the front (leader) or a leader
        // committed it as part of a group
        loop {
            if let Some(result) = ticket_result(&ticket) {
                return result.map_err(crate::Error::Background);
            }

            let is_front = state
                .writers
                .front()
                .is_some_and(|front| Arc::ptr_eq(front, &ticket));

            if is_front {
                break;
            }

            state = self.wait_writer(state);
        }

        // This ticket is the leader now
        self.write_as_leader(state, ticket.sync)
    }

    fn write_as_leader(
        &self,
        state: MutexGuard<'_, DbState>,
        leader_sync: bool,
    ) -> crate::Result<()> {
        let mut state = match self.make_room_for_write(state, false) {
            Ok(state) => state,
            Err((mut state, e)) => {
                // Only the leader itself is affected; followers get
                // their own turn
                state.writers.pop_front();
                self.writer_cv.notify_all();
                return Err(e);
            }
        };

        let (mut group, group_len, sync) = build_write_group(&mut state, leader_sync);

        let seqno = state.versions.last_sequence() + 1;
        group.set_sequence(seqno);
        let count = u64::from(group.len());

        // The sequence range is burned even if the write fails, since
        // the log record may be partially durable
        state.versions.set_last_sequence(seqno + count.max(1) - 1);

        // Only the leader writes to the log, so the lock can be
        // released during the append and fsync
        #[expect(clippy::expect_used, reason = "only the leader takes the log writer")]
        let mut wal = state.wal.take().expect("log writer must be present");
        let mem = state.mem.clone();
        drop(state);

        let mut io_result = wal.add_record(group.payload());

        if io_result.is_ok() && sync {
            io_result = wal.sync();
        }

        if io_result.is_ok() {
            group.apply_to(&mem);
        }

        let mut state = self.lock_state();
        state.wal = Some(wal);

        let result = match io_result {
            Ok(()) => Ok(()),
            Err(e) => {
                // A failed log write poisons the database: the record
                // may be partially durable, so nothing may be written
                // after it
                self.record_background_error(&mut state, e);

                #[expect(clippy::expect_used, reason = "error was just recorded")]
                Err(state
                    .background_error
                    .clone()
                    .expect("background error must be set"))
            }
        };

        if state.mem.size() > self.config.write_buffer_size {
            self.maybe_schedule_compaction(&mut state);
        }

        finish_tickets(&mut state, group_len, &result);
        self.writer_cv.notify_all();

        result.map_err(crate::Error::Background)
    }

    /// Ensures there is room in the memtable, applying back-pressure.
    ///
    /// May temporarily release the lock (slowdown sleep) or wait for
    /// background work (flush, level-0 pressure).
    fn make_room_for_write<'a>(
        &'a self,
        state: MutexGuard<'a, DbState>,
        force: bool,
    ) -> Result<MutexGuard<'a, DbState>, (MutexGuard<'a, DbState>, crate::Error)> {
        let mut state = state;
        let mut allow_delay = !force;

        loop {
            if let Some(e) = &state.background_error {
                let e = crate::Error::Background(e.clone());
                return Err((state, e));
            }

            let level0_files = state.versions.current().num_files(0);

            if allow_delay && level0_files >= self.config.l0_slowdown_writes_trigger {
                // Gentle back-pressure: give the compactor one
                // millisecond of air, once per write
                drop(state);
                std::thread::sleep(std::time::Duration::from_millis(1));
                allow_delay = false;
                state = self.lock_state();
                continue;
            }

            if !force && state.mem.size() <= self.config.write_buffer_size {
                return Ok(state);
            }

            if state.imm.is_some() {
                // The previous memtable is still being flushed
                self.maybe_schedule_compaction(&mut state);
                state = self.wait_done(state);
                continue;
            }

            if level0_files >= self.config.l0_stop_writes_trigger {
                self.info_log.write("too many level-0 files, stalling writes");
                self.maybe_schedule_compaction(&mut state);
                state = self.wait_done(state);
                continue;
            }

            match self.rotate_memtable(&mut state) {
                Ok(()) => return Ok(state),
                Err(e) => return Err((state, e)),
            }
        }
    }

    /// Seals the active memtable and switches to a fresh one with a
    /// fresh write-ahead log.
    fn rotate_memtable(&self, state: &mut DbState) -> crate::Result<()> {
        debug_assert!(state.imm.is_none());
        debug_assert!(state.wal.is_some(), "rotation during an in-flight write");

        let new_log_number = state.versions.new_file_number();

        let wal = match crate::wal::Writer::create(log_file_path(&self.path, new_log_number)) {
            Ok(wal) => wal,
            Err(e) => {
                // Keep file numbers dense if the filesystem refuses
                state.versions.reuse_file_number(new_log_number);
                return Err(e);
            }
        };

        state.wal = Some(wal);
        state.wal_number = new_log_number;

        let sealed = std::mem::replace(&mut state.mem, Arc::new(Memtable::new()));
        state.imm = Some(sealed);
        self.has_imm.store(true, Ordering::Release);

        self.maybe_schedule_compaction(state);

        Ok(())
    }

    // ----------------------------------------------------------------
    // Read path

    fn get(&self, key: &[u8], opts: &ReadOptions) -> crate::Result<Option<UserValue>> {
        let (mem, imm, version, seqno) = {
            let state = self.lock_state();

            let seqno = opts
                .snapshot
                .as_ref()
                .map_or_else(|| state.versions.last_sequence(), Snapshot::sequence);

            (
                state.mem.clone(),
                state.imm.clone(),
                state.versions.current(),
                seqno,
            )
        };

        match mem.get(key, seqno) {
            MemtableGet::Found(value) => return Ok(Some(value)),
            MemtableGet::Deleted => return Ok(None),
            MemtableGet::NotFound => {}
        }

        if let Some(imm) = imm {
            match imm.get(key, seqno) {
                MemtableGet::Found(value) => return Ok(Some(value)),
                MemtableGet::Deleted => return Ok(None),
                MemtableGet::NotFound => {}
            }
        }

        let lookup = lookup_key(key, seqno);

        let (outcome, stats) =
            version.get(&self.table_cache, &lookup, opts.verify_checksums, opts.fill_cache)?;

        if version.update_stats(stats) {
            let mut state = self.lock_state();
            self.maybe_schedule_compaction(&mut state);
        }

        Ok(match outcome {
            GetOutcome::Found(value) => Some(value),
            GetOutcome::Deleted | GetOutcome::NotFound => None,
        })
    }

    fn range_iter(
        self: &Arc<Self>,
        range: (Bound<UserKey>, Bound<UserKey>),
        opts: &ReadOptions,
    ) -> crate::Result<DbIterator> {
        let (mem, imm, version, seqno) = {
            let state = self.lock_state();

            let seqno = opts
                .snapshot
                .as_ref()
                .map_or_else(|| state.versions.last_sequence(), Snapshot::sequence);

            (
                state.mem.clone(),
                state.imm.clone(),
                state.versions.current(),
                seqno,
            )
        };

        DbIterator::new(
            self.clone(),
            (mem, imm),
            version,
            seqno,
            range,
            opts.verify_checksums,
            opts.fill_cache,
        )
    }

    // ----------------------------------------------------------------
    // Background work

    fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.background_scheduled
            || state.shutting_down
            || state.background_error.is_some()
        {
            return;
        }

        let manual_pending = state.manual.as_ref().is_some_and(|m| !m.done);

        if state.imm.is_none() && !manual_pending && !state.versions.needs_compaction() {
            return;
        }

        state.background_scheduled = true;
        self.work_cv.notify_one();
    }

    fn background_thread(self: Arc<Self>) {
        loop {
            let mut state = self.lock_state();

            while !state.background_scheduled && !state.shutting_down {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                {
                    state = self.work_cv.wait(state).expect("lock is poisoned");
                }
            }

            if state.shutting_down {
                return;
            }

            state = self.background_compaction(state);

            state.background_scheduled = false;

            // More work may have queued up in the meantime
            self.maybe_schedule_compaction(&mut state);

            self.done_cv.notify_all();
            drop(state);
        }
    }

    fn background_compaction<'a>(
        &'a self,
        state: MutexGuard<'a, DbState>,
    ) -> MutexGuard<'a, DbState> {
        let mut state = state;

        if state.imm.is_some() {
            return self.compact_memtable(state);
        }

        let is_manual = state.manual.as_ref().is_some_and(|m| !m.done);

        let compaction = if is_manual {
            let (level, begin, end) = {
                #[expect(clippy::expect_used, reason = "checked by is_manual")]
                let m = state.manual.as_ref().expect("manual request must exist");
                (m.level, m.begin.clone(), m.end.clone())
            };

            let compaction = state
                .versions
                .compact_range(level, begin.as_ref(), end.as_ref());

            if compaction.is_none() {
                if let Some(m) = state.manual.as_mut() {
                    m.done = true;
                }
            }

            compaction
        } else {
            state.versions.pick_compaction()
        };

        let Some(mut compaction) = compaction else {
            return state;
        };

        // Remember where this chunk ends, so a manual compaction can
        // resume behind it
        let manual_resume = compaction
            .input(0)
            .iter()
            .map(|f| f.largest.clone())
            .max();

        let result = if !is_manual && compaction.is_trivial_move() {
            // Move the file down without rewriting it
            #[expect(clippy::expect_used, reason = "trivial move has exactly one input")]
            let file = compaction.input(0).first().expect("input must exist").clone();

            let level = compaction.level();
            compaction.edit.remove_file(level, file.number);
            compaction.edit.add_file(level + 1, file.clone());

            self.info_log.write(&format!(
                "moving table {} ({} B) from level {level} to {}",
                file.number,
                file.size,
                level + 1,
            ));

            let edit = compaction.take_edit();
            let result = state.versions.log_and_apply(edit);

            if result.is_ok() {
                self.remove_obsolete_files(&mut state);
            }

            result
        } else {
            let (returned_state, result) = self.run_compaction(state, &mut compaction);
            state = returned_state;
            result
        };

        match result {
            Ok(()) => {
                if is_manual {
                    if let Some(m) = state.manual.as_mut() {
                        // Chunk finished; resume after it next round
                        m.begin = manual_resume;
                    }
                }
            }
            Err(e) => {
                if self.stop.is_stopped() {
                    // Partial work during shutdown is expected
                } else {
                    self.record_background_error(&mut state, e);
                }

                if let Some(m) = state.manual.as_mut() {
                    m.done = true;
                }
            }
        }

        state
    }

    /// Flushes the immutable memtable into a table file and installs
    /// it at the deepest safe level.
    fn compact_memtable<'a>(&'a self, state: MutexGuard<'a, DbState>) -> MutexGuard<'a, DbState> {
        let mut state = state;

        let Some(imm) = state.imm.clone() else {
            return state;
        };

        let base_version = state.versions.current();
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        let wal_number = state.wal_number;

        drop(state);

        // Heavy lifting without the lock: stream the memtable out
        let build_result = self.build_table_from_memtable(number, &imm);

        let mut state = self.lock_state();
        state.pending_outputs.remove(&number);

        let meta = match build_result {
            Ok(meta) => meta,
            Err(e) => {
                let _ = std::fs::remove_file(table_file_path(&self.path, number));
                self.record_background_error(&mut state, e);
                return state;
            }
        };

        let mut edit = VersionEdit::default();

        match meta {
            Some(meta) => {
                let level = base_version.pick_level_for_memtable_output(
                    &self.config,
                    &meta.smallest.user_key.clone(),
                    &meta.largest.user_key.clone(),
                );

                self.info_log.write(&format!(
                    "flushed memtable to table {} ({} B) at level {level}",
                    meta.number, meta.size,
                ));

                edit.add_file(level, Arc::new(meta));
            }
            None => {
                // Sealed memtable held nothing, elide the file
                state.versions.reuse_file_number(number);
            }
        }

        // All writes in logs before this number are now durable in tables
        edit.set_log_number(wal_number);

        match state.versions.log_and_apply(edit) {
            Ok(()) => {
                state.imm = None;
                self.has_imm.store(false, Ordering::Release);
                self.remove_obsolete_files(&mut state);
            }
            Err(e) => {
                self.record_background_error(&mut state, e);
            }
        }

        state
    }

    fn build_table_from_memtable(
        &self,
        number: FileId,
        memtable: &Memtable,
    ) -> crate::Result<Option<FileMetaData>> {
        if memtable.is_empty() {
            return Ok(None);
        }

        let path = table_file_path(&self.path, number);
        let file = std::fs::File::create(&path)?;
        let mut builder = TableBuilder::new(file, &self.config);

        for item in memtable.iter() {
            builder.add(&item)?;
        }

        #[expect(clippy::expect_used, reason = "the memtable is not empty")]
        let smallest = builder.first_key().cloned().expect("must have first key");
        #[expect(clippy::expect_used, reason = "the memtable is not empty")]
        let largest = builder.last_key().cloned().expect("must have last key");

        let size = builder.finish()?;

        // Opening the result verifies footer and index integrity
        self.table_cache.get(number, size)?;

        Ok(Some(FileMetaData::new(number, size, smallest, largest)))
    }

    /// Runs a full merging compaction: reads the inputs in key order,
    /// applies the drop rules and writes fresh output tables.
    fn run_compaction<'a>(
        &'a self,
        state: MutexGuard<'a, DbState>,
        compaction: &mut Compaction,
    ) -> (MutexGuard<'a, DbState>, crate::Result<()>) {
        let mut state = state;

        self.info_log.write(&format!(
            "compacting {} files of level {} with {} files of level {}",
            compaction.input(0).len(),
            compaction.level(),
            compaction.input(1).len(),
            compaction.level() + 1,
        ));
        log::debug!(
            "compaction inputs: L{} {:?} + L{} {:?}",
            compaction.level(),
            compaction.input_numbers(0),
            compaction.level() + 1,
            compaction.input_numbers(1),
        );

        // Entries at or below this horizon that are shadowed or
        // tombstoned can be dropped for good
        let smallest_snapshot = self
            .snapshots
            .smallest()
            .unwrap_or_else(|| state.versions.last_sequence());

        drop(state);

        let result = self.merge_compaction_inputs(compaction, smallest_snapshot);

        let mut state = self.lock_state();

        let outputs = match result {
            Ok(outputs) => outputs,
            Err(e) => {
                return (state, Err(e));
            }
        };

        compaction.add_input_deletions();
        let output_level = compaction.level() + 1;
        let output_numbers: Vec<FileId> = outputs.iter().map(|meta| meta.number).collect();

        for meta in outputs {
            compaction.edit.add_file(output_level, Arc::new(meta));
        }

        let edit = compaction.take_edit();
        let result = state.versions.log_and_apply(edit);

        for number in output_numbers {
            state.pending_outputs.remove(&number);

            if result.is_err() {
                let _ = std::fs::remove_file(table_file_path(&self.path, number));
            }
        }

        if result.is_ok() {
            self.info_log.write(&format!(
                "compaction done, {}",
                state.versions.current().level_summary(),
            ));

            self.remove_obsolete_files(&mut state);
        }

        (state, result)
    }

    /// The unlocked part of a compaction: the k-way merge with the
    /// record drop rules, cutting output files as it goes.
    fn merge_compaction_inputs(
        &self,
        compaction: &mut Compaction,
        smallest_snapshot: SeqNo,
    ) -> crate::Result<Vec<FileMetaData>> {
        let verify = self.config.paranoid_checks;

        let mut iters: Vec<BoxedIterator<'_>> = vec![];

        for which in 0..2 {
            let files = compaction.input(which).to_vec();

            if files.is_empty() {
                continue;
            }

            if compaction.level() == 0 && which == 0 {
                // Level-0 inputs overlap, merge them individually
                for file in files {
                    let table = self.table_cache.get(file.number, file.size)?;
                    iters.push(Box::new(table.range(
                        (Bound::Unbounded, Bound::Unbounded),
                        verify,
                        false,
                    )));
                }
            } else {
                iters.push(Box::new(LevelIter::new(
                    self.table_cache.clone(),
                    files,
                    (Bound::Unbounded, Bound::Unbounded),
                    verify,
                    false,
                )));
            }
        }

        let merge = MergeIterator::new(iters);

        let mut outputs: Vec<FileMetaData> = vec![];
        let mut current: Option<(FileId, TableBuilder)> = None;

        let mut current_user_key: Option<UserKey> = None;
        let mut last_sequence_for_key = u64::MAX;

        let finish_output = |this: &Self,
                             current: &mut Option<(FileId, TableBuilder)>,
                             outputs: &mut Vec<FileMetaData>|
         -> crate::Result<()> {
            let Some((number, builder)) = current.take() else {
                return Ok(());
            };

            if builder.is_empty() {
                let _ = std::fs::remove_file(table_file_path(&this.path, number));
                return Ok(());
            }

            #[expect(clippy::expect_used, reason = "builder is not empty")]
            let smallest = builder.first_key().cloned().expect("must have first key");
            #[expect(clippy::expect_used, reason = "builder is not empty")]
            let largest = builder.last_key().cloned().expect("must have last key");

            let size = builder.finish()?;

            // Verify the output is readable before publishing it
            this.table_cache.get(number, size)?;

            outputs.push(FileMetaData::new(number, size, smallest, largest));
            Ok(())
        };

        let cleanup = |this: &Self,
                       current: Option<(FileId, TableBuilder)>,
                       outputs: &[FileMetaData]| {
            if let Some((number, builder)) = current {
                drop(builder);
                let _ = std::fs::remove_file(table_file_path(&this.path, number));
                let mut state = this.lock_state();
                state.pending_outputs.remove(&number);
            }

            // Outputs stay in pending_outputs until the caller either
            // installs or deletes them
            let _ = outputs;
        };

        for item in merge {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    cleanup(self, current, &outputs);
                    return Err(e);
                }
            };

            if self.stop.is_stopped() {
                cleanup(self, current, &outputs);
                return Err(crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "shutting down during compaction",
                )));
            }

            // A pending flush takes priority over compaction progress,
            // otherwise writers stall behind a full memtable
            if self.has_imm.load(Ordering::Acquire) {
                let state = self.lock_state();
                if state.imm.is_some() {
                    let state = self.compact_memtable(state);
                    drop(state);
                    self.done_cv.notify_all();
                }
            }

            let user_key_changed = current_user_key
                .as_ref()
                .is_none_or(|k| *k != item.key.user_key);

            // Outputs are only ever cut between user keys, so all
            // versions of a key land in one file and deeper levels
            // stay disjoint on user keys
            if user_key_changed {
                if let Some((_, builder)) = &current {
                    let oversized = builder.estimated_size() >= compaction.max_output_file_size();

                    if (oversized || compaction.should_stop_before(&item.key))
                        && !builder.is_empty()
                    {
                        if let Err(e) = finish_output(self, &mut current, &mut outputs) {
                            cleanup(self, current, &outputs);
                            return Err(e);
                        }
                    }
                }

                current_user_key = Some(item.key.user_key.clone());
                last_sequence_for_key = u64::MAX;
            }

            let drop_entry = if last_sequence_for_key <= smallest_snapshot {
                // A newer entry of the same key is already at or below
                // the horizon, this one can never be observed again
                true
            } else {
                item.key.is_tombstone()
                    && item.key.seqno <= smallest_snapshot
                    && compaction.is_base_level_for_key(&item.key.user_key)
            };

            last_sequence_for_key = item.key.seqno;

            if drop_entry {
                continue;
            }

            if current.is_none() {
                let number = {
                    let mut state = self.lock_state();
                    let number = state.versions.new_file_number();
                    state.pending_outputs.insert(number);
                    number
                };

                let path = table_file_path(&self.path, number);

                match std::fs::File::create(&path) {
                    Ok(file) => {
                        current = Some((number, TableBuilder::new(file, &self.config)));
                    }
                    Err(e) => {
                        cleanup(self, current, &outputs);
                        return Err(e.into());
                    }
                }
            }

            #[expect(clippy::expect_used, reason = "output was just ensured")]
            let (_, builder) = current.as_mut().expect("output must exist");

            if let Err(e) = builder.add(&item) {
                cleanup(self, current, &outputs);
                return Err(e);
            }
        }

        if let Err(e) = finish_output(self, &mut current, &mut outputs) {
            cleanup(self, current, &outputs);
            return Err(e);
        }

        Ok(outputs)
    }

    // ----------------------------------------------------------------
    // Manual compaction

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> crate::Result<()> {
        // Deepest level that holds data overlapping the range
        let max_level = {
            let state = self.lock_state();
            let version = state.versions.current();

            let mut max_level = 1;
            for level in 1..version.level_count() {
                if version.overlap_in_level(level, begin, end) {
                    max_level = level;
                }
            }
            max_level
        };

        self.flush_memtable()?;

        for level in 0..max_level {
            self.manual_compact_level(level, begin, end)?;
        }

        Ok(())
    }

    /// Seals the active memtable (if non-empty) and waits until every
    /// sealed memtable has been flushed.
    fn flush_memtable(&self) -> crate::Result<()> {
        let mut state = self.lock_state();

        loop {
            if let Some(e) = &state.background_error {
                return Err(crate::Error::Background(e.clone()));
            }

            if state.imm.is_some() {
                self.maybe_schedule_compaction(&mut state);
                state = self.wait_done(state);
                continue;
            }

            if state.mem.is_empty() {
                return Ok(());
            }

            // Rotation must not interleave with an in-flight write
            if !state.writers.is_empty() || state.wal.is_none() {
                state = self.wait_writer(state);
                continue;
            }

            self.rotate_memtable(&mut state)?;
        }
    }

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> crate::Result<()> {
        let begin_key = begin.map(|key| InternalKey::new(key, MAX_SEQNO, VALUE_TYPE_FOR_SEEK));
        let end_key = end.map(|key| InternalKey::new(key, 0, ValueType::Tombstone));

        let mut state = self.lock_state();

        // One manual compaction at a time
        while state.manual.is_some() {
            state = self.wait_done(state);
        }

        state.manual = Some(ManualCompaction {
            level,
            done: false,
            begin: begin_key,
            end: end_key,
        });

        let result = loop {
            if let Some(e) = &state.background_error {
                break Err(crate::Error::Background(e.clone()));
            }

            let done = state.manual.as_ref().is_none_or(|m| m.done);
            if done {
                break Ok(());
            }

            self.maybe_schedule_compaction(&mut state);
            state = self.wait_done(state);
        };

        state.manual = None;
        self.done_cv.notify_all();

        result
    }

    // ----------------------------------------------------------------
    // File garbage collection

    /// Deletes files that no live version references anymore.
    fn remove_obsolete_files(&self, state: &mut DbState) {
        if state.background_error.is_some() {
            // After a background error the manifest may be behind;
            // better to leak files than to delete live ones
            return;
        }

        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());

        let log_number = state.versions.log_number;
        let manifest_number = state.versions.manifest_file_number();

        let Ok(entries) = std::fs::read_dir(&self.path) else {
            return;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();

            let Some((file_type, number)) = parse_file_name(&name.to_string_lossy()) else {
                continue;
            };

            let keep = match file_type {
                FileType::Log => number >= log_number,
                FileType::Manifest => number >= manifest_number,
                FileType::Table | FileType::Temp => live.contains(&number),
                FileType::Current | FileType::Lock | FileType::InfoLog => true,
            };

            if keep {
                continue;
            }

            if file_type == FileType::Table {
                self.table_cache.evict(number);
            }

            log::debug!("removing obsolete file {name:?}");
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

fn ticket_result(ticket: &WriterTicket) -> Option<Result<(), Arc<crate::Error>>> {
    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    ticket.result.lock().expect("lock is poisoned").take()
}

/// Pops the first `count` queued writers, handing each the result.
///
/// The leader (front) takes its result from the return value instead.
fn finish_tickets(state: &mut DbState, count: usize, result: &Result<(), Arc<crate::Error>>) {
    for idx in 0..count {
        let Some(ticket) = state.writers.pop_front() else {
            break;
        };

        if idx > 0 {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut slot = ticket.result.lock().expect("lock is poisoned");
            *slot = Some(result.clone());
        }
    }
}

/// Coalesces queued writers behind the leader into one batch.
///
/// Returns the combined batch, how many tickets joined, and whether
/// the group must be synced.
fn build_write_group(state: &mut DbState, leader_sync: bool) -> (WriteBatch, usize, bool) {
    #[expect(clippy::expect_used, reason = "the leader is the front ticket")]
    let leader_batch = state
        .writers
        .front()
        .expect("leader must be queued")
        .batch
        .lock()
        .expect("lock is poisoned")
        .take()
        .expect("leader batch must be present");

    let mut max_size = MAX_WRITE_GROUP_SIZE;
    if leader_batch.size() <= SMALL_WRITE_SIZE {
        max_size = leader_batch.size() + SMALL_WRITE_SIZE;
    }

    let mut group = leader_batch;
    let mut group_len = 1;

    for ticket in state.writers.iter().skip(1) {
        if ticket.sync && !leader_sync {
            // A sync write must not piggyback on a non-sync group
            break;
        }

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut slot = ticket.batch.lock().expect("lock is poisoned");

        let Some(batch) = slot.as_ref() else {
            break;
        };

        if group.size() + batch.size() > max_size {
            break;
        }

        #[expect(clippy::expect_used, reason = "batch presence was just checked")]
        let batch = slot.take().expect("batch must be present");
        group.append(&batch);
        group_len += 1;
    }

    (group, group_len, leader_sync)
}

// ----------------------------------------------------------------
// Recovery helpers

#[allow(clippy::too_many_arguments)]
fn replay_wal(
    path: &Path,
    log_number: FileId,
    config: &Config,
    info_log: &InfoLog,
    versions: &mut VersionSet,
    table_cache: &Arc<TableCache>,
    mem: &mut Memtable,
    edit: &mut VersionEdit,
    max_sequence: &mut SeqNo,
) -> crate::Result<()> {
    let mut reader = crate::wal::Reader::open(log_file_path(path, log_number))?;

    info_log.write(&format!("replaying write-ahead log {log_number}"));

    loop {
        let payload = match reader.read_record() {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                // The tail of the log was half-written during a crash;
                // everything before it is intact and gets replayed
                if config.paranoid_checks {
                    return Err(e);
                }

                info_log.write(&format!(
                    "dropping corrupt tail of write-ahead log {log_number}: {e}",
                ));
                break;
            }
        };

        let batch = match WriteBatch::from_payload(&payload) {
            Ok(batch) => batch,
            Err(e) => {
                if config.paranoid_checks {
                    return Err(e);
                }

                info_log.write(&format!(
                    "dropping corrupt batch in write-ahead log {log_number}: {e}",
                ));
                break;
            }
        };

        batch.apply_to(mem);

        let last = batch.sequence() + u64::from(batch.len()).saturating_sub(1);
        *max_sequence = (*max_sequence).max(last);

        if mem.size() > config.write_buffer_size {
            write_recovery_table(path, config, versions, table_cache, mem, edit)?;
            *mem = Memtable::new();
        }
    }

    Ok(())
}

/// Writes a memtable recovered from the log into a level-0 table.
fn write_recovery_table(
    path: &Path,
    config: &Config,
    versions: &mut VersionSet,
    table_cache: &Arc<TableCache>,
    mem: &Memtable,
    edit: &mut VersionEdit,
) -> crate::Result<()> {
    if mem.is_empty() {
        return Ok(());
    }

    let number = versions.new_file_number();
    let table_path = table_file_path(path, number);

    let file = std::fs::File::create(&table_path)?;
    let mut builder = TableBuilder::new(file, config);

    for item in mem.iter() {
        builder.add(&item)?;
    }

    #[expect(clippy::expect_used, reason = "the memtable is not empty")]
    let smallest = builder.first_key().cloned().expect("must have first key");
    #[expect(clippy::expect_used, reason = "the memtable is not empty")]
    let largest = builder.last_key().cloned().expect("must have last key");

    let size = builder.finish()?;
    table_cache.get(number, size)?;

    edit.add_file(0, Arc::new(FileMetaData::new(number, size, smallest, largest)));

    Ok(())
}
