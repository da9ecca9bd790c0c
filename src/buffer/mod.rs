//! The editable byte buffer.
//!
//! All state sits behind one mutex. Saves take the lock to launch the worker,
//! on the worker to plan and install copies of file data history still needs,
//! and to reconcile once the strategy finishes. The copies themselves are read
//! without it. Throughout a save the buffer stays readable but refuses
//! modification.

pub mod events;

#[cfg(test)]
mod tests;

use crossbeam::channel::Receiver;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub use events::{BufferEvent, BufferEventKind, BufferId};

use crate::config::Config;
use crate::edit::{Action, Edit, EditLog};
use crate::error::{BufferError, Result, SaveError};
use crate::save::{self, SaveCallbacks, SaveHandle, SaveJob, SaveKind, SaveOutcome, StrategyReport};
use crate::segment::{DetachPlan, Detached, Detacher, Document, Snapshot};
use crate::store::{BackingStore, SpaceProbe, SystemProbe};
use events::EventHub;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_UNTITLED: AtomicU64 = AtomicU64::new(1);

/// What callers may currently do with a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub modify: bool,
    pub file_operations: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            read: true,
            modify: true,
            file_operations: true,
        }
    }
}

struct BufferState {
    doc: Document,
    store: Option<Arc<BackingStore>>,
    log: EditLog,
    permissions: Permissions,
    /// Permissions to restore when the running save completes
    pre_save: Option<Permissions>,
    /// Edits recorded since `begin_chaining`
    chain: Option<Vec<Edit>>,
    events: EventHub,
    config: Config,
    probe: Arc<dyn SpaceProbe>,
    name: String,
}

/// A byte buffer over a (possibly huge) file, edited without loading it
pub struct Buffer {
    id: BufferId,
    state: Arc<Mutex<BufferState>>,
}

impl Buffer {
    /// An empty, untitled buffer
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let name = format!("Untitled {}", NEXT_UNTITLED.fetch_add(1, Ordering::Relaxed));
        Self::build(Document::new(), None, config, name)
    }

    /// Load `path`. Only a single segment covering the file is created; bytes
    /// are read on demand.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, Config::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref();
        let store = Arc::new(BackingStore::open(path, config.window_size, config.fixed_size)?);
        info!(path = %path.display(), size = store.size(), "loaded file");

        let doc = Document::from_store(&store);
        Ok(Self::build(doc, Some(store), config, path.display().to_string()))
    }

    fn build(doc: Document, store: Option<Arc<BackingStore>>, config: Config, name: String) -> Self {
        let id = BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed));
        let state = BufferState {
            doc,
            store,
            log: EditLog::new(config.max_undo_actions),
            permissions: Permissions::default(),
            pre_save: None,
            chain: None,
            events: EventHub::new(id),
            config,
            probe: Arc::new(SystemProbe),
            name,
        };
        Self {
            id,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        lock_state(&self.state)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Receive change, permission and file-change notifications
    pub fn subscribe(&self) -> Receiver<BufferEvent> {
        self.lock().events.subscribe()
    }

    pub fn size(&self) -> u64 {
        self.lock().doc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether edits may change the size; false for device files
    pub fn is_resizable(&self) -> bool {
        self.lock().resizable()
    }

    pub fn permissions(&self) -> Permissions {
        self.lock().permissions
    }

    /// The file currently backing the buffer
    pub fn path(&self) -> Option<PathBuf> {
        self.lock().store.as_ref().map(|store| store.path().to_path_buf())
    }

    pub fn has_file(&self) -> bool {
        self.lock().store.is_some()
    }

    /// Display name: the file path, or "Untitled N"
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Byte at `index`; 0 while reading is not allowed
    pub fn byte_at(&self, index: u64) -> Result<u8> {
        let state = self.lock();
        if !state.permissions.read {
            return Ok(0);
        }
        state.doc.byte_at(index)
    }

    /// Logical bytes `start..=end` detached from the buffer
    pub fn range_snapshot(&self, start: u64, end: u64) -> Result<Snapshot> {
        let state = self.lock();
        if !state.permissions.read {
            return Ok(Snapshot::new());
        }
        state.doc.get_range(start, end)
    }

    /// Logical bytes `start..=end` copied out
    pub fn range_to_vec(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let snapshot = self.range_snapshot(start, end)?;
        Ok(snapshot.to_vec()?)
    }

    /// The whole content copied out
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let snapshot = {
            let state = self.lock();
            if !state.permissions.read {
                return Ok(Vec::new());
            }
            state.doc.snapshot()
        };
        Ok(snapshot.to_vec()?)
    }

    /// Lengths of the segments making up the content, in order
    pub fn segment_lengths(&self) -> Vec<u64> {
        self.lock().doc.segment_lengths()
    }

    /// Returns false when modification is not allowed
    pub fn append(&self, data: &[u8]) -> Result<bool> {
        let mut state = self.lock();
        if !state.permissions.modify || !state.resizable() || data.is_empty() {
            return Ok(false);
        }
        let edit = Edit::append(&mut state.doc, data);
        state.record(edit);
        Ok(true)
    }

    /// Insert `data` before `pos`; `pos == size` appends
    pub fn insert(&self, pos: u64, data: &[u8]) -> Result<bool> {
        let mut state = self.lock();
        if !state.permissions.modify {
            return Ok(false);
        }
        let size = state.doc.len();
        if pos > size {
            return Err(BufferError::OutOfRange { index: pos, size });
        }
        if !state.resizable() || data.is_empty() {
            return Ok(false);
        }

        let edit = if pos == size {
            Edit::append(&mut state.doc, data)
        } else {
            Edit::insert(&mut state.doc, pos, data)?
        };
        state.record(edit);
        Ok(true)
    }

    /// Remove bytes `start..=end`
    pub fn delete(&self, start: u64, end: u64) -> Result<bool> {
        let mut state = self.lock();
        if !state.permissions.modify {
            return Ok(false);
        }
        state.check_range(start, end)?;
        if !state.resizable() {
            return Ok(false);
        }

        let edit = Edit::delete(&mut state.doc, start, end)?;
        state.record(edit);
        Ok(true)
    }

    /// Replace bytes `start..=end` with `data`. A length change needs a
    /// resizable buffer.
    pub fn replace(&self, start: u64, end: u64, data: &[u8]) -> Result<bool> {
        let mut state = self.lock();
        if !state.permissions.modify {
            return Ok(false);
        }
        state.check_range(start, end)?;
        if end - start + 1 != data.len() as u64 && !state.resizable() {
            return Ok(false);
        }

        let edit = Edit::replace(&mut state.doc, start, end, data)?;
        state.record(edit);
        Ok(true)
    }

    /// Undo the most recent action. Returns false if nothing was undone.
    pub fn undo(&self) -> bool {
        let mut state = self.lock();
        if !state.permissions.modify || state.chain.is_some() {
            return false;
        }
        let Some(action) = state.log.pop_undo() else {
            return false;
        };

        action.apply_reverse(&mut state.doc);
        state.log.push_redo(action);
        state.events.emit(BufferEventKind::Changed);
        true
    }

    /// Redo the most recently undone action. Returns false if nothing was redone.
    pub fn redo(&self) -> bool {
        let mut state = self.lock();
        if !state.permissions.modify || state.chain.is_some() {
            return false;
        }
        let Some(action) = state.log.pop_redo() else {
            return false;
        };

        action.apply(&mut state.doc);
        if state.log.push(action) {
            state.collect_garbage();
        }
        state.events.emit(BufferEventKind::Changed);
        true
    }

    /// Group the following edits into one undo step until `end_chaining`
    pub fn begin_chaining(&self) -> Result<()> {
        let mut state = self.lock();
        if state.chain.is_some() {
            return Err(BufferError::ChainingActive);
        }
        state.chain = Some(Vec::new());
        state.sync_events();
        Ok(())
    }

    /// Close the group opened by `begin_chaining`, firing one change event if
    /// anything was edited
    pub fn end_chaining(&self) -> Result<()> {
        let mut state = self.lock();
        let children = state.chain.take().ok_or(BufferError::ChainingInactive)?;
        state.sync_events();

        if children.is_empty() {
            return Ok(());
        }
        debug!(edits = children.len(), "recording chained edits");
        let id = state.log.next_id();
        if state.log.push(Action::Composite { id, children }) {
            state.collect_garbage();
        }
        state.events.emit(BufferEventKind::Changed);
        Ok(())
    }

    pub fn is_chaining(&self) -> bool {
        self.lock().chain.is_some()
    }

    pub fn can_undo(&self) -> bool {
        self.lock().log.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.lock().log.can_redo()
    }

    /// Content differs from the file as last loaded or saved
    pub fn has_changed(&self) -> bool {
        self.lock().log.has_changed()
    }

    pub fn undo_count(&self) -> usize {
        self.lock().log.undo_count()
    }

    pub fn redo_count(&self) -> usize {
        self.lock().log.redo_count()
    }

    /// History was evicted, so undo can no longer reach the saved state
    pub fn changed_beyond_undo(&self) -> bool {
        self.lock().log.changed_beyond_undo()
    }

    pub fn max_undo_actions(&self) -> Option<usize> {
        self.lock().log.max_size()
    }

    /// Limit the undo history; `None` removes the limit
    pub fn set_max_undo_actions(&self, max: Option<usize>) {
        let mut state = self.lock();
        state.config.max_undo_actions = max;
        if state.log.set_max_size(max) {
            state.collect_garbage();
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.lock().config.temp_dir()
    }

    /// Directory used by save-via-temp-file
    pub fn set_temp_dir(&self, dir: impl Into<PathBuf>) {
        self.lock().config.temp_dir = Some(dir.into());
    }

    /// Replace the source of free disk and memory figures
    pub fn set_space_probe(&self, probe: Arc<dyn SpaceProbe>) {
        self.lock().probe = probe;
    }

    /// Signal that the backing file was changed by someone else
    pub fn notify_file_changed(&self) {
        self.lock().events.emit(BufferEventKind::FileChanged);
    }

    /// Drop all edits and history and reload the file from disk
    pub fn revert(&self) -> Result<bool> {
        let mut state = self.lock();
        if !state.permissions.modify {
            return Ok(false);
        }
        if state.chain.is_some() {
            return Err(BufferError::ChainingActive);
        }
        let path = state
            .store
            .as_ref()
            .map(|store| store.path().to_path_buf())
            .ok_or(BufferError::NoFile)?;

        state.log.clear();
        state.reload(&path)?;
        info!(path = %path.display(), "reverted to file on disk");
        state.events.emit(BufferEventKind::Changed);
        Ok(true)
    }

    /// Release the file and all history. The buffer can no longer be read or
    /// modified afterwards.
    pub fn close_file(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.permissions.file_operations {
            return Err(BufferError::FileOperationsDisallowed);
        }

        state.permissions.read = false;
        state.permissions.modify = false;
        state.chain = None;
        state.sync_events();
        state.log.clear();
        state.doc = Document::new();
        state.store = None;

        debug!(name = %state.name, "closed buffer");
        state.events.emit(BufferEventKind::PermissionsChanged);
        Ok(())
    }

    /// Save to the current file, in place when the layout allows it and through
    /// a temp file otherwise. Runs in the background.
    pub fn save(&self, callbacks: SaveCallbacks) -> Result<SaveHandle> {
        let state = self.lock();
        self.save_current(state, callbacks)
    }

    /// Save to `path`, which becomes the buffer's file on success
    pub fn save_as(&self, path: impl AsRef<Path>, callbacks: SaveCallbacks) -> Result<SaveHandle> {
        let path = path.as_ref();
        let state = self.lock();
        state.check_can_save()?;

        if state.is_current_file(path) {
            debug!(path = %path.display(), "save-as target is the current file");
            return self.save_current(state, callbacks);
        }

        let job = state.job(SaveKind::SaveAs, path.to_path_buf());
        self.launch(state, job, callbacks)
    }

    fn save_current(&self, state: MutexGuard<'_, BufferState>, callbacks: SaveCallbacks) -> Result<SaveHandle> {
        state.check_can_save()?;
        let store = state.store.clone().ok_or(BufferError::NoFile)?;
        let kind = state.choose_strategy(&store);
        let job = state.job(kind, store.path().to_path_buf());
        self.launch(state, job, callbacks)
    }

    fn launch(
        &self,
        mut state: MutexGuard<'_, BufferState>,
        job: SaveJob,
        callbacks: SaveCallbacks,
    ) -> Result<SaveHandle> {
        let in_place = job.kind == SaveKind::InPlace;
        state.begin_save();

        // an in-place save overwrites the file history reads from, so it lets
        // go first; other saves leave the old file intact until they succeed
        let before = Arc::clone(&self.state);
        let prepare = move || if in_place { detach(&before, true) } else { Ok(()) };

        let after = Arc::clone(&self.state);
        let reconcile = move |report: StrategyReport| {
            if report.current_file.is_some() && !in_place {
                if let Err(e) = detach(&after, false) {
                    warn!(error = %e, "could not detach history from the old file");
                    lock_state(&after).log.drop_history();
                }
            }
            lock_state(&after).finish_save(report)
        };

        match save::spawn(job, callbacks, prepare, reconcile) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(error = %e, "could not start save worker");
                state.end_save();
                state.events.emit(BufferEventKind::PermissionsChanged);
                Err(e.into())
            }
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("id", &self.id).finish_non_exhaustive()
    }
}

fn lock_state(state: &Mutex<BufferState>) -> MutexGuard<'_, BufferState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Copy what the buffer still needs from its backing file into memory, as
/// far as the keep policy allows. The lock is held to plan and to install the
/// copies, not while reading them.
fn detach(shared: &Mutex<BufferState>, in_place: bool) -> io::Result<()> {
    let plan = lock_state(shared).plan_detach(in_place);
    if plan.is_empty() {
        return Ok(());
    }

    debug!(bytes = plan.cost(), "copying file data off the backing file");
    let detached = plan.materialize()?;
    lock_state(shared).install(detached);
    Ok(())
}

impl BufferState {
    fn resizable(&self) -> bool {
        self.store.as_ref().map_or(true, |store| store.is_resizable())
    }

    fn check_range(&self, start: u64, end: u64) -> Result<()> {
        let size = self.doc.len();
        if end >= size {
            return Err(BufferError::OutOfRange { index: end, size });
        }
        if start > end {
            return Err(BufferError::OutOfRange { index: start, size });
        }
        Ok(())
    }

    /// Put a fresh edit into history, or into the open chain
    fn record(&mut self, edit: Edit) {
        match self.chain.as_mut() {
            Some(children) => {
                children.push(edit);
                if children.len() == 1 {
                    self.drop_redo();
                }
            }
            None => {
                let id = self.log.next_id();
                let evicted = self.log.push(Action::Edit { id, edit });
                let cleared = self.log.clear_redo();
                if evicted || cleared {
                    self.collect_garbage();
                }
                self.events.emit(BufferEventKind::Changed);
            }
        }
    }

    fn drop_redo(&mut self) {
        if self.log.clear_redo() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        let mut keep: HashSet<_> = self.log.referenced_segments();
        if let Some(children) = &self.chain {
            keep.extend(children.iter().flat_map(Edit::segment_ids));
        }
        self.doc.collect_garbage(keep);
    }

    /// Notifications are held back while chaining or saving
    fn sync_events(&mut self) {
        let enabled = self.chain.is_none() && self.pre_save.is_none();
        self.events.set_enabled(enabled);
    }

    fn check_can_save(&self) -> Result<()> {
        if self.chain.is_some() {
            return Err(BufferError::ChainingActive);
        }
        if !self.permissions.file_operations {
            return Err(BufferError::FileOperationsDisallowed);
        }
        Ok(())
    }

    fn is_current_file(&self, path: &Path) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match (fs::canonicalize(path), fs::canonicalize(store.path())) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// In place only works when writing can't clobber bytes still to be read:
    /// either the size is fixed, or every file segment sits at its own offset.
    fn choose_strategy(&self, store: &Arc<BackingStore>) -> SaveKind {
        if !store.is_resizable() {
            return SaveKind::InPlace;
        }
        if self.doc.len() != store.size() {
            return SaveKind::TempFile;
        }

        let aligned = self
            .doc
            .snapshot()
            .iter_with_offsets()
            .all(|(offset, segment)| !segment.is_backed_by(store) || segment.start() == offset);

        if aligned {
            SaveKind::InPlace
        } else {
            SaveKind::TempFile
        }
    }

    fn job(&self, kind: SaveKind, target: PathBuf) -> SaveJob {
        SaveJob {
            kind,
            snapshot: self.doc.snapshot(),
            target,
            store: self.store.clone(),
            temp_dir: self.config.temp_dir(),
            block_size: self.config.save_block_size,
            probe: Arc::clone(&self.probe),
        }
    }

    /// Apply the keep policy to history and plan the copies that let what is
    /// left outlive the backing file
    fn plan_detach(&mut self, in_place: bool) -> DetachPlan {
        let mut detacher = Detacher::new(&self.doc, self.store.as_ref(), in_place);
        self.log
            .retain_after_save(self.config.keep_undo_after_save, &mut detacher, self.probe.as_ref());
        let plan = detacher.finish();
        self.collect_garbage();
        plan
    }

    fn install(&mut self, detached: Detached) {
        self.doc.install(detached.moved);
        match detached.history {
            Some(history) => self.doc.install(history),
            None => self.log.drop_history(),
        }
        self.collect_garbage();
    }

    fn begin_save(&mut self) {
        self.pre_save = Some(self.permissions);
        self.permissions.modify = false;
        self.permissions.file_operations = false;

        self.events.emit(BufferEventKind::PermissionsChanged);
        self.sync_events();
    }

    fn end_save(&mut self) {
        if let Some(permissions) = self.pre_save.take() {
            self.permissions = permissions;
        }
        self.sync_events();
    }

    /// Open `path` as the new backing store and read the content from it
    fn reload(&mut self, path: &Path) -> io::Result<()> {
        let store = Arc::new(BackingStore::open(path, self.config.window_size, self.config.fixed_size)?);
        let keep = self.log.referenced_segments();
        if !self.doc.reload(&store, self.store.as_ref(), keep) {
            warn!(path = %path.display(), "saved file does not match the buffer, dropping history");
            self.log.clear();
        }
        self.store = Some(store);
        self.name = path.display().to_string();
        Ok(())
    }

    /// Runs on the save thread once the strategy has returned
    fn finish_save(&mut self, report: StrategyReport) -> SaveOutcome {
        let StrategyReport {
            mut outcome,
            current_file,
        } = report;
        let mut reloaded = false;

        if let Some(path) = current_file {
            match self.reload(&path) {
                Ok(()) => {
                    self.log.mark_saved();
                    reloaded = true;
                    debug!(path = %path.display(), "buffer now backed by saved file");
                }
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "could not reopen saved file");
                    if outcome.is_finished() {
                        outcome = SaveOutcome::Failed(SaveError::Reopen { path, source });
                    }
                }
            }
        }

        self.end_save();
        self.events.emit(BufferEventKind::PermissionsChanged);
        if reloaded {
            self.events.emit(BufferEventKind::Changed);
        }
        outcome
    }
}
