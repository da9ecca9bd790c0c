//! Background saves.
//!
//! Each strategy is a plain function over a [`Snapshot`] and a destination. The
//! worker thread runs one of them, hands the report to the owning buffer for
//! reconciliation and then publishes the outcome on a channel.

mod in_place;
mod save_as;
mod temp_file;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::SaveError;
use crate::segment::Snapshot;
use crate::store::{BackingStore, SpaceProbe};

/// Which of the three save algorithms a save runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    /// Overwrite changed regions of the open file; size must be unchanged
    InPlace,
    /// Write a temp file, delete the original, move the temp file into place
    TempFile,
    /// Write to a new path
    SaveAs,
}

/// Recovery markers for save-via-temp-file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempFileStage {
    /// The temp file is being created and written; the original is untouched
    BeforeCreatingTemp,
    /// The temp file is complete; the original is still untouched
    BeforeDeletingOriginal,
    /// The original is gone; only the temp file holds the data
    BeforeMovingIntoPlace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAsStage {
    /// Nothing exists at the destination yet
    BeforeCreate,
    /// The destination has been created (or truncated)
    BeforeWrite,
}

/// The furthest point a save reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStage {
    InPlace,
    TempFile(TempFileStage),
    SaveAs(SaveAsStage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Start,
    Update,
    Finish,
}

#[derive(Debug)]
pub enum SaveOutcome {
    Finished,
    Cancelled,
    Failed(SaveError),
}

impl SaveOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, SaveOutcome::Finished)
    }
}

/// Cooperative cancellation flag, checked between I/O blocks
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type ProgressFn = Box<dyn FnMut(f64, ProgressPhase) + Send>;
pub type StageFn = Box<dyn FnMut(SaveStage) + Send>;
pub type CompletionFn = Box<dyn FnOnce(&SaveOutcome) + Send>;

/// Optional hooks for a save. All of them run on the save thread.
#[derive(Default)]
pub struct SaveCallbacks {
    progress: Option<ProgressFn>,
    stage: Option<StageFn>,
    completion: Option<CompletionFn>,
    cancel: Option<CancelToken>,
}

impl SaveCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the completed fraction (0.0..=1.0) as data is written
    pub fn on_progress(mut self, f: impl FnMut(f64, ProgressPhase) + Send + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Called each time the save enters a new stage
    pub fn on_stage(mut self, f: impl FnMut(SaveStage) + Send + 'static) -> Self {
        self.stage = Some(Box::new(f));
        self
    }

    /// Called once the buffer has been reconciled, before the handle resolves
    pub fn on_complete(mut self, f: impl FnOnce(&SaveOutcome) + Send + 'static) -> Self {
        self.completion = Some(Box::new(f));
        self
    }

    /// Use a caller-owned token, so cancellation can be requested from a callback
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Handle to a save running in the background
#[derive(Debug)]
pub struct SaveHandle {
    kind: SaveKind,
    cancel: CancelToken,
    written: Arc<AtomicU64>,
    total: u64,
    done: Receiver<SaveOutcome>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SaveHandle {
    pub fn kind(&self) -> SaveKind {
        self.kind
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation; honoured only before irrevocable steps
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fraction of the content written so far
    pub fn progress(&self) -> f64 {
        fraction(self.written.load(Ordering::Relaxed), self.total)
    }

    pub fn try_outcome(&mut self) -> Option<SaveOutcome> {
        let outcome = self.done.try_recv().ok()?;
        self.join();
        Some(outcome)
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<SaveOutcome> {
        match self.done.recv_timeout(timeout) {
            Ok(outcome) => {
                self.join();
                Some(outcome)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(worker_vanished()),
        }
    }

    /// Block until the save and the buffer reconciliation are complete
    pub fn wait(mut self) -> SaveOutcome {
        let outcome = self.done.recv().unwrap_or_else(|_| worker_vanished());
        self.join();
        outcome
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn worker_vanished() -> SaveOutcome {
    SaveOutcome::Failed(SaveError::Panicked(
        "save worker exited without reporting".to_string(),
    ))
}

fn fraction(written: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (written as f64 / total as f64).min(1.0)
    }
}

/// Everything a strategy needs, detached from the buffer
pub(crate) struct SaveJob {
    pub kind: SaveKind,
    pub snapshot: Snapshot,
    pub target: PathBuf,
    /// Store the buffer currently reads from
    pub store: Option<Arc<BackingStore>>,
    pub temp_dir: PathBuf,
    pub block_size: usize,
    pub probe: Arc<dyn SpaceProbe>,
}

/// What a strategy did
#[derive(Debug)]
pub(crate) struct StrategyReport {
    pub outcome: SaveOutcome,
    /// File the buffer must reload from, when its backing file changed
    pub current_file: Option<PathBuf>,
}

impl StrategyReport {
    fn finished(path: &Path) -> Self {
        Self {
            outcome: SaveOutcome::Finished,
            current_file: Some(path.to_path_buf()),
        }
    }

    fn cancelled() -> Self {
        Self {
            outcome: SaveOutcome::Cancelled,
            current_file: None,
        }
    }

    fn failed(error: SaveError) -> Self {
        Self {
            outcome: SaveOutcome::Failed(error),
            current_file: None,
        }
    }
}

/// Progress, stage and cancellation plumbing shared by the strategies
pub(crate) struct SaveControl {
    cancel: CancelToken,
    written: Arc<AtomicU64>,
    total: u64,
    block_size: usize,
    progress: Option<ProgressFn>,
    stage: Option<StageFn>,
}

impl SaveControl {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn enter(&mut self, stage: SaveStage) {
        debug!(?stage, "save stage");
        if let Some(f) = self.stage.as_mut() {
            f(stage);
        }
    }

    pub fn start(&mut self) {
        self.written.store(0, Ordering::Relaxed);
        self.report(ProgressPhase::Start);
    }

    pub fn advance(&mut self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::Relaxed);
        self.report(ProgressPhase::Update);
    }

    pub fn finish(&mut self) {
        self.report(ProgressPhase::Finish);
    }

    fn report(&mut self, phase: ProgressPhase) {
        let done = fraction(self.written.load(Ordering::Relaxed), self.total);
        if let Some(f) = self.progress.as_mut() {
            f(done, phase);
        }
    }
}

/// Whether streaming ran to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Streamed {
    Complete,
    Cancelled,
}

/// Write the whole snapshot to `out` in `block_size` units, checking for
/// cancellation before each one
pub(crate) fn stream<W: Write>(snapshot: &Snapshot, out: &mut W, ctl: &mut SaveControl) -> io::Result<Streamed> {
    let mut block = vec![0u8; ctl.block_size()];

    for segment in snapshot.segments() {
        let mut local = 0;
        while local < segment.len() {
            if ctl.is_cancelled() {
                return Ok(Streamed::Cancelled);
            }
            let n = segment.read(local, &mut block)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "segment source ended early",
                ));
            }
            out.write_all(&block[..n])?;
            local += n as u64;
            ctl.advance(n as u64);
        }
    }

    Ok(Streamed::Complete)
}

pub(crate) fn io_failure(path: &Path, stage: SaveStage) -> impl FnOnce(io::Error) -> SaveError + '_ {
    move |source| SaveError::Io {
        path: path.to_path_buf(),
        stage,
        source,
    }
}

/// Start `job` on its own thread. `prepare` runs there before the strategy
/// touches any file; if it fails the strategy is skipped. `reconcile` runs
/// once the strategy returns, whatever the result, and decides the final
/// outcome.
pub(crate) fn spawn<P, F>(job: SaveJob, callbacks: SaveCallbacks, prepare: P, reconcile: F) -> io::Result<SaveHandle>
where
    P: FnOnce() -> io::Result<()> + Send + 'static,
    F: FnOnce(StrategyReport) -> SaveOutcome + Send + 'static,
{
    let SaveCallbacks {
        progress,
        stage,
        completion,
        cancel,
    } = callbacks;

    let cancel = cancel.unwrap_or_default();
    let written = Arc::new(AtomicU64::new(0));
    let total = job.snapshot.len();
    let kind = job.kind;
    let (done_tx, done_rx) = bounded::<SaveOutcome>(1);

    let mut ctl = SaveControl {
        cancel: cancel.clone(),
        written: Arc::clone(&written),
        total,
        block_size: job.block_size.max(1),
        progress,
        stage,
    };

    info!(?kind, target = %job.target.display(), bytes = total, "starting save");

    let thread = thread::Builder::new()
        .name("hexbuf-save".to_string())
        .spawn(move || {
            let report = panic::catch_unwind(AssertUnwindSafe(|| match prepare() {
                Ok(()) => run(&job, &mut ctl),
                Err(e) => StrategyReport::failed(io_failure(&job.target, first_stage(job.kind))(e)),
            }))
            .unwrap_or_else(|payload| StrategyReport::failed(SaveError::Panicked(panic_message(payload))));

            let outcome = reconcile(report);
            info!(?kind, ?outcome, "save complete");

            if let Some(completion) = completion {
                completion(&outcome);
            }
            let _ = done_tx.send(outcome);
        })?;

    Ok(SaveHandle {
        kind,
        cancel,
        written,
        total,
        done: done_rx,
        thread: Some(thread),
    })
}

fn run(job: &SaveJob, ctl: &mut SaveControl) -> StrategyReport {
    match job.kind {
        SaveKind::InPlace => in_place::save_in_place(&job.snapshot, job.store.as_ref(), &job.target, ctl),
        SaveKind::TempFile => temp_file::save_via_temp_file(
            &job.snapshot,
            &job.target,
            &job.temp_dir,
            job.probe.as_ref(),
            ctl,
        ),
        SaveKind::SaveAs => save_as::save_as(&job.snapshot, &job.target, job.probe.as_ref(), ctl),
    }
}

fn first_stage(kind: SaveKind) -> SaveStage {
    match kind {
        SaveKind::InPlace => SaveStage::InPlace,
        SaveKind::TempFile => SaveStage::TempFile(TempFileStage::BeforeCreatingTemp),
        SaveKind::SaveAs => SaveStage::SaveAs(SaveAsStage::BeforeCreate),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Refuse a save that needs `needed` bytes in `dir` when free space is known to be short
pub(crate) fn check_free_space(probe: &dyn SpaceProbe, dir: &Path, needed: u64) -> Result<(), SaveError> {
    match probe.available_disk_space(dir) {
        Some(available) if available < needed => Err(SaveError::InsufficientDiskSpace {
            path: dir.to_path_buf(),
            needed,
            available,
        }),
        _ => Ok(()),
    }
}
