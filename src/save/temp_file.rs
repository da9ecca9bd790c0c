use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::save_as::discard;
use super::{check_free_space, io_failure, stream, SaveControl, SaveStage, Streamed, StrategyReport, TempFileStage};
use crate::segment::Snapshot;
use crate::store::SpaceProbe;

/// Write `snapshot` to a temp file in `temp_dir`, then replace `original` with it.
///
/// Until the original is deleted any cancel or fault leaves it untouched and the
/// temp file is removed. After deletion cancellation is ignored; if moving the
/// temp file then fails, the temp file is reported as the buffer's new file.
pub(crate) fn save_via_temp_file(
    snapshot: &Snapshot,
    original: &Path,
    temp_dir: &Path,
    probe: &dyn SpaceProbe,
    ctl: &mut SaveControl,
) -> StrategyReport {
    let mut stage = SaveStage::TempFile(TempFileStage::BeforeCreatingTemp);
    ctl.enter(stage);

    if let Err(e) = check_free_space(probe, temp_dir, snapshot.len()) {
        return StrategyReport::failed(e);
    }

    let (mut file, temp_path) = match create_temp(temp_dir) {
        Ok(created) => created,
        Err(e) => return StrategyReport::failed(io_failure(temp_dir, stage)(e)),
    };
    debug!(temp = %temp_path.display(), "writing temp file");

    ctl.start();
    let written = stream(snapshot, &mut file, ctl).and_then(|streamed| {
        file.sync_all()?;
        Ok(streamed)
    });
    drop(file);

    match written {
        Ok(Streamed::Complete) => ctl.finish(),
        Ok(Streamed::Cancelled) => {
            discard(&temp_path);
            return StrategyReport::cancelled();
        }
        Err(e) => {
            discard(&temp_path);
            return StrategyReport::failed(io_failure(&temp_path, stage)(e));
        }
    }

    stage = SaveStage::TempFile(TempFileStage::BeforeDeletingOriginal);
    ctl.enter(stage);

    if ctl.is_cancelled() {
        discard(&temp_path);
        return StrategyReport::cancelled();
    }
    if let Err(e) = fs::remove_file(original) {
        discard(&temp_path);
        return StrategyReport::failed(io_failure(original, stage)(e));
    }

    // No way back from here: the temp file is the only copy of the data.
    stage = SaveStage::TempFile(TempFileStage::BeforeMovingIntoPlace);
    ctl.enter(stage);

    match move_into_place(&temp_path, original) {
        Ok(()) => StrategyReport::finished(original),
        Err(e) => {
            warn!(
                temp = %temp_path.display(),
                error = %e,
                "could not move temp file into place, keeping it as the current file"
            );
            StrategyReport {
                outcome: super::SaveOutcome::Failed(io_failure(original, stage)(e)),
                current_file: Some(temp_path),
            }
        }
    }
}

fn create_temp(temp_dir: &Path) -> io::Result<(fs::File, PathBuf)> {
    let named = tempfile::Builder::new()
        .prefix(".hexbuf-save-")
        .suffix(".tmp")
        .tempfile_in(temp_dir)?;
    // cleanup is driven by the stage reached, not by drop
    named.keep().map_err(|e| e.error)
}

fn move_into_place(temp: &Path, original: &Path) -> io::Result<()> {
    match fs::rename(temp, original) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!("temp dir is on another device, copying into place");
            if let Err(copy_err) = reflink_copy::reflink_or_copy(temp, original) {
                // a half-copied original is worse than none
                let _ = fs::remove_file(original);
                return Err(copy_err);
            }
            if let Err(e) = fs::remove_file(temp) {
                warn!(temp = %temp.display(), error = %e, "could not remove temp file after copy");
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
