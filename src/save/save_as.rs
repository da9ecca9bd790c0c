use std::fs::{self, File, OpenOptions};
use std::path::Path;
use tracing::warn;

use super::{check_free_space, io_failure, stream, SaveAsStage, SaveControl, SaveStage, Streamed, StrategyReport};
use crate::segment::Snapshot;
use crate::store::SpaceProbe;

/// Write `snapshot` to a new file at `dest`
pub(crate) fn save_as(
    snapshot: &Snapshot,
    dest: &Path,
    probe: &dyn SpaceProbe,
    ctl: &mut SaveControl,
) -> StrategyReport {
    let mut stage = SaveStage::SaveAs(SaveAsStage::BeforeCreate);
    ctl.enter(stage);

    let dir = parent_dir(dest);
    if let Err(e) = check_free_space(probe, dir, snapshot.len()) {
        return StrategyReport::failed(e);
    }

    // An append-mode open never truncates, so a file held open elsewhere
    // fails here with its contents intact.
    if let Err(e) = OpenOptions::new().append(true).create(true).open(dest) {
        return StrategyReport::failed(io_failure(dest, stage)(e));
    }
    let mut file = match File::create(dest) {
        Ok(file) => file,
        Err(e) => return StrategyReport::failed(io_failure(dest, stage)(e)),
    };

    stage = SaveStage::SaveAs(SaveAsStage::BeforeWrite);
    ctl.enter(stage);
    ctl.start();

    let written = stream(snapshot, &mut file, ctl).and_then(|streamed| {
        file.sync_all()?;
        Ok(streamed)
    });
    drop(file);

    match written {
        Ok(Streamed::Complete) if !ctl.is_cancelled() => {
            ctl.finish();
            StrategyReport::finished(dest)
        }
        Ok(_) => {
            discard(dest);
            StrategyReport::cancelled()
        }
        Err(e) => {
            discard(dest);
            StrategyReport::failed(io_failure(dest, stage)(e))
        }
    }
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Best-effort removal of a partially written file
pub(crate) fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not remove partial save");
    }
}
