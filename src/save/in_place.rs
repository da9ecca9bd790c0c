use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{io_failure, SaveControl, SaveStage, StrategyReport};
use crate::segment::{Segment, Snapshot};
use crate::store::BackingStore;

/// Overwrite the regions of `path` whose content differs from `snapshot`.
///
/// Segments still reading from `store` at their own offset are skipped. Segments
/// reading from `store` at another offset are copied into memory first, since
/// writing may clobber their source. An interrupted run leaves the file partly
/// updated; its size never changes.
pub(crate) fn save_in_place(
    snapshot: &Snapshot,
    store: Option<&Arc<BackingStore>>,
    path: &Path,
    ctl: &mut SaveControl,
) -> StrategyReport {
    let stage = SaveStage::InPlace;
    ctl.enter(stage);
    ctl.start();

    let mut pending: Vec<(u64, Segment)> = Vec::new();
    let mut unchanged = 0u64;

    for (offset, segment) in snapshot.iter_with_offsets() {
        match store {
            Some(store) if segment.is_backed_by(store) => {
                if segment.start() == offset {
                    unchanged += segment.len();
                    continue;
                }
                match segment.to_private() {
                    Ok(private) => pending.push((offset, private)),
                    Err(e) => return StrategyReport::failed(io_failure(path, stage)(e)),
                }
            }
            _ => pending.push((offset, segment.clone())),
        }
    }

    debug!(
        regions = pending.len(),
        unchanged,
        "writing changed regions in place"
    );
    ctl.advance(unchanged);

    let mut file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(e) => return StrategyReport::failed(io_failure(path, stage)(e)),
    };

    let mut block = vec![0u8; ctl.block_size()];
    for (offset, segment) in &pending {
        if let Err(e) = file.seek(SeekFrom::Start(*offset)) {
            return StrategyReport::failed(io_failure(path, stage)(e));
        }

        let mut local = 0;
        while local < segment.len() {
            if ctl.is_cancelled() {
                return StrategyReport::cancelled();
            }
            let n = match segment.read(local, &mut block) {
                Ok(0) => {
                    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "segment source ended early");
                    return StrategyReport::failed(io_failure(path, stage)(eof));
                }
                Ok(n) => n,
                Err(e) => return StrategyReport::failed(io_failure(path, stage)(e)),
            };
            if let Err(e) = file.write_all(&block[..n]) {
                return StrategyReport::failed(io_failure(path, stage)(e));
            }
            local += n as u64;
            ctl.advance(n as u64);
        }
    }

    if let Err(e) = file.sync_all() {
        return StrategyReport::failed(io_failure(path, stage)(e));
    }
    ctl.finish();

    StrategyReport::finished(path)
}
