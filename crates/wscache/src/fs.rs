//! Ring file creation and opening.

use std::fs::{File, OpenOptions};
use std::path::Path;

use tracing::{info, warn};

use crate::error::CacheResult;

/// Opens (or creates) the ring file at `path` with exactly `len` bytes.
///
/// An existing file of a different size is resized; growth preserves the
/// old contents, shrinkage is reported because it usually means the
/// operator changed the configured cache size and recovery will find a
/// truncated ring.
pub fn open_ring_file(path: &Path, len: u64) -> CacheResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    let current = file.metadata()?.len();
    if current == 0 {
        info!(path = %path.display(), len, "creating ring file");
        file.set_len(len)?;
    } else if current != len {
        if current > len {
            warn!(
                path = %path.display(),
                old = current,
                new = len,
                "ring file shrinks; buffers beyond the new end are lost"
            );
        }
        file.set_len(len)?;
    }
    Ok(file)
}
