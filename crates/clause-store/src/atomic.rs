use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use tracing::{debug, warn};

const TEMP_SUFFIX: &str = ".tmp";

/// Replace `dir/file_name` with `bytes` so that a crash at any point leaves
/// either the previous content or the new content, never a mix.
///
/// The data goes to a hidden sibling temp file (`.<stem>.XXXX.tmp`), is
/// fsynced, renamed over the target, and the directory entry is fsynced.
pub fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> io::Result<()> {
    let stem = file_name.split('.').next().unwrap_or(file_name);
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{stem}."))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(file_name)).map_err(|e| e.error)?;
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

pub fn is_temp_file(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(TEMP_SUFFIX)
}

/// Remove temp files left behind by writes interrupted by a crash.
pub fn sweep_temp_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_temp_file(name) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(file = name, "removed stale temp file");
                removed += 1;
            }
            Err(e) => warn!(file = name, error = %e, "failed to remove stale temp file"),
        }
    }
    removed
}
