//! Durable state snapshots.
//!
//! Every 10th control cycle the daemon writes its last valid snapshot plus
//! mode to disk for crash diagnostics. The record is never read back into
//! live state, so the only invariant that matters is that a reader never
//! observes a torn file: write-temp-then-rename.

use sm_error::{Result, SkymonitorError};
use sm_protocol::PersistedState;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Atomically write the state record to `path`.
pub fn save_state_snapshot(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(state)?;

    let temp_path = path.with_extension("json.tmp");

    let mut file = fs::File::create(&temp_path).map_err(|e| SkymonitorError::FileWrite {
        path: temp_path.clone(),
        source: e,
    })?;

    file.write_all(json.as_bytes())
        .map_err(|e| SkymonitorError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;

    file.sync_all().map_err(|e| SkymonitorError::FileWrite {
        path: temp_path.clone(),
        source: e,
    })?;

    drop(file);

    fs::rename(&temp_path, path).map_err(|e| SkymonitorError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!("Saved state snapshot to {:?}", path);
    Ok(())
}
