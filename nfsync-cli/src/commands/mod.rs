pub mod daemon;
pub mod ids;
pub mod reset;
pub mod run;
pub mod status;

use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use nfsync_daemon::{request, DaemonError, DaemonRequest};

/// Send `req` to a live daemon. `None` means no daemon is listening and the
/// caller may touch the stores itself.
pub(crate) fn via_daemon(data_dir: &Path, req: &DaemonRequest) -> Result<Option<Value>> {
    match request(data_dir, req) {
        Ok(data) => Ok(Some(data)),
        Err(DaemonError::DaemonNotRunning { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
