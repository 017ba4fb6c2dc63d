use std::{
    env,
    path::{Path, PathBuf},
};

use crate::VirtlingResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a path to absolute form against the process working directory.
///
/// Paths in the configuration document are interpreted relative to the
/// working directory and converted to absolute form before any hypervisor
/// object sees them. Absolute paths are returned unchanged.
pub fn absolutize(path: impl AsRef<Path>) -> VirtlingResult<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(env::current_dir()?.join(path))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
