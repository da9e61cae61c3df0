// File permission hardening for local state that may hold credentials.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub fn ensure_owner_only_file(path: &Path) -> Result<()> {
    restrict_mode(path, 0o600)
}

pub fn ensure_owner_only_dir(path: &Path) -> Result<()> {
    restrict_mode(path, 0o700)
}

#[cfg(unix)]
fn restrict_mode(path: &Path, wanted: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if !path.exists() {
        return Ok(());
    }

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to read metadata for `{}`", path.display()))?;
    if metadata.permissions().mode() & 0o777 != wanted {
        fs::set_permissions(path, fs::Permissions::from_mode(wanted))
            .with_context(|| format!("failed to set owner-only mode on `{}`", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path, _wanted: u32) -> Result<()> {
    Ok(())
}
