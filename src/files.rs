//! File persistence with explicit permission modes.

use std::fs;
use std::io::Write;
use std::path::Path;

/// Mode for the rendered Dex config: owner read/write, world readable.
pub const PUBLIC_FILE_MODE: u32 = 0o644;

/// Mode for private key material: owner read/write only.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Write `contents` to `path`, creating or truncating it, and apply `mode`.
///
/// The mode is applied at creation time and again afterwards, since an
/// existing file keeps its old permissions when opened for truncation.
/// On non-unix platforms the mode is ignored.
///
/// # Errors
///
/// Returns the underlying I/O error if the file cannot be opened, written,
/// or its permissions updated.
pub fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
