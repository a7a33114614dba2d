//! Source size resolution for regular files and block devices

use crate::{Error, Result};
use std::fs;
use std::path::Path;

/// Resolve the total byte length of a backup source.
///
/// Regular files report their stat size. Block-special files report the
/// raw capacity of the device, which stat does not expose.
pub fn target_size_in_bytes(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if metadata.file_type().is_block_device() {
            tracing::debug!(path = %path.display(), "source is a block device");
            return block_device_size(path);
        }
    }

    Ok(metadata.len())
}

/// Query the capacity of a block-special file via blockdev(8).
#[cfg(unix)]
fn block_device_size(path: &Path) -> Result<u64> {
    let output = std::process::Command::new("blockdev")
        .arg("--getsize64")
        .arg(path)
        .output()?;

    if !output.status.success() {
        return Err(Error::DeviceProbe {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u64>()
        .map_err(|err| Error::DeviceProbe {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}
