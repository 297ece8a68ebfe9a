//! Sandbox configuration tunables.

use std::path::PathBuf;

/// Tunables of the filesystem jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailOptions {
    /// Directory holding the staging tmpfs.
    pub staging_dir: PathBuf,

    /// Size of the staging tmpfs.
    pub staging_size: String,

    /// Size of the jail root tmpfs.
    pub root_size: String,

    /// Permission bits of the jail root.
    pub root_mode: u32,
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/tmp/sandbox")
}

fn default_staging_size() -> String {
    "4k".to_string()
}

fn default_root_size() -> String {
    "1M".to_string()
}

fn default_root_mode() -> u32 {
    0o700
}

impl Default for JailOptions {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            staging_size: default_staging_size(),
            root_size: default_root_size(),
            root_mode: default_root_mode(),
        }
    }
}

// Only the Linux jail mounts anything.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
impl JailOptions {
    pub(crate) fn staging_mount_data(&self) -> String {
        format!("size={}", self.staging_size)
    }

    pub(crate) fn root_mount_data(&self) -> String {
        format!("size={},mode={:04o}", self.root_size, self.root_mode)
    }
}
