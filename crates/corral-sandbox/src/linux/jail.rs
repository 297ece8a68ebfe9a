//! Filesystem jail: a private tmpfs root populated with bind mounts.
//!
//! Building the jail needs a mount namespace owned by the caller. The steps
//! run in order and none of them is undone on failure:
//!
//! 1. mount a small private tmpfs staging area (idempotent),
//! 2. mount the jail root, a uniquely named tmpfs inside the staging area,
//! 3. bind mount every requested path under the jail root; read-only binds
//!    are remounted read-only together with every mount nested below them,
//! 4. remount the jail root read-only,
//! 5. pivot into the jail root and detach the old root,
//! 6. change directory to the new `/`.

use crate::config::JailOptions;
use crate::error::{ApplyPhase, SandboxError};
use crate::policy::BindMount;
use crate::Result;
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::unistd::{chdir, fchdir, pivot_root};
use std::ffi::OsString;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Accumulated bind mounts and the options used to build the jail.
#[derive(Debug, Default)]
pub struct FilesystemJail {
    mounts: Vec<BindMount>,
    options: JailOptions,
}

impl FilesystemJail {
    /// Create an empty jail.
    pub fn new(options: JailOptions) -> Self {
        Self {
            mounts: Vec::new(),
            options,
        }
    }

    /// Queue a bind mount. Mounts are made in the order they are added.
    pub fn add(&mut self, bind: BindMount) {
        self.mounts.push(bind);
    }

    /// Queued bind mounts.
    pub fn mounts(&self) -> &[BindMount] {
        &self.mounts
    }

    /// Tunables used when the jail is built.
    pub fn options(&self) -> &JailOptions {
        &self.options
    }

    /// Replace the tunables.
    pub fn set_options(&mut self, options: JailOptions) {
        self.options = options;
    }

    /// Build the jail and switch the calling process into it.
    ///
    /// Must run inside a fresh mount namespace. An empty mount list still
    /// yields a valid, empty, read-only root.
    pub fn enter(&self) -> Result<()> {
        self.prepare_staging()?;
        let root = self.create_root()?;

        for bind in &self.mounts {
            bind_mount(bind, &root)?;
        }

        self.seal_root(&root)?;
        switch_root(&root)?;

        debug!("Filesystem jail entered ({} bind mounts)", self.mounts.len());
        Ok(())
    }

    fn prepare_staging(&self) -> Result<()> {
        let staging = &self.options.staging_dir;

        fs::create_dir_all(staging)
            .map_err(|e| jail_error(format!("Failed to create '{}'", staging.display()), e))?;

        let data = self.options.staging_mount_data();
        match mount(
            Some("tmpfs"),
            staging.as_path(),
            Some("tmpfs"),
            MsFlags::empty(),
            Some(data.as_str()),
        ) {
            Ok(()) | Err(Errno::EBUSY) => {}
            Err(e) => {
                return Err(jail_error(
                    format!("Failed to mount tmpfs on '{}'", staging.display()),
                    e,
                ))
            }
        }

        make_private(staging, MsFlags::empty())
    }

    fn create_root(&self) -> Result<PathBuf> {
        let root = self
            .options
            .staging_dir
            .join(Uuid::new_v4().simple().to_string());

        DirBuilder::new()
            .mode(self.options.root_mode)
            .create(&root)
            .map_err(|e| jail_error(format!("Failed to create '{}'", root.display()), e))?;

        let data = self.options.root_mount_data();
        mount(
            Some("tmpfs"),
            root.as_path(),
            Some("tmpfs"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(|e| jail_error(format!("Failed to mount tmpfs on '{}'", root.display()), e))?;
        make_private(&root, MsFlags::empty())?;

        debug!("Sandbox filesystem root: '{}'", root.display());
        Ok(root)
    }

    fn seal_root(&self, root: &Path) -> Result<()> {
        let data = self.options.root_mount_data();
        mount(
            None::<&str>,
            root,
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            Some(data.as_str()),
        )
        .map_err(|e| {
            jail_error(
                format!("Failed to remount '{}' read-only", root.display()),
                e,
            )
        })
    }
}

fn jail_error(context: String, source: impl Into<io::Error>) -> SandboxError {
    SandboxError::apply(ApplyPhase::MountJail, context, source)
}

fn make_private(path: &Path, extra: MsFlags) -> Result<()> {
    mount(
        None::<&str>,
        path,
        None::<&str>,
        MsFlags::MS_PRIVATE | extra,
        None::<&str>,
    )
    .map_err(|e| jail_error(format!("Failed to set MS_PRIVATE on '{}'", path.display()), e))
}

/// Create an empty directory or file at `target` matching the type of `source`.
pub fn create_mount_point(source: &Path, target: &Path) -> Result<()> {
    let metadata = fs::metadata(source)
        .map_err(|e| jail_error(format!("Failed to stat '{}'", source.display()), e))?;

    let created = if metadata.is_dir() {
        fs::create_dir_all(target)
    } else {
        target
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(target)
                    .map(drop)
            })
    };

    created.map_err(|e| jail_error(format!("Failed to create '{}'", target.display()), e))
}

fn bind_mount(bind: &BindMount, root: &Path) -> Result<()> {
    let target = bind.dest_under(root);
    create_mount_point(&bind.source, &target)?;

    mount(
        Some(bind.source.as_path()),
        target.as_path(),
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        jail_error(
            format!(
                "Failed to mount '{}' to '{}'",
                bind.source.display(),
                target.display()
            ),
            e,
        )
    })?;

    if bind.readonly {
        remount_readonly(&target)?;
        for submount in submounts(&target)? {
            remount_readonly(&submount)?;
        }
    }

    debug!(
        "Mounted '{}' at '{}'{}",
        bind.source.display(),
        bind.dest.display(),
        if bind.readonly { " (read-only)" } else { "" }
    );
    Ok(())
}

/// A bind mount ignores `MS_RDONLY` until it is remounted.
///
/// The remount has to repeat the flags the kernel locked on the source mount,
/// otherwise it fails with `EPERM` inside a user namespace.
fn remount_readonly(target: &Path) -> Result<()> {
    let current = statvfs(target)
        .map_err(|e| jail_error(format!("Failed to stat mount '{}'", target.display()), e))?;

    let flags =
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | locked_flags(current.flags());
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(|e| {
        jail_error(
            format!("Failed to remount '{}' read-only", target.display()),
            e,
        )
    })
}

/// Mount points strictly below `target` in the caller's mount namespace.
///
/// The read-only remount only covers the top of a recursive bind, so every
/// mount it dragged along is remounted on its own.
fn submounts(target: &Path) -> Result<Vec<PathBuf>> {
    let target = fs::canonicalize(target)
        .map_err(|e| jail_error(format!("Failed to resolve '{}'", target.display()), e))?;
    let mountinfo = fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| jail_error("Failed to read /proc/self/mountinfo".to_string(), e))?;

    Ok(nested_mounts(&mountinfo, &target))
}

/// Mounts listed below `target` after its most recent mount.
///
/// Earlier entries under the same path are hidden by that mount.
fn nested_mounts(mountinfo: &str, target: &Path) -> Vec<PathBuf> {
    let points: Vec<_> = mount_points(mountinfo).collect();
    let start = points
        .iter()
        .rposition(|point| point == target)
        .map_or(0, |i| i + 1);

    points
        .into_iter()
        .skip(start)
        .filter(|point| point.starts_with(target) && point != target)
        .collect()
}

/// Mount points listed in a `mountinfo` table, in mount order.
fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(unescape_mount_path)
}

// The kernel writes space, tab, newline and backslash as `\ooo`.
fn unescape_mount_path(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|digits| {
            bytes[i] == b'\\' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        });
        match octal {
            Some(digits) => {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    PathBuf::from(OsString::from_vec(out))
}

fn locked_flags(fs_flags: FsFlags) -> MsFlags {
    const LOCKED: [(FsFlags, MsFlags); 6] = [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ];

    LOCKED
        .iter()
        .filter(|(st, _)| fs_flags.contains(*st))
        .fold(MsFlags::empty(), |acc, (_, ms)| acc | *ms)
}

fn open_dir_path(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_PATH | libc::O_DIRECTORY)
        .open(path)
        .map_err(|e| jail_error(format!("Failed to open directory '{}'", path.display()), e))
}

/// Make `root` the process root and detach everything else.
fn switch_root(root: &Path) -> Result<()> {
    let old_root = open_dir_path(Path::new("/"))?;
    let new_root = open_dir_path(root)?;

    fchdir(new_root.as_raw_fd()).map_err(|e| {
        jail_error(
            format!("Failed to change current directory to '{}'", root.display()),
            e,
        )
    })?;

    // The old root ends up stacked under the new one.
    pivot_root(".", ".")
        .map_err(|e| jail_error("Failed to pivot root mount point".to_string(), e))?;

    fchdir(old_root.as_raw_fd()).map_err(|e| {
        jail_error(
            "Failed to change current directory to old '/'".to_string(),
            e,
        )
    })?;
    make_private(Path::new("."), MsFlags::MS_REC)?;

    // The old root may be stacked several times; detach until nothing is left.
    umount2(".", MntFlags::MNT_DETACH)
        .map_err(|e| jail_error("Failed to unmount old root mount point".to_string(), e))?;
    loop {
        match umount2(".", MntFlags::MNT_DETACH) {
            Ok(()) => continue,
            Err(Errno::EINVAL) => break,
            Err(e) => {
                return Err(jail_error(
                    "Failed to unmount old root mount point".to_string(),
                    e,
                ))
            }
        }
    }

    chdir("/").map_err(|e| {
        jail_error(
            "Failed to change current directory to new '/'".to_string(),
            e,
        )
    })
}
