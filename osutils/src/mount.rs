use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Error};
use log::warn;

use crate::{dependencies::Dependency, files};

/// Mounts a file or block device at mount_dir. Regular files are mounted
/// through a loop device.
pub fn mount(
    path: impl AsRef<Path>,
    mount_dir: impl AsRef<Path>,
    filesystem: Option<&str>,
    options: &[String],
) -> Result<(), Error> {
    let mut options = options.to_owned();
    let mut command = Dependency::Mount.cmd();

    if path.as_ref().is_file() {
        options.push("loop".into());
    }

    if !options.is_empty() {
        command.arg("-o").arg(options.join(","));
    }

    if let Some(fs_name) = filesystem {
        command.arg("-t").arg(fs_name);
    }

    command
        .arg(path.as_ref())
        .arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to mount {} to path {}",
            path.as_ref().display(),
            mount_dir.as_ref().display(),
        ))?;

    Ok(())
}

/// Creates a bind mount of path at mount_dir.
pub fn bind_mount(path: impl AsRef<Path>, mount_dir: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Mount
        .cmd()
        .with_arg("--bind")
        .with_arg(path.as_ref())
        .with_arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to mount {} as a bind mount for {}",
            path.as_ref().display(),
            mount_dir.as_ref().display(),
        ))
}

/// Remounts an existing mount point read-write or read-only.
pub fn remount(mount_dir: impl AsRef<Path>, read_write: bool) -> Result<(), Error> {
    let mode = if read_write { "remount,rw" } else { "remount,ro" };
    Dependency::Mount
        .cmd()
        .with_arg("-o")
        .with_arg(mode)
        .with_arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to remount {} as {}",
            mount_dir.as_ref().display(),
            if read_write { "read-write" } else { "read-only" },
        ))
}

/// Unmounts mount_dir.
pub fn umount(mount_dir: impl AsRef<Path>, recursive: bool) -> Result<(), Error> {
    let mut cmd = Dependency::Umount.cmd();
    if recursive {
        cmd.arg("-R");
    }

    cmd.arg(mount_dir.as_ref()).run_and_check().context(format!(
        "Failed to unmount directory {}",
        mount_dir.as_ref().display()
    ))
}

/// Unmounts a directory when dropped, so that an early return cannot leak
/// the mount.
pub struct MountGuard<'a> {
    pub mount_dir: &'a Path,
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = umount(self.mount_dir, false) {
            warn!(
                "Failed to unmount directory {}: {}",
                self.mount_dir.display(),
                e
            );
        }
    }
}

/// Ensure that the target_path is a suitable path for a mount point
pub fn ensure_mount_directory(target_path: &Path) -> Result<(), Error> {
    if target_path.exists() {
        if !target_path.is_dir() {
            bail!("Mount path '{}' is not a directory", target_path.display());
        }
    } else {
        files::create_dirs(target_path).context(format!(
            "Failed to create mount path '{}'",
            target_path.display()
        ))?;
    }

    Ok(())
}

/// Whether path is currently a mount point, per /proc/mounts.
pub fn is_mountpoint(path: &Path) -> Result<bool, Error> {
    let mounts = fs::read_to_string("/proc/mounts").context("Failed to read /proc/mounts")?;
    let needle = path.to_string_lossy();
    Ok(mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mounted| mounted == needle))
}
