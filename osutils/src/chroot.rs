use std::{
    fs, mem,
    os::{
        fd::{IntoRawFd, RawFd},
        unix,
    },
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::{debug, warn};
use sys_mount::{Mount, MountFlags, Unmount, UnmountDrop, UnmountFlags};

use crate::files;

/// A chroot environment with the special directories ('/dev', '/proc',
/// '/sys') and any requested bind mounts in place.
///
/// Note: Dropping this object does *not* exit the chroot. Use
/// `execute_and_exit()`.
pub struct Chroot {
    rootfd: RawFd,
    mounts: Vec<UnmountDrop<Mount>>,
}

impl Chroot {
    /// Mount special directories and the given bind mounts (host path ->
    /// path relative to the new root), then enter the chroot.
    pub fn enter(path: &Path, binds: &[(PathBuf, PathBuf)]) -> Result<Self, Error> {
        if !path.exists() {
            bail!("Chroot path '{}' does not exist", path.display());
        }

        debug!("Mounting special directories under '{}'", path.display());
        let mut mounts = vec![
            Mount::builder()
                .fstype("devtmpfs")
                .flags(MountFlags::empty())
                .mount("devtmpfs", path.join("dev"))
                .context("Failed to mount '/dev' for chroot")?
                .into_unmount_drop(UnmountFlags::empty()),
            Mount::builder()
                .fstype("proc")
                .flags(MountFlags::empty())
                .mount("proc", path.join("proc"))
                .context("Failed to mount '/proc' for chroot")?
                .into_unmount_drop(UnmountFlags::empty()),
            Mount::builder()
                .fstype("sysfs")
                .flags(MountFlags::empty())
                .mount("sysfs", path.join("sys"))
                .context("Failed to mount '/sys' for chroot")?
                .into_unmount_drop(UnmountFlags::empty()),
        ];

        for (host_path, rel_path) in binds {
            let target = crate::path::join_relative(path, rel_path);
            files::create_dirs(&target)?;
            mounts.push(
                Mount::builder()
                    .flags(MountFlags::BIND)
                    .mount(host_path, &target)
                    .context(format!(
                        "Failed to bind mount '{}' at '{}' for chroot",
                        host_path.display(),
                        target.display()
                    ))?
                    .into_unmount_drop(UnmountFlags::empty()),
            );
        }

        debug!("Entering chroot");
        let rootfd = fs::File::open("/")
            .context("Failed to open current root")?
            .into_raw_fd();
        unix::fs::chroot(path).context("Failed to enter chroot")?;
        std::env::set_current_dir("/").context("Failed to change directory into chroot")?;

        Ok(Self { rootfd, mounts })
    }

    /// Runs `f` inside the chroot and always exits afterwards. If `f` failed,
    /// exit errors are logged and the original error is returned.
    pub fn execute_and_exit<F>(self, f: F) -> Result<(), Error>
    where
        F: FnOnce() -> Result<(), Error>,
    {
        let result = f();

        if let Err(e) = self.exit() {
            if result.is_ok() {
                return Err(e);
            }
            warn!("Encountered secondary error while handling earlier error: {e:?}");
        }
        result
    }

    /// Exit the chroot environment and unmount everything mounted on entry.
    fn exit(self) -> Result<(), Error> {
        nix::unistd::fchdir(self.rootfd).context("Failed to return to original root")?;
        unix::fs::chroot(".").context("Failed to exit chroot")?;
        debug!("Exited chroot");

        // Bind mounts came after the special directories, so unmount in
        // reverse registration order.
        for mount in self.mounts.into_iter().rev() {
            mount
                .unmount(UnmountFlags::empty())
                .context("Failed to unmount chroot directory")?;
            mem::forget(mount);
        }
        Ok(())
    }
}
