pub mod chroot;
pub mod dependencies;
pub mod exe;
pub mod files;
pub mod grubenv;
pub mod loader;
pub mod lsblk;
pub mod mount;
pub mod path;
pub mod systemd;
pub mod tune2fs;

pub(crate) mod crate_private {
    pub trait Sealed {}
}
