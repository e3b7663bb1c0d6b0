use const_format::formatcp;

// Filesystem labels for the well-known partitions.

/// Label of the state partition holding the active and passive images.
pub const STATE_LABEL: &str = "COS_STATE";

/// Label of the recovery partition.
pub const RECOVERY_LABEL: &str = "COS_RECOVERY";

/// Label of the persistent data partition.
pub const PERSISTENT_LABEL: &str = "COS_PERSISTENT";

/// Label of the OEM configuration partition.
pub const OEM_LABEL: &str = "COS_OEM";

/// Label of the EFI system partition.
pub const EFI_LABEL: &str = "COS_GRUB";

/// Filesystem label of the active image.
pub const ACTIVE_IMG_LABEL: &str = "COS_ACTIVE";

/// Filesystem label of the passive image.
pub const PASSIVE_IMG_LABEL: &str = "COS_PASSIVE";

/// Filesystem label of the recovery image.
pub const RECOVERY_IMG_LABEL: &str = "COS_SYSTEM";

// Runtime directories.

/// Runtime directory of the agent.
pub const RUN_DIR: &str = "/run/keel";

/// Mount point of the state partition during servicing.
pub const STATE_MOUNT_POINT: &str = formatcp!("{RUN_DIR}/state");

/// Mount point of the recovery partition during servicing.
pub const RECOVERY_MOUNT_POINT: &str = formatcp!("{RUN_DIR}/recovery");

/// Mount point of the persistent partition.
pub const PERSISTENT_MOUNT_POINT: &str = "/usr/local";

/// Mount point of the OEM partition.
pub const OEM_MOUNT_POINT: &str = "/oem";

/// Mount point of the EFI system partition.
pub const EFI_MOUNT_POINT: &str = "/efi";

/// Loop-mount point for a freshly deployed image under inspection.
pub const TRANSITION_MOUNT_POINT: &str = formatcp!("{RUN_DIR}/transition");

// Image slot files, relative to their partition mount point.

/// Directory holding the slot images on the state and recovery partitions.
pub const IMAGES_DIR: &str = "images";

/// Active image file, relative to the state mount point.
pub const ACTIVE_IMG_FILE: &str = formatcp!("{IMAGES_DIR}/active.img");

/// Passive image file, relative to the state mount point.
pub const PASSIVE_IMG_FILE: &str = formatcp!("{IMAGES_DIR}/passive.img");

/// Recovery image file, relative to the recovery mount point.
pub const RECOVERY_IMG_FILE: &str = formatcp!("{IMAGES_DIR}/recovery.img");

/// Staging file an image is deployed to before the atomic rename into its
/// final slot location.
pub const TRANSITION_IMG_FILE: &str = formatcp!("{IMAGES_DIR}/transition.img");

/// Name of the install state document written to the state and recovery
/// partitions.
pub const STATE_FILE_NAME: &str = "state.yaml";

/// Root filesystem image expected inside an installation ISO.
pub const ISO_ROOTFS_FILE: &str = "rootfs.squashfs";

// Boot entry resolution.

/// GRUB config locations scanned for `--id` menu stanzas. Missing files are
/// skipped.
pub const GRUB_CONF_PATHS: [&str; 4] = [
    "/etc/keel/grub.cfg",
    "/etc/keel/branding/grubmenu.cfg",
    formatcp!("{STATE_MOUNT_POINT}/grub2/grub.cfg"),
    formatcp!("{STATE_MOUNT_POINT}/grubmenu"),
];

/// GRUB environment block consulted by the boot menu on next boot.
pub const GRUB_ENV_PATH: &str = formatcp!("{OEM_MOUNT_POINT}/grubenv");

/// Menu entry id the default boot entry is pointed back at after servicing.
pub const DEFAULT_MENU_ENTRY: &str = "cos";

/// systemd-boot loader directory, relative to the EFI mount point.
pub const LOADER_DIR: &str = "loader";

/// systemd-boot entry directory, relative to the EFI mount point.
pub const LOADER_ENTRIES_DIR: &str = formatcp!("{LOADER_DIR}/entries");

/// systemd-boot loader configuration, relative to the EFI mount point.
pub const LOADER_CONF_FILE: &str = formatcp!("{LOADER_DIR}/loader.conf");

/// Directory holding the EFI binaries of the slot entries, relative to the
/// EFI mount point.
pub const EFI_BINARIES_DIR: &str = "EFI/keel";

// System extensions.

/// Pool of installed but not yet role-assigned extension images.
pub const SYSEXT_INSTALL_DIR: &str = "/var/lib/keel/extensions";

/// Runtime directory systemd-sysext merges extensions from.
pub const SYSEXT_RUNTIME_DIR: &str = "/run/extensions";

/// Service restarted when the live extension set changes.
pub const SYSEXT_SERVICE: &str = "systemd-sysext";

// Misc.

/// Default path of the agent configuration document.
pub const AGENT_CONFIG_PATH: &str = "/etc/keel/config.yaml";

/// Default size of a freshly created slot image, in MiB.
pub const DEFAULT_IMAGE_SIZE_MIB: u64 = 3072;

/// Seconds to wait before a requested reboot or poweroff after a reset.
pub const SHUTDOWN_DELAY_SECS: u64 = 5;

/// Shutdown script written when installing from CD with eject requested.
pub const EJECT_SCRIPT_PATH: &str = "/usr/lib/systemd/system-shutdown/eject.sh";
