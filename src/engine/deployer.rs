use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::{debug, info};

use keel_api::config::{FileSystem, ImageSource, ImageSpec, InstallSpec, PartitionSpec};
use osutils::{
    dependencies::Dependency,
    files,
    lsblk,
    mount::{self, MountGuard},
    tune2fs,
};

/// The partitioning and image deployment service the orchestrators drive.
///
/// Implementations own all block-device and filesystem mutation; the
/// orchestrators only sequence calls. Postconditions: after `deploy_image`
/// the image file exists and is mounted at its mount point until
/// `umount_image`; after `mount_partition` the partition is mounted at its
/// configured mount point until `umount`.
pub trait Deployer {
    /// Whether a deployment carrying this spec's well-known labels is
    /// already present on any disk.
    fn detect_deployment(&self, spec: &InstallSpec) -> Result<bool, Error>;

    /// Picks an install target when none was configured.
    fn detect_install_target(&self) -> Result<Option<PathBuf>, Error>;

    /// Writes a fresh partition table to the install target and formats
    /// every configured partition. Destroys existing data. Not reversible.
    fn partition_and_format(&self, spec: &InstallSpec) -> Result<(), Error>;

    /// Whether a block device carrying the partition's label is present.
    fn partition_exists(&self, part: &PartitionSpec) -> Result<bool, Error>;

    /// Reformats a single partition located by its filesystem label.
    fn format_partition(&self, part: &PartitionSpec, fs: FileSystem) -> Result<(), Error>;

    /// Mounts a partition located by its filesystem label at its configured
    /// mount point. Returns the mount path.
    fn mount_partition(&self, part: &PartitionSpec, read_write: bool) -> Result<PathBuf, Error>;

    fn umount(&self, path: &Path) -> Result<(), Error>;

    /// Creates the image file, populates it from its source and leaves it
    /// mounted at the image's mount point. Returns deployment metadata
    /// (image digest or similar) when the source provides any.
    fn deploy_image(&self, image: &ImageSpec) -> Result<Option<String>, Error>;

    fn umount_image(&self, image: &ImageSpec) -> Result<(), Error>;

    /// Stamps a filesystem label onto a block device or image file.
    fn set_label(&self, target: &Path, label: &str) -> Result<(), Error>;

    /// Installs the bootloader with the state partition as its boot
    /// directory. Without a target disk the existing installation is
    /// refreshed in place.
    fn install_bootloader(&self, target: Option<&Path>, state_mount: &Path) -> Result<(), Error>;

    /// Fetches an installation ISO (local path or http(s) URI) and mounts
    /// it under `workdir`. Returns the mounted tree.
    fn fetch_iso(&self, uri: &str, workdir: &Path) -> Result<PathBuf, Error>;

    /// Flushes filesystem buffers.
    fn sync(&self) -> Result<(), Error>;
}

/// Production deployer shelling out to the usual partitioning and filesystem
/// tooling.
#[derive(Default)]
pub struct SystemDeployer;

impl SystemDeployer {
    /// Path of the n-th partition on a device, accounting for the `p`
    /// separator of nvme/mmcblk-style names.
    fn partition_device(target: &Path, index: u32) -> PathBuf {
        let device = target.to_string_lossy();
        if device.ends_with(|c: char| c.is_ascii_digit()) {
            PathBuf::from(format!("{device}p{index}"))
        } else {
            PathBuf::from(format!("{device}{index}"))
        }
    }

    fn mkfs(target: &Path, fs: FileSystem, label: &str) -> Result<(), Error> {
        let mut cmd = Dependency::Mkfs.cmd();
        cmd.arg("-t").arg(fs.to_string());
        match fs {
            FileSystem::Vfat => {
                cmd.arg("-n").arg(label);
            }
            _ => {
                cmd.arg("-F").arg("-L").arg(label);
            }
        }
        cmd.arg(target).run_and_check().context(format!(
            "Failed to create {} filesystem on '{}'",
            fs,
            target.display()
        ))
    }

    /// Copies a resolved source into `dest`. Returns deployment metadata for
    /// sources that provide any.
    fn dump_source(&self, source: &ImageSource, dest: &Path) -> Result<Option<String>, Error> {
        match source {
            ImageSource::None => bail!("Image has no source to deploy from"),
            ImageSource::Dir(dir) => {
                rsync_tree(dir, dest)?;
                Ok(None)
            }
            ImageSource::File(file) => {
                let staging = tempfile::tempdir().context("Failed to create staging dir")?;
                mount::mount(file, staging.path(), None, &["ro".into()])?;
                let _guard = MountGuard {
                    mount_dir: staging.path(),
                };
                rsync_tree(staging.path(), dest)?;
                Ok(None)
            }
            ImageSource::Oci(reference) => pull_oci(reference, dest).map(Some),
        }
    }
}

fn rsync_tree(from: &Path, to: &Path) -> Result<(), Error> {
    Dependency::Rsync
        .cmd()
        .with_args(["-aAX", "--exclude", "/proc/*", "--exclude", "/sys/*", "--exclude", "/dev/*"])
        .with_arg(format!("{}/", from.display()))
        .with_arg(format!("{}/", to.display()))
        .run_and_check()
        .context(format!(
            "Failed to copy tree '{}' into '{}'",
            from.display(),
            to.display()
        ))
}

/// Pulls a container image into `dest` by unpacking its layers in manifest
/// order. Returns the config digest as deployment metadata.
pub(crate) fn pull_oci(reference: &str, dest: &Path) -> Result<String, Error> {
    let layout = tempfile::tempdir().context("Failed to create image layout dir")?;
    info!("Pulling container image '{reference}'");
    Dependency::Skopeo
        .cmd()
        .with_arg("copy")
        .with_arg(format!("docker://{reference}"))
        .with_arg(format!("dir:{}", layout.path().display()))
        .run_and_check()
        .context(format!("Failed to pull image '{reference}'"))?;

    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(layout.path().join("manifest.json"))
            .context("Failed to read image manifest")?,
    )
    .context("Failed to parse image manifest")?;

    let layers = manifest["layers"]
        .as_array()
        .context("Image manifest has no layers")?;
    for layer in layers {
        let digest = layer["digest"]
            .as_str()
            .context("Image layer has no digest")?;
        // `dir:` layouts name blobs by the bare hex digest.
        let blob = digest.split(':').next_back().unwrap_or(digest);
        debug!("Unpacking layer {digest}");
        Dependency::Tar
            .cmd()
            .with_args(["-x", "-f"])
            .with_arg(layout.path().join(blob))
            .with_arg("-C")
            .with_arg(dest)
            .run_and_check()
            .context(format!("Failed to unpack layer {digest}"))?;
    }

    manifest["config"]["digest"]
        .as_str()
        .map(str::to_string)
        .context("Image manifest has no config digest")
}

impl Deployer for SystemDeployer {
    fn detect_deployment(&self, spec: &InstallSpec) -> Result<bool, Error> {
        let mut labels = vec![spec.active.label.clone()];
        if let Some(state) = &spec.partitions.state {
            labels.push(state.label.clone());
        }
        for label in labels {
            if lsblk::find_by_label(&label)?.is_some() {
                debug!("Found existing deployment labeled '{label}'");
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn detect_install_target(&self) -> Result<Option<PathBuf>, Error> {
        lsblk::largest_disk()
    }

    fn partition_and_format(&self, spec: &InstallSpec) -> Result<(), Error> {
        let target = spec
            .target
            .as_deref()
            .context("No install target device")?;

        info!("Partitioning '{}'", target.display());
        let mut parted = Dependency::Parted
            .cmd()
            .with_args(["-s", "--"])
            .with_arg(target)
            .with_args(["mklabel", "gpt"]);

        // Partition plan: EFI, OEM, recovery, state, then persistent growing
        // to fill the disk. Only configured partitions get a slot.
        let boundaries = [
            ("1MiB", "65MiB"),
            ("65MiB", "129MiB"),
            ("129MiB", "4225MiB"),
            ("4225MiB", "12417MiB"),
            ("12417MiB", "100%"),
        ];

        let plan = [
            spec.partitions.efi.as_ref().map(|p| (p, FileSystem::Vfat)),
            spec.partitions.oem.as_ref().map(|p| (p, FileSystem::Ext4)),
            spec.partitions
                .recovery
                .as_ref()
                .map(|p| (p, FileSystem::Ext4)),
            spec.partitions
                .state
                .as_ref()
                .map(|p| (p, FileSystem::Ext4)),
            spec.partitions
                .persistent
                .as_ref()
                .map(|p| (p, FileSystem::Ext4)),
        ];

        let mut formats = Vec::new();
        let mut index = 0;
        for (slot, (start, end)) in plan.iter().zip(boundaries) {
            let Some((part, fs)) = slot else {
                continue;
            };
            index += 1;
            let fs_token = match fs {
                FileSystem::Vfat => "fat32",
                _ => "ext4",
            };
            parted.args(["mkpart", part.label.as_str(), fs_token, start, end]);
            formats.push((Self::partition_device(target, index), *fs, part.label.clone()));
        }

        parted
            .run_and_check()
            .context("Failed to write partition table")?;
        Dependency::Partprobe
            .cmd()
            .with_arg(target)
            .run_and_check()
            .context("Failed to re-read partition table")?;

        for (device, fs, label) in formats {
            Self::mkfs(&device, fs, &label)?;
        }
        Ok(())
    }

    fn partition_exists(&self, part: &PartitionSpec) -> Result<bool, Error> {
        Ok(lsblk::find_by_label(&part.label)?.is_some())
    }

    fn format_partition(&self, part: &PartitionSpec, fs: FileSystem) -> Result<(), Error> {
        let device = lsblk::find_by_label(&part.label)?
            .with_context(|| format!("No partition labeled '{}'", part.label))?;
        Self::mkfs(&device.path, fs, &part.label)
    }

    fn mount_partition(&self, part: &PartitionSpec, read_write: bool) -> Result<PathBuf, Error> {
        let mount_point = part
            .mount_point
            .as_deref()
            .with_context(|| format!("Partition '{}' has no mount point", part.label))?;
        let device = lsblk::find_by_label(&part.label)?
            .with_context(|| format!("No partition labeled '{}'", part.label))?;

        mount::ensure_mount_directory(mount_point)?;
        let options = vec![if read_write { "rw" } else { "ro" }.to_string()];
        mount::mount(&device.path, mount_point, None, &options)?;
        Ok(mount_point.to_path_buf())
    }

    fn umount(&self, path: &Path) -> Result<(), Error> {
        mount::umount(path, false)
    }

    fn deploy_image(&self, image: &ImageSpec) -> Result<Option<String>, Error> {
        if let Some(parent) = image.file.parent() {
            files::create_dirs(parent)?;
        }
        mount::ensure_mount_directory(&image.mount_point)?;

        info!(
            "Deploying '{}' into '{}'",
            image.source,
            image.file.display()
        );
        match image.fs {
            FileSystem::Squashfs => {
                let staging = tempfile::tempdir().context("Failed to create staging dir")?;
                let metadata = self.dump_source(&image.source, staging.path())?;

                if image.file.exists() {
                    fs::remove_file(&image.file).context("Failed to remove stale image file")?;
                }
                Dependency::Mksquashfs
                    .cmd()
                    .with_arg(staging.path())
                    .with_arg(&image.file)
                    .with_args(["-b", "1024k", "-comp", "xz", "-no-progress"])
                    .run_and_check()
                    .context(format!(
                        "Failed to create squashfs image '{}'",
                        image.file.display()
                    ))?;

                mount::mount(&image.file, &image.mount_point, Some("squashfs"), &["ro".into()])?;
                Ok(metadata)
            }
            _ => {
                let file = fs::File::create(&image.file).context(format!(
                    "Failed to create image file '{}'",
                    image.file.display()
                ))?;
                file.set_len(image.size_mib * 1024 * 1024)
                    .context("Failed to size image file")?;
                drop(file);

                Self::mkfs(&image.file, image.fs, &image.label)?;
                mount::mount(&image.file, &image.mount_point, None, &["rw".into()])?;
                self.dump_source(&image.source, &image.mount_point)
            }
        }
    }

    fn umount_image(&self, image: &ImageSpec) -> Result<(), Error> {
        mount::umount(&image.mount_point, false)
    }

    fn set_label(&self, target: &Path, label: &str) -> Result<(), Error> {
        tune2fs::set_label(target, label)
    }

    fn install_bootloader(&self, target: Option<&Path>, state_mount: &Path) -> Result<(), Error> {
        let grub = if Dependency::Grub2Install.exists() {
            Dependency::Grub2Install
        } else {
            Dependency::GrubInstall
        };
        let mut cmd = grub.cmd();
        cmd.arg(format!("--boot-directory={}", state_mount.display()));
        if let Some(target) = target {
            cmd.arg(target);
        }
        cmd.run_and_check().context("Bootloader installation failed")
    }

    fn fetch_iso(&self, uri: &str, workdir: &Path) -> Result<PathBuf, Error> {
        let iso_path = if let Some(rest) = uri.strip_prefix("file://") {
            PathBuf::from(rest)
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            let local = workdir.join("install.iso");
            info!("Downloading installation medium from '{uri}'");
            let response = reqwest::blocking::get(uri)
                .and_then(reqwest::blocking::Response::error_for_status)
                .context(format!("Failed to download '{uri}'"))?;
            let mut file = files::create_file(&local)?;
            let body = response.bytes().context("Failed to read ISO body")?;
            std::io::copy(&mut body.as_ref(), &mut file).context("Failed to write ISO")?;
            local
        } else {
            PathBuf::from(uri)
        };

        let mount_dir = workdir.join("iso");
        mount::ensure_mount_directory(&mount_dir)?;
        mount::mount(&iso_path, &mount_dir, Some("iso9660"), &["ro".into()])?;
        Ok(mount_dir)
    }

    fn sync(&self) -> Result<(), Error> {
        Dependency::Sync
            .cmd()
            .run_and_check()
            .context("Failed to flush filesystem buffers")
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::cell::RefCell;

    use super::*;

    /// Test deployer operating on a plain directory tree: partition mounts
    /// are directories keyed by label, and a deployed image is a regular
    /// file whose content records the source it came from.
    pub(crate) struct MockDeployer {
        root: PathBuf,
        pub mounted: RefCell<Vec<PathBuf>>,
        pub unmounted: RefCell<Vec<PathBuf>>,
        pub formatted: RefCell<Vec<String>>,
        pub labeled: RefCell<Vec<(PathBuf, String)>>,
        pub partitioned: RefCell<bool>,
        pub bootloader_targets: RefCell<Vec<Option<PathBuf>>>,
        pub metadata: Option<String>,
        pub fail_deploy: bool,
        pub existing_deployment: bool,
    }

    impl MockDeployer {
        pub fn new(root: &Path) -> Self {
            Self {
                root: root.to_path_buf(),
                mounted: RefCell::new(Vec::new()),
                unmounted: RefCell::new(Vec::new()),
                formatted: RefCell::new(Vec::new()),
                labeled: RefCell::new(Vec::new()),
                partitioned: RefCell::new(false),
                bootloader_targets: RefCell::new(Vec::new()),
                metadata: None,
                fail_deploy: false,
                existing_deployment: false,
            }
        }

        pub fn deployed_content(source: &ImageSource) -> String {
            format!("deployed:{source}")
        }
    }

    impl Deployer for MockDeployer {
        fn detect_deployment(&self, _spec: &InstallSpec) -> Result<bool, Error> {
            Ok(self.existing_deployment)
        }

        fn detect_install_target(&self) -> Result<Option<PathBuf>, Error> {
            Ok(Some(self.root.join("mock-disk")))
        }

        fn partition_and_format(&self, _spec: &InstallSpec) -> Result<(), Error> {
            *self.partitioned.borrow_mut() = true;
            Ok(())
        }

        fn partition_exists(&self, _part: &PartitionSpec) -> Result<bool, Error> {
            Ok(true)
        }

        fn format_partition(&self, part: &PartitionSpec, _fs: FileSystem) -> Result<(), Error> {
            self.formatted.borrow_mut().push(part.label.clone());
            Ok(())
        }

        fn mount_partition(
            &self,
            part: &PartitionSpec,
            _read_write: bool,
        ) -> Result<PathBuf, Error> {
            let dir = self.root.join("mounts").join(&part.label);
            fs::create_dir_all(&dir)?;
            self.mounted.borrow_mut().push(dir.clone());
            Ok(dir)
        }

        fn umount(&self, path: &Path) -> Result<(), Error> {
            self.unmounted.borrow_mut().push(path.to_path_buf());
            Ok(())
        }

        fn deploy_image(&self, image: &ImageSpec) -> Result<Option<String>, Error> {
            if self.fail_deploy {
                bail!("mock deploy failure");
            }
            if let Some(parent) = image.file.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&image.file, Self::deployed_content(&image.source))?;
            fs::create_dir_all(&image.mount_point)?;
            Ok(self.metadata.clone())
        }

        fn umount_image(&self, image: &ImageSpec) -> Result<(), Error> {
            self.unmounted.borrow_mut().push(image.mount_point.clone());
            Ok(())
        }

        fn set_label(&self, target: &Path, label: &str) -> Result<(), Error> {
            self.labeled
                .borrow_mut()
                .push((target.to_path_buf(), label.to_string()));
            Ok(())
        }

        fn install_bootloader(
            &self,
            target: Option<&Path>,
            _state_mount: &Path,
        ) -> Result<(), Error> {
            self.bootloader_targets
                .borrow_mut()
                .push(target.map(Path::to_path_buf));
            Ok(())
        }

        fn fetch_iso(&self, _uri: &str, workdir: &Path) -> Result<PathBuf, Error> {
            let dir = workdir.join("iso");
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(keel_api::constants::ISO_ROOTFS_FILE), "squash")?;
            Ok(dir)
        }

        fn sync(&self) -> Result<(), Error> {
            Ok(())
        }
    }
}
