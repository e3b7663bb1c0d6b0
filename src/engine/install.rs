use std::{cell::Cell, collections::BTreeMap, fs, io::Write, path::PathBuf, rc::Rc};

use log::{info, warn};

use keel_api::{
    config::{ImageSource, InstallSpec, PartitionRole},
    constants,
    error::{BootEntryError, InvalidInputError, KeelError, ReportError, ServicingError},
    state::{ImageRecord, ImageRecordKey, InstallState, PartitionRecord, PartitionRecordKey},
};
use osutils::files;

use super::{
    boot::grub,
    bootrole,
    cleanup::CleanupStack,
    deployer::Deployer,
    hooks::{self, HookRunner},
};

/// Installs the OS onto a disk: partitions and formats the target, deploys
/// the active image, installs the bootloader, then populates the recovery
/// and passive slots and persists the install state.
pub struct Installer<'a, D: Deployer> {
    spec: InstallSpec,
    deployer: &'a D,
    hooks: &'a HookRunner,
    grub_env: PathBuf,
    cmdline_path: PathBuf,
    workdir: PathBuf,
    eject_script: PathBuf,
    now: fn() -> String,
}

impl<'a, D: Deployer> Installer<'a, D> {
    pub fn new(spec: InstallSpec, deployer: &'a D, hooks: &'a HookRunner) -> Self {
        Self {
            spec,
            deployer,
            hooks,
            grub_env: constants::GRUB_ENV_PATH.into(),
            cmdline_path: "/proc/cmdline".into(),
            workdir: constants::RUN_DIR.into(),
            eject_script: constants::EJECT_SCRIPT_PATH.into(),
            now: || chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_grub_env(mut self, path: impl Into<PathBuf>) -> Self {
        self.grub_env = path.into();
        self
    }

    pub fn with_workdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.workdir = path.into();
        self
    }

    #[cfg(test)]
    fn with_cmdline(mut self, path: impl Into<PathBuf>) -> Self {
        self.cmdline_path = path.into();
        self
    }

    #[cfg(test)]
    fn with_eject_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.eject_script = path.into();
        self
    }

    pub fn run(mut self) -> Result<(), KeelError> {
        info!("Starting install");
        self.hooks.publish_event(hooks::EVENT_INSTALL_PRE);

        let mut stack = CleanupStack::new();
        let result = self.stage(&mut stack);

        // A failed unwind aborts here: no eject script and no post hooks on
        // a system we could not put back together.
        stack.unwind(result.err())?;

        if self.spec.eject_cd && bootrole::booted_from_cd(&self.cmdline_path) {
            if let Err(e) = self.write_eject_script() {
                warn!("Failed to set up CD eject on shutdown: {e:?}");
            }
        }

        self.hooks.publish_event(hooks::EVENT_INSTALL_AFTER);
        self.hooks.run(hooks::AFTER_INSTALL)?;
        info!("Install completed");
        Ok(())
    }

    fn stage(&mut self, stack: &mut CleanupStack<'a>) -> Result<(), KeelError> {
        let deployer = self.deployer;

        // Installation medium: mount it and point the active and recovery
        // sources at the tree it carries.
        if let Some(iso) = self.spec.iso.clone() {
            let staging = self.workdir.join("iso-staging");
            files::create_dirs(&staging).structured(ServicingError::FetchIso)?;
            let mounted = deployer
                .fetch_iso(&iso, &staging)
                .structured(ServicingError::FetchIso)?;
            let rootfs = mounted.join(constants::ISO_ROOTFS_FILE);
            self.spec.active.source = ImageSource::File(rootfs.clone());
            self.spec.recovery.source = ImageSource::File(rootfs);

            stack.push("remove installation medium staging", move || {
                let _ = deployer.umount(&mounted);
                fs::remove_dir_all(&staging)?;
                Ok(())
            });
        }

        if self.spec.no_format {
            // Refuse to install over a live deployment unless forced. This
            // check gates every irreversible step below.
            let existing = deployer
                .detect_deployment(&self.spec)
                .structured(ServicingError::DetectDeployment)?;
            if existing && !self.spec.force {
                return Err(KeelError::new(InvalidInputError::ForceRequired));
            }
            if self.spec.target.is_none() {
                let target = deployer
                    .detect_install_target()
                    .structured(ServicingError::DetectDeployment)?
                    .ok_or_else(|| KeelError::new(InvalidInputError::NoTargetDevice))?;
                info!("Auto-detected install target '{}'", target.display());
                self.spec.target = Some(target);
            }
        } else {
            if self.spec.target.is_none() {
                return Err(KeelError::new(InvalidInputError::NoTargetDevice));
            }
            deployer
                .partition_and_format(&self.spec)
                .structured(ServicingError::PartitionDevice)?;
        }

        let mounts = super::mount_configured_partitions(deployer, &self.spec.partitions, stack)?;

        self.hooks.run(hooks::BEFORE_INSTALL)?;

        let metadata = deployer.deploy_image(&self.spec.active).structured(
            ServicingError::DeployImage {
                label: self.spec.active.label.clone(),
            },
        )?;
        let active_unmounted = Rc::new(Cell::new(false));
        {
            let image = self.spec.active.clone();
            let active_unmounted = active_unmounted.clone();
            stack.push("unmount active image", move || {
                if !active_unmounted.get() {
                    deployer.umount_image(&image)?;
                }
                Ok(())
            });
        }

        super::create_extra_dirs(&self.spec.active.mount_point, &self.spec.extra_dirs);

        super::copy_cloud_init(&self.spec.active.mount_point, &self.spec.cloud_init)
            .structured(ServicingError::CopyCloudConfig)?;

        let state_mount = mounts
            .get(&PartitionRole::State)
            .ok_or_else(|| KeelError::new(ServicingError::UndefinedStateOrRecovery))?;
        let target = self
            .spec
            .target
            .clone()
            .ok_or_else(|| KeelError::new(InvalidInputError::NoTargetDevice))?;
        deployer
            .install_bootloader(Some(&target), state_mount)
            .structured(ServicingError::InstallBootloader)?;

        super::selinux_relabel(&self.spec.active.mount_point, &self.relabel_binds(&mounts))
            .structured(ServicingError::Relabel)?;

        self.hooks.run_in_chroot(
            hooks::AFTER_INSTALL_CHROOT,
            &self.spec.active.mount_point,
            &self.spec.bind_mounts,
        )?;

        // Unlike upgrade, a failed rebrand aborts an install.
        grub::set_default_entry(&self.grub_env, constants::DEFAULT_MENU_ENTRY)
            .structured(BootEntryError::WriteGrubEnv)?;

        // The remaining deploys need the active image unmounted; do it here
        // rather than leaving it to the cleanup stack.
        deployer.umount_image(&self.spec.active).structured(
            ServicingError::UnmountImage {
                label: self.spec.active.label.clone(),
            },
        )?;
        active_unmounted.set(true);

        // Recovery and passive population is not transactional: a failure
        // here leaves the active slot installed and these slots absent.
        let recovery_metadata = deployer.deploy_image(&self.spec.recovery).structured(
            ServicingError::DeployImage {
                label: self.spec.recovery.label.clone(),
            },
        )?;
        deployer.umount_image(&self.spec.recovery).structured(
            ServicingError::UnmountImage {
                label: self.spec.recovery.label.clone(),
            },
        )?;

        // Passive starts life as a byte-identical backup of active.
        files::copy_file(&self.spec.active.file, &self.spec.passive.file).structured(
            ServicingError::DeployImage {
                label: self.spec.passive.label.clone(),
            },
        )?;
        deployer
            .set_label(&self.spec.passive.file, &self.spec.passive.label)
            .structured(ServicingError::LabelPassive)?;

        let state = self.build_state(metadata, recovery_metadata);
        super::persist_state(&state, &mounts)?;
        Ok(())
    }

    /// Persistent and OEM are bound into the relabel chroot when mounted.
    fn relabel_binds(
        &self,
        mounts: &BTreeMap<PartitionRole, PathBuf>,
    ) -> BTreeMap<PathBuf, PathBuf> {
        let mut binds = BTreeMap::new();
        if let Some(path) = mounts.get(&PartitionRole::Persistent) {
            binds.insert(
                path.clone(),
                PathBuf::from(constants::PERSISTENT_MOUNT_POINT),
            );
        }
        if let Some(path) = mounts.get(&PartitionRole::Oem) {
            binds.insert(path.clone(), PathBuf::from(constants::OEM_MOUNT_POINT));
        }
        binds
    }

    /// The state document of a fresh install: active and passive share the
    /// same source and metadata, recovery records its own.
    fn build_state(
        &self,
        metadata: Option<String>,
        recovery_metadata: Option<String>,
    ) -> InstallState {
        let mut state = InstallState::new((self.now)());

        if let Some(part) = &self.spec.partitions.state {
            let active = ImageRecord::new(
                &self.spec.active.source,
                metadata.clone(),
                &self.spec.active.label,
                self.spec.active.fs,
            );
            let passive = ImageRecord {
                label: self.spec.passive.label.clone(),
                ..active.clone()
            };
            state.partitions.insert(
                PartitionRecordKey::State,
                PartitionRecord {
                    fslabel: part.label.clone(),
                    images: BTreeMap::from([
                        (ImageRecordKey::Active, active),
                        (ImageRecordKey::Passive, passive),
                    ]),
                },
            );
        }

        if let Some(part) = &self.spec.partitions.recovery {
            state.partitions.insert(
                PartitionRecordKey::Recovery,
                PartitionRecord {
                    fslabel: part.label.clone(),
                    images: BTreeMap::from([(
                        ImageRecordKey::Recovery,
                        ImageRecord::new(
                            &self.spec.recovery.source,
                            recovery_metadata,
                            &self.spec.recovery.label,
                            self.spec.recovery.fs,
                        ),
                    )]),
                },
            );
        }

        for (key, part) in [
            (PartitionRecordKey::Oem, &self.spec.partitions.oem),
            (
                PartitionRecordKey::Persistent,
                &self.spec.partitions.persistent,
            ),
        ] {
            if let Some(part) = part {
                state.partitions.insert(
                    key,
                    PartitionRecord {
                        fslabel: part.label.clone(),
                        images: BTreeMap::new(),
                    },
                );
            }
        }
        state
    }

    fn write_eject_script(&self) -> Result<(), anyhow::Error> {
        let mut file = files::create_file_mode(&self.eject_script, 0o744)?;
        file.write_all(b"#!/bin/sh\neject -rmT\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use keel_api::{
        config::{FileSystem, ImageSpec, PartitionMap, PartitionSpec},
        error::ErrorKind,
    };
    use osutils::grubenv::GrubEnvironment;

    use super::super::deployer::mock::MockDeployer;
    use super::*;

    fn test_spec(dir: &Path) -> InstallSpec {
        let images = dir.join("images");
        let part = |label: &str| {
            Some(PartitionSpec {
                mount_point: Some(dir.join("mnt").join(label)),
                label: label.to_string(),
            })
        };
        let image = |file: &str, label: &str| ImageSpec {
            source: ImageSource::Oci("ghcr.io/acme/os:v1".into()),
            file: images.join(file),
            mount_point: dir.join("img-mount"),
            label: label.to_string(),
            fs: FileSystem::Ext4,
            size_mib: 8,
        };
        InstallSpec {
            target: Some(dir.join("disk")),
            iso: None,
            active: image("active.img", "COS_ACTIVE"),
            passive: ImageSpec {
                source: ImageSource::None,
                ..image("passive.img", "COS_PASSIVE")
            },
            recovery: image("recovery.img", "COS_SYSTEM"),
            partitions: PartitionMap {
                state: part("COS_STATE"),
                recovery: part("COS_RECOVERY"),
                persistent: part("COS_PERSISTENT"),
                oem: part("COS_OEM"),
                efi: None,
            },
            no_format: false,
            force: false,
            eject_cd: false,
            cloud_init: Vec::new(),
            extra_dirs: vec![PathBuf::from("/var/lib/acme")],
            bind_mounts: BTreeMap::new(),
            strict_hooks: false,
        }
    }

    fn installer<'a>(
        spec: InstallSpec,
        deployer: &'a MockDeployer,
        hooks: &'a HookRunner,
        dir: &Path,
    ) -> Installer<'a, MockDeployer> {
        Installer::new(spec, deployer, hooks)
            .with_grub_env(dir.join("grubenv"))
            .with_workdir(dir.join("work"))
    }

    #[test]
    fn test_install_populates_all_slots() {
        let dir = TempDir::new().unwrap();
        let spec = test_spec(dir.path());
        let deployer = MockDeployer::new(dir.path());
        let hooks = HookRunner::new(BTreeMap::new(), false);

        installer(spec.clone(), &deployer, &hooks, dir.path())
            .run()
            .unwrap();

        assert!(*deployer.partitioned.borrow());
        let deployed = MockDeployer::deployed_content(&spec.active.source);
        assert_eq!(fs::read_to_string(&spec.active.file).unwrap(), deployed);
        // Passive is a byte-identical copy of active, relabeled.
        assert_eq!(fs::read_to_string(&spec.passive.file).unwrap(), deployed);
        assert!(deployer
            .labeled
            .borrow()
            .contains(&(spec.passive.file.clone(), "COS_PASSIVE".into())));
        assert!(spec.recovery.file.exists());
        // The default entry was rebranded.
        let env = GrubEnvironment::read_or_default(dir.path().join("grubenv")).unwrap();
        assert_eq!(env.get("default_menu_entry"), Some("cos"));
    }

    #[test]
    fn test_install_state_written_redundantly() {
        let dir = TempDir::new().unwrap();
        let spec = test_spec(dir.path());
        let mut deployer = MockDeployer::new(dir.path());
        deployer.metadata = Some("sha256:fresh".into());
        let hooks = HookRunner::new(BTreeMap::new(), false);

        installer(spec, &deployer, &hooks, dir.path()).run().unwrap();

        for mount in ["COS_STATE", "COS_RECOVERY"] {
            let path = dir
                .path()
                .join("mounts")
                .join(mount)
                .join(constants::STATE_FILE_NAME);
            let state = InstallState::load(&path).unwrap().unwrap();
            let images = &state.partitions[&PartitionRecordKey::State].images;
            // Active and passive reference the same source and metadata
            // right after an install.
            assert_eq!(
                images[&ImageRecordKey::Active].source,
                images[&ImageRecordKey::Passive].source
            );
            assert_eq!(
                images[&ImageRecordKey::Active].source_metadata,
                Some("sha256:fresh".to_string())
            );
            assert_eq!(
                images[&ImageRecordKey::Active].source_metadata,
                images[&ImageRecordKey::Passive].source_metadata
            );
            assert!(state
                .partitions
                .contains_key(&PartitionRecordKey::Recovery));
        }
    }

    #[test]
    fn test_no_format_requires_force_over_existing_deployment() {
        let dir = TempDir::new().unwrap();
        let mut spec = test_spec(dir.path());
        spec.no_format = true;
        let mut deployer = MockDeployer::new(dir.path());
        deployer.existing_deployment = true;
        let hooks = HookRunner::new(BTreeMap::new(), false);

        let err = installer(spec, &deployer, &hooks, dir.path())
            .run()
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::InvalidInput(InvalidInputError::ForceRequired)
        );
        assert_eq!(
            err.kind().to_string(),
            "use force flag to run an installation over the current running deployment"
        );
        assert!(!*deployer.partitioned.borrow());
    }

    #[test]
    fn test_no_format_autodetects_target_and_skips_partitioning() {
        let dir = TempDir::new().unwrap();
        let mut spec = test_spec(dir.path());
        spec.no_format = true;
        spec.target = None;
        let deployer = MockDeployer::new(dir.path());
        let hooks = HookRunner::new(BTreeMap::new(), false);

        installer(spec, &deployer, &hooks, dir.path()).run().unwrap();
        assert!(!*deployer.partitioned.borrow());
    }

    #[test]
    fn test_iso_source_rewrite() {
        let dir = TempDir::new().unwrap();
        let mut spec = test_spec(dir.path());
        spec.iso = Some("https://get.acme.example/os.iso".into());
        let deployer = MockDeployer::new(dir.path());
        let hooks = HookRunner::new(BTreeMap::new(), false);

        installer(spec.clone(), &deployer, &hooks, dir.path())
            .run()
            .unwrap();

        // Active was deployed from the tree the medium carries, not from
        // the originally configured source.
        let rootfs = dir
            .path()
            .join("work/iso-staging/iso")
            .join(constants::ISO_ROOTFS_FILE);
        assert_eq!(
            fs::read_to_string(&spec.active.file).unwrap(),
            MockDeployer::deployed_content(&ImageSource::File(rootfs))
        );
        // The staging tree was cleaned up afterwards.
        assert!(!dir.path().join("work/iso-staging").exists());
    }

    #[test]
    fn test_eject_script_written_when_booted_from_cd() {
        let dir = TempDir::new().unwrap();
        let mut spec = test_spec(dir.path());
        spec.eject_cd = true;
        let deployer = MockDeployer::new(dir.path());
        let hooks = HookRunner::new(BTreeMap::new(), false);

        let cmdline = dir.path().join("cmdline");
        fs::write(&cmdline, "root=live:CDLABEL=ACME").unwrap();
        let eject = dir.path().join("eject.sh");

        installer(spec, &deployer, &hooks, dir.path())
            .with_cmdline(&cmdline)
            .with_eject_script(&eject)
            .run()
            .unwrap();

        assert!(fs::read_to_string(&eject).unwrap().contains("eject"));
    }
}
