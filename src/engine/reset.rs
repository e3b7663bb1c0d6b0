use std::{cell::Cell, collections::BTreeMap, path::PathBuf, rc::Rc, time::Duration};

use log::{info, warn};

use keel_api::{
    config::{FileSystem, PartitionRole, ResetSpec},
    constants,
    error::{BootEntryError, KeelError, ReportError, ServicingError},
    state::{ImageRecord, ImageRecordKey, InstallState, PartitionRecord, PartitionRecordKey},
};
use osutils::{files, mount, systemd};

use super::{
    boot::grub,
    cleanup::CleanupStack,
    deployer::Deployer,
    hooks::{self, HookRunner},
};

/// Restores a device to factory state: optionally reformats the mutable
/// partitions, redeploys the active and passive slots from the recovery
/// source, and reinitializes boot metadata.
pub struct Resetter<'a, D: Deployer> {
    spec: ResetSpec,
    deployer: &'a D,
    hooks: &'a HookRunner,
    grub_env: PathBuf,
    now: fn() -> String,
}

impl<'a, D: Deployer> Resetter<'a, D> {
    pub fn new(spec: ResetSpec, deployer: &'a D, hooks: &'a HookRunner) -> Self {
        Self {
            spec,
            deployer,
            hooks,
            grub_env: constants::GRUB_ENV_PATH.into(),
            now: || chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_grub_env(mut self, path: impl Into<PathBuf>) -> Self {
        self.grub_env = path.into();
        self
    }

    pub fn run(&self) -> Result<(), KeelError> {
        info!("Starting reset");
        self.hooks.publish_event(hooks::EVENT_RESET_PRE);

        let mut stack = CleanupStack::new();
        let result = self.stage(&mut stack);

        // A failed unwind means we skip the reboot logic below.
        stack.unwind(result.err())?;

        self.hooks.publish_event(hooks::EVENT_RESET_AFTER);

        if self.spec.reboot || self.spec.poweroff {
            info!(
                "Shutting down in {} seconds",
                constants::SHUTDOWN_DELAY_SECS
            );
            std::thread::sleep(Duration::from_secs(constants::SHUTDOWN_DELAY_SECS));
            systemd::shutdown(self.spec.poweroff).structured(ServicingError::Shutdown)?;
        }
        Ok(())
    }

    fn stage(&self, stack: &mut CleanupStack<'a>) -> Result<(), KeelError> {
        let deployer = self.deployer;

        // Release anything a previous run left mounted.
        for (_, part) in self.spec.partitions.configured() {
            if let Some(mount_point) = &part.mount_point {
                if mount::is_mountpoint(mount_point).unwrap_or(false) {
                    if let Err(e) = deployer.umount(mount_point) {
                        warn!(
                            "Could not unmount '{}' from an earlier run: {e:?}",
                            mount_point.display()
                        );
                    }
                }
            }
        }

        // Wipe the mutable partitions when asked to, skipping ones that are
        // not actually present.
        for (flag, part) in [
            (self.spec.format_persistent, &self.spec.partitions.persistent),
            (self.spec.format_oem, &self.spec.partitions.oem),
        ] {
            let Some(part) = part.as_ref().filter(|_| flag) else {
                continue;
            };
            let exists = deployer
                .partition_exists(part)
                .structured(ServicingError::DetectDeployment)?;
            if !exists {
                warn!("Partition '{}' not present, not reformatting", part.label);
                continue;
            }
            deployer
                .format_partition(part, FileSystem::Ext4)
                .structured(ServicingError::FormatPartition {
                    label: part.label.clone(),
                })?;
        }

        let mounts = super::mount_configured_partitions(deployer, &self.spec.partitions, stack)?;

        self.hooks.run(hooks::BEFORE_RESET)?;

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

        // Reset never re-partitions; GRUB is refreshed against the existing
        // state partition without touching the disk layout.
        let state_mount = mounts
            .get(&PartitionRole::State)
            .ok_or_else(|| KeelError::new(ServicingError::UndefinedStateOrRecovery))?;
        deployer
            .install_bootloader(None, state_mount)
            .structured(ServicingError::InstallBootloader)?;

        super::create_extra_dirs(&self.spec.active.mount_point, &self.spec.extra_dirs);

        super::selinux_relabel(&self.spec.active.mount_point, &self.relabel_binds(&mounts))
            .structured(ServicingError::Relabel)?;

        self.hooks.run_in_chroot(
            hooks::AFTER_RESET_CHROOT,
            &self.spec.active.mount_point,
            &self.spec.bind_mounts,
        )?;

        grub::set_default_entry(&self.grub_env, constants::DEFAULT_MENU_ENTRY)
            .structured(BootEntryError::WriteGrubEnv)?;

        deployer.umount_image(&self.spec.active).structured(
            ServicingError::UnmountImage {
                label: self.spec.active.label.clone(),
            },
        )?;
        active_unmounted.set(true);

        files::copy_file(&self.spec.active.file, &self.spec.passive.file).structured(
            ServicingError::DeployImage {
                label: self.spec.passive.label.clone(),
            },
        )?;
        deployer
            .set_label(&self.spec.passive.file, &self.spec.passive.label)
            .structured(ServicingError::LabelPassive)?;

        self.hooks.run(hooks::AFTER_RESET)?;

        self.record_state(&mounts, metadata)?;
        Ok(())
    }

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

    /// Writes the post-reset state document, carrying forward what the
    /// recovery partition already recorded: a reset that does not touch
    /// recovery must not lose its metadata.
    fn record_state(
        &self,
        mounts: &BTreeMap<PartitionRole, PathBuf>,
        metadata: Option<String>,
    ) -> Result<(), KeelError> {
        let previous = mounts
            .get(&PartitionRole::Recovery)
            .map(|m| InstallState::load(&m.join(constants::STATE_FILE_NAME)))
            .transpose()?
            .flatten();

        let mut state = InstallState::new((self.now)());
        if let Some(part) = &self.spec.partitions.state {
            let active = ImageRecord::new(
                &self.spec.active.source,
                metadata,
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
        if let Some(previous) = previous {
            state.merge_previous(previous);
        }

        super::persist_state(&state, mounts)
    }
}
