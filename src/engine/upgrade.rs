use std::{
    cell::Cell,
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use log::{debug, info, warn};

use keel_api::{
    config::{BootRole, ImageSpec, PartitionRole, UpgradeSpec},
    constants,
    error::{KeelError, ReportError, ServicingError},
    state::{ImageRecord, ImageRecordKey, InstallState, PartitionRecord, PartitionRecordKey},
};

use super::{
    boot::{grub, systemd, EntryRole},
    bootentries::BootPaths,
    bootrole::BootRoleDetector,
    cleanup::CleanupStack,
    deployer::Deployer,
    hooks::{self, HookRunner},
};

/// Upgrades the active slot (or the recovery image) by deploying the new
/// image into a transition file and atomically renaming it into place, with
/// the previous active image rotated to the passive slot first.
pub struct Upgrader<'a, D: Deployer, B: BootRoleDetector> {
    spec: UpgradeSpec,
    deployer: &'a D,
    hooks: &'a HookRunner,
    detector: &'a B,
    grub_env: PathBuf,
    boot_paths: BootPaths,
    now: fn() -> String,
}

fn rfc3339_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Staging sibling of a slot's final image file.
fn transition_file(image: &ImageSpec) -> PathBuf {
    image
        .file
        .parent()
        .map(|dir| dir.join("transition.img"))
        .unwrap_or_else(|| PathBuf::from("transition.img"))
}

impl<'a, D: Deployer, B: BootRoleDetector> Upgrader<'a, D, B> {
    pub fn new(spec: UpgradeSpec, deployer: &'a D, hooks: &'a HookRunner, detector: &'a B) -> Self {
        Self {
            spec,
            deployer,
            hooks,
            detector,
            grub_env: constants::GRUB_ENV_PATH.into(),
            boot_paths: BootPaths::default(),
            now: rfc3339_now,
        }
    }

    pub fn with_grub_env(mut self, path: impl Into<PathBuf>) -> Self {
        self.grub_env = path.into();
        self
    }

    pub fn with_boot_paths(mut self, paths: BootPaths) -> Self {
        self.boot_paths = paths;
        self
    }

    pub fn run(&self) -> Result<(), KeelError> {
        self.hooks.publish_event(hooks::EVENT_UPGRADE_PRE);

        let mut stack = CleanupStack::new();
        let result = self.stage(&mut stack);

        // Once the final rename has happened the upgrade is complete;
        // failures while unwinding only warrant warnings either way.
        stack.unwind_best_effort();

        if result.is_ok() {
            self.hooks.publish_event(hooks::EVENT_UPGRADE_AFTER);
            info!("Upgrade completed");
        }
        result
    }

    fn stage<'s>(&'s self, stack: &mut CleanupStack<'s>) -> Result<(), KeelError> {
        // The booted slot is detected before anything is mutated; it gates
        // the backup rule below.
        let booted = self.detector.current_role();
        info!(
            "Starting {} upgrade (booted from {booted})",
            if self.spec.recovery_upgrade {
                "recovery"
            } else {
                "system"
            }
        );

        let image = self.spec.target_image().clone();
        let transition = transition_file(&image);
        let deploy_spec = ImageSpec {
            file: transition.clone(),
            ..image.clone()
        };

        // Mount state and recovery read-write.
        let mut mounts: BTreeMap<PartitionRole, PathBuf> = BTreeMap::new();
        for role in [PartitionRole::State, PartitionRole::Recovery] {
            let part = self
                .spec
                .partitions
                .get(role)
                .ok_or_else(|| KeelError::new(ServicingError::UndefinedStateOrRecovery))?;
            let path = self.deployer.mount_partition(part, true).structured(
                ServicingError::MountPartition {
                    label: part.label.clone(),
                },
            )?;
            let unmount_path = path.clone();
            stack.push(format!("unmount {}", path.display()), move || {
                self.deployer.umount(&unmount_path)
            });
            mounts.insert(role, path);
        }

        // Safety net: never leave a half-written transition file behind.
        {
            let transition = transition.clone();
            stack.push("remove transition file", move || {
                if transition.exists() {
                    fs::remove_file(&transition)?;
                }
                Ok(())
            });
        }

        // Persistent is only needed for relabel binds; carrying on without
        // it is fine.
        let persistent_mount = self.spec.partitions.persistent.as_ref().and_then(|part| {
            match self.deployer.mount_partition(part, true) {
                Ok(path) => {
                    let unmount_path = path.clone();
                    stack.push(format!("unmount {}", path.display()), move || {
                        self.deployer.umount(&unmount_path)
                    });
                    Some(path)
                }
                Err(e) => {
                    warn!("Could not mount persistent partition, continuing: {e:?}");
                    None
                }
            }
        });

        self.hooks.run(hooks::BEFORE_UPGRADE)?;

        let metadata = self.deployer.deploy_image(&deploy_spec).structured(
            ServicingError::DeployImage {
                label: deploy_spec.label.clone(),
            },
        )?;

        let image_unmounted = Rc::new(Cell::new(false));
        {
            let deploy_spec = deploy_spec.clone();
            let image_unmounted = image_unmounted.clone();
            stack.push("unmount transition image", move || {
                if !image_unmounted.get() {
                    self.deployer.umount_image(&deploy_spec)?;
                }
                Ok(())
            });
        }

        super::create_extra_dirs(&deploy_spec.mount_point, &self.spec.extra_dirs);

        // Squashfs images are immutable; everything else gets relabeled in
        // place with persistent/OEM bound when they are mounted.
        if !deploy_spec.fs.is_squashfs() {
            let binds = self.relabel_binds(persistent_mount.as_deref());
            super::selinux_relabel(&deploy_spec.mount_point, &binds)
                .structured(ServicingError::Relabel)?;
        }

        self.hooks.run_in_chroot(
            hooks::AFTER_UPGRADE_CHROOT,
            &deploy_spec.mount_point,
            &self.spec.bind_mounts,
        )?;

        // Unlike install, a failed rebrand does not abort an upgrade.
        if !self.spec.recovery_upgrade {
            if let Err(e) = grub::set_default_entry(&self.grub_env, constants::DEFAULT_MENU_ENTRY)
            {
                warn!("Failed to rebrand default boot entry, continuing: {e:?}");
            }
        }

        self.deployer.umount_image(&deploy_spec).structured(
            ServicingError::UnmountImage {
                label: deploy_spec.label.clone(),
            },
        )?;
        image_unmounted.set(true);

        // Backup rule: a system upgrade rotates the current active image to
        // the passive slot, unless we are running from passive right now.
        // Overwriting the known-good passive with a build made while the
        // active slot is suspect would leave no way back.
        let mut backed_up = false;
        if !self.spec.recovery_upgrade && booted != BootRole::Passive {
            if image.file.exists() {
                fs::rename(&image.file, &self.spec.passive.file)
                    .structured(ServicingError::BackupActive)?;
                self.deployer
                    .set_label(&self.spec.passive.file, &self.spec.passive.label)
                    .structured(ServicingError::LabelPassive)?;
                // On a UKI layout the boot artifacts rotate with the image:
                // the passive entry set becomes a copy of the active one.
                if self.boot_paths.is_uki() {
                    let entries = self
                        .boot_paths
                        .esp_root
                        .join(constants::LOADER_ENTRIES_DIR);
                    systemd::rotate_role(&entries, EntryRole::Active, EntryRole::Passive)?;
                    let binaries = self.boot_paths.esp_root.join(constants::EFI_BINARIES_DIR);
                    if binaries.is_dir() {
                        systemd::rotate_role(&binaries, EntryRole::Active, EntryRole::Passive)?;
                    }
                    systemd::assign_sort_keys(&self.boot_paths.esp_root)?;
                }
                backed_up = true;
            } else {
                debug!(
                    "No previous active image at '{}', skipping backup",
                    image.file.display()
                );
            }
        } else if !self.spec.recovery_upgrade {
            info!("Booted from the passive slot, leaving it untouched");
        }

        fs::rename(&transition, &image.file).structured(ServicingError::FinalizeUpgrade)?;
        self.deployer.sync().structured(ServicingError::Sync)?;

        self.record_state(&mounts, &image, metadata, backed_up)?;

        self.hooks.run(hooks::AFTER_UPGRADE)?;

        if !self.spec.recovery_upgrade {
            warn!("The recovery image is upgraded independently; run a recovery upgrade to refresh it");
        }
        Ok(())
    }

    /// Bind mounts for the relabel chroot: persistent (freshly mounted) and
    /// OEM when it is already mounted on the running system.
    fn relabel_binds(&self, persistent_mount: Option<&Path>) -> BTreeMap<PathBuf, PathBuf> {
        let mut binds = BTreeMap::new();
        if let Some(path) = persistent_mount {
            binds.insert(path.to_path_buf(), PathBuf::from(constants::PERSISTENT_MOUNT_POINT));
        }
        if let Some(oem) = &self.spec.partitions.oem {
            if let Some(mount_point) = &oem.mount_point {
                if osutils::mount::is_mountpoint(mount_point).unwrap_or(false) {
                    binds.insert(mount_point.clone(), mount_point.clone());
                }
            }
        }
        binds
    }

    /// Updates the persisted install state: the upgraded slot gets the new
    /// record, and a backed-up passive slot inherits the old active record,
    /// never the new one.
    fn record_state(
        &self,
        mounts: &BTreeMap<PartitionRole, PathBuf>,
        image: &ImageSpec,
        metadata: Option<String>,
        backed_up: bool,
    ) -> Result<(), KeelError> {
        let state_path = mounts
            .get(&PartitionRole::State)
            .map(|m| m.join(constants::STATE_FILE_NAME))
            .ok_or_else(|| KeelError::new(ServicingError::UndefinedStateOrRecovery))?;

        let mut state = InstallState::load(&state_path)?.unwrap_or_default();
        state.date = (self.now)();

        let new_record = ImageRecord::new(&image.source, metadata, &image.label, image.fs);
        if self.spec.recovery_upgrade {
            let fslabel = self
                .spec
                .partitions
                .recovery
                .as_ref()
                .map(|p| p.label.clone())
                .unwrap_or_default();
            let record = state
                .partitions
                .entry(PartitionRecordKey::Recovery)
                .or_insert_with(|| PartitionRecord {
                    fslabel,
                    images: BTreeMap::new(),
                });
            record.images.insert(ImageRecordKey::Recovery, new_record);
        } else {
            let fslabel = self
                .spec
                .partitions
                .state
                .as_ref()
                .map(|p| p.label.clone())
                .unwrap_or_default();
            let record = state
                .partitions
                .entry(PartitionRecordKey::State)
                .or_insert_with(|| PartitionRecord {
                    fslabel,
                    images: BTreeMap::new(),
                });
            if backed_up {
                if let Some(old_active) = record.images.get(&ImageRecordKey::Active).cloned() {
                    record.images.insert(ImageRecordKey::Passive, old_active);
                }
            }
            record.images.insert(ImageRecordKey::Active, new_record);
        }

        super::persist_state(&state, mounts)
    }
}
