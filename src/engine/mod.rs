use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use log::{debug, warn};

use keel_api::{
    config::PartitionMap,
    config::PartitionRole,
    error::{KeelError, ReportError, ServicingError},
    state::InstallState,
};
use osutils::{chroot::Chroot, dependencies::Dependency, files, path::join_relative};

use self::{cleanup::CleanupStack, deployer::Deployer};

pub mod boot;
pub mod bootentries;
pub mod bootrole;
pub mod cleanup;
pub mod deployer;
pub mod hooks;
pub mod install;
pub mod reset;
pub mod sysext;
pub mod upgrade;

/// SELinux file contexts consulted for a relabel; relabeling is skipped when
/// the deployed root does not ship one.
const FILE_CONTEXTS: &str = "etc/selinux/targeted/contexts/files/file_contexts";

/// Mounts every configured partition and registers a matching unmount on the
/// cleanup stack, so a failed pipeline cannot leak mounts.
pub(crate) fn mount_configured_partitions<'a, D: Deployer>(
    deployer: &'a D,
    partitions: &PartitionMap,
    stack: &mut CleanupStack<'a>,
) -> Result<BTreeMap<PartitionRole, PathBuf>, KeelError> {
    let mut mounts = BTreeMap::new();
    for (role, part) in partitions.configured() {
        if part.mount_point.is_none() {
            debug!("Partition '{}' has no mount point, skipping", part.label);
            continue;
        }
        let path = deployer.mount_partition(part, true).structured(
            ServicingError::MountPartition {
                label: part.label.clone(),
            },
        )?;
        let unmount_path = path.clone();
        stack.push(format!("unmount {}", path.display()), move || {
            deployer.umount(&unmount_path)
        });
        mounts.insert(role, path);
    }
    Ok(mounts)
}

/// Relabels a deployed root in a chroot, with any currently mounted
/// persistent/OEM paths bound so their contexts resolve.
pub(crate) fn selinux_relabel(
    root: &Path,
    binds: &BTreeMap<PathBuf, PathBuf>,
) -> Result<(), Error> {
    if !root.join(FILE_CONTEXTS).exists() {
        debug!(
            "No SELinux file contexts under '{}', skipping relabel",
            root.display()
        );
        return Ok(());
    }

    let binds: Vec<(PathBuf, PathBuf)> = binds
        .iter()
        .map(|(host, rel)| (host.clone(), rel.clone()))
        .collect();
    Chroot::enter(root, &binds)
        .context("Failed to enter chroot for relabeling")?
        .execute_and_exit(|| {
            Dependency::Setfiles
                .cmd()
                .with_args(["-i", "-F"])
                .with_arg(Path::new("/").join(FILE_CONTEXTS))
                .with_arg("/")
                .run_and_check()
                .context("setfiles failed")
        })
}

/// Creates configured extra directories under a deployed root. Best effort
/// per directory.
pub(crate) fn create_extra_dirs(root: &Path, dirs: &[PathBuf]) {
    for dir in dirs {
        let target = join_relative(root, dir);
        if let Err(e) = files::create_dirs(&target) {
            warn!("Failed to create extra directory '{}': {e:?}", target.display());
        }
    }
}

/// Copies cloud-init config files into the deployed root's oem directory.
pub(crate) fn copy_cloud_init(root: &Path, uris: &[String]) -> Result<(), Error> {
    let dest_dir = join_relative(root, "oem");
    for uri in uris {
        if let Some(name) = uri.rsplit('/').next().filter(|n| !n.is_empty()) {
            let dest = dest_dir.join(name);
            if uri.starts_with("http://") || uri.starts_with("https://") {
                let response = reqwest::blocking::get(uri)
                    .and_then(reqwest::blocking::Response::error_for_status)
                    .context(format!("Failed to download cloud config '{uri}'"))?;
                let body = response.bytes().context("Failed to read cloud config")?;
                files::create_dirs(&dest_dir)?;
                std::fs::write(&dest, &body)
                    .context(format!("Failed to write '{}'", dest.display()))?;
            } else {
                let source = uri.strip_prefix("file://").unwrap_or(uri);
                files::copy_file(source, &dest)?;
            }
        }
    }
    Ok(())
}

/// Persists the install state document to both the state and recovery
/// partitions so either copy can bootstrap future servicing.
pub(crate) fn persist_state(
    state: &InstallState,
    mounts: &BTreeMap<PartitionRole, PathBuf>,
) -> Result<(), KeelError> {
    let state_mount = mounts.get(&PartitionRole::State);
    let recovery_mount = mounts.get(&PartitionRole::Recovery);
    let (Some(state_mount), Some(recovery_mount)) = (state_mount, recovery_mount) else {
        return Err(KeelError::new(ServicingError::UndefinedStateOrRecovery));
    };

    state.write(&state_mount.join(keel_api::constants::STATE_FILE_NAME))?;
    state.write(&recovery_mount.join(keel_api::constants::STATE_FILE_NAME))?;
    Ok(())
}
