use std::{
    fs,
    os::unix::fs as fs_unix,
    path::{Path, PathBuf},
};

use anyhow::Context;
use log::{debug, info};
use regex::Regex;

use keel_api::{
    config::ExtensionRole,
    constants,
    error::{ExtensionError, InvalidInputError, KeelError, ReportError},
};
use osutils::{files, systemd};

use super::{bootrole::BootRoleDetector, deployer};

const RAW_SUFFIX: &str = ".raw";

/// Directory layout the extension manager works against, injected so tests
/// can redirect every root.
pub struct SysextPaths {
    /// Pool of installed but not yet role-assigned extension images.
    pub install_dir: PathBuf,
    /// Directory systemd-sysext merges extensions from at runtime.
    pub runtime_dir: PathBuf,
    /// Service restarted when the live extension set changes; `None`
    /// disables restarts.
    pub service: Option<String>,
}

impl Default for SysextPaths {
    fn default() -> Self {
        Self {
            install_dir: constants::SYSEXT_INSTALL_DIR.into(),
            runtime_dir: constants::SYSEXT_RUNTIME_DIR.into(),
            service: Some(constants::SYSEXT_SERVICE.to_string()),
        }
    }
}

/// An installed system extension image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SysExtension {
    pub name: String,
    pub location: PathBuf,
}

/// Manages signed `.raw` system extension images: an installed pool plus
/// per-role directories whose entries symlink back into the pool, with
/// optional immediate activation into the runtime directory.
pub struct SysextManager<'a, B: BootRoleDetector> {
    paths: SysextPaths,
    detector: &'a B,
}

impl<'a, B: BootRoleDetector> SysextManager<'a, B> {
    pub fn new(paths: SysextPaths, detector: &'a B) -> Self {
        Self { paths, detector }
    }

    fn role_dir(&self, role: Option<ExtensionRole>) -> PathBuf {
        match role {
            Some(role) => self.paths.install_dir.join(role.to_string()),
            None => self.paths.install_dir.clone(),
        }
    }

    /// Lists `.raw` images directly in a role directory, or in the pool when
    /// no role is given. The directory is created if absent.
    pub fn list(&self, role: Option<ExtensionRole>) -> Result<Vec<SysExtension>, KeelError> {
        let dir = self.role_dir(role);
        files::create_dirs(&dir).structured(ExtensionError::CreateDir {
            path: dir.display().to_string(),
        })?;

        let mut extensions: Vec<SysExtension> = fs::read_dir(&dir)
            .context(format!("Failed to read '{}'", dir.display()))
            .structured(ExtensionError::List)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(RAW_SUFFIX))
            .map(|name| SysExtension {
                location: dir.join(&name),
                name,
            })
            .collect();
        extensions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(extensions)
    }

    /// First extension whose name matches the pattern.
    pub fn get(
        &self,
        pattern: &str,
        role: Option<ExtensionRole>,
    ) -> Result<Option<SysExtension>, KeelError> {
        let re = Regex::new(pattern).structured(ExtensionError::InvalidPattern {
            pattern: pattern.to_string(),
        })?;
        Ok(self
            .list(role)?
            .into_iter()
            .find(|ext| re.is_match(&ext.name)))
    }

    /// Downloads or copies an extension image into the pool. Supported
    /// schemes: `file://` (or a bare path), `http(s)://`, and the
    /// `oci|docker|container://` family.
    pub fn install(&self, uri: &str) -> Result<SysExtension, KeelError> {
        files::create_dirs(&self.paths.install_dir).structured(ExtensionError::CreateDir {
            path: self.paths.install_dir.display().to_string(),
        })?;

        let download_err = || ExtensionError::Download {
            uri: uri.to_string(),
        };

        if let Some(rest) = uri
            .strip_prefix("oci://")
            .or_else(|| uri.strip_prefix("docker://"))
            .or_else(|| uri.strip_prefix("container://"))
        {
            return self.install_from_image(rest, uri);
        }

        let name = uri
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or(uri)
            .to_string();
        if !name.ends_with(RAW_SUFFIX) {
            return Err(KeelError::new(InvalidInputError::NotAnExtension { name }));
        }
        let dest = self.paths.install_dir.join(&name);

        if uri.starts_with("http://") || uri.starts_with("https://") {
            info!("Downloading extension from '{uri}'");
            let body = reqwest::blocking::get(uri)
                .and_then(reqwest::blocking::Response::error_for_status)
                .and_then(reqwest::blocking::Response::bytes)
                .context(format!("Failed to download '{uri}'"))
                .structured(download_err())?;
            fs::write(&dest, &body)
                .context(format!("Failed to write '{}'", dest.display()))
                .structured(download_err())?;
        } else {
            let source = uri.strip_prefix("file://").unwrap_or(uri);
            files::copy_file(source, &dest).structured(download_err())?;
        }

        Ok(SysExtension {
            name,
            location: dest,
        })
    }

    /// Pulls a container image and adopts the first `.raw` file it carries.
    fn install_from_image(&self, reference: &str, uri: &str) -> Result<SysExtension, KeelError> {
        let download_err = || ExtensionError::Download {
            uri: uri.to_string(),
        };
        let staging = tempfile::tempdir()
            .context("Failed to create staging dir")
            .structured(download_err())?;
        deployer::pull_oci(reference, staging.path()).structured(download_err())?;

        let raw = find_raw_file(staging.path())
            .context("Image carries no .raw extension")
            .structured(download_err())?;
        let name = raw
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(RAW_SUFFIX)
            .to_string();
        let dest = self.paths.install_dir.join(&name);
        files::copy_file(&raw, &dest).structured(download_err())?;
        Ok(SysExtension {
            name,
            location: dest,
        })
    }

    /// Enables an installed extension for a role by symlinking it into the
    /// role directory. Enabling an already-enabled extension is a no-op.
    /// With `now`, the extension is additionally merged into the running
    /// system, but only when the booted slot matches the role.
    pub fn enable(
        &self,
        name: &str,
        role: ExtensionRole,
        now: bool,
    ) -> Result<(), KeelError> {
        let pool_file = self.paths.install_dir.join(name);
        if !pool_file.exists() {
            return Err(KeelError::new(ExtensionError::NotFound {
                name: name.to_string(),
            }));
        }

        let dir = self.role_dir(Some(role));
        files::create_dirs(&dir).structured(ExtensionError::CreateDir {
            path: dir.display().to_string(),
        })?;

        let link = dir.join(name);
        if link.symlink_metadata().is_ok() {
            debug!("Extension '{name}' already enabled for role '{role}'");
        } else {
            fs_unix::symlink(&pool_file, &link)
                .context(format!("Failed to link '{}'", link.display()))
                .structured(ExtensionError::Link {
                    name: name.to_string(),
                })?;
        }

        if now {
            self.merge_live(name, role, &pool_file)?;
        }
        Ok(())
    }

    /// Disables an extension for a role. Disabling an extension that is not
    /// enabled is not an error.
    pub fn disable(
        &self,
        name: &str,
        role: ExtensionRole,
        now: bool,
    ) -> Result<(), KeelError> {
        let link = self.role_dir(Some(role)).join(name);
        if link.symlink_metadata().is_ok() {
            fs::remove_file(&link)
                .context(format!("Failed to unlink '{}'", link.display()))
                .structured(ExtensionError::Unlink {
                    name: name.to_string(),
                })?;
        } else {
            debug!("Extension '{name}' not enabled for role '{role}'");
        }

        if now {
            self.unmerge_live(name, role)?;
        }
        Ok(())
    }

    /// Disables an extension for every role and removes it from the pool.
    /// Idempotent.
    pub fn remove(&self, name: &str, now: bool) -> Result<(), KeelError> {
        for role in [
            ExtensionRole::Active,
            ExtensionRole::Passive,
            ExtensionRole::Recovery,
            ExtensionRole::Common,
        ] {
            self.disable(name, role, now)?;
        }

        let pool_file = self.paths.install_dir.join(name);
        if pool_file.exists() {
            fs::remove_file(&pool_file)
                .context(format!("Failed to remove '{}'", pool_file.display()))
                .structured(ExtensionError::Unlink {
                    name: name.to_string(),
                })?;
        }
        Ok(())
    }

    fn merge_live(
        &self,
        name: &str,
        role: ExtensionRole,
        pool_file: &Path,
    ) -> Result<(), KeelError> {
        let booted = self.detector.current_role();
        if !role.matches_boot(booted) {
            info!(
                "Extension '{name}' enabled for role '{role}' but the system is booted \
                 from '{booted}'; it will be merged on the matching boot"
            );
            return Ok(());
        }

        files::create_dirs(&self.paths.runtime_dir).structured(ExtensionError::CreateDir {
            path: self.paths.runtime_dir.display().to_string(),
        })?;
        let runtime_link = self.paths.runtime_dir.join(name);
        if runtime_link.symlink_metadata().is_err() {
            fs_unix::symlink(pool_file, &runtime_link)
                .context(format!("Failed to link '{}'", runtime_link.display()))
                .structured(ExtensionError::Link {
                    name: name.to_string(),
                })?;
        }
        self.restart_service()
    }

    fn unmerge_live(&self, name: &str, role: ExtensionRole) -> Result<(), KeelError> {
        let booted = self.detector.current_role();
        if !role.matches_boot(booted) {
            return Ok(());
        }

        let runtime_link = self.paths.runtime_dir.join(name);
        if runtime_link.symlink_metadata().is_ok() {
            fs::remove_file(&runtime_link)
                .context(format!("Failed to unlink '{}'", runtime_link.display()))
                .structured(ExtensionError::Unlink {
                    name: name.to_string(),
                })?;
            self.restart_service()?;
        }
        Ok(())
    }

    fn restart_service(&self) -> Result<(), KeelError> {
        if let Some(service) = &self.paths.service {
            systemd::restart_unit(service).structured(ExtensionError::ServiceRestart)?;
        }
        Ok(())
    }
}

/// First `.raw` file anywhere under `root`.
fn find_raw_file(root: &Path) -> Option<PathBuf> {
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let entries = fs::read_dir(&dir).ok()?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(RAW_SUFFIX))
            {
                return Some(path);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use keel_api::config::BootRole;

    use super::super::bootrole::FixedBootRole;
    use super::*;

    fn manager<'a>(dir: &Path, detector: &'a FixedBootRole) -> SysextManager<'a, FixedBootRole> {
        SysextManager::new(
            SysextPaths {
                install_dir: dir.join("extensions"),
                runtime_dir: dir.join("run-extensions"),
                service: None,
            },
            detector,
        )
    }

    fn install_fixture(dir: &Path, mgr: &SysextManager<'_, FixedBootRole>) -> SysExtension {
        let source = dir.join("valid.raw");
        fs::write(&source, "extension-payload").unwrap();
        mgr.install(&format!("file://{}", source.display())).unwrap()
    }

    #[test]
    fn test_install_and_enable_lifecycle() {
        let dir = TempDir::new().unwrap();
        let detector = FixedBootRole(BootRole::Active);
        let mgr = manager(dir.path(), &detector);

        let installed = install_fixture(dir.path(), &mgr);
        assert_eq!(installed.name, "valid.raw");

        mgr.enable("valid.raw", ExtensionRole::Active, false).unwrap();

        let active = mgr.list(Some(ExtensionRole::Active)).unwrap();
        assert_eq!(
            active,
            vec![SysExtension {
                name: "valid.raw".into(),
                location: dir.path().join("extensions/active/valid.raw"),
            }]
        );
        assert!(mgr.list(Some(ExtensionRole::Passive)).unwrap().is_empty());

        mgr.remove("valid.raw", false).unwrap();
        for role in [None, Some(ExtensionRole::Active), Some(ExtensionRole::Passive)] {
            assert!(mgr.list(role).unwrap().is_empty());
        }
    }

    #[test]
    fn test_enable_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let detector = FixedBootRole(BootRole::Active);
        let mgr = manager(dir.path(), &detector);
        install_fixture(dir.path(), &mgr);

        mgr.enable("valid.raw", ExtensionRole::Common, false).unwrap();
        mgr.enable("valid.raw", ExtensionRole::Common, false).unwrap();

        assert_eq!(mgr.list(Some(ExtensionRole::Common)).unwrap().len(), 1);
    }

    #[test]
    fn test_disable_missing_is_noop() {
        let dir = TempDir::new().unwrap();
        let detector = FixedBootRole(BootRole::Active);
        let mgr = manager(dir.path(), &detector);

        mgr.disable("ghost.raw", ExtensionRole::Active, false).unwrap();
        mgr.remove("ghost.raw", false).unwrap();
    }

    #[test]
    fn test_enable_rejects_uninstalled() {
        let dir = TempDir::new().unwrap();
        let detector = FixedBootRole(BootRole::Active);
        let mgr = manager(dir.path(), &detector);

        let err = mgr
            .enable("ghost.raw", ExtensionRole::Active, false)
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            keel_api::error::ErrorKind::Extension(ExtensionError::NotFound { .. })
        ));
    }

    #[test]
    fn test_install_rejects_non_raw() {
        let dir = TempDir::new().unwrap();
        let detector = FixedBootRole(BootRole::Active);
        let mgr = manager(dir.path(), &detector);

        let source = dir.path().join("tool.tar");
        fs::write(&source, "not an extension").unwrap();
        let err = mgr
            .install(&format!("file://{}", source.display()))
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            keel_api::error::ErrorKind::InvalidInput(InvalidInputError::NotAnExtension { .. })
        ));
    }

    #[test]
    fn test_activation_gated_on_boot_role() {
        let dir = TempDir::new().unwrap();
        let detector = FixedBootRole(BootRole::Passive);
        let mgr = manager(dir.path(), &detector);
        install_fixture(dir.path(), &mgr);

        // Booted from passive, enabling for active: recorded, not merged.
        mgr.enable("valid.raw", ExtensionRole::Active, true).unwrap();
        assert!(!dir.path().join("run-extensions/valid.raw").exists());

        // Common always merges.
        mgr.enable("valid.raw", ExtensionRole::Common, true).unwrap();
        assert!(dir
            .path()
            .join("run-extensions/valid.raw")
            .symlink_metadata()
            .is_ok());

        // Disabling for the matching role unmerges again.
        mgr.disable("valid.raw", ExtensionRole::Common, true).unwrap();
        assert!(dir
            .path()
            .join("run-extensions/valid.raw")
            .symlink_metadata()
            .is_err());
    }

    #[test]
    fn test_get_first_regex_match() {
        let dir = TempDir::new().unwrap();
        let detector = FixedBootRole(BootRole::Active);
        let mgr = manager(dir.path(), &detector);

        for name in ["alpha.raw", "beta.raw"] {
            let source = dir.path().join(name);
            fs::write(&source, "x").unwrap();
            mgr.install(&format!("file://{}", source.display())).unwrap();
        }

        let found = mgr.get("^al.*", None).unwrap().unwrap();
        assert_eq!(found.name, "alpha.raw");
        assert!(mgr.get("^zz.*", None).unwrap().is_none());
    }
}
