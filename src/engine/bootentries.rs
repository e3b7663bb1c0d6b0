use std::path::PathBuf;

use keel_api::{constants, error::KeelError};

use super::boot::{grub, systemd};

/// Filesystem locations boot-entry resolution works against. Injected so
/// tests can redirect every root without a real ESP.
pub struct BootPaths {
    /// GRUB config locations scanned for menu stanzas.
    pub grub_configs: Vec<PathBuf>,
    /// GRUB environment block for persistent variables.
    pub grub_env: PathBuf,
    /// Mount point of the boot filesystem holding the systemd-boot loader
    /// tree.
    pub esp_root: PathBuf,
}

impl Default for BootPaths {
    fn default() -> Self {
        Self {
            grub_configs: constants::GRUB_CONF_PATHS.iter().map(PathBuf::from).collect(),
            grub_env: constants::GRUB_ENV_PATH.into(),
            esp_root: constants::EFI_MOUNT_POINT.into(),
        }
    }
}

impl BootPaths {
    /// A systemd-boot loader tree on the ESP means the system boots via
    /// UKI; otherwise entries are resolved through GRUB.
    pub fn is_uki(&self) -> bool {
        self.esp_root.join(constants::LOADER_ENTRIES_DIR).is_dir()
    }
}

/// Lists boot entries in the scheme the system actually boots with.
pub fn list_boot_entries(paths: &BootPaths) -> Result<Vec<String>, KeelError> {
    if paths.is_uki() {
        systemd::list_entries(&paths.esp_root)
    } else {
        grub::list_entries(&paths.grub_configs)
    }
}

/// Selects the entry to boot next in the scheme the system actually boots
/// with.
pub fn select_boot_entry(paths: &BootPaths, entry: &str) -> Result<(), KeelError> {
    if paths.is_uki() {
        systemd::select_entry(&paths.esp_root, entry)
    } else {
        grub::select_entry(&paths.grub_configs, &paths.grub_env, entry)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn paths_in(dir: &TempDir) -> BootPaths {
        BootPaths {
            grub_configs: vec![dir.path().join("grub.cfg")],
            grub_env: dir.path().join("grubenv"),
            esp_root: dir.path().join("efi"),
        }
    }

    #[test]
    fn test_dispatches_to_grub_without_loader_tree() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        fs::write(
            dir.path().join("grub.cfg"),
            "menuentry \"Acme\" --id kairos {\n}\n",
        )
        .unwrap();

        assert!(!paths.is_uki());
        assert_eq!(list_boot_entries(&paths).unwrap(), vec!["kairos"]);
    }

    #[test]
    fn test_dispatches_to_systemd_with_loader_tree() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        let entries = paths.esp_root.join(constants::LOADER_ENTRIES_DIR);
        fs::create_dir_all(&entries).unwrap();
        fs::write(entries.join("active.conf"), "title Acme OS\n").unwrap();

        assert!(paths.is_uki());
        assert_eq!(list_boot_entries(&paths).unwrap(), vec!["cos"]);
    }
}
