use std::path::PathBuf;

use keel_api::{config::BootRole, constants};

/// Determines which image slot the running system was booted from. The
/// answer gates the upgrade backup rule and live extension activation, so it
/// sits behind a trait and stays mockable.
pub trait BootRoleDetector {
    fn current_role(&self) -> BootRole;
}

/// Reads the sentinel files the initrd drops into the runtime directory
/// (`active_mode`, `passive_mode`, `recovery_mode`).
pub struct SentinelBootRole {
    run_dir: PathBuf,
}

impl SentinelBootRole {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }
}

impl Default for SentinelBootRole {
    fn default() -> Self {
        Self::new(constants::RUN_DIR)
    }
}

impl BootRoleDetector for SentinelBootRole {
    fn current_role(&self) -> BootRole {
        for (marker, role) in [
            ("active_mode", BootRole::Active),
            ("passive_mode", BootRole::Passive),
            ("recovery_mode", BootRole::Recovery),
        ] {
            if self.run_dir.join(marker).exists() {
                return role;
            }
        }
        BootRole::Unknown
    }
}

/// Whether the system was booted from installation media, per the kernel
/// command line.
pub fn booted_from_cd(cmdline_path: &std::path::Path) -> bool {
    std::fs::read_to_string(cmdline_path)
        .map(|cmdline| cmdline.contains("root=live:"))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) struct FixedBootRole(pub BootRole);

#[cfg(test)]
impl BootRoleDetector for FixedBootRole {
    fn current_role(&self) -> BootRole {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_sentinel_roles() {
        let dir = TempDir::new().unwrap();
        let detector = SentinelBootRole::new(dir.path());
        assert_eq!(detector.current_role(), BootRole::Unknown);

        fs::write(dir.path().join("passive_mode"), "").unwrap();
        assert_eq!(detector.current_role(), BootRole::Passive);

        // An active marker takes precedence when both are present.
        fs::write(dir.path().join("active_mode"), "").unwrap();
        assert_eq!(detector.current_role(), BootRole::Active);
    }

    #[test]
    fn test_booted_from_cd() {
        let dir = TempDir::new().unwrap();
        let cmdline = dir.path().join("cmdline");
        fs::write(&cmdline, "BOOT_IMAGE=/vmlinuz root=live:CDLABEL=ACME rd.live.dir=/").unwrap();
        assert!(booted_from_cd(&cmdline));

        fs::write(&cmdline, "BOOT_IMAGE=/vmlinuz root=LABEL=COS_STATE").unwrap();
        assert!(!booted_from_cd(&cmdline));

        assert!(!booted_from_cd(&dir.path().join("missing")));
    }
}
