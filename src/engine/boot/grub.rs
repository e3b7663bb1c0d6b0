use std::{fs, path::Path, sync::OnceLock};

use anyhow::{Context, Error};
use log::debug;
use regex::Regex;

use keel_api::error::{BootEntryError, KeelError, ReportError};
use osutils::grubenv::GrubEnvironment;

fn entry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--id\s+(\S+)\s*\{").expect("valid regex"))
}

/// Collects the `--id` tokens of all menu stanzas across the known config
/// locations. Missing files are skipped; duplicates keep their first-seen
/// position.
pub fn list_entries<P: AsRef<Path>>(config_paths: &[P]) -> Result<Vec<String>, KeelError> {
    let mut entries: Vec<String> = Vec::new();
    for path in config_paths {
        let path = path.as_ref();
        if !path.exists() {
            debug!("GRUB config '{}' not present, skipping", path.display());
            continue;
        }
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read '{}'", path.display()))
            .structured(BootEntryError::ListEntries)?;
        for capture in entry_regex().captures_iter(&contents) {
            let id = capture[1].to_string();
            if !entries.contains(&id) {
                entries.push(id);
            }
        }
    }
    Ok(entries)
}

/// Selects the entry to boot next by persisting `next_entry` into the GRUB
/// environment block. The name must match a listed menu stanza.
pub fn select_entry<P: AsRef<Path>>(
    config_paths: &[P],
    env_path: &Path,
    entry: &str,
) -> Result<(), KeelError> {
    let entries = list_entries(config_paths)?;
    if !entries.iter().any(|e| e == entry) {
        return Err(KeelError::new(BootEntryError::NotFound {
            entry: entry.to_string(),
        }));
    }

    write_env(env_path, "next_entry", entry).structured(BootEntryError::WriteGrubEnv)
}

/// Rebrands the default menu entry title. Fatal during install, warn-only
/// during upgrade; callers decide.
pub fn set_default_entry(env_path: &Path, title: &str) -> Result<(), Error> {
    write_env(env_path, "default_menu_entry", title)
}

fn write_env(env_path: &Path, key: &str, value: &str) -> Result<(), Error> {
    let mut env = GrubEnvironment::read_or_default(env_path)?;
    env.set(key, value);
    env.write(env_path)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use tempfile::TempDir;

    use keel_api::error::ErrorKind;

    use super::*;

    const GRUB_CFG: &str = indoc! {r#"
        menuentry "Acme OS" --id kairos {
            search --no-floppy --label --set=root COS_STATE
        }
        menuentry "Acme OS (fallback)" --id fallback {
            search --no-floppy --label --set=root COS_STATE
        }
        menuentry "Acme OS (fallback)" --id fallback {
            set img=/images/passive.img
        }
    "#};

    #[test]
    fn test_list_entries_dedups_and_skips_missing() {
        let dir = TempDir::new().unwrap();
        let cfg = dir.path().join("grub.cfg");
        fs::write(&cfg, GRUB_CFG).unwrap();

        let entries = list_entries(&[cfg, dir.path().join("absent.cfg")]).unwrap();
        assert_eq!(entries, vec!["kairos", "fallback"]);
    }

    #[test]
    fn test_list_entries_empty_when_nothing_exists() {
        let dir = TempDir::new().unwrap();
        let entries =
            list_entries(&[dir.path().join("a.cfg"), dir.path().join("b.cfg")]).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_select_entry_persists_next_entry() {
        let dir = TempDir::new().unwrap();
        let cfg = dir.path().join("grub.cfg");
        fs::write(&cfg, GRUB_CFG).unwrap();
        let env_path = dir.path().join("grubenv");

        select_entry(&[cfg], &env_path, "kairos").unwrap();

        let env = GrubEnvironment::read_or_default(&env_path).unwrap();
        assert_eq!(env.get("next_entry"), Some("kairos"));
    }

    #[test]
    fn test_select_unknown_entry_fails() {
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("grubenv");

        let err = select_entry(&[dir.path().join("grub.cfg")], &env_path, "kairos").unwrap_err();
        assert!(err.kind().to_string().contains("does not exist"));
        assert_eq!(
            err.kind(),
            &ErrorKind::BootEntry(BootEntryError::NotFound {
                entry: "kairos".into()
            })
        );
        assert!(!env_path.exists());
    }

    #[test]
    fn test_set_default_entry() {
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("grubenv");
        set_default_entry(&env_path, "Acme OS v2").unwrap();

        let env = GrubEnvironment::read_or_default(&env_path).unwrap();
        assert_eq!(env.get("default_menu_entry"), Some("Acme OS v2"));
    }
}
