use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Error};
use log::{debug, warn};

use keel_api::{
    constants::{LOADER_CONF_FILE, LOADER_ENTRIES_DIR},
    error::{BootEntryError, KeelError, ReportError},
};
use osutils::{loader::ConfFile, mount};

use super::{
    conf_to_display, display_to_conf_prefix, sort_key_for, strip_assessment, EntryRole,
    CANONICAL_DISPLAY_NAMES,
};

fn entries_dir(esp_root: &Path) -> PathBuf {
    esp_root.join(LOADER_ENTRIES_DIR)
}

/// Entry conf filenames under the loader entries directory, sorted. A
/// missing directory yields an empty list.
fn list_conf_files(esp_root: &Path) -> Result<Vec<String>, KeelError> {
    let dir = entries_dir(esp_root);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<String> = fs::read_dir(&dir)
        .context(format!("Failed to read '{}'", dir.display()))
        .structured(BootEntryError::ListEntries)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".conf") && name != "loader.conf")
        .collect();
    files.sort();
    Ok(files)
}

/// Display names of all boot entries.
pub fn list_entries(esp_root: &Path) -> Result<Vec<String>, KeelError> {
    Ok(list_conf_files(esp_root)?
        .iter()
        .map(|name| conf_to_display(name))
        .collect())
}

/// Selects the default boot entry by display name and persists it into
/// `loader.conf`, preserving the boot-assessment suffix of the matching
/// on-disk entry.
pub fn select_entry(esp_root: &Path, name: &str) -> Result<(), KeelError> {
    let files = list_conf_files(esp_root)?;

    // Heuristic, preserved as observed behavior: treat the entry list as the
    // stock set only when the on-disk count matches a stock layout exactly
    // (3 entries without state reset, 4 with). A custom layout with, say, 5
    // role-named entries silently skips the reduction and keeps its real
    // display names.
    let candidates: Vec<String> = match files.len() {
        n if n == CANONICAL_DISPLAY_NAMES.len() => CANONICAL_DISPLAY_NAMES
            .iter()
            .map(|s| s.to_string())
            .collect(),
        3 => CANONICAL_DISPLAY_NAMES[..3]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        _ => files.iter().map(|f| conf_to_display(f)).collect(),
    };

    // `active` is accepted as an alias for `cos` even when not listed.
    let first_word = name.split_whitespace().next().unwrap_or(name);
    let is_alias = first_word == "active";
    if !is_alias && !candidates.iter().any(|c| c == name) {
        return Err(KeelError::new(BootEntryError::NotFound {
            entry: name.to_string(),
        }));
    }

    let normalized = if is_alias {
        name.replacen("active", "cos", 1)
    } else {
        name.to_string()
    };

    // Re-resolve against the real entries, recovering the assessment suffix
    // that display names drop.
    let target_prefix = display_to_conf_prefix(&normalized);
    let resolved = files
        .iter()
        .find(|f| strip_assessment(f.strip_suffix(".conf").unwrap_or(f)) == target_prefix)
        .cloned()
        .structured(BootEntryError::UnmappedName {
            value: normalized.clone(),
        })?;
    debug!("Resolved entry '{name}' to '{resolved}'");

    // The boot filesystem is normally mounted read-only; take read-write
    // access for the write and always hand it back.
    let needs_remount = mount::is_mountpoint(esp_root).unwrap_or(false);
    if needs_remount {
        mount::remount(esp_root, true).structured(BootEntryError::RemountBoot)?;
    }
    let result = write_default(esp_root, &resolved);
    if needs_remount {
        if let Err(e) = mount::remount(esp_root, false) {
            warn!("Failed to remount boot filesystem read-only: {e:?}");
        }
    }
    result
}

fn write_default(esp_root: &Path, entry_file: &str) -> Result<(), KeelError> {
    let loader_path = esp_root.join(LOADER_CONF_FILE);
    if !loader_path.exists() {
        return Err(KeelError::new(BootEntryError::MissingLoaderConf {
            path: loader_path.display().to_string(),
        }));
    }
    let mut conf = ConfFile::read(&loader_path).structured(BootEntryError::WriteLoaderConf)?;
    conf.set("default", entry_file);
    conf.write().structured(BootEntryError::WriteLoaderConf)
}

/// Role of a boot artifact (conf or EFI binary) by its filename token.
fn artifact_role(filename: &str) -> Option<EntryRole> {
    let stem = filename.split('.').next().unwrap_or(filename);
    let stem = strip_assessment(stem);
    EntryRole::from_conf_token(stem.split('_').next().unwrap_or(stem))
}

/// Rotates one role's artifact set onto another role's names: deletes every
/// file of the target role, then copies every file of the source role under
/// the substituted name. Copied conf files get their `efi` reference and
/// `title` rewritten for the target role.
pub fn rotate_role(dir: &Path, from: EntryRole, to: EntryRole) -> Result<(), KeelError> {
    rotate_role_inner(dir, from, to).structured(BootEntryError::RotateRole {
        from: from.conf_prefix().to_string(),
        to: to.conf_prefix().to_string(),
    })
}

fn rotate_role_inner(dir: &Path, from: EntryRole, to: EntryRole) -> Result<(), Error> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .context(format!("Failed to read '{}'", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    for name in &names {
        if artifact_role(name) == Some(to) {
            debug!("Removing stale artifact '{name}'");
            fs::remove_file(dir.join(name))
                .context(format!("Failed to remove stale artifact '{name}'"))?;
        }
    }

    for name in &names {
        if artifact_role(name) != Some(from) {
            continue;
        }
        let new_name = name.replacen(from.conf_prefix(), to.conf_prefix(), 1);
        let src = dir.join(name);
        let dst = dir.join(&new_name);
        debug!("Copying artifact '{name}' to '{new_name}'");

        if name.ends_with(".conf") {
            let mut conf = ConfFile::read(&src)?;

            if let Some(efi) = conf.get("efi").map(str::to_string) {
                // Substitute the role token in the referenced binary's file
                // name, leaving its directory untouched.
                let rewritten = match efi.rsplit_once('/') {
                    Some((parent, base)) => format!(
                        "{parent}/{}",
                        base.replacen(from.conf_prefix(), to.conf_prefix(), 1)
                    ),
                    None => efi.replacen(from.conf_prefix(), to.conf_prefix(), 1),
                };
                conf.set("efi", rewritten);
            }

            if let Some(title) = conf.get("title").map(str::to_string) {
                let base = title
                    .strip_suffix(EntryRole::Passive.title_suffix())
                    .or_else(|| title.strip_suffix(EntryRole::Recovery.title_suffix()))
                    .unwrap_or(&title);
                conf.set("title", format!("{base}{}", to.title_suffix()));
            }

            conf.write_to(&dst)?;
        } else {
            fs::copy(&src, &dst)
                .context(format!("Failed to copy artifact '{name}' to '{new_name}'"))?;
        }
    }
    Ok(())
}

/// Stamps a `sort-key` into every entry conf so the boot menu order is
/// independent of directory order.
pub fn assign_sort_keys(esp_root: &Path) -> Result<(), KeelError> {
    for name in list_conf_files(esp_root)? {
        let path = entries_dir(esp_root).join(&name);
        let mut conf = ConfFile::read(&path).structured(BootEntryError::AssignSortKeys)?;
        conf.set("sort-key", sort_key_for(&name));
        conf.write().structured(BootEntryError::AssignSortKeys)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use tempfile::TempDir;

    use keel_api::error::ErrorKind;

    use super::*;

    fn write_entry(esp: &Path, name: &str, contents: &str) {
        let dir = entries_dir(esp);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), contents).unwrap();
    }

    fn write_loader_conf(esp: &Path) {
        let path = esp.join(LOADER_CONF_FILE);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "timeout 5\ndefault active.conf\n").unwrap();
    }

    fn loader_default(esp: &Path) -> String {
        ConfFile::read(esp.join(LOADER_CONF_FILE))
            .unwrap()
            .get("default")
            .unwrap()
            .to_string()
    }

    fn canonical_set(esp: &Path) {
        write_loader_conf(esp);
        write_entry(esp, "active+2-1.conf", "title Acme OS\n");
        write_entry(esp, "passive+3.conf", "title Acme OS (fallback)\n");
        write_entry(esp, "recovery+1-2.conf", "title Acme OS recovery\n");
        write_entry(esp, "statereset+2-1.conf", "title Acme OS state reset\n");
    }

    #[test]
    fn test_list_entries_missing_dir_is_empty() {
        let esp = TempDir::new().unwrap();
        assert!(list_entries(esp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_list_entries_display_names() {
        let esp = TempDir::new().unwrap();
        canonical_set(esp.path());
        assert_eq!(
            list_entries(esp.path()).unwrap(),
            vec!["cos", "fallback", "recovery", "statereset"]
        );
    }

    #[test]
    fn test_select_preserves_assessment_suffix() {
        let esp = TempDir::new().unwrap();
        canonical_set(esp.path());

        select_entry(esp.path(), "fallback").unwrap();
        assert_eq!(loader_default(esp.path()), "passive+3.conf");

        select_entry(esp.path(), "cos").unwrap();
        assert_eq!(loader_default(esp.path()), "active+2-1.conf");

        // Migration alias resolves to the same entry.
        select_entry(esp.path(), "active").unwrap();
        assert_eq!(loader_default(esp.path()), "active+2-1.conf");
    }

    #[test]
    fn test_select_unknown_entry_fails() {
        let esp = TempDir::new().unwrap();
        canonical_set(esp.path());

        let err = select_entry(esp.path(), "sidegrade").unwrap_err();
        assert!(err.kind().to_string().contains("does not exist"));
    }

    #[test]
    fn test_select_with_non_canonical_layout_uses_real_names() {
        let esp = TempDir::new().unwrap();
        write_loader_conf(esp.path());
        write_entry(esp.path(), "active_cloud+1.conf", "title Acme OS cloud\n");
        write_entry(esp.path(), "passive_cloud.conf", "title Acme OS cloud (fallback)\n");

        select_entry(esp.path(), "cos cloud").unwrap();
        assert_eq!(loader_default(esp.path()), "active_cloud+1.conf");

        // With only two entries there is no canonical reduction, so the
        // stock names are not offered.
        let err = select_entry(esp.path(), "statereset").unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::BootEntry(BootEntryError::NotFound {
                entry: "statereset".into()
            })
        );
    }

    #[test]
    fn test_select_without_loader_conf_fails() {
        let esp = TempDir::new().unwrap();
        write_entry(esp.path(), "active.conf", "title Acme OS\n");
        write_entry(esp.path(), "passive.conf", "title Acme OS (fallback)\n");

        let err = select_entry(esp.path(), "cos").unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::BootEntry(BootEntryError::MissingLoaderConf { .. })
        ));
    }

    #[test]
    fn test_rotate_role_rewrites_conf_and_copies_binaries() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("active.conf"),
            indoc! {"
                title Acme OS
                efi /EFI/keel/active.efi
            "},
        )
        .unwrap();
        fs::write(dir.path().join("active.efi"), "new-binary").unwrap();
        fs::write(
            dir.path().join("passive.conf"),
            "title stale\nefi /EFI/keel/passive.efi\n",
        )
        .unwrap();
        fs::write(dir.path().join("passive.efi"), "old-binary").unwrap();

        rotate_role(dir.path(), EntryRole::Active, EntryRole::Passive).unwrap();

        let rotated = ConfFile::read(dir.path().join("passive.conf")).unwrap();
        assert_eq!(rotated.get("title"), Some("Acme OS (fallback)"));
        assert_eq!(rotated.get("efi"), Some("/EFI/keel/passive.efi"));
        assert_eq!(
            fs::read_to_string(dir.path().join("passive.efi")).unwrap(),
            "new-binary"
        );

        // The source role's artifacts are copied, not moved.
        assert!(dir.path().join("active.conf").exists());
        assert!(dir.path().join("active.efi").exists());
    }

    #[test]
    fn test_assign_sort_keys() {
        let esp = TempDir::new().unwrap();
        canonical_set(esp.path());
        write_entry(esp.path(), "custom.conf", "title Something Else\n");

        assign_sort_keys(esp.path()).unwrap();

        for (name, key) in [
            ("active+2-1.conf", "0001"),
            ("passive+3.conf", "0002"),
            ("recovery+1-2.conf", "0003"),
            ("statereset+2-1.conf", "0004"),
            ("custom.conf", "0010"),
        ] {
            let conf = ConfFile::read(entries_dir(esp.path()).join(name)).unwrap();
            assert_eq!(conf.get("sort-key"), Some(key), "wrong sort key for {name}");
        }
    }
}
