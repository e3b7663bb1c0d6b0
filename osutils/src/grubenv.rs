use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{bail, Context, Error};

/// Size of a GRUB environment block. The file is padded to exactly this many
/// bytes so GRUB can rewrite it in place.
pub const BLOCK_SIZE: usize = 1024;

const HEADER: &str = "# GRUB Environment Block\n";

/// A GRUB environment block: the fixed-size key=value store the boot menu
/// reads persistent variables (`next_entry`, `default_menu_entry`, ...) from.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GrubEnvironment {
    vars: BTreeMap<String, String>,
}

impl GrubEnvironment {
    /// Loads an environment block, returning an empty environment when the
    /// file does not exist yet.
    pub fn read_or_default(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .context(format!("Failed to read GRUB env block '{}'", path.display()))?;

        let mut vars = BTreeMap::new();
        for line in contents.lines() {
            if line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                vars.insert(key.to_string(), value.trim_end_matches('#').to_string());
            }
        }
        Ok(Self { vars })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Serializes the environment into a fixed-size block padded with `#`.
    pub fn render(&self) -> Result<String, Error> {
        let mut block = String::from(HEADER);
        for (key, value) in &self.vars {
            block.push_str(&format!("{key}={value}\n"));
        }
        if block.len() > BLOCK_SIZE {
            bail!(
                "GRUB environment does not fit into the {BLOCK_SIZE}-byte block ({} bytes)",
                block.len()
            );
        }
        block.push_str(&"#".repeat(BLOCK_SIZE - block.len()));
        Ok(block)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            crate::files::create_dirs(parent)?;
        }
        fs::write(path, self.render()?).context(format!(
            "Failed to write GRUB env block '{}'",
            path.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn test_render_is_block_sized() {
        let mut env = GrubEnvironment::default();
        env.set("next_entry", "kairos");
        let block = env.render().unwrap();
        assert_eq!(block.len(), BLOCK_SIZE);
        assert!(block.starts_with("# GRUB Environment Block\nnext_entry=kairos\n"));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grubenv");

        let mut env = GrubEnvironment::default();
        env.set("next_entry", "fallback")
            .set("default_menu_entry", "Acme OS");
        env.write(&path).unwrap();

        let parsed = GrubEnvironment::read_or_default(&path).unwrap();
        assert_eq!(parsed.get("next_entry"), Some("fallback"));
        assert_eq!(parsed.get("default_menu_entry"), Some("Acme OS"));
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let env = GrubEnvironment::read_or_default(dir.path().join("grubenv")).unwrap();
        assert_eq!(env.get("next_entry"), None);
    }

    #[test]
    fn test_oversized_environment_rejected() {
        let mut env = GrubEnvironment::default();
        env.set("filler", "x".repeat(BLOCK_SIZE));
        assert!(env.render().is_err());
    }
}
