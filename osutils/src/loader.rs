use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};

/// A line-oriented `key value` configuration file as used by systemd-boot
/// (`loader.conf` and the entry `.conf` files). Unknown keys, comments and
/// ordering are preserved across a rewrite.
#[derive(Debug, Clone)]
pub struct ConfFile {
    path: PathBuf,
    lines: Vec<Line>,
}

#[derive(Debug, Clone)]
enum Line {
    Pair { key: String, value: String },
    Other(String),
}

impl ConfFile {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read conf file '{}'", path.display()))?;
        Ok(Self::parse(path, &contents))
    }

    fn parse(path: &Path, contents: &str) -> Self {
        let lines = contents
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return Line::Other(line.to_string());
                }
                match trimmed.split_once(char::is_whitespace) {
                    Some((key, value)) => Line::Pair {
                        key: key.to_string(),
                        value: value.trim().to_string(),
                    },
                    None => Line::Pair {
                        key: trimmed.to_string(),
                        value: String::new(),
                    },
                }
            })
            .collect();
        ConfFile {
            path: path.to_path_buf(),
            lines,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Pair { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Replaces the first occurrence of `key`, or appends a new line.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        for line in &mut self.lines {
            if let Line::Pair { key: k, value: v } = line {
                if k == key {
                    *v = value;
                    return self;
                }
            }
        }
        self.lines.push(Line::Pair {
            key: key.to_string(),
            value,
        });
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Pair { key, value } if value.is_empty() => out.push_str(key),
                Line::Pair { key, value } => {
                    out.push_str(key);
                    out.push(' ');
                    out.push_str(value);
                }
                Line::Other(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }

    pub fn write(&self) -> Result<(), Error> {
        self.write_to(&self.path.clone())
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            crate::files::create_dirs(parent)?;
        }
        fs::write(path, self.render())
            .context(format!("Failed to write conf file '{}'", path.display()))
    }
}
