use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Sets the filesystem label of an ext* block device or image file.
pub fn set_label(target: impl AsRef<Path>, label: &str) -> Result<(), Error> {
    Dependency::Tune2fs
        .cmd()
        .with_arg("-L")
        .with_arg(label)
        .with_arg(target.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to set label '{}' on '{}'",
            label,
            target.as_ref().display()
        ))
}
