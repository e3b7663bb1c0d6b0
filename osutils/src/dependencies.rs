use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
    process::Command as StdCommand,
};

use anyhow::{Context, Error};
use strum_macros::IntoStaticStr;

use crate::exe::RunAndCheck;

/// External binaries the agent shells out to. Resolving through this table
/// keeps the full set of runtime dependencies in one place and produces a
/// uniform error when one is missing.
#[derive(Debug, Clone, Copy, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Eject,
    #[strum(serialize = "grub2-install")]
    Grub2Install,
    #[strum(serialize = "grub-install")]
    GrubInstall,
    Lsblk,
    Mkfs,
    Mksquashfs,
    Mount,
    Parted,
    Partprobe,
    Rsync,
    Setfiles,
    Skopeo,
    Sync,
    Systemctl,
    Tar,
    Tune2fs,
    Umount,
    // Test dependencies
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
    #[cfg(test)]
    DoesNotExist,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    /// Gets the name of the dependency, e.g. `Dependency::Tune2fs` -> "tune2fs".
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Checks if the dependency is present on the system.
    pub fn exists(&self) -> bool {
        self.path().is_ok()
    }

    /// Resolves the dependency through $PATH.
    pub fn path(&self) -> Result<PathBuf, Error> {
        which::which(self.name())
            .with_context(|| format!("Failed to find dependency '{}'", self.name()))
    }

    /// Converts the dependency into a new command builder.
    pub fn cmd(&self) -> Command {
        Command {
            dependency: *self,
            args: vec![],
        }
    }
}

pub struct Command {
    dependency: Dependency,
    args: Vec<OsString>,
}

impl Command {
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn with_arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args(args);
        self
    }

    fn build(&self) -> Result<StdCommand, Error> {
        let mut cmd = StdCommand::new(self.dependency.path()?);
        cmd.args(&self.args);
        Ok(cmd)
    }

    pub fn run_and_check(&self) -> Result<(), Error> {
        self.build()?.run_and_check()
    }

    pub fn output_and_check(&self) -> Result<String, Error> {
        self.build()?.output_and_check()
    }
}
