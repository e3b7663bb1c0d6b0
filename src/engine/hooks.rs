use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Error};
use log::{debug, warn};

use keel_api::error::{KeelError, ReportError, ServicingError};
use osutils::{chroot::Chroot, exe::RunAndCheck};

// Lifecycle stages with user-configurable commands.
pub const BEFORE_INSTALL: &str = "before-install";
pub const AFTER_INSTALL_CHROOT: &str = "after-install-chroot";
pub const AFTER_INSTALL: &str = "after-install";
pub const BEFORE_UPGRADE: &str = "before-upgrade";
pub const AFTER_UPGRADE_CHROOT: &str = "after-upgrade-chroot";
pub const AFTER_UPGRADE: &str = "after-upgrade";
pub const BEFORE_RESET: &str = "before-reset";
pub const AFTER_RESET_CHROOT: &str = "after-reset-chroot";
pub const AFTER_RESET: &str = "after-reset";

// Bus events published around each operation. Always best-effort.
pub const EVENT_INSTALL_PRE: &str = "keel-install.pre";
pub const EVENT_INSTALL_AFTER: &str = "keel-install.after";
pub const EVENT_UPGRADE_PRE: &str = "keel-upgrade.pre";
pub const EVENT_UPGRADE_AFTER: &str = "keel-upgrade.after";
pub const EVENT_RESET_PRE: &str = "keel-reset.pre";
pub const EVENT_RESET_AFTER: &str = "keel-reset.after";

/// Executes the commands configured for named lifecycle stages. Failures are
/// logged and swallowed unless strict mode is on; bus events are swallowed
/// unconditionally.
pub struct HookRunner {
    stages: BTreeMap<String, Vec<String>>,
    strict: bool,
}

impl HookRunner {
    pub fn new(stages: BTreeMap<String, Vec<String>>, strict: bool) -> Self {
        Self { stages, strict }
    }

    /// Runs a lifecycle stage on the host.
    pub fn run(&self, stage: &str) -> Result<(), KeelError> {
        self.filter_strict(stage, self.execute(stage))
    }

    /// Runs a lifecycle stage inside a chroot of `root`, with the given bind
    /// mounts (host path -> chroot-relative path) in place. The chroot is
    /// left on every exit path.
    pub fn run_in_chroot(
        &self,
        stage: &str,
        root: &Path,
        binds: &BTreeMap<PathBuf, PathBuf>,
    ) -> Result<(), KeelError> {
        if self.commands(stage).is_empty() {
            debug!("No commands configured for stage '{stage}'");
            return Ok(());
        }

        let binds: Vec<(PathBuf, PathBuf)> = binds
            .iter()
            .map(|(host, rel)| (host.clone(), rel.clone()))
            .collect();

        let result = Chroot::enter(root, &binds)
            .context(format!("Failed to enter chroot for stage '{stage}'"))
            .and_then(|chroot| chroot.execute_and_exit(|| self.execute(stage)));

        self.filter_strict(stage, result)
    }

    /// Publishes a bus event. Event failures never propagate.
    pub fn publish_event(&self, event: &str) {
        if let Err(e) = self.execute(event) {
            warn!("Event '{event}' handler failed: {e:?}");
        }
    }

    fn commands(&self, stage: &str) -> &[String] {
        self.stages.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    fn execute(&self, stage: &str) -> Result<(), Error> {
        let commands = self.commands(stage);
        if commands.is_empty() {
            debug!("No commands configured for stage '{stage}'");
            return Ok(());
        }

        debug!("Running {} command(s) for stage '{stage}'", commands.len());
        for command in commands {
            Command::new("/bin/sh")
                .arg("-c")
                .arg(command)
                .run_and_check()
                .context(format!("Stage '{stage}' command failed: {command}"))?;
        }
        Ok(())
    }

    fn filter_strict(&self, stage: &str, result: Result<(), Error>) -> Result<(), KeelError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if self.strict => Err(e).structured(ServicingError::Hook {
                stage: stage.to_string(),
            }),
            Err(e) => {
                warn!("Stage '{stage}' failed (non-strict, continuing): {e:?}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_api::error::ErrorKind;
    use tempfile::TempDir;

    use super::*;

    fn runner_with(stage: &str, commands: &[&str], strict: bool) -> HookRunner {
        HookRunner::new(
            BTreeMap::from([(
                stage.to_string(),
                commands.iter().map(|c| c.to_string()).collect(),
            )]),
            strict,
        )
    }

    #[test]
    fn test_commands_run_in_order() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let commands = vec![
            format!("echo first >> {}", out.display()),
            format!("echo second >> {}", out.display()),
        ];
        let runner = HookRunner::new(
            BTreeMap::from([(BEFORE_INSTALL.to_string(), commands)]),
            true,
        );
        runner.run(BEFORE_INSTALL).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_failure_swallowed_when_not_strict() {
        let runner = runner_with(BEFORE_UPGRADE, &["exit 3"], false);
        runner.run(BEFORE_UPGRADE).unwrap();
    }

    #[test]
    fn test_failure_propagates_when_strict() {
        let runner = runner_with(BEFORE_UPGRADE, &["exit 3"], true);
        let err = runner.run(BEFORE_UPGRADE).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Servicing(ServicingError::Hook {
                stage: BEFORE_UPGRADE.to_string()
            })
        );
    }

    #[test]
    fn test_unconfigured_stage_is_noop() {
        let runner = HookRunner::new(BTreeMap::new(), true);
        runner.run(AFTER_RESET).unwrap();
    }

    #[test]
    fn test_events_never_propagate() {
        let runner = runner_with(EVENT_INSTALL_PRE, &["exit 1"], true);
        runner.publish_event(EVENT_INSTALL_PRE);
    }
}
