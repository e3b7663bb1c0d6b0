use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Restarts a systemd unit.
pub fn restart_unit(unit: &str) -> Result<(), Error> {
    Dependency::Systemctl
        .cmd()
        .with_arg("restart")
        .with_arg(unit)
        .run_and_check()
        .context(format!("Failed to restart unit '{unit}'"))
}

/// Reboots or powers off the machine through systemctl.
pub fn shutdown(poweroff: bool) -> Result<(), Error> {
    let verb = if poweroff { "poweroff" } else { "reboot" };
    Dependency::Systemctl
        .cmd()
        .with_arg(verb)
        .run_and_check()
        .context(format!("Failed to {verb}"))
}
