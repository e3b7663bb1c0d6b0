use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use keel::{
    cli::{BootentriesCommands, Cli, Commands, SysextCommands},
    engine::{
        bootentries::{self, BootPaths},
        bootrole::SentinelBootRole,
        deployer::SystemDeployer,
        hooks::HookRunner,
        install::Installer,
        reset::Resetter,
        sysext::{SysextManager, SysextPaths},
        upgrade::Upgrader,
    },
    logging,
};
use keel_api::{config::AgentConfig, error::KeelError};

fn main() -> ExitCode {
    let args = Cli::parse();
    logging::init(args.verbosity);
    info!("keel version: {}", keel::KEEL_VERSION);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            if let Some(path) = &args.error {
                match serde_yaml::to_string(&e) {
                    Ok(doc) => {
                        if let Err(io_err) = std::fs::write(path, doc) {
                            error!("Failed to save error report: {io_err}");
                        }
                    }
                    Err(ser_err) => error!("Failed to serialize error report: {ser_err}"),
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Cli) -> Result<(), KeelError> {
    let deployer = SystemDeployer;
    match &args.command {
        Commands::Install {
            config,
            device,
            no_format,
            force,
        } => {
            let cfg = AgentConfig::load(config)?;
            let hooks = HookRunner::new(cfg.hooks.clone(), cfg.strict_hooks);
            let mut spec = cfg.install_spec();
            if device.is_some() {
                spec.target = device.clone();
            }
            spec.no_format |= *no_format;
            spec.force |= *force;
            Installer::new(spec, &deployer, &hooks).run()
        }

        Commands::Upgrade { config, recovery } => {
            let cfg = AgentConfig::load(config)?;
            let hooks = HookRunner::new(cfg.hooks.clone(), cfg.strict_hooks);
            let detector = SentinelBootRole::default();
            Upgrader::new(cfg.upgrade_spec(*recovery), &deployer, &hooks, &detector).run()
        }

        Commands::Reset {
            config,
            reboot,
            poweroff,
        } => {
            let cfg = AgentConfig::load(config)?;
            let hooks = HookRunner::new(cfg.hooks.clone(), cfg.strict_hooks);
            let mut spec = cfg.reset_spec();
            spec.reboot |= *reboot;
            spec.poweroff |= *poweroff;
            Resetter::new(spec, &deployer, &hooks).run()
        }

        Commands::Bootentries { command } => {
            let paths = BootPaths::default();
            match command {
                BootentriesCommands::List => {
                    for entry in bootentries::list_boot_entries(&paths)? {
                        println!("{entry}");
                    }
                    Ok(())
                }
                BootentriesCommands::Select { entry } => {
                    bootentries::select_boot_entry(&paths, entry)
                }
            }
        }

        Commands::Sysext { command } => {
            let detector = SentinelBootRole::default();
            let manager = SysextManager::new(SysextPaths::default(), &detector);
            match command {
                SysextCommands::List { role } => {
                    for ext in manager.list(*role)? {
                        println!("{}\t{}", ext.name, ext.location.display());
                    }
                    Ok(())
                }
                SysextCommands::Install { uri } => {
                    let ext = manager.install(uri)?;
                    println!("{}\t{}", ext.name, ext.location.display());
                    Ok(())
                }
                SysextCommands::Enable { name, role, now } => manager.enable(name, *role, *now),
                SysextCommands::Disable { name, role, now } => manager.disable(name, *role, *now),
                SysextCommands::Remove { name, now } => manager.remove(name, *now),
            }
        }
    }
}
