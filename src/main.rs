use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use termpilot::cli::{Cli, Command};
use termpilot::commands;
use termpilot::config::ProjectConfig;
use termpilot::registry::JsonFileRegistry;
use termpilot::shell_completion;
use termpilot::terminal::SurfaceId;
use termpilot::terminal::tmux::TmuxProvider;

fn install_stop_handler() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Relaxed);
    })
    .ok();
    stop
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet = matches!(
        &cli.command,
        Command::Config { .. } | Command::Completions { .. }
    );

    let filter = match cli.verbose {
        0 if quiet => "termpilot=warn",
        0 => "termpilot=info",
        1 => "termpilot=debug",
        _ => "termpilot=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Command::Completions { shell } = cli.command {
        return shell_completion::print(shell);
    }

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;
    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .termpilot/config.toml found, using defaults"),
    }
    let root = ProjectConfig::project_root(&cwd, config_path.as_deref());
    let registry = JsonFileRegistry::new(config.registry_path(&root));
    let provider = TmuxProvider::new(&config.provider);

    match cli.command {
        Command::List { all } => commands::list(&provider, &registry, all)?,
        Command::Status { surface } => {
            commands::status(&provider, &config, &SurfaceId::new(surface))?
        }
        Command::Context { surface, full } => {
            commands::context(&provider, &config, &SurfaceId::new(surface), full)?
        }
        Command::Attach {
            surface,
            goal,
            resume,
            new,
        } => {
            provider.check().context("tmux is not available")?;
            let stop = install_stop_handler();
            commands::attach(
                &provider,
                &registry,
                &config,
                &root,
                SurfaceId::new(surface),
                goal.as_deref(),
                resume,
                new,
                &stop,
            )?;
        }
        Command::Run => {
            provider.check().context("tmux is not available")?;
            let stop = install_stop_handler();
            commands::run_interactive(&provider, &registry, &config, &root, &stop)?;
        }
        Command::Sessions => commands::sessions(&registry)?,
        Command::Config { json } => {
            if json {
                println!(
                    "{}",
                    commands::render_config_json(&config, config_path.as_deref())?
                );
            } else {
                print!(
                    "{}",
                    commands::render_config_human(&config, config_path.as_deref())
                );
            }
        }
        Command::Completions { .. } => {}
    }

    Ok(())
}
