use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tto::cli::{Cli, Command};
use tto::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("tto={}", cli.log_level()))
        }))
        .init();

    match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("invalid configuration in {}", cli.config.display()))?;
    if let Some(role) = cli.role {
        config = config
            .with_role(role)
            .with_context(|| format!("cannot run as {}", role.as_str()))?;
    }

    match cli.command {
        Command::Check => {
            print!("{}", tto::app::summary(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run => {
            tracing::info!(
                "Starting tto {} as {}",
                env!("CARGO_PKG_VERSION"),
                config.role().as_str()
            );
            let term = tto::app::run(&config)
                .await
                .with_context(|| format!("{} stopped", config.role().as_str()))?;
            tracing::info!("Exiting: {}", term);
            Ok(ExitCode::from(term.exit_code() as u8))
        }
    }
}
