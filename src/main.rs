use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use zsync_restore::cli::{self, Commands};
use zsync_restore::commands;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // --debug wins over --verbose; RUST_LOG directives still apply on top
    let level = if cli.globals.debug {
        tracing::Level::TRACE
    } else if cli.globals.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // Only use colors when outputting to a TTY (not when piped to file)
    let use_color = atty::is(atty::Stream::Stdout);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(cli.globals.debug)
        .with_ansi(use_color)
        .init();

    let result = match cli.cmd {
        Commands::Restore(args) => commands::cmd_restore(&cli.globals, args).await,
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}
