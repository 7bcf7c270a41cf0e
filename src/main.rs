mod cli;
mod client;
mod db;
mod dump;
mod server;
mod util;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr so they never collide with the
    // carriage-return status display on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Commands::Client {
            db,
            server_host,
            server_port,
            workers,
            error_log,
            progress_limit,
        } => {
            util::catch_interrupts();

            let creds = db::Credentials::from_opts(db)?;

            let config = client::ClientConfig {
                server_host,
                server_port,
                workers,
                error_log: match error_log {
                    Some(path) => path,
                    None => std::env::current_dir()?.join("trite.err"),
                },
                progress_limit_bytes: progress_limit * 1_073_741_824,
            };

            client::run(config, creds).await?;
        }

        Commands::Dump { db, dump_dir } => {
            util::catch_interrupts();

            let creds = db::Credentials::from_opts(db)?;

            let dir = match dump_dir {
                Some(path) => path,
                None => std::env::current_dir()?,
            };

            dump::run(&dir, creds).await?;
        }

        Commands::Server {
            dump_path,
            backup_path,
            server_port,
        } => {
            server::run(&dump_path, &backup_path, server_port).await?;
        }
    }

    Ok(())
}
