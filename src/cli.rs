use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "trite")]
#[command(
    about = "Transport MySQL tables out of a prepared XtraBackup physical backup over HTTP",
    long_about = None
)]
pub struct Cli {
    /// Omitting the mode prints usage and exits cleanly
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Database connection options shared by client and dump modes
#[derive(Args, Debug, Clone)]
pub struct DbOpts {
    /// MySQL user name
    #[arg(long)]
    pub user: String,

    /// MySQL password (prompted without echo if omitted)
    #[arg(long)]
    pub pass: Option<String>,

    /// MySQL server hostname or ip
    #[arg(long)]
    pub host: Option<String>,

    /// MySQL server port
    #[arg(long, default_value_t = 3306)]
    pub port: u16,

    /// MySQL socket file (preferred over host when both are given)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Enable TLS (skips certificate verification) and cleartext password auth
    #[arg(long)]
    pub tls: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Restore tables into the local database from a trite server
    Client {
        #[command(flatten)]
        db: DbOpts,

        /// Hostname or ip of the trite server
        #[arg(long = "server-host")]
        server_host: String,

        /// HTTP port of the trite server
        #[arg(long = "server-port", default_value_t = 12000)]
        server_port: u16,

        /// Number of concurrent download workers
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// Path of the error log (defaults to trite.err in the working directory)
        #[arg(long = "error-log")]
        error_log: Option<PathBuf>,

        /// Minimum file size in GB before a download progress line is shown
        #[arg(long = "progress-limit", default_value_t = 5)]
        progress_limit: u64,
    },

    /// Dump create statements for tables and stored objects
    Dump {
        #[command(flatten)]
        db: DbOpts,

        /// Directory to write the dump under (defaults to the working directory)
        #[arg(long = "dump-dir")]
        dump_dir: Option<PathBuf>,
    },

    /// Serve object dumps and a prepared backup over HTTP
    Server {
        /// Directory of object dumps produced by dump mode
        #[arg(long = "dump-path")]
        dump_path: PathBuf,

        /// Directory of the prepared physical backup
        #[arg(long = "backup-path")]
        backup_path: PathBuf,

        /// HTTP port to listen on
        #[arg(long = "server-port", default_value_t = 12000)]
        server_port: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let cli = Cli::parse_from([
            "trite",
            "client",
            "--user",
            "app",
            "--server-host",
            "backup1",
        ]);
        match cli.command.expect("mode") {
            Commands::Client {
                db,
                server_host,
                server_port,
                workers,
                error_log,
                progress_limit,
            } => {
                assert_eq!(db.user, "app");
                assert_eq!(db.port, 3306);
                assert!(!db.tls);
                assert_eq!(server_host, "backup1");
                assert_eq!(server_port, 12000);
                assert_eq!(workers, 1);
                assert!(error_log.is_none());
                assert_eq!(progress_limit, 5);
            }
            other => panic!("parsed wrong mode: {other:?}"),
        }
    }

    #[test]
    fn server_requires_both_paths() {
        let res = Cli::try_parse_from(["trite", "server", "--dump-path", "/tmp/dump"]);
        assert!(res.is_err());
    }

    #[test]
    fn socket_and_host_may_coexist() {
        let cli = Cli::parse_from([
            "trite",
            "dump",
            "--user",
            "app",
            "--host",
            "db1",
            "--socket",
            "/var/lib/mysql/mysql.sock",
        ]);
        match cli.command.expect("mode") {
            Commands::Dump { db, .. } => {
                assert_eq!(db.host.as_deref(), Some("db1"));
                assert!(db.socket.is_some());
            }
            other => panic!("parsed wrong mode: {other:?}"),
        }
    }
}
