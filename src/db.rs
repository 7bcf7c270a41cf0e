use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use sqlx::{Connection, Executor, MySqlPool};

use crate::cli::DbOpts;

/// Session-level wait timeout, one hour.
const WAIT_TIMEOUT_SECS: u32 = 3600;

/// Network write timeout, ten minutes. Prevents disconnects when moving
/// thousands of tables.
const NET_WRITE_TIMEOUT_SECS: u32 = 600;

/// Resolved database connection information.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
    pub host: String,
    pub port: u16,
    pub socket: Option<PathBuf>,
    pub tls: bool,
}

impl Credentials {
    /// Resolve credentials from CLI options, prompting for a missing
    /// password without echo.
    pub fn from_opts(opts: DbOpts) -> Result<Self> {
        Self::from_opts_with_prompt(opts, || {
            rpassword::prompt_password("Enter password: ").context("failed to read password")
        })
    }

    /// Prompt is injected so tests can script the password source.
    fn from_opts_with_prompt(
        opts: DbOpts,
        prompt: impl FnOnce() -> Result<String>,
    ) -> Result<Self> {
        let pass = match opts.pass {
            Some(p) if !p.is_empty() => p,
            _ => prompt()?,
        };

        // Localhost when neither a host nor a socket was supplied.
        let host = match opts.host {
            Some(h) if !h.is_empty() => h,
            _ => "localhost".to_string(),
        };

        Ok(Self {
            user: opts.user,
            pass,
            host,
            port: opts.port,
            socket: opts.socket,
            tls: opts.tls,
        })
    }

    /// Open a connection pool and verify the credentials with a ping.
    ///
    /// Every pooled connection disables binary logging for its session and
    /// carries the long-run timeouts. Idle connections are not retained.
    pub async fn connect(&self) -> Result<MySqlPool> {
        let mut options = MySqlConnectOptions::new()
            .username(&self.user)
            .password(&self.pass);

        // The socket transport is preferred when both are supplied.
        if let Some(socket) = &self.socket {
            options = options.socket(socket);
        } else {
            options = options.host(&self.host).port(self.port);
        }

        if self.tls {
            // Encrypt without verifying the server certificate, and allow
            // the cleartext plugin that PAM-style auth needs.
            options = options
                .ssl_mode(MySqlSslMode::Required)
                .enable_cleartext_plugin(true);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(32)
            .min_connections(0)
            .idle_timeout(Duration::from_secs(1))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("set session sql_log_bin=0").await?;
                    conn.execute(
                        format!("set session wait_timeout={WAIT_TIMEOUT_SECS}").as_str(),
                    )
                    .await?;
                    conn.execute(
                        format!("set session net_write_timeout={NET_WRITE_TIMEOUT_SECS}")
                            .as_str(),
                    )
                    .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .context("Unable to access database! Possible incorrect password.")?;

        // Round trip to prove the credentials before any work starts.
        pool.acquire()
            .await
            .context("Unable to access database! Possible incorrect password.")?
            .ping()
            .await
            .context("Unable to access database! Possible incorrect password.")?;

        Ok(pool)
    }
}

/// Creation record for procedures, functions, triggers and views, stored as
/// JSON at dump time. Views carry no sql_mode or database collation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDefinition {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "SqlMode", default, skip_serializing_if = "Option::is_none")]
    pub sql_mode: Option<String>,

    #[serde(rename = "Create")]
    pub create: String,

    #[serde(rename = "CharsetClient")]
    pub charset_client: String,

    #[serde(rename = "Collation")]
    pub collation: String,

    #[serde(
        rename = "DbCollation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub db_collation: Option<String>,
}
