pub mod apply;
pub mod display;
pub mod download;
pub mod errlog;
pub mod fetch;
pub mod objects;
pub mod progress;

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sqlx::{Executor, MySqlPool, Row};
use tokio::sync::mpsc;

use crate::db::Credentials;
use crate::util::filename;
use crate::util::sql::split_file_name;
use display::{DisplayEvent, FocusedTable, Status};
use errlog::ErrorRecorder;

/// Suffix that keeps staged downloads invisible to the running engine.
pub const STAGING_SUFFIX: &str = ".trite";

/// Client mode configuration resolved from the CLI.
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub workers: usize,
    pub error_log: PathBuf,
    pub progress_limit_bytes: u64,
}

/// Shared context handed to every worker and apply task.
pub struct ClientCtx {
    pub http: reqwest::Client,
    pub pool: MySqlPool,
    pub taburl: String,
    pub backurl: String,
    pub datadir: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub version: String,
    pub progress_limit: u64,
    pub display: mpsc::UnboundedSender<DisplayEvent>,
    pub focused: FocusedTable,
    pub recorder: ErrorRecorder,
}

impl ClientCtx {
    /// 5.1 and 5.5 servers import from `.exp` export metadata.
    pub fn legacy_exp(&self) -> bool {
        is_legacy(&self.version)
    }

    pub fn send_status(&self, job: &TableJob, status: Status) {
        let _ = self
            .display
            .send(DisplayEvent::new(&job.schema, &job.table, status));
    }
}

/// One table to download and apply.
#[derive(Debug, Clone)]
pub struct TableJob {
    pub schema: String,
    pub table: String,
    pub encoded_schema: Option<String>,
    pub encoded_table: Option<String>,
}

impl TableJob {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            encoded_schema: filename::needs_encoding(schema).then(|| filename::encode(schema)),
            encoded_table: filename::needs_encoding(table).then(|| filename::encode(table)),
        }
    }

    /// On-disk name of the schema directory.
    pub fn schema_filename(&self) -> &str {
        self.encoded_schema.as_deref().unwrap_or(&self.schema)
    }

    /// On-disk base name of the table's files.
    pub fn table_filename(&self) -> &str {
        self.encoded_table.as_deref().unwrap_or(&self.table)
    }

    pub fn fq(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

fn is_legacy(version: &str) -> bool {
    version.starts_with("5.1") || version.starts_with("5.5")
}

/// Run client mode end to end.
pub async fn run(config: ClientConfig, creds: Credentials) -> Result<()> {
    let pool = creds.connect().await?;

    let version = global_variable(&pool, "version")
        .await?
        .map(|(_, value)| value)
        .context("could not detect the server version")?;

    // 5.1 and 5.5 gate physical imports behind a global flag whose exact
    // name varies by build; discover it and remember it for reset.
    let import_flag = if is_legacy(&version) {
        let (flag, _) = global_variable(&pool, "%innodb%import%")
            .await?
            .with_context(|| format!("no physical-import variable found on {version}"))?;
        pool.execute(format!("set global {flag}=1").as_str())
            .await?;
        Some(flag)
    } else if version.starts_with("5.6") || version.starts_with("10.") {
        None
    } else {
        bail!("{version} is not supported");
    };

    let datadir = PathBuf::from(
        session_variable(&pool, "datadir")
            .await?
            .map(|(_, value)| value)
            .context("could not read the server datadir")?,
    );
    probe_datadir(&datadir)?;
    tracing::debug!("server {version}, datadir {}", datadir.display());

    // Staged files take the data directory's owner.
    let meta = std::fs::metadata(&datadir)?;
    let (uid, gid) = (meta.uid(), meta.gid());

    let taburl = format!(
        "http://{}:{}/tables/",
        config.server_host, config.server_port
    );
    let backurl = format!(
        "http://{}:{}/backups/",
        config.server_host, config.server_port
    );

    let http = reqwest::Client::new();
    for url in [&taburl, &backurl] {
        if !fetch::head_ok(&http, url).await.unwrap_or(false) {
            bail!(
                "Problem connecting to {url}\n\
                 Check that the server is running, the port number is correct \
                 or that a firewall is not blocking access"
            );
        }
    }

    let schemas = fetch::fetch_listing(&http, &taburl).await?;

    let (display_tx, display_rx) = mpsc::unbounded_channel();
    let focused = FocusedTable::default();
    let display_task = tokio::spawn(display::run(display_rx, focused.clone()));

    let ctx = Arc::new(ClientCtx {
        http: http.clone(),
        pool: pool.clone(),
        taburl: taburl.clone(),
        backurl,
        datadir,
        uid,
        gid,
        version,
        progress_limit: config.progress_limit_bytes,
        display: display_tx,
        focused,
        recorder: ErrorRecorder::new(config.error_log),
    });

    let (job_tx, job_rx) = mpsc::unbounded_channel::<TableJob>();
    let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
    let (handle_tx, mut handle_rx) = mpsc::unbounded_channel();

    let workers: Vec<_> = (0..config.workers.max(1))
        .map(|_| {
            tokio::spawn(download::run_worker(
                ctx.clone(),
                job_rx.clone(),
                handle_tx.clone(),
            ))
        })
        .collect();
    drop(handle_tx);

    // Enumerate schemas and queue one job per table.
    for schema in &schemas {
        objects::ensure_schema(&pool, &http, &taburl, schema).await?;

        let tables = fetch::fetch_listing(&http, &format!("{taburl}{schema}/tables")).await?;
        for table in tables {
            let (base, _) = split_file_name(&table);
            let job = TableJob::new(schema, base);
            ctx.send_status(&job, Status::Starting);
            let _ = job_tx.send(job);
        }
    }
    drop(job_tx);

    // Download phase: the workers exit once the job channel drains.
    for worker in workers {
        worker.await?;
    }

    // Apply phase: every spawned apply task must settle before any stored
    // object is replayed. A skipped table never produced a handle here.
    while let Some(handle) = handle_rx.recv().await {
        let _ = handle.await;
    }

    let error_count = ctx.recorder.count().await;
    let error_log = ctx.recorder.path().clone();

    // Dropping the context closes the display channel; wait for the final
    // status lines to land before printing anything else.
    drop(ctx);
    let _ = display_task.await;

    println!();
    for schema in &schemas {
        objects::apply_schema_objects(&pool, &http, &taburl, schema).await?;
    }

    if let Some(flag) = import_flag {
        pool.execute(format!("set global {flag}=0").as_str())
            .await?;
    }

    if error_count > 0 {
        println!();
        println!("! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ");
        println!("{error_count} errors were encountered");
        println!("Check {} for more details", error_log.display());
        println!("! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ! ");
    }

    Ok(())
}

/// Prove the data directory is writable before any worker starts.
fn probe_datadir(datadir: &Path) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let probe = datadir.join("trite_test");
    let created = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o660)
        .open(&probe)
        .and_then(|mut file| file.write_all(b"delete\n"));

    match created {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(_) => bail!("The MySQL data directory is not writable as this user!"),
    }
}

async fn global_variable(pool: &MySqlPool, pattern: &str) -> Result<Option<(String, String)>> {
    variable_like(pool, "show global variables like", pattern).await
}

async fn session_variable(pool: &MySqlPool, pattern: &str) -> Result<Option<(String, String)>> {
    variable_like(pool, "show variables like", pattern).await
}

async fn variable_like(
    pool: &MySqlPool,
    stmt: &str,
    pattern: &str,
) -> Result<Option<(String, String)>> {
    let row = pool
        .fetch_optional(format!("{stmt} '{pattern}'").as_str())
        .await?;

    Ok(match row {
        Some(row) => Some((row.try_get(0)?, row.try_get(1)?)),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_band_covers_51_and_55() {
        assert!(is_legacy("5.1.73-log"));
        assert!(is_legacy("5.5.40"));
        assert!(!is_legacy("5.6.21"));
        assert!(!is_legacy("10.0.15-MariaDB"));
    }

    #[test]
    fn jobs_encode_names_on_demand() {
        let plain = TableJob::new("sales", "orders");
        assert!(plain.encoded_schema.is_none());
        assert_eq!(plain.schema_filename(), "sales");
        assert_eq!(plain.fq(), "sales.orders");

        let accented = TableJob::new("vente", "café");
        assert_eq!(accented.table_filename(), "caf@00e9");
        assert_eq!(accented.fq(), "vente.café");
    }

    #[test]
    fn writable_datadir_probe_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        probe_datadir(dir.path()).unwrap();
        assert!(!dir.path().join("trite_test").exists());
    }

    #[test]
    fn unwritable_datadir_is_fatal() {
        let err = probe_datadir(Path::new("/nonexistent/datadir")).unwrap_err();
        assert!(err.to_string().contains("not writable"));
    }
}
