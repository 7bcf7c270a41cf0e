use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Executor, MySql, Row, Transaction};
use thiserror::Error;

use super::display::Status;
use super::errlog::{ErrorRecorder, ProcessEntry};
use super::fetch;
use super::{ClientCtx, TableJob, STAGING_SUFFIX};
use crate::util::sql::quote_ident;

/// Engine of a table confirmed present in the backup. Probing happens in
/// the download worker; a table only reaches the apply engine once its
/// engine is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEngine {
    InnoDb,
    MyIsam,
}

/// Apply step that failed. The step fixes which cleanup actions must run
/// before the table's transaction is rolled back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("There was an error selecting the schema for {0}")]
    Use(String),
    #[error("There was an error dropping table {0}")]
    Drop(String),
    #[error("There was an error creating table {0}")]
    Create(String),
    #[error("There was an error discarding the tablespace for {0}")]
    Discard(String),
    #[error("There was an error locking table {0}")]
    Lock(String),
    #[error("There was an error renaming table {0}")]
    Rename(String),
    #[error("There was an error importing the tablespace for {0}")]
    Import(String),
    #[error("There was an error analyzing table {0}")]
    Analyze(String),
    #[error("There was an error unlocking table {0}")]
    Unlock(String),
    #[error("There was an error committing the transaction for {0}")]
    Commit(String),
}

struct Cleanup {
    remove_staged: bool,
    unlock: bool,
    drop_table: bool,
}

impl ApplyError {
    fn cleanup(&self) -> Cleanup {
        match self {
            // Nothing ran yet, but staged files must not outlive the table.
            ApplyError::Use(_) => Cleanup {
                remove_staged: true,
                unlock: false,
                drop_table: false,
            },
            ApplyError::Drop(_) | ApplyError::Create(_) => Cleanup {
                remove_staged: true,
                unlock: false,
                drop_table: false,
            },
            ApplyError::Discard(_) | ApplyError::Lock(_) => Cleanup {
                remove_staged: true,
                unlock: false,
                drop_table: true,
            },
            ApplyError::Rename(_) => Cleanup {
                remove_staged: true,
                unlock: true,
                drop_table: true,
            },
            ApplyError::Import(_) => Cleanup {
                remove_staged: false,
                unlock: true,
                drop_table: true,
            },
            // The tablespace is already live; dropping it would lose data.
            ApplyError::Analyze(_) => Cleanup {
                remove_staged: false,
                unlock: true,
                drop_table: false,
            },
            ApplyError::Unlock(_) => Cleanup {
                remove_staged: false,
                unlock: false,
                drop_table: false,
            },
            // The failed commit consumed the transaction; nothing to drive.
            ApplyError::Commit(_) => Cleanup {
                remove_staged: false,
                unlock: false,
                drop_table: false,
            },
        }
    }
}

/// SQL surface the state machine drives. One implementation wraps a sqlx
/// transaction; tests substitute a scripted one.
#[async_trait]
pub trait ApplyTx: Send {
    async fn exec(&mut self, sql: &str) -> Result<()>;
    async fn engine_status(&mut self) -> Result<String>;
    async fn process_list(&mut self) -> Result<Vec<ProcessEntry>>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A real per-table transaction from the pool.
pub struct SqlxTx(pub Transaction<'static, MySql>);

#[async_trait]
impl ApplyTx for SqlxTx {
    // Statements run over the text protocol: `use`, `lock table` and
    // `unlock tables` cannot be prepared.
    async fn exec(&mut self, sql: &str) -> Result<()> {
        (&mut *self.0).execute(sql).await?;
        Ok(())
    }

    async fn engine_status(&mut self) -> Result<String> {
        let row = (&mut *self.0)
            .fetch_one("show engine innodb status")
            .await?;
        Ok(row.try_get::<String, _>(2)?)
    }

    async fn process_list(&mut self) -> Result<Vec<ProcessEntry>> {
        let rows = (&mut *self.0)
            .fetch_all(
                "select id, user, host, ifnull(db,'NULL'), command, time, \
                 ifnull(state,'NULL'), ifnull(info,'NULL') \
                 from information_schema.processlist where id != connection_id()",
            )
            .await?;

        let mut list = Vec::with_capacity(rows.len());
        for row in rows {
            list.push(ProcessEntry {
                id: row.try_get(0)?,
                user: row.try_get(1)?,
                host: row.try_get(2)?,
                db: row.try_get(3)?,
                command: row.try_get(4)?,
                time: row.try_get(5)?,
                state: row.try_get(6)?,
                info: row.try_get(7)?,
            });
        }
        Ok(list)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.0.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.0.rollback().await?;
        Ok(())
    }
}

/// Final name of a staged file, with the staging suffix stripped.
pub fn rename_target(staged: &Path) -> PathBuf {
    let name = staged
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    staged.with_file_name(name.trim_end_matches(STAGING_SUFFIX))
}

/// Restore one table inside a single transaction.
///
/// On any step failure the step-specific cleanup runs, diagnostics are
/// recorded with the transaction still open, and the transaction is rolled
/// back; no staged file survives a failure.
pub async fn apply_table(
    mut tx: Box<dyn ApplyTx>,
    schema: &str,
    table: &str,
    engine: TableEngine,
    create_stmt: Option<&str>,
    staged: &[PathBuf],
    recorder: &ErrorRecorder,
) -> Result<(), ApplyError> {
    let fq = format!("{schema}.{table}");

    // Session setup; these fall back to the server defaults on failure.
    let _ = tx.exec("set session foreign_key_checks=0").await;
    let _ = tx.exec("set session lock_wait_timeout=60").await;

    // Nothing below works without the schema selected; abort the table
    // before any statement can run against the wrong database.
    if tx
        .exec(&format!("use {}", quote_ident(schema)))
        .await
        .is_err()
    {
        return fail(tx, ApplyError::Use(fq), table, staged, recorder).await;
    }

    let drop_stmt = format!("drop table if exists {}", quote_ident(table));

    match engine {
        TableEngine::InnoDb => {
            if tx.exec(&drop_stmt).await.is_err() {
                return fail(tx, ApplyError::Drop(fq), table, staged, recorder).await;
            }

            if tx.exec(create_stmt.unwrap_or_default()).await.is_err() {
                return fail(tx, ApplyError::Create(fq), table, staged, recorder).await;
            }

            let discard = format!("alter table {} discard tablespace", quote_ident(table));
            if tx.exec(&discard).await.is_err() {
                return fail(tx, ApplyError::Discard(fq), table, staged, recorder).await;
            }

            // Lock out concurrent readers between discard and import.
            let lock = format!("lock table {} write", quote_ident(table));
            if tx.exec(&lock).await.is_err() {
                return fail(tx, ApplyError::Lock(fq), table, staged, recorder).await;
            }

            for file in staged {
                if std::fs::rename(file, rename_target(file)).is_err() {
                    return fail(tx, ApplyError::Rename(fq), table, staged, recorder).await;
                }
            }

            let import = format!("alter table {} import tablespace", quote_ident(table));
            if tx.exec(&import).await.is_err() {
                return fail(tx, ApplyError::Import(fq), table, staged, recorder).await;
            }

            // Without an analyze the imported table has no index statistics.
            let analyze = format!("analyze local table {}", quote_ident(table));
            if tx.exec(&analyze).await.is_err() {
                return fail(tx, ApplyError::Analyze(fq), table, staged, recorder).await;
            }

            if tx.exec("unlock tables").await.is_err() {
                return fail(tx, ApplyError::Unlock(fq), table, staged, recorder).await;
            }

            if let Err(err) = tx.commit().await {
                return commit_failed(err, fq, recorder).await;
            }
        }

        TableEngine::MyIsam => {
            if tx.exec(&drop_stmt).await.is_err() {
                return fail(tx, ApplyError::Drop(fq), table, staged, recorder).await;
            }

            for file in staged {
                if std::fs::rename(file, rename_target(file)).is_err() {
                    return fail(tx, ApplyError::Rename(fq), table, staged, recorder).await;
                }
            }

            if let Err(err) = tx.commit().await {
                return commit_failed(err, fq, recorder).await;
            }
        }
    }

    Ok(())
}

/// A failed commit has already consumed the transaction, so there is no
/// engine status to snapshot and nothing to roll back; record it and
/// surface the table as errored.
async fn commit_failed(
    err: anyhow::Error,
    fq: String,
    recorder: &ErrorRecorder,
) -> Result<(), ApplyError> {
    let commit_err = ApplyError::Commit(fq);
    let _ = recorder
        .record(&format!("{commit_err}: {err}"), None, &[])
        .await;
    Err(commit_err)
}

/// Record diagnostics, run the step's cleanup, and roll back.
async fn fail(
    mut tx: Box<dyn ApplyTx>,
    err: ApplyError,
    table: &str,
    staged: &[PathBuf],
    recorder: &ErrorRecorder,
) -> Result<(), ApplyError> {
    // Snapshot diagnostics while the failed transaction is still open.
    let status = tx.engine_status().await.ok();
    let list = tx.process_list().await.unwrap_or_default();
    let _ = recorder
        .record(&err.to_string(), status.as_deref(), &list)
        .await;

    let plan = err.cleanup();
    if plan.remove_staged {
        for file in staged {
            let _ = std::fs::remove_file(file);
        }
    }
    if plan.unlock {
        let _ = tx.exec("unlock tables").await;
    }
    if plan.drop_table {
        let _ = tx
            .exec(&format!("drop table if exists {}", quote_ident(table)))
            .await;
    }
    let _ = tx.rollback().await;

    Err(err)
}

/// Per-table apply task, spawned by a download worker once the table's
/// files are staged.
pub async fn apply_task(
    ctx: Arc<ClientCtx>,
    job: TableJob,
    engine: TableEngine,
    staged: Vec<PathBuf>,
) {
    ctx.send_status(&job, Status::Applying);

    let tx = match ctx.pool.begin().await {
        Ok(tx) => Box::new(SqlxTx(tx)),
        Err(err) => {
            for file in &staged {
                let _ = std::fs::remove_file(file);
            }
            let _ = ctx
                .recorder
                .record(
                    &format!(
                        "There was an error opening a transaction for {}.{}: {err}",
                        job.schema, job.table
                    ),
                    None,
                    &[],
                )
                .await;
            ctx.send_status(&job, Status::Error);
            return;
        }
    };

    // The create statement comes from the dump tree, not the backup.
    let create_stmt = match engine {
        TableEngine::InnoDb => {
            let url = format!("{}{}/tables/{}.sql", ctx.taburl, job.schema, job.table);
            match fetch::fetch_text(&ctx.http, &url).await {
                Ok(stmt) => Some(stmt),
                Err(err) => {
                    for file in &staged {
                        let _ = std::fs::remove_file(file);
                    }
                    let _ = ctx
                        .recorder
                        .record(
                            &format!(
                                "There was an error fetching the create statement for {}.{}: {err}",
                                job.schema, job.table
                            ),
                            None,
                            &[],
                        )
                        .await;
                    let _ = (tx as Box<dyn ApplyTx>).rollback().await;
                    ctx.send_status(&job, Status::Error);
                    return;
                }
            }
        }
        TableEngine::MyIsam => None,
    };

    let result = apply_table(
        tx,
        &job.schema,
        &job.table,
        engine,
        create_stmt.as_deref(),
        &staged,
        &ctx.recorder,
    )
    .await;

    match result {
        Ok(()) => ctx.send_status(&job, Status::Restored),
        Err(_) => ctx.send_status(&job, Status::Error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Scripted transaction: records every statement, optionally failing
    /// the first one containing a given fragment, or the commit itself.
    struct MockTx {
        executed: Arc<StdMutex<Vec<String>>>,
        fail_on: Option<&'static str>,
        fail_commit: bool,
        committed: Arc<AtomicBool>,
        rolled_back: Arc<AtomicBool>,
    }

    type MockHandles = (
        Box<MockTx>,
        Arc<StdMutex<Vec<String>>>,
        Arc<AtomicBool>,
        Arc<AtomicBool>,
    );

    impl MockTx {
        fn new(fail_on: Option<&'static str>) -> MockHandles {
            Self::build(fail_on, false)
        }

        fn failing_commit() -> MockHandles {
            Self::build(None, true)
        }

        fn build(fail_on: Option<&'static str>, fail_commit: bool) -> MockHandles {
            let executed = Arc::new(StdMutex::new(Vec::new()));
            let committed = Arc::new(AtomicBool::new(false));
            let rolled_back = Arc::new(AtomicBool::new(false));
            let tx = Box::new(Self {
                executed: executed.clone(),
                fail_on,
                fail_commit,
                committed: committed.clone(),
                rolled_back: rolled_back.clone(),
            });
            (tx, executed, committed, rolled_back)
        }
    }

    #[async_trait]
    impl ApplyTx for MockTx {
        async fn exec(&mut self, sql: &str) -> Result<()> {
            self.executed.lock().unwrap().push(sql.to_string());
            if let Some(frag) = self.fail_on {
                if sql.contains(frag) {
                    anyhow::bail!("injected failure on {frag}");
                }
            }
            Ok(())
        }

        async fn engine_status(&mut self) -> Result<String> {
            Ok("=== INNODB MONITOR OUTPUT ===".into())
        }

        async fn process_list(&mut self) -> Result<Vec<ProcessEntry>> {
            Ok(Vec::new())
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            if self.fail_commit {
                anyhow::bail!("injected commit failure");
            }
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            self.rolled_back.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stage_files(dir: &std::path::Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(format!("{name}{STAGING_SUFFIX}"));
                std::fs::write(&path, b"tablespace bytes").unwrap();
                path
            })
            .collect()
    }

    fn recorder(dir: &std::path::Path) -> ErrorRecorder {
        ErrorRecorder::new(dir.join("trite.err"))
    }

    #[tokio::test]
    async fn innodb_success_runs_the_full_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_files(dir.path(), &["t1.ibd"]);
        let rec = recorder(dir.path());
        let (tx, executed, committed, _) = MockTx::new(None);

        apply_table(
            tx,
            "sales",
            "t1",
            TableEngine::InnoDb,
            Some("CREATE TABLE `t1` (id int)"),
            &staged,
            &rec,
        )
        .await
        .unwrap();

        let sql = executed.lock().unwrap().clone();
        assert_eq!(
            sql,
            vec![
                "set session foreign_key_checks=0".to_string(),
                "set session lock_wait_timeout=60".to_string(),
                "use `sales`".to_string(),
                "drop table if exists `t1`".to_string(),
                "CREATE TABLE `t1` (id int)".to_string(),
                "alter table `t1` discard tablespace".to_string(),
                "lock table `t1` write".to_string(),
                "alter table `t1` import tablespace".to_string(),
                "analyze local table `t1`".to_string(),
                "unlock tables".to_string(),
            ]
        );
        assert!(committed.load(Ordering::SeqCst));

        // Staged file renamed into place.
        assert!(!staged[0].exists());
        assert!(dir.path().join("t1.ibd").exists());
        assert_eq!(rec.count().await, 0);
    }

    #[tokio::test]
    async fn myisam_success_drops_and_renames_only() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_files(dir.path(), &["t2.MYI", "t2.MYD", "t2.frm"]);
        let rec = recorder(dir.path());
        let (tx, executed, committed, _) = MockTx::new(None);

        apply_table(tx, "sales", "t2", TableEngine::MyIsam, None, &staged, &rec)
            .await
            .unwrap();

        let sql = executed.lock().unwrap().clone();
        assert_eq!(sql[3], "drop table if exists `t2`");
        assert!(!sql.iter().any(|s| s.contains("tablespace")));
        assert!(committed.load(Ordering::SeqCst));

        for name in ["t2.MYI", "t2.MYD", "t2.frm"] {
            assert!(dir.path().join(name).exists());
        }
    }

    #[tokio::test]
    async fn discard_failure_drops_table_and_removes_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_files(dir.path(), &["t1.ibd"]);
        let rec = recorder(dir.path());
        let (tx, executed, committed, rolled_back) = MockTx::new(Some("discard tablespace"));

        let err = apply_table(
            tx,
            "sales",
            "t1",
            TableEngine::InnoDb,
            Some("CREATE TABLE `t1` (id int)"),
            &staged,
            &rec,
        )
        .await
        .unwrap_err();

        assert_eq!(err, ApplyError::Discard("sales.t1".into()));
        assert!(!staged[0].exists());
        assert!(!dir.path().join("t1.ibd").exists());
        assert!(rolled_back.load(Ordering::SeqCst));
        assert!(!committed.load(Ordering::SeqCst));
        assert_eq!(rec.count().await, 1);

        // Cleanup issued a second drop after the initial one.
        let sql = executed.lock().unwrap().clone();
        let drops = sql
            .iter()
            .filter(|s| s.as_str() == "drop table if exists `t1`")
            .count();
        assert_eq!(drops, 2);
        assert!(!sql.iter().any(|s| s.as_str() == "unlock tables"));
    }

    #[tokio::test]
    async fn import_failure_unlocks_and_drops_but_keeps_renamed_files() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_files(dir.path(), &["t1.ibd"]);
        let rec = recorder(dir.path());
        let (tx, executed, _, rolled_back) = MockTx::new(Some("import tablespace"));

        let err = apply_table(
            tx,
            "sales",
            "t1",
            TableEngine::InnoDb,
            Some("CREATE TABLE `t1` (id int)"),
            &staged,
            &rec,
        )
        .await
        .unwrap_err();

        assert_eq!(err, ApplyError::Import("sales.t1".into()));
        // Files were already renamed into place; import cleanup leaves them.
        assert!(dir.path().join("t1.ibd").exists());
        assert!(rolled_back.load(Ordering::SeqCst));

        let sql = executed.lock().unwrap().clone();
        let tail = &sql[sql.len() - 2..];
        assert_eq!(tail[0], "unlock tables");
        assert_eq!(tail[1], "drop table if exists `t1`");
    }

    #[tokio::test]
    async fn analyze_failure_unlocks_without_dropping() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_files(dir.path(), &["t1.ibd"]);
        let rec = recorder(dir.path());
        let (tx, executed, _, rolled_back) = MockTx::new(Some("analyze local table"));

        let err = apply_table(
            tx,
            "sales",
            "t1",
            TableEngine::InnoDb,
            Some("CREATE TABLE `t1` (id int)"),
            &staged,
            &rec,
        )
        .await
        .unwrap_err();

        assert_eq!(err, ApplyError::Analyze("sales.t1".into()));
        assert!(rolled_back.load(Ordering::SeqCst));

        // The data is live: cleanup must not drop the table.
        let sql = executed.lock().unwrap().clone();
        let after_analyze: Vec<_> = sql
            .iter()
            .skip_while(|s| !s.contains("analyze"))
            .skip(1)
            .collect();
        assert_eq!(after_analyze, vec!["unlock tables"]);
    }

    #[tokio::test]
    async fn rename_failure_unlocks_drops_and_removes_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let mut staged = stage_files(dir.path(), &["t1.exp"]);
        // Second staged path points at a file that does not exist, so the
        // rename step fails after the first file went into place.
        staged.push(dir.path().join(format!("t1.ibd{STAGING_SUFFIX}")));
        let rec = recorder(dir.path());
        let (tx, executed, _, rolled_back) = MockTx::new(None);

        let err = apply_table(
            tx,
            "sales",
            "t1",
            TableEngine::InnoDb,
            Some("CREATE TABLE `t1` (id int)"),
            &staged,
            &rec,
        )
        .await
        .unwrap_err();

        assert_eq!(err, ApplyError::Rename("sales.t1".into()));
        assert!(rolled_back.load(Ordering::SeqCst));
        assert_eq!(rec.count().await, 1);

        // No staged file with the suffix survives.
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(!name.to_string_lossy().ends_with(STAGING_SUFFIX));
        }

        let sql = executed.lock().unwrap().clone();
        assert!(sql.iter().any(|s| s.as_str() == "unlock tables"));
        let drops = sql
            .iter()
            .filter(|s| s.as_str() == "drop table if exists `t1`")
            .count();
        assert_eq!(drops, 2);
    }

    #[tokio::test]
    async fn use_failure_aborts_before_any_table_statement() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_files(dir.path(), &["t1.ibd"]);
        let rec = recorder(dir.path());
        let (tx, executed, committed, rolled_back) = MockTx::new(Some("use `sales`"));

        let err = apply_table(
            tx,
            "sales",
            "t1",
            TableEngine::InnoDb,
            Some("CREATE TABLE `t1` (id int)"),
            &staged,
            &rec,
        )
        .await
        .unwrap_err();

        assert_eq!(err, ApplyError::Use("sales.t1".into()));
        assert!(!staged[0].exists());
        assert!(rolled_back.load(Ordering::SeqCst));
        assert!(!committed.load(Ordering::SeqCst));
        assert_eq!(rec.count().await, 1);

        // The machine never reached the table itself: no drop, no create.
        let sql = executed.lock().unwrap().clone();
        assert!(!sql.iter().any(|s| s.contains("drop table")));
        assert!(!sql.iter().any(|s| s.contains("CREATE TABLE")));
    }

    #[tokio::test]
    async fn commit_failure_is_an_error_not_a_restore() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_files(dir.path(), &["t1.ibd"]);
        let rec = recorder(dir.path());
        let (tx, executed, committed, _) = MockTx::failing_commit();

        let err = apply_table(
            tx,
            "sales",
            "t1",
            TableEngine::InnoDb,
            Some("CREATE TABLE `t1` (id int)"),
            &staged,
            &rec,
        )
        .await
        .unwrap_err();

        assert_eq!(err, ApplyError::Commit("sales.t1".into()));
        assert!(!committed.load(Ordering::SeqCst));
        assert_eq!(rec.count().await, 1);

        let log = std::fs::read_to_string(rec.path()).unwrap();
        assert!(log.contains("committing the transaction for sales.t1"));

        // The sequence ran to completion before the commit fell over; the
        // renamed file stays where the engine expects it.
        let sql = executed.lock().unwrap().clone();
        assert_eq!(sql.last().map(String::as_str), Some("unlock tables"));
        assert!(dir.path().join("t1.ibd").exists());
    }

    #[tokio::test]
    async fn myisam_commit_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let staged = stage_files(dir.path(), &["t2.MYD"]);
        let rec = recorder(dir.path());
        let (tx, _, committed, _) = MockTx::failing_commit();

        let err = apply_table(tx, "sales", "t2", TableEngine::MyIsam, None, &staged, &rec)
            .await
            .unwrap_err();

        assert_eq!(err, ApplyError::Commit("sales.t2".into()));
        assert!(!committed.load(Ordering::SeqCst));
        assert_eq!(rec.count().await, 1);
    }

    #[test]
    fn rename_target_strips_the_suffix() {
        let staged = Path::new("/var/lib/mysql/sales/t1.ibd.trite");
        assert_eq!(
            rename_target(staged),
            Path::new("/var/lib/mysql/sales/t1.ibd")
        );
    }
}
