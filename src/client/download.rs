use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::apply::{apply_task, TableEngine};
use super::display::Status;
use super::fetch;
use super::progress::Progress;
use super::{ClientCtx, TableJob, STAGING_SUFFIX};

/// Staged files carry the data-directory owner and MySQL's file mode.
const MYSQL_FILE_MODE: u32 = 0o660;

/// Result of probing the backup for a table's characteristic file. Only
/// the two supported engines ever cross into the apply engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    InnoDb,
    MyIsam,
    Unsupported,
}

/// Worker loop: pull table jobs off the shared channel until it drains,
/// forwarding each spawned apply task's handle for the apply-phase wait.
pub async fn run_worker(
    ctx: Arc<ClientCtx>,
    jobs: Arc<Mutex<UnboundedReceiver<TableJob>>>,
    handles: UnboundedSender<JoinHandle<()>>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else { break };

        if let Some(handle) = download_table(&ctx, job).await {
            let _ = handles.send(handle);
        }
    }
}

/// File extensions to transfer for an engine. Servers in the 5.1/5.5 band
/// need the `.exp` export metadata alongside the tablespace.
pub fn extensions_for(engine: EngineKind, legacy_exp: bool) -> Vec<&'static str> {
    match engine {
        EngineKind::InnoDb => {
            if legacy_exp {
                vec![".exp", ".ibd"]
            } else {
                vec![".ibd"]
            }
        }
        EngineKind::MyIsam => vec![".MYI", ".MYD", ".frm"],
        EngineKind::Unsupported => Vec::new(),
    }
}

/// Path of a staged download in the data directory.
pub fn staged_path(datadir: &Path, schema_file: &str, table_file: &str, ext: &str) -> PathBuf {
    datadir
        .join(schema_file)
        .join(format!("{table_file}{ext}{STAGING_SUFFIX}"))
}

fn print_missing_file(what: &str, table: &str) {
    println!();
    println!("!!!!!!!!!!!!!!!!!!!!");
    println!("The {what} file is missing for table {table}");
    println!("Skipping ...");
    println!("!!!!!!!!!!!!!!!!!!!!");
    println!();
}

/// Download one table's file set into the data directory under staging
/// names, then hand it to the apply engine. Returns the apply task handle,
/// or None when the table was skipped or failed during download.
async fn download_table(ctx: &Arc<ClientCtx>, job: TableJob) -> Option<JoinHandle<()>> {
    ctx.send_status(&job, Status::Downloading);

    let schema_file = job.schema_filename().to_string();
    let table_file = job.table_filename().to_string();

    // Probe the backup for the engine's characteristic file.
    let ibd_url = format!("{}{}/{}.ibd", ctx.backurl, schema_file, table_file);
    let myd_url = format!("{}{}/{}.MYD", ctx.backurl, schema_file, table_file);

    let kind = if head_probe(ctx, &ibd_url).await {
        EngineKind::InnoDb
    } else if head_probe(ctx, &myd_url).await {
        EngineKind::MyIsam
    } else {
        EngineKind::Unsupported
    };

    let engine = match kind {
        EngineKind::InnoDb => TableEngine::InnoDb,
        EngineKind::MyIsam => TableEngine::MyIsam,
        EngineKind::Unsupported => {
            print_missing_file(".ibd or .MYD", &job.table);
            return None;
        }
    };

    let extensions = extensions_for(kind, ctx.legacy_exp());

    let mut staged: Vec<PathBuf> = Vec::new();
    for ext in extensions {
        let url = format!("{}{}/{}{}", ctx.backurl, schema_file, table_file, ext);

        // XtraBackup has been seen to miss a table's .exp; confirm before
        // staging anything else for the table.
        if ext == ".exp" && !head_probe(ctx, &url).await {
            print_missing_file(".exp", &job.table);
            remove_staged(&staged);
            return None;
        }

        let path = staged_path(&ctx.datadir, &schema_file, &table_file, ext);
        match stream_to_staged(ctx, &job, &path, &url, ext).await {
            Ok(()) => staged.push(path),
            Err(err) => {
                staged.push(path);
                remove_staged(&staged);
                println!();
                println!("{err}");

                let _ = ctx
                    .recorder
                    .record(
                        &format!(
                            "There was an error downloading {}.{}: {err}",
                            job.schema, job.table
                        ),
                        None,
                        &[],
                    )
                    .await;
                ctx.send_status(&job, Status::Error);
                return None;
            }
        }
    }

    // Apply runs on its own task so this worker can start the next download.
    Some(tokio::spawn(apply_task(ctx.clone(), job, engine, staged)))
}

async fn head_probe(ctx: &Arc<ClientCtx>, url: &str) -> bool {
    match fetch::head_ok(&ctx.http, url).await {
        Ok(found) => found,
        Err(err) => {
            tracing::warn!("probe failed: {err}");
            false
        }
    }
}

fn remove_staged(staged: &[PathBuf]) {
    for file in staged {
        let _ = std::fs::remove_file(file);
    }
}

/// Stream one backup file into its staging path and verify the size the
/// server advertised.
async fn stream_to_staged(
    ctx: &Arc<ClientCtx>,
    job: &TableJob,
    path: &Path,
    url: &str,
    ext: &str,
) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(MYSQL_FILE_MODE)
        .open(path)
        .await?;

    // Owned like the data directory so the engine can take the file over.
    let _ = std::os::unix::fs::chown(path, Some(ctx.uid), Some(ctx.gid));

    let resp = ctx.http.get(url).send().await?;
    fetch::ensure_ok(resp.status(), url)?;
    let size_server = resp.content_length().map(|n| n as i64).unwrap_or(-1);

    let mut progress = (ext != ".exp" && size_server > ctx.progress_limit as i64).then(|| {
        Progress::new(&job.fq(), size_server, ctx.focused.clone(), std::io::stdout())
    });

    let mut writer = tokio::io::BufWriter::new(file);
    let mut stream = resp.bytes_stream();
    let mut written: i64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as i64;
        if let Some(p) = progress.as_mut() {
            let _ = p.observe(chunk.len());
        }
    }
    writer.flush().await?;

    if let Some(p) = progress.as_mut() {
        let _ = p.finish();
    }

    if written != size_server {
        bail!(
            "File download size does not match size on server! {} has been removed.",
            path.display()
        );
    }

    Ok(())
}
