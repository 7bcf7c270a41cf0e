use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

struct ServerState {
    dump: PathBuf,
    backup: PathBuf,
}

/// Serve the object dumps and the prepared backup over HTTP.
pub async fn run(dump_path: &Path, backup_path: &Path, port: u16) -> Result<()> {
    // A prepared backup carries .exp export files; refuse anything else
    // since the client's import protocol depends on them.
    if !backup_prepared(backup_path)? {
        bail!("It appears that --export has not been run on your backups!");
    }

    let state = Arc::new(ServerState {
        dump: dump_path.to_path_buf(),
        backup: backup_path.to_path_buf(),
    });

    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            bail!("ERROR: Port {port} is already in use!");
        }
        Err(err) => return Err(err).context("could not open the listening socket"),
    };

    println!();
    println!("Starting server listening on port {port}");
    tracing::debug!(
        "serving dumps from {} and backups from {}",
        dump_path.display(),
        backup_path.display()
    );

    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/tables/", get(tables_index))
        .route("/tables/*path", get(tables_entry))
        .route("/backups/", get(backups_index))
        .route("/backups/*path", get(backups_entry))
        .route("/gz/", get(gz_index))
        .route("/gz/*path", get(gz_entry))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Landing page linking the two trees.
async fn root() -> Html<&'static str> {
    Html(
        "<html>\n\
         \t<head>\n\
         \t\t<title>TRITE</title>\n\
         \t</head>\n\
         \t<body>\n\
         \t\t<a href=\"/tables\">tables</a>\n\
         \t\t<br>\n\
         \t\t<a href=\"/backups\">backups</a>\n\
         \t</body>\n\
         </html>\n",
    )
}

async fn tables_index(State(state): State<Arc<ServerState>>) -> Response {
    serve_tree(&state.dump, "", false).await
}

async fn tables_entry(
    State(state): State<Arc<ServerState>>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    serve_tree(&state.dump, &path, false).await
}

async fn backups_index(State(state): State<Arc<ServerState>>) -> Response {
    serve_tree(&state.backup, "", false).await
}

async fn backups_entry(
    State(state): State<Arc<ServerState>>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    serve_tree(&state.backup, &path, false).await
}

async fn gz_index(State(state): State<Arc<ServerState>>) -> Response {
    serve_tree(&state.backup, "", true).await
}

async fn gz_entry(
    State(state): State<Arc<ServerState>>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    serve_tree(&state.backup, &path, true).await
}

/// Serve one entry of a tree: directories render an anchor-per-entry
/// listing, files stream back with an accurate Content-Length.
async fn serve_tree(root: &Path, rel: &str, gzip: bool) -> Response {
    let Some(full) = resolve(root, rel) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(meta) = tokio::fs::metadata(&full).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if meta.is_dir() {
        match render_listing(&full).await {
            Ok(html) => Html(html).into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    } else if gzip {
        serve_file_gzip(&full).await
    } else {
        serve_file(&full, meta.len()).await
    }
}

/// Join a request path onto a tree root, refusing anything that would
/// escape it.
pub fn resolve(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut full = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => full.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(full)
}

async fn render_listing(dir: &Path) -> Result<String> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().await?.is_dir();
        entries.push((name, is_dir));
    }
    entries.sort();

    Ok(listing_html(&entries))
}

/// Directory listing wire format: one anchor per entry, text content is
/// the entry name, directories suffixed with a slash. The client's anchor
/// parser depends on this shape.
pub fn listing_html(entries: &[(String, bool)]) -> String {
    let mut out = String::from("<pre>\n");
    for (name, is_dir) in entries {
        let display = if *is_dir {
            format!("{name}/")
        } else {
            name.clone()
        };
        let escaped = escape_html(&display);
        out.push_str(&format!("<a href=\"{escaped}\">{escaped}</a>\n"));
    }
    out.push_str("</pre>\n");
    out
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn serve_file(path: &Path, len: u64) -> Response {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let body = Body::from_stream(ReaderStream::new(file));
    match Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .body(body)
    {
        Ok(resp) => resp,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Convenience tree serving backup files gzip-compressed.
async fn serve_file_gzip(path: &Path) -> Response {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let compressed = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&bytes)?;
        encoder.finish()
    })
    .await;

    let bytes = match compressed {
        Ok(Ok(bytes)) => bytes,
        _ => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    match Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_ENCODING, "gzip")
        .header(header::CONTENT_LENGTH, bytes.len())
        .body(Body::from(bytes))
    {
        Ok(resp) => resp,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Walk the backup directory for the .exp files that prove --export ran.
pub fn backup_prepared(dir: &Path) -> Result<bool> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("could not read backup directory {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            if backup_prepared(&path)? {
                return Ok(true);
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some("exp") {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fetch::parse_anchors;

    #[test]
    fn prepared_backup_is_detected_in_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let schema = dir.path().join("sales");
        std::fs::create_dir(&schema).unwrap();
        std::fs::write(schema.join("t1.ibd"), b"pages").unwrap();
        assert!(!backup_prepared(dir.path()).unwrap());

        std::fs::write(schema.join("t1.exp"), b"export metadata").unwrap();
        assert!(backup_prepared(dir.path()).unwrap());
    }

    #[test]
    fn missing_backup_directory_errors() {
        assert!(backup_prepared(Path::new("/nonexistent/backup")).is_err());
    }

    #[test]
    fn traversal_components_are_rejected() {
        let root = Path::new("/srv/dump");
        assert_eq!(
            resolve(root, "sales/tables/t1.sql"),
            Some(PathBuf::from("/srv/dump/sales/tables/t1.sql"))
        );
        assert!(resolve(root, "../etc/passwd").is_none());
        assert!(resolve(root, "sales/../../etc/passwd").is_none());
        assert!(resolve(root, "/etc/passwd").is_none());
    }

    #[test]
    fn listing_round_trips_through_the_client_parser() {
        let entries = vec![
            ("archive".to_string(), true),
            ("orders.sql".to_string(), false),
            ("sales".to_string(), true),
        ];
        let html = listing_html(&entries);

        // One anchor per entry, directories suffixed with a slash.
        assert!(html.contains("<a href=\"archive/\">archive/</a>"));
        assert!(html.contains("<a href=\"orders.sql\">orders.sql</a>"));

        // The client's parser reads back exactly the entry names.
        assert_eq!(parse_anchors(&html), vec!["archive", "orders.sql", "sales"]);
    }

    #[test]
    fn names_are_html_escaped() {
        let entries = vec![("a&b.sql".to_string(), false)];
        let html = listing_html(&entries);
        assert!(html.contains("a&amp;b.sql"));
        assert_eq!(parse_anchors(&html), vec!["a&b.sql"]);
    }

    #[tokio::test]
    async fn listings_are_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.sql"), b"x").unwrap();
        std::fs::write(dir.path().join("a.sql"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("tables")).unwrap();

        let html = render_listing(dir.path()).await.unwrap();
        assert_eq!(parse_anchors(&html), vec!["a.sql", "b.sql", "tables"]);
    }
}
