use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};

/// Abort the run on anything but a 200; the server trees are required.
pub fn ensure_ok(status: StatusCode, url: &str) -> Result<()> {
    if status != StatusCode::OK {
        bail!("{} returned from: {}", status.as_u16(), url);
    }
    Ok(())
}

/// Whether a HEAD of the URL answers 200.
pub async fn head_ok(http: &Client, url: &str) -> Result<bool> {
    let resp = http
        .head(url)
        .send()
        .await
        .with_context(|| format!("Problem connecting to {url}"))?;
    Ok(resp.status() == StatusCode::OK)
}

/// GET a URL and return its body, failing on any non-200 response.
pub async fn fetch_text(http: &Client, url: &str) -> Result<String> {
    let resp = http
        .get(url)
        .send()
        .await
        .with_context(|| format!("Problem connecting to {url}"))?;
    ensure_ok(resp.status(), url)?;
    resp.text()
        .await
        .with_context(|| format!("Problem reading response body from {url}"))
}

/// GET a directory listing served by the static file handler and return
/// the entry names it lists.
pub async fn fetch_listing(http: &Client, url: &str) -> Result<Vec<String>> {
    let body = fetch_text(http, url).await?;
    Ok(parse_anchors(&body))
}

/// Extract entry names from a directory-listing page: one anchor per
/// entry, text content is the name, directories carry a trailing slash
/// that is stripped here. This format is part of the wire protocol.
pub fn parse_anchors(body: &str) -> Vec<String> {
    let document = Html::parse_document(body);
    let anchors = Selector::parse("a").expect("static selector");

    document
        .select(&anchors)
        .filter_map(|a| {
            let text: String = a.text().collect();
            // Formatting-only text nodes start with a newline.
            if text.starts_with('\n') {
                return None;
            }
            let name = text.trim_end_matches('/');
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}
