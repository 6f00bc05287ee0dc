use crate::pipeline::extract::Record;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Derives a stable, filesystem-safe output name from a page URL.
///
/// Plain glue, not a contract: the last two path segments joined with an
/// underscore, sanitized, `.json` appended. Enough to keep one durable file
/// per work item without colliding across a site's catalog.
pub fn filename_for_url(url: &str) -> String {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme);

    let segments: Vec<&str> = path
        .split('/')
        .skip(1) // host
        .filter(|segment| !segment.is_empty())
        .collect();

    let tail = match segments.len() {
        0 => "page".to_owned(),
        1 => segments[0].to_owned(),
        n => format!("{}_{}", segments[n - 2], segments[n - 1]),
    };

    let stem = tail.trim_end_matches(".html");
    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut name = sanitized.trim_matches('_').to_owned();
    if name.is_empty() {
        name = "page".to_owned();
    }
    name.truncate(200);
    format!("{name}.json")
}

/// Persists one extracted record to its own file under `output_dir`.
///
/// The write completes before the caller mutates the queue; that ordering is
/// what makes an interrupted run resumable without data loss.
pub async fn write_record(output_dir: &Path, url: &str, record: &Record) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let path = output_dir.join(filename_for_url(url));
    let rendered = serde_json::to_string_pretty(record).context("failed to render the record")?;
    tokio::fs::write(&path, rendered.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(path)
}
