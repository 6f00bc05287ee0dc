/// Structured record extracted from one rendered page.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Extraction seam for page-specific field mapping.
///
/// The heuristics behind this trait are bespoke and site-coupled, so they
/// live outside the pipeline. Extraction is infallible by contract: missing
/// or malformed page sections yield partial or empty records, never errors;
/// a thin record is still worth persisting.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, html: &str) -> Record;
}

impl<F> PageExtractor for F
where
    F: Fn(&str) -> Record + Send + Sync,
{
    fn extract(&self, html: &str) -> Record {
        self(html)
    }
}
