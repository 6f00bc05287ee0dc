use crate::fetch::client::FetchResponse;

/// How one fetch attempt should be treated by the retry driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    RateLimited,
    Failed { message: String },
}

/// Substrings that identify throttling in error text or page bodies.
const RATE_LIMIT_MARKERS: &[&str] = &["429", "too many"];

/// Body markers of an error shell served with a 200 status.
const ERROR_PAGE_MARKERS: &[&str] = &[
    "404 error",
    "page not found",
    "the page you are looking for",
    "this page doesn't exist",
    "error 404",
    "http 404",
    "404 - not found",
];

/// Maps a raw fetch response onto the retry driver's decision space.
///
/// A throttling response is recognized by status 429 or by rate-limit
/// wording in the error text; an apparently successful response is demoted
/// to a failure when the body is an error shell.
pub fn classify(response: &FetchResponse) -> FetchOutcome {
    if response.status_code == Some(429) {
        return FetchOutcome::RateLimited;
    }

    if !response.success {
        let message = response
            .error_message
            .clone()
            .unwrap_or_else(|| "fetch failed without detail".to_owned());
        if contains_any(&message, RATE_LIMIT_MARKERS) {
            return FetchOutcome::RateLimited;
        }
        return FetchOutcome::Failed { message };
    }

    if is_error_page(&response.html, response.status_code) {
        return FetchOutcome::Failed {
            message: "target served an error page".to_owned(),
        };
    }

    FetchOutcome::Success
}

/// Whether a failure message reads as throttling once the driver gets to
/// reconsider it. Broader than [`classify`]'s in-band markers: explicit
/// "rate limit" wording also counts here.
pub fn is_rate_limit_message(message: &str) -> bool {
    contains_any(message, RATE_LIMIT_MARKERS) || contains_any(message, &["rate limit"])
}

/// Detects error pages: any reported status at or above 400, or a nominal
/// 200 whose title or body carries known not-found markers.
pub fn is_error_page(html: &str, status_code: Option<u16>) -> bool {
    if let Some(status) = status_code {
        if status >= 400 {
            return true;
        }
    }

    if html.is_empty() {
        return false;
    }

    let lowered = html.to_lowercase();

    if let Some(title) = title_text(&lowered) {
        if title.contains("404") || title.contains("not found") {
            return true;
        }
    }

    ERROR_PAGE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    markers.iter().any(|marker| lowered.contains(marker))
}

/// Pulls the `<title>` contents out of an already-lowercased document.
fn title_text(lowered_html: &str) -> Option<&str> {
    let start = lowered_html.find("<title")?;
    let open_end = lowered_html[start..].find('>')? + start + 1;
    let close = lowered_html[open_end..].find("</title>")? + open_end;
    Some(lowered_html[open_end..close].trim())
}
