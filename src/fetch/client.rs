use crate::runtime::config::{HaulConfig, JitterWindow};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::time::sleep;

/// Result of one page fetch, reported in-band.
///
/// The fetcher never errors at the call boundary; transport failures show up
/// as `success = false` with a message, HTTP-level rejections carry their
/// status code. Classification of these fields into retry decisions lives in
/// [`crate::fetch::classify`].
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub html: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

/// Transport seam for rendered-page retrieval.
///
/// The real engine behind this trait is out of scope here; anything that can
/// produce a [`FetchResponse`] for a URL can drive the pipeline, which is
/// also how the tests script fetch outcomes.
pub trait PageFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, FetchResponse>;
}

/// Browser-profile headers sent with every request so traffic blends in with
/// ordinary desktop browsing.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    (
        "User-Agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
         Chrome/120.0.0.0 Safari/537.36",
    ),
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,\
         image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
    ),
    ("Accept-Language", "pl-PL,pl;q=0.9,en-US;q=0.8,en;q=0.7"),
    ("DNT", "1"),
    ("Connection", "keep-alive"),
    ("Upgrade-Insecure-Requests", "1"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Sec-Fetch-User", "?1"),
    ("Cache-Control", "max-age=0"),
];

/// Default [`PageFetcher`] over plain HTTP.
///
/// Applies a jittered render delay after the response arrives and a short
/// post-fetch pause before returning, mimicking a reader rather than a
/// polling loop.
pub struct HttpPageFetcher {
    client: reqwest::Client,
    render_delay: JitterWindow,
    post_fetch_pause: JitterWindow,
}

impl HttpPageFetcher {
    pub fn new(config: &HaulConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in BROWSER_HEADERS {
            headers.insert(
                *name,
                HeaderValue::from_str(value).context("invalid browser profile header")?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.fetch_timeout())
            .build()
            .context("failed to build the HTTP client")?;

        Ok(Self {
            client,
            render_delay: config.render_delay(),
            post_fetch_pause: config.post_fetch_pause(),
        })
    }

    async fn fetch_inner(&self, url: &str) -> FetchResponse {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                return FetchResponse {
                    html: String::new(),
                    success: false,
                    status_code: err.status().map(|status| status.as_u16()),
                    error_message: Some(err.to_string()),
                };
            }
        };

        let status = response.status();

        // Let late-loading page content settle before reading the body.
        sleep(self.render_delay.sample()).await;

        let html = match response.text().await {
            Ok(html) => html,
            Err(err) => {
                return FetchResponse {
                    html: String::new(),
                    success: false,
                    status_code: Some(status.as_u16()),
                    error_message: Some(err.to_string()),
                };
            }
        };

        sleep(self.post_fetch_pause.sample()).await;

        FetchResponse {
            html,
            success: status.is_success(),
            status_code: Some(status.as_u16()),
            error_message: if status.is_success() {
                None
            } else {
                Some(format!("server answered {status}"))
            },
        }
    }
}

impl PageFetcher for HttpPageFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, FetchResponse> {
        Box::pin(self.fetch_inner(url))
    }
}
