// HTTP client construction. Every upstream request gets a fresh client so
// that the proxy chosen for that request is the one actually used.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy};
use std::time::Duration;

/// Chrome-on-Windows fingerprint for endpoints behind anti-automation
/// challenges. The credential issuer rejects default client fingerprints.
static BROWSER_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let pairs: &[(&str, &str)] = &[
        (
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,\
             image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
        ),
        ("accept-language", "ru"),
        ("cache-control", "no-cache"),
        ("pragma", "no-cache"),
        ("priority", "u=0, i"),
        ("upgrade-insecure-requests", "1"),
        (
            "sec-ch-ua",
            "\"Google Chrome\";v=\"143\", \"Chromium\";v=\"143\", \"Not:A-Brand\";v=\"24\"",
        ),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", "\"Windows\""),
        ("sec-fetch-dest", "document"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-site", "none"),
        ("sec-fetch-user", "?1"),
        (
            "user-agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36",
        ),
    ];
    let mut headers = HeaderMap::new();
    for &(name, value) in pairs {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(value).expect("static header value"),
        );
    }
    headers
});

/// Build a JSON-API client bound to the given proxy URL (if any).
pub fn proxied_client(proxy_url: Option<&str>, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder().timeout(timeout).gzip(true);
    if let Some(url) = proxy_url {
        builder = builder.proxy(Proxy::all(url)?);
    }
    Ok(builder.build()?)
}

/// A client able to pass the anti-automation challenge protecting the
/// gasless-router credential endpoint. Pluggable so tests (and other
/// ecosystems' solvers) can substitute their own.
#[async_trait]
pub trait ChallengeSolvingClient: Send + Sync {
    /// GET the URL through the given proxy and return (status, body).
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        proxy_url: Option<&str>,
        timeout: Duration,
    ) -> Result<(u16, String)>;
}

/// Default solver: a reqwest client carrying a full Chrome fingerprint.
#[derive(Debug, Default)]
pub struct BrowserImpersonationClient;

#[async_trait]
impl ChallengeSolvingClient for BrowserImpersonationClient {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        proxy_url: Option<&str>,
        timeout: Duration,
    ) -> Result<(u16, String)> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .default_headers(BROWSER_HEADERS.clone())
            .gzip(true);
        if let Some(proxy) = proxy_url {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        let client = builder.build()?;

        let mut request = client.get(url).query(query);
        for (name, value) in extra_headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, body))
    }
}
