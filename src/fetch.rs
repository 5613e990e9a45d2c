//! HTTP fetch for sub-scrapes with an origin allowlist.
//!
//! Security model:
//! - Only URLs matching allowed origins can be fetched (an empty list allows all)
//! - Redirects only followed if they stay within the same origin
//! - Non-success responses are errors, surfaced to the script as `{ error }`

use crate::runtime::FetchFn;
use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use reqwest::header::{LOCATION, USER_AGENT};
use std::sync::Arc;
use url::Url;

const MAX_REDIRECTS: usize = 10;

/// Configuration for fetch allowlist
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://shop.example.com")
    /// An origin is scheme + host + port. Empty means any origin.
    pub allowed_origins: Vec<String>,
    /// Sent as the User-Agent header when set
    pub user_agent: Option<String>,
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| {
            // Exact origin match
            origin == *allowed
        })
    }
}

/// Blocking fetcher backing `scrape(url, callback)`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            // Don't follow redirects automatically - we'll handle them manually
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client, config })
    }

    /// GET `url` and return the body text.
    pub fn fetch(&self, url: &str) -> Result<String> {
        let url = Url::parse(url).map_err(|e| anyhow!("Invalid URL '{}': {}", url, e))?;

        if !self.config.is_origin_allowed(&url) {
            return Err(anyhow!(
                "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
                url.origin().ascii_serialization(),
                self.config.allowed_origins
            ));
        }

        let mut current = url.clone();
        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(current.clone());
            if let Some(agent) = &self.config.user_agent {
                request = request.header(USER_AGENT, agent);
            }
            let response = request
                .send()
                .map_err(|e| anyhow!("Fetch failed: {}", e))?;
            let status = response.status();

            // Handle redirects manually - only allow same-origin
            if status.is_redirection() {
                let Some(location) = response.headers().get(LOCATION) else {
                    return Err(anyhow!("Fetch failed: {} without a location", status));
                };
                let location = location
                    .to_str()
                    .map_err(|_| anyhow!("Invalid redirect location"))?;
                let next = current
                    .join(location)
                    .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

                if next.origin() != url.origin() {
                    return Err(anyhow!(
                        "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                        next.origin().ascii_serialization(),
                        url.origin().ascii_serialization()
                    ));
                }
                tracing::debug!(from = %current, to = %next, "following redirect");
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(anyhow!("Fetch failed: {} for {}", status, current));
            }

            return response
                .text()
                .map_err(|e| anyhow!("Failed to read response body: {}", e));
        }

        Err(anyhow!(
            "Fetch failed: more than {} redirects for {}",
            MAX_REDIRECTS,
            url
        ))
    }

    /// Adapt into the fetch collaborator of [`crate::ScrapeParams`].
    pub fn into_fetch_fn(self) -> FetchFn {
        Arc::new(move |url: &str| self.fetch(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let config = FetchConfig {
            allowed_origins: vec![
                "https://shop.example.com".to_string(),
                "http://localhost:3000".to_string(),
            ],
            ..Default::default()
        };

        // Allowed
        assert!(config.is_origin_allowed(&Url::parse("https://shop.example.com/items").unwrap()));
        assert!(config.is_origin_allowed(&Url::parse("https://shop.example.com/").unwrap()));
        assert!(config.is_origin_allowed(&Url::parse("http://localhost:3000/p2").unwrap()));

        // Not allowed
        assert!(!config.is_origin_allowed(&Url::parse("https://evil.com/p2").unwrap()));
        assert!(!config.is_origin_allowed(&Url::parse("http://shop.example.com/items").unwrap())); // http vs https
        assert!(!config.is_origin_allowed(&Url::parse("https://shop.example.com:8080/").unwrap())); // different port
    }

    #[test]
    fn test_empty_allowlist_allows_everything() {
        let config = FetchConfig::default();
        assert!(config.is_origin_allowed(&Url::parse("https://anything.com").unwrap()));
    }

    #[test]
    fn test_blocked_origin_fails_before_any_request() {
        let fetcher = HttpFetcher::new(FetchConfig {
            allowed_origins: vec!["https://shop.example.com".to_string()],
            ..Default::default()
        })
        .unwrap();
        let err = fetcher.fetch("https://evil.com/p2").unwrap_err();
        assert!(err.to_string().starts_with("Fetch blocked"), "{}", err);

        let err = fetcher.fetch("not a url").unwrap_err();
        assert!(err.to_string().starts_with("Invalid URL"), "{}", err);
    }
}
