//! Vacancy source contracts, hh.ru adapters, crawl loop and record cleaning.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tks_core::{ListingItem, VacancyDetail};
use tks_storage::{FetchError, HttpFetcher};

mod crawl;
mod extract;
mod transform;

pub use crawl::{
    crawl_listings, fetch_details, DetailCooldown, DetailCrawl, DetailFailurePolicy, ListingCrawl,
    Paginator, SkippedDetail,
};
pub use extract::{parse_api_detail, parse_api_listing, parse_html_detail, parse_html_listing};
pub use transform::{clean, split_skills, CleanBatch};

pub const CRATE_NAME: &str = "tks-adapters";

/// Id of the `<template>` element carrying the search page's initial state.
pub const HTML_STATE_TEMPLATE_ID: &str = "HH-Lux-InitialState";

pub type ListingBatch = Vec<ListingItem>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Html,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api => f.write_str("api"),
            Self::Html => f.write_str("html"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "html" => Ok(Self::Html),
            other => Err(format!("unknown source mode {other:?} (expected api or html)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("http status {status} for {url}")]
    Http { url: String, status: u16 },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("malformed payload from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

impl RetrievalError {
    pub fn url(&self) -> &str {
        match self {
            Self::Http { url, .. } | Self::Request { url, .. } | Self::Malformed { url, .. } => url,
        }
    }

    pub(crate) fn malformed(url: &str, reason: impl fmt::Display) -> Self {
        Self::Malformed {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<FetchError> for RetrievalError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, url } => Self::Http { url, status },
            other => Self::Request {
                url: other.url().to_string(),
                source: other,
            },
        }
    }
}

/// Delays between requests, on top of the detail cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrawlPacing {
    pub page_delay: Duration,
    pub detail_delay: Duration,
}

/// Fixed search parameters sent with every listing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default = "default_search_field")]
    pub search_field: String,
}

fn default_search_field() -> String {
    "name".to_string()
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: "middle python developer".to_string(),
            search_field: default_search_field(),
        }
    }
}

impl SearchQuery {
    fn to_pairs(&self, page: u32) -> Vec<(String, String)> {
        vec![
            ("text".to_string(), self.text.clone()),
            ("search_field".to_string(), self.search_field.clone()),
            ("page".to_string(), page.to_string()),
        ]
    }
}

/// A paginated job-listing service with a per-item detail endpoint.
#[async_trait]
pub trait VacancySource: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn pacing(&self) -> CrawlPacing {
        CrawlPacing::default()
    }

    /// One request for listing page `page`. An empty batch ends pagination.
    async fn fetch_page(&self, page: u32) -> Result<ListingBatch, RetrievalError>;

    /// One request for the item's detail payload.
    async fn fetch_detail(&self, item: &ListingItem) -> Result<VacancyDetail, RetrievalError>;
}

/// hh.ru public JSON API.
#[derive(Debug, Clone)]
pub struct HhApiSource {
    http: Arc<HttpFetcher>,
    listing_url: String,
    query: SearchQuery,
}

impl HhApiSource {
    pub fn new(http: Arc<HttpFetcher>, listing_url: impl Into<String>, query: SearchQuery) -> Self {
        Self {
            http,
            listing_url: listing_url.into(),
            query,
        }
    }
}

#[async_trait]
impl VacancySource for HhApiSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn fetch_page(&self, page: u32) -> Result<ListingBatch, RetrievalError> {
        let resp = self
            .http
            .get(&self.listing_url, &self.query.to_pairs(page))
            .await?;
        parse_api_listing(&resp.text(), &resp.final_url)
    }

    async fn fetch_detail(&self, item: &ListingItem) -> Result<VacancyDetail, RetrievalError> {
        let resp = self.http.get(&item.detail_url, &[]).await?;
        parse_api_detail(&resp.text(), &resp.final_url)
    }
}

/// hh.ru search pages, reading the JSON state embedded in the markup.
#[derive(Debug, Clone)]
pub struct HhHtmlSource {
    http: Arc<HttpFetcher>,
    listing_url: String,
    query: SearchQuery,
    pacing: CrawlPacing,
}

impl HhHtmlSource {
    pub fn new(http: Arc<HttpFetcher>, listing_url: impl Into<String>, query: SearchQuery) -> Self {
        Self {
            http,
            listing_url: listing_url.into(),
            query,
            pacing: CrawlPacing {
                page_delay: Duration::from_secs(1),
                detail_delay: Duration::from_millis(500),
            },
        }
    }

    pub fn with_pacing(mut self, pacing: CrawlPacing) -> Self {
        self.pacing = pacing;
        self
    }
}

#[async_trait]
impl VacancySource for HhHtmlSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Html
    }

    fn pacing(&self) -> CrawlPacing {
        self.pacing
    }

    async fn fetch_page(&self, page: u32) -> Result<ListingBatch, RetrievalError> {
        let resp = self
            .http
            .get(&self.listing_url, &self.query.to_pairs(page))
            .await?;
        parse_html_listing(&resp.text(), &resp.final_url)
    }

    async fn fetch_detail(&self, item: &ListingItem) -> Result<VacancyDetail, RetrievalError> {
        let resp = self.http.get(&item.detail_url, &[]).await?;
        parse_html_detail(&resp.text(), &resp.final_url)
    }
}
