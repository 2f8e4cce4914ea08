use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tks_core::{ListingItem, Vacancy, VacancyId};
use tracing::{debug, info, warn};

use crate::{ListingBatch, RetrievalError, VacancySource};

/// Sequential scan over listing pages starting at page 0. Ends at the first
/// empty page or the first error and cannot be resumed afterwards.
pub struct Paginator<'a> {
    source: &'a dyn VacancySource,
    next_page: u32,
    exhausted: bool,
    pages_requested: u32,
}

impl<'a> Paginator<'a> {
    pub fn new(source: &'a dyn VacancySource) -> Self {
        Self {
            source,
            next_page: 0,
            exhausted: false,
            pages_requested: 0,
        }
    }

    pub async fn next_batch(&mut self) -> Result<Option<ListingBatch>, RetrievalError> {
        if self.exhausted {
            return Ok(None);
        }

        self.pages_requested += 1;
        let batch = match self.source.fetch_page(self.next_page).await {
            Ok(batch) => batch,
            Err(err) => {
                self.exhausted = true;
                return Err(err);
            }
        };

        if batch.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        self.next_page += 1;
        Ok(Some(batch))
    }

    pub fn pages_requested(&self) -> u32 {
        self.pages_requested
    }
}

#[derive(Debug, Clone)]
pub struct ListingCrawl {
    pub items: Vec<ListingItem>,
    pub pages_requested: u32,
    pub duplicates: usize,
}

/// Drains every listing page. Items repeated across pages keep their first
/// occurrence.
pub async fn crawl_listings(source: &dyn VacancySource) -> Result<ListingCrawl, RetrievalError> {
    let page_delay = source.pacing().page_delay;
    let mut pager = Paginator::new(source);
    let mut seen: HashSet<VacancyId> = HashSet::new();
    let mut items = Vec::new();
    let mut duplicates = 0;

    while let Some(batch) = pager.next_batch().await? {
        debug!(page = pager.pages_requested() - 1, items = batch.len(), "listing page");
        for item in batch {
            if seen.insert(item.id.clone()) {
                items.push(item);
            } else {
                duplicates += 1;
            }
        }
        if !page_delay.is_zero() {
            tokio::time::sleep(page_delay).await;
        }
    }

    info!(
        source = %source.kind(),
        pages = pager.pages_requested(),
        items = items.len(),
        duplicates,
        "listing crawl finished"
    );
    Ok(ListingCrawl {
        items,
        pages_requested: pager.pages_requested(),
        duplicates,
    })
}

/// Upstream request ceiling for detail fetches: after every `every` requests
/// the loop sleeps for `pause`. The counter is shared by the whole loop, so
/// detail fetches must stay sequential.
#[derive(Debug, Clone)]
pub struct DetailCooldown {
    every: usize,
    pause: Duration,
    requests: usize,
    pauses: usize,
}

impl Default for DetailCooldown {
    fn default() -> Self {
        Self::new(119, Duration::from_secs(60))
    }
}

impl DetailCooldown {
    pub fn new(every: usize, pause: Duration) -> Self {
        Self {
            every: every.max(1),
            pause,
            requests: 0,
            pauses: 0,
        }
    }

    /// Count one finished detail request and sleep when a window closes.
    pub async fn record_request(&mut self) {
        self.requests += 1;
        if self.requests % self.every == 0 {
            info!(
                requests = self.requests,
                pause_secs = self.pause.as_secs_f64(),
                "detail request window reached, cooling down"
            );
            tokio::time::sleep(self.pause).await;
            self.pauses += 1;
        }
    }

    pub fn requests(&self) -> usize {
        self.requests
    }

    pub fn pauses(&self) -> usize {
        self.pauses
    }
}

/// What to do when one vacancy's detail request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailFailurePolicy {
    /// Fail the whole crawl on the first error.
    #[default]
    Abort,
    /// Log the error, leave the vacancy out, carry on.
    Skip,
}

impl fmt::Display for DetailFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => f.write_str("abort"),
            Self::Skip => f.write_str("skip"),
        }
    }
}

impl FromStr for DetailFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(format!(
                "unknown detail failure policy {other:?} (expected abort or skip)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDetail {
    pub vacancy_id: VacancyId,
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct DetailCrawl {
    pub vacancies: Vec<Vacancy>,
    pub skipped: Vec<SkippedDetail>,
}

/// Second round trip per vacancy: fills description and key skills.
pub async fn fetch_details(
    source: &dyn VacancySource,
    items: Vec<ListingItem>,
    cooldown: &mut DetailCooldown,
    policy: DetailFailurePolicy,
) -> Result<DetailCrawl, RetrievalError> {
    let detail_delay = source.pacing().detail_delay;
    let mut vacancies = Vec::with_capacity(items.len());
    let mut skipped = Vec::new();

    for item in items {
        let result = source.fetch_detail(&item).await;
        cooldown.record_request().await;

        match result {
            Ok(detail) => vacancies.push(Vacancy::from(item).with_detail(detail)),
            Err(err) => match policy {
                DetailFailurePolicy::Abort => return Err(err),
                DetailFailurePolicy::Skip => {
                    warn!(vacancy_id = %item.id, error = %err, "skipping vacancy after failed detail fetch");
                    skipped.push(SkippedDetail {
                        vacancy_id: item.id,
                        url: err.url().to_string(),
                        error: err.to_string(),
                    });
                }
            },
        }

        if !detail_delay.is_zero() {
            tokio::time::sleep(detail_delay).await;
        }
    }

    Ok(DetailCrawl { vacancies, skipped })
}
