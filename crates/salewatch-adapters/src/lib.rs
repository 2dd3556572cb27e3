//! Record extraction from CivilView sales listings, live over HTTP or from fixture pages.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use salewatch_core::{fields, normalize_text, GroupSource, Record};
use salewatch_storage::{BackoffPolicy, FetchError, HttpFetcher, RetryDisposition};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "salewatch-adapters";

pub const DEFAULT_BASE_URL: &str = "https://salesweb.civilview.com/";

const LISTING_TABLE: &str = "table.table.table-striped";
const LISTING_ROWS: &str = "table.table.table-striped tbody tr";
const NO_SALES_MARKERS: &str = ".no-sales, #noData";
const DETAILS_LINK: &str = "td.hidden-print a";
const DETAIL_LIST: &str = ".sale-details-list";
const DETAIL_ITEMS: &str = ".sale-details-list .sale-detail-item";
const DETAIL_LABEL: &str = ".sale-detail-label";
const DETAIL_VALUE: &str = ".sale-detail-value";

const JUDGMENT_LABELS: [&str; 4] = [
    "Approx. Judgment",
    "Approx. Upset",
    "Approximate Judgment",
    "Approx Judgment",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed page {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{group}: giving up after {attempts} attempt(s): {last}")]
    Exhausted {
        group: String,
        attempts: usize,
        #[source]
        last: Box<ExtractError>,
    },
}

impl ExtractError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractError::Fetch(err) => err.disposition() == RetryDisposition::Retryable,
            // A half-rendered page usually comes back whole on the next try.
            ExtractError::Malformed { .. } => true,
            ExtractError::Selector(_)
            | ExtractError::Fixture { .. }
            | ExtractError::Exhausted { .. } => false,
        }
    }
}

/// Produces one county's listings. Either the whole batch or an error; never a partial batch.
#[async_trait]
pub trait RecordExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, group: &GroupSource) -> Result<Vec<Record>, ExtractError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub url: String,
    pub body: String,
}

/// Where listing and detail pages come from.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn listing_url(&self, group: &GroupSource) -> Url;

    async fn listing_page(&self, group: &GroupSource) -> Result<Page, ExtractError>;

    async fn detail_page(
        &self,
        group: &GroupSource,
        url: &str,
        property_id: &str,
    ) -> Result<Page, ExtractError>;
}

pub fn listing_url(base: &Url, group_id: &str) -> Url {
    let mut url = base.join("Sales/SalesSearch").unwrap_or_else(|_| base.clone());
    url.query_pairs_mut().append_pair("countyId", group_id);
    url
}

pub fn property_id_from_href(href: &str, page_url: &Url) -> String {
    page_url
        .join(href)
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "PropertyId")
                .map(|(_, value)| value.trim().to_string())
        })
        .unwrap_or_default()
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(format!("{css}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    normalize_text(&element.text().collect::<Vec<_>>().join(" "))
}

/// One row of the county sales table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingRow {
    pub property_id: String,
    pub details_url: Option<String>,
    pub sales_date: String,
    pub defendant: String,
    pub address: String,
    pub approx_judgment: String,
    pub sale_type: Option<String>,
}

impl ListingRow {
    /// Fold labelled detail-page values into the row.
    pub fn apply_details(&mut self, items: &[DetailItem]) {
        for item in items {
            let label = item.label.as_str();
            if label.contains("Address") {
                if self.address.is_empty() || item.value.len() > self.address.len() {
                    self.address = item.value.clone();
                }
            } else if JUDGMENT_LABELS.iter().any(|known| label.contains(known)) {
                self.approx_judgment = item.value.clone();
            } else if label.contains("Defendant") {
                if self.defendant.is_empty() {
                    self.defendant = item.value.clone();
                }
            } else if label.contains("Sale Date") {
                if self.sales_date.is_empty() {
                    self.sales_date = item.value.clone();
                }
            } else if label.contains("Sale Type") {
                self.sale_type = Some(item.value.clone());
            }
        }
    }

    pub fn into_record(self, group: &GroupSource) -> Record {
        let mut record = Record::new(self.property_id, group.display_name.clone())
            .with_field(fields::ADDRESS, self.address)
            .with_field(fields::DEFENDANT, self.defendant)
            .with_field(fields::SALES_DATE, self.sales_date)
            .with_field(fields::APPROX_JUDGMENT, self.approx_judgment);
        if let Some(sale_type) = self.sale_type {
            record.set_field(fields::SALE_TYPE, sale_type);
        }
        record
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingPage {
    Rows(Vec<ListingRow>),
    /// The county has nothing scheduled.
    NoSales,
}

pub fn parse_listing_page(html: &str, page_url: &Url) -> Result<ListingPage, ExtractError> {
    let document = Html::parse_document(html);
    let table = selector(LISTING_TABLE)?;
    if document.select(&table).next().is_none() {
        if document.select(&selector(NO_SALES_MARKERS)?).next().is_some() {
            return Ok(ListingPage::NoSales);
        }
        return Err(ExtractError::Malformed {
            url: page_url.to_string(),
            reason: "neither a sales table nor a no-sales marker".to_string(),
        });
    }

    let rows_sel = selector(LISTING_ROWS)?;
    let cell_sel = selector("td")?;
    let link_sel = selector(DETAILS_LINK)?;

    let rows = document
        .select(&rows_sel)
        .map(|row| {
            let cells: Vec<_> = row.select(&cell_sel).collect();
            let cell_text = |idx: usize| {
                cells
                    .get(idx)
                    .map(|c| element_text(*c))
                    .unwrap_or_default()
            };
            let href = row
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(str::trim)
                .filter(|href| !href.is_empty());

            ListingRow {
                property_id: href
                    .map(|href| property_id_from_href(href, page_url))
                    .unwrap_or_default(),
                details_url: href.and_then(|href| page_url.join(href).ok()).map(|u| u.to_string()),
                sales_date: cell_text(2),
                defendant: cell_text(4),
                address: if cells.len() >= 6 { cell_text(5) } else { String::new() },
                approx_judgment: String::new(),
                sale_type: None,
            }
        })
        .collect();

    Ok(ListingPage::Rows(rows))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailItem {
    pub label: String,
    pub value: String,
}

pub fn parse_detail_page(html: &str, page_url: &str) -> Result<Vec<DetailItem>, ExtractError> {
    let document = Html::parse_document(html);
    if document.select(&selector(DETAIL_LIST)?).next().is_none() {
        return Err(ExtractError::Malformed {
            url: page_url.to_string(),
            reason: "missing sale details list".to_string(),
        });
    }
    let item_sel = selector(DETAIL_ITEMS)?;
    let label_sel = selector(DETAIL_LABEL)?;
    let value_sel = selector(DETAIL_VALUE)?;

    Ok(document
        .select(&item_sel)
        .map(|item| DetailItem {
            label: item.select(&label_sel).next().map(element_text).unwrap_or_default(),
            value: item.select(&value_sel).next().map(element_text).unwrap_or_default(),
        })
        .collect())
}

/// CivilView extraction over any [`PageSource`], retried as a whole under one policy.
#[derive(Debug, Clone)]
pub struct CivilViewExtractor<P> {
    pages: P,
    retry: BackoffPolicy,
    detail_delay: Duration,
}

impl<P: PageSource> CivilViewExtractor<P> {
    pub fn new(pages: P, retry: BackoffPolicy) -> Self {
        Self {
            pages,
            retry,
            detail_delay: Duration::ZERO,
        }
    }

    /// Pause between detail page requests.
    pub fn with_detail_delay(mut self, delay: Duration) -> Self {
        self.detail_delay = delay;
        self
    }

    async fn extract_once(&self, group: &GroupSource) -> Result<Vec<Record>, ExtractError> {
        let page = self.pages.listing_page(group).await?;
        let page_url = Url::parse(&page.url).unwrap_or_else(|_| self.pages.listing_url(group));
        let rows = match parse_listing_page(&page.body, &page_url)? {
            ListingPage::NoSales => {
                info!(county = %group.display_name, "no sales listed");
                return Ok(Vec::new());
            }
            ListingPage::Rows(rows) => rows,
        };

        let mut records = Vec::with_capacity(rows.len());
        for mut row in rows {
            if let Some(url) = row.details_url.clone() {
                match self.detail_items(group, &url, &row.property_id).await {
                    Ok(items) => row.apply_details(&items),
                    Err(err) => warn!(
                        county = %group.display_name,
                        property_id = %row.property_id,
                        error = %err,
                        "detail page unavailable; keeping listing values"
                    ),
                }
                if !self.detail_delay.is_zero() {
                    tokio::time::sleep(self.detail_delay).await;
                }
            }
            records.push(row.into_record(group));
        }
        Ok(records)
    }

    async fn detail_items(
        &self,
        group: &GroupSource,
        url: &str,
        property_id: &str,
    ) -> Result<Vec<DetailItem>, ExtractError> {
        let page = self.pages.detail_page(group, url, property_id).await?;
        parse_detail_page(&page.body, &page.url)
    }
}

#[async_trait]
impl<P: PageSource> RecordExtractor for CivilViewExtractor<P> {
    fn name(&self) -> &'static str {
        "civilview"
    }

    async fn fetch(&self, group: &GroupSource) -> Result<Vec<Record>, ExtractError> {
        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            match self.extract_once(group).await {
                Ok(records) => {
                    debug!(
                        county = %group.display_name,
                        records = records.len(),
                        attempt,
                        "extracted"
                    );
                    return Ok(records);
                }
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        county = %group.display_name,
                        attempt = attempt + 1,
                        attempts,
                        error = %err,
                        "extraction attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(ExtractError::Exhausted {
                        group: group.display_name.clone(),
                        attempts: attempt + 1,
                        last: Box::new(err),
                    })
                }
            }
        }
    }
}

/// Live pages over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    http: HttpFetcher,
    base_url: Url,
}

impl HttpPageSource {
    pub fn new(http: HttpFetcher, base_url: &str) -> anyhow::Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("parsing base url {base_url}"))?;
        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    fn listing_url(&self, group: &GroupSource) -> Url {
        listing_url(&self.base_url, &group.id)
    }

    async fn listing_page(&self, group: &GroupSource) -> Result<Page, ExtractError> {
        let url = self.listing_url(group);
        let resp = self.http.fetch_text(&group.id, url.as_str()).await?;
        Ok(Page {
            url: resp.final_url,
            body: resp.body,
        })
    }

    async fn detail_page(
        &self,
        group: &GroupSource,
        url: &str,
        _property_id: &str,
    ) -> Result<Page, ExtractError> {
        let resp = self.http.fetch_text(&group.id, url).await?;
        Ok(Page {
            url: resp.final_url,
            body: resp.body,
        })
    }
}

/// Saved pages laid out as `<root>/<county_id>/listing.html` and
/// `<root>/<county_id>/details/<property_id>.html`.
#[derive(Debug, Clone)]
pub struct FixturePageSource {
    root: PathBuf,
    base_url: Url,
}

impl FixturePageSource {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self {
            root: root.into(),
            base_url: Url::parse(DEFAULT_BASE_URL).context("parsing default base url")?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read(&self, path: PathBuf, url: String) -> Result<Page, ExtractError> {
        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ExtractError::Fixture {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Page { url, body })
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    fn listing_url(&self, group: &GroupSource) -> Url {
        listing_url(&self.base_url, &group.id)
    }

    async fn listing_page(&self, group: &GroupSource) -> Result<Page, ExtractError> {
        let path = self.root.join(&group.id).join("listing.html");
        self.read(path, self.listing_url(group).to_string()).await
    }

    async fn detail_page(
        &self,
        group: &GroupSource,
        url: &str,
        property_id: &str,
    ) -> Result<Page, ExtractError> {
        let path = self
            .root
            .join(&group.id)
            .join("details")
            .join(format!("{property_id}.html"));
        self.read(path, url.to_string()).await
    }
}

pub fn live_extractor(
    http: HttpFetcher,
    base_url: &str,
    retry: BackoffPolicy,
) -> anyhow::Result<CivilViewExtractor<HttpPageSource>> {
    Ok(CivilViewExtractor::new(HttpPageSource::new(http, base_url)?, retry)
        .with_detail_delay(Duration::from_millis(250)))
}

/// Offline extractor over saved pages; a missing or broken page is not retried.
pub fn fixture_extractor(
    root: impl Into<PathBuf>,
) -> anyhow::Result<CivilViewExtractor<FixturePageSource>> {
    Ok(CivilViewExtractor::new(
        FixturePageSource::new(root)?,
        BackoffPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    ))
}
