//! Page fetcher contracts + HTML and fixture-backed implementations.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use adwatch_core::{RawListing, DATE_UNKNOWN, LOCATION_UNAVAILABLE, PRICE_UNAVAILABLE};
use adwatch_storage::{FetchError, HttpFetcher};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "adwatch-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.olx.pt/coracaodejesus/?search%5Bdist%5D=15";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid page url `{0}`")]
    Url(String),
    #[error("reading fixture {path}: {source}")]
    FixtureIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing fixture {path}: {source}")]
    FixtureParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One page of the source, indexed from 1. An empty page ends pagination.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawListing>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub card: String,
    pub title: String,
    /// Used only when the title is not wrapped in an anchor.
    pub link: String,
    pub price: String,
    pub location_date: String,
    pub image: String,
    pub placeholder_images: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            card: r#"div[data-cy="l-card"]"#.to_string(),
            title: "h4.css-1g61gc2".to_string(),
            link: "a[href]".to_string(),
            price: r#"p[data-testid="ad-price"]"#.to_string(),
            location_date: r#"p[data-testid="location-date"]"#.to_string(),
            image: "img.css-8wsg1m".to_string(),
            placeholder_images: vec!["/app/static/media/no_thumbnail.15f456ec5.svg".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub selectors: SelectorConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            selectors: SelectorConfig::default(),
        }
    }
}

impl SourceConfig {
    /// Read a YAML source definition. A missing file yields the built-in defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no source file; using built-in source definition");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn page_url(&self, page: u32) -> String {
        page_url(&self.base_url, page)
    }
}

pub fn page_url(base_url: &str, page: u32) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{separator}page={page}")
}

/// Split an `"<location> - <date>"` line at the first separator.
pub fn split_location_date(text: &str) -> (String, String) {
    let text = text.trim();
    if text.is_empty() {
        return (LOCATION_UNAVAILABLE.to_string(), DATE_UNKNOWN.to_string());
    }
    match text.split_once(" - ") {
        Some((location, date)) => (location.trim().to_string(), date.trim().to_string()),
        None => (text.to_string(), DATE_UNKNOWN.to_string()),
    }
}

struct CompiledSelectors {
    card: Selector,
    title: Selector,
    link: Selector,
    price: Selector,
    location_date: Selector,
    image: Selector,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

impl CompiledSelectors {
    fn new(config: &SelectorConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            card: compile(&config.card)?,
            title: compile(&config.title)?,
            link: compile(&config.link)?,
            price: compile(&config.price)?,
            location_date: compile(&config.location_date)?,
            image: compile(&config.image)?,
        })
    }
}

fn normalized_text(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn first_text(card: ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .map(normalized_text)
        .filter(|t| !t.is_empty())
}

fn enclosing_href(el: ElementRef<'_>) -> Option<String> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|node| node.value().name() == "a")
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string)
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(url) => url.to_string(),
        None => href.to_string(),
    }
}

/// Extract listing cards from one results page.
///
/// Cards without a title or link are still returned with blank fields so that
/// reconciliation can count and report them.
pub fn parse_listing_page(
    html: &str,
    page_url: &str,
    selectors: &SelectorConfig,
) -> Result<Vec<RawListing>, AdapterError> {
    let compiled = CompiledSelectors::new(selectors)?;
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    let mut out = Vec::new();
    for card in document.select(&compiled.card) {
        let title_el = card.select(&compiled.title).next();
        let title = title_el.map(normalized_text).unwrap_or_default();

        let href = title_el
            .and_then(enclosing_href)
            .or_else(|| {
                card.select(&compiled.link)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .map(str::to_string)
            })
            .filter(|h| !h.trim().is_empty());
        let link = href
            .map(|h| resolve(base.as_ref(), h.trim()))
            .unwrap_or_default();

        let price = first_text(card, &compiled.price).unwrap_or_else(|| PRICE_UNAVAILABLE.to_string());
        let (location, date) = match first_text(card, &compiled.location_date) {
            Some(text) => split_location_date(&text),
            None => (LOCATION_UNAVAILABLE.to_string(), DATE_UNKNOWN.to_string()),
        };

        let image_url = card
            .select(&compiled.image)
            .next()
            .and_then(|img| img.value().attr("src"))
            .map(str::trim)
            .filter(|src| !src.is_empty())
            .filter(|src| !selectors.placeholder_images.iter().any(|p| p == src))
            .map(|src| resolve(base.as_ref(), src));

        out.push(RawListing {
            title,
            price,
            location,
            date,
            link,
            image_url,
        });
    }

    debug!(page_url, cards = out.len(), "parsed listing page");
    Ok(out)
}

/// Fetches live result pages over HTTP.
#[derive(Debug)]
pub struct HtmlPageFetcher {
    http: HttpFetcher,
    source: SourceConfig,
}

impl HtmlPageFetcher {
    pub fn new(http: HttpFetcher, source: SourceConfig) -> Self {
        Self { http, source }
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }
}

#[async_trait]
impl PageFetcher for HtmlPageFetcher {
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawListing>, AdapterError> {
        let url = self.source.page_url(page);
        if Url::parse(&url).is_err() {
            return Err(AdapterError::Url(url));
        }
        info!(page, %url, "fetching listing page");
        let response = self.http.fetch_text(&url).await?;
        parse_listing_page(&response.body, &response.final_url, &self.source.selectors)
    }
}

/// Serves pages from `page-N.json` (an array of raw listings) or
/// `page-N.html` files in a directory. A missing page is an empty page.
#[derive(Debug, Clone)]
pub struct FixturePageFetcher {
    dir: PathBuf,
    source: SourceConfig,
}

impl FixturePageFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            source: SourceConfig::default(),
        }
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.source = source;
        self
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, AdapterError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(AdapterError::FixtureIo {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[async_trait]
impl PageFetcher for FixturePageFetcher {
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawListing>, AdapterError> {
        let json_path = self.dir.join(format!("page-{page}.json"));
        if let Some(text) = Self::read_optional(&json_path).await? {
            return serde_json::from_str(&text).map_err(|source| AdapterError::FixtureParse {
                path: json_path,
                source,
            });
        }

        let html_path = self.dir.join(format!("page-{page}.html"));
        if let Some(text) = Self::read_optional(&html_path).await? {
            return parse_listing_page(&text, &self.source.page_url(page), &self.source.selectors);
        }

        debug!(page, dir = %self.dir.display(), "no fixture for page");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: &str = r#"
        <html><body>
          <div data-cy="l-card">
            <a href="/d/anuncio/bicicleta-IDabc.html">
              <h4 class="css-1g61gc2">  Bicicleta
                 de montanha </h4>
            </a>
            <p data-testid="ad-price">100 €</p>
            <p data-testid="location-date">Porto - Hoje às 10:15</p>
            <img class="css-8wsg1m" src="https://img.example/1.jpg">
          </div>
          <div data-cy="l-card">
            <a href="https://www.olx.pt/d/anuncio/cadeira-IDdef.html">
              <h4 class="css-1g61gc2">Cadeira</h4>
            </a>
            <p data-testid="location-date">Braga</p>
            <img class="css-8wsg1m" src="/app/static/media/no_thumbnail.15f456ec5.svg">
          </div>
          <div data-cy="l-card">
            <p data-testid="ad-price">5 €</p>
          </div>
        </body></html>
    "#;

    const PAGE_URL: &str = "https://www.olx.pt/coracaodejesus/?search%5Bdist%5D=15&page=1";

    #[test]
    fn page_url_appends_page_parameter() {
        assert_eq!(
            page_url(DEFAULT_BASE_URL, 2),
            "https://www.olx.pt/coracaodejesus/?search%5Bdist%5D=15&page=2"
        );
        assert_eq!(page_url("https://x.test/ads", 1), "https://x.test/ads?page=1");
    }

    #[test]
    fn location_and_date_split_at_first_separator() {
        assert_eq!(
            split_location_date("Porto - Hoje às 10:15"),
            ("Porto".to_string(), "Hoje às 10:15".to_string())
        );
        assert_eq!(
            split_location_date("Vila Nova - de Gaia - 3 de março"),
            ("Vila Nova".to_string(), "de Gaia - 3 de março".to_string())
        );
        assert_eq!(
            split_location_date("Braga"),
            ("Braga".to_string(), DATE_UNKNOWN.to_string())
        );
        assert_eq!(
            split_location_date("  "),
            (LOCATION_UNAVAILABLE.to_string(), DATE_UNKNOWN.to_string())
        );
    }

    #[test]
    fn cards_are_extracted_with_placeholders_and_absolute_links() {
        let listings = parse_listing_page(PAGE, PAGE_URL, &SelectorConfig::default()).unwrap();
        assert_eq!(listings.len(), 3);

        let bike = &listings[0];
        assert_eq!(bike.title, "Bicicleta de montanha");
        assert_eq!(bike.price, "100 €");
        assert_eq!(bike.location, "Porto");
        assert_eq!(bike.date, "Hoje às 10:15");
        assert_eq!(bike.link, "https://www.olx.pt/d/anuncio/bicicleta-IDabc.html");
        assert_eq!(bike.image_url.as_deref(), Some("https://img.example/1.jpg"));

        let chair = &listings[1];
        assert_eq!(chair.price, PRICE_UNAVAILABLE);
        assert_eq!(chair.location, "Braga");
        assert_eq!(chair.date, DATE_UNKNOWN);
        assert!(chair.image_url.is_none());

        let broken = &listings[2];
        assert_eq!(broken.missing_required_field(), Some("title"));
        assert!(broken.link.is_empty());
    }

    #[test]
    fn invalid_selector_is_reported() {
        let selectors = SelectorConfig {
            card: "div[".to_string(),
            ..SelectorConfig::default()
        };
        let err = parse_listing_page(PAGE, PAGE_URL, &selectors).unwrap_err();
        assert!(matches!(err, AdapterError::Selector { .. }));
    }

    #[test]
    fn source_yaml_overrides_only_given_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("source.yaml");
        std::fs::write(
            &path,
            "base_url: https://ads.example/search?q=sofa\nselectors:\n  card: li.ad\n",
        )
        .unwrap();

        let source = SourceConfig::load(&path).unwrap();
        assert_eq!(source.base_url, "https://ads.example/search?q=sofa");
        assert_eq!(source.selectors.card, "li.ad");
        assert_eq!(source.selectors.title, SelectorConfig::default().title);
        assert_eq!(source.page_url(3), "https://ads.example/search?q=sofa&page=3");
    }

    #[test]
    fn missing_source_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let source = SourceConfig::load(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(source, SourceConfig::default());
    }

    #[tokio::test]
    async fn fixture_fetcher_serves_json_html_and_empty_pages() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("page-1.json"),
            r#"[{"title":"Bike","price":"100€","link":"https://x/1"}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("page-2.html"), PAGE).unwrap();

        let fetcher = FixturePageFetcher::new(dir.path());

        let first = fetcher.fetch_page(1).await.unwrap();
        assert_eq!(first, vec![RawListing::new("Bike", "100€", "https://x/1")]);

        let second = fetcher.fetch_page(2).await.unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].link, "https://www.olx.pt/d/anuncio/cadeira-IDdef.html");

        assert!(fetcher.fetch_page(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_fixture_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("page-1.json"), "not json").unwrap();
        let err = FixturePageFetcher::new(dir.path()).fetch_page(1).await.unwrap_err();
        assert!(matches!(err, AdapterError::FixtureParse { .. }));
    }
}
