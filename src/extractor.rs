use crate::fetcher::Fetcher;
use crate::types::{CandidateUrl, Listing};
use crate::ExtractionError;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::{debug, instrument};
use url::Url;

/// Maximum number of characters kept in `Listing::raw_snapshot`.
pub const SNAPSHOT_LIMIT: usize = 2000;

/// CSS selectors tried, in order, for each listing field.
pub struct FieldSelectors {
    title: Vec<Selector>,
    price: Vec<Selector>,
    seller: Vec<Selector>,
    description: Vec<Selector>,
}

impl Default for FieldSelectors {
    fn default() -> Self {
        Self::new(
            ["h1[itemprop='name']", "h1", ".product-title", "title"],
            ["[itemprop='price']", "[data-price]", ".price", "[class*='price']"],
            [
                "[itemprop='seller'] [itemprop='name']",
                ".seller-name",
                ".seller",
                "[class*='seller']",
                "a[href*='/seller/']",
            ],
            [
                "[itemprop='description']",
                "#description",
                ".description",
                "[class*='description']",
                "article p",
            ],
        )
    }
}

impl FieldSelectors {
    /// Builds selectors from CSS strings; invalid selectors are skipped.
    pub fn new<S: AsRef<str>>(
        title: impl IntoIterator<Item = S>,
        price: impl IntoIterator<Item = S>,
        seller: impl IntoIterator<Item = S>,
        description: impl IntoIterator<Item = S>,
    ) -> Self {
        fn parse_all<S: AsRef<str>>(selectors: impl IntoIterator<Item = S>) -> Vec<Selector> {
            selectors
                .into_iter()
                .filter_map(|s| Selector::parse(s.as_ref()).ok())
                .collect()
        }

        Self {
            title: parse_all(title),
            price: parse_all(price),
            seller: parse_all(seller),
            description: parse_all(description),
        }
    }
}

/// Structured fields found on a page, before they become a `Listing`.
#[derive(Debug, Default, Clone, PartialEq)]
struct Fields {
    title: Option<String>,
    price: Option<f64>,
    currency: Option<String>,
    seller: Option<String>,
    description: Option<String>,
    /// Image references as written on the page; may be relative.
    images: Vec<String>,
}

impl Fields {
    /// Fills every missing field from `other`.
    fn or(self, other: Fields) -> Fields {
        Fields {
            title: self.title.or(other.title),
            price: self.price.or(other.price),
            currency: self.currency.or(other.currency),
            seller: self.seller.or(other.seller),
            description: self.description.or(other.description),
            images: if self.images.is_empty() { other.images } else { self.images },
        }
    }

    fn is_empty(&self) -> bool {
        *self == Fields::default()
    }
}

/// The `ContentExtractor` fetches candidate pages and extracts listing fields
/// from JSON-LD, meta tags and CSS heuristics, in that order of preference.
pub struct ContentExtractor {
    fetcher: Arc<Fetcher>,
    selectors: FieldSelectors,
}

impl ContentExtractor {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            selectors: FieldSelectors::default(),
        }
    }

    pub fn with_selectors(mut self, selectors: FieldSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    /// Fetches and parses the page of `candidate`.
    pub async fn extract(&self, candidate: &CandidateUrl) -> Result<Listing, ExtractionError> {
        let page = self.fetcher.fetch(&candidate.url).await?;
        self.parse(candidate, &page.body, page.content_type.as_deref())
    }

    /// Parses a fetched page. Missing fields produce a partial listing, not an error.
    #[instrument(skip(self, candidate, html), fields(url = %candidate.url, html_length = html.len()))]
    pub fn parse(
        &self,
        candidate: &CandidateUrl,
        html: &str,
        content_type: Option<&str>,
    ) -> Result<Listing, ExtractionError> {
        if let Some(content_type) = content_type {
            let ct = content_type.to_ascii_lowercase();
            if !ct.contains("html") && !ct.contains("xml") {
                return Err(ExtractionError::ParseFailure(format!(
                    "unsupported content type {content_type}"
                )));
            }
        }
        if html.trim().is_empty() {
            return Err(ExtractionError::EmptyPage);
        }

        let document = Html::parse_document(html);
        let snapshot = truncate(&visible_text(&document), SNAPSHOT_LIMIT);

        let fields = json_ld_fields(&document)
            .or(meta_fields(&document))
            .or(self.css_fields(&document));

        if fields.is_empty() && snapshot.is_empty() {
            return Err(ExtractionError::EmptyPage);
        }

        let images = resolve_images(&candidate.url, &fields.images);
        let listing = Listing {
            url: candidate.url.clone(),
            title: fields.title,
            price: fields.price,
            currency: fields.currency,
            seller_identifier: fields.seller,
            description: fields.description,
            images,
            raw_snapshot: snapshot,
            partial: false,
            discovery_index: candidate.discovery_index,
            marketplace: candidate.marketplace.clone(),
            snippet: candidate.snippet.clone(),
            sources: candidate.sources.clone(),
            extraction_error: None,
        };
        let partial = listing.completeness() < 5;
        debug!("Extracted {} of 5 fields", listing.completeness());
        Ok(Listing { partial, ..listing })
    }

    fn css_fields(&self, document: &Html) -> Fields {
        let price_text = first_match(document, &self.selectors.price, |el| {
            el.value()
                .attr("content")
                .or_else(|| el.value().attr("data-price"))
                .map(str::to_string)
                .or_else(|| non_empty(element_text(el)))
        });
        let (price, currency) = price_text
            .as_deref()
            .and_then(parse_price)
            .map_or((None, None), |(p, c)| (Some(p), c));

        Fields {
            title: first_match(document, &self.selectors.title, |el| non_empty(element_text(el))),
            price,
            currency,
            seller: first_match(document, &self.selectors.seller, |el| non_empty(element_text(el))),
            description: first_match(document, &self.selectors.description, |el| {
                el.value()
                    .attr("content")
                    .map(str::to_string)
                    .or_else(|| non_empty(element_text(el)))
            }),
            images: Vec::new(),
        }
    }
}

/// Resolves image references against the page URL, dropping duplicates and
/// anything that is not http(s).
fn resolve_images(base: &Url, images: &[String]) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::new();
    for image in images {
        let Ok(url) = base.join(image.trim()) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        let url = String::from(url);
        if !resolved.contains(&url) {
            resolved.push(url);
        }
    }
    resolved
}

fn first_match(
    document: &Html,
    selectors: &[Selector],
    value: impl Fn(ElementRef) -> Option<String>,
) -> Option<String> {
    selectors
        .iter()
        .find_map(|selector| document.select(selector).find_map(&value))
}

fn element_text(element: ElementRef) -> String {
    collapse(&element.text().collect::<Vec<_>>().join(" "))
}

fn non_empty(text: String) -> Option<String> {
    let text = collapse(&text);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Text a reader would see: everything under `<body>` except scripts and styles.
fn visible_text(document: &Html) -> String {
    let Ok(body) = Selector::parse("body") else {
        return String::new();
    };
    let Some(body) = document.select(&body).next() else {
        return String::new();
    };

    let hidden = ["script", "style", "noscript", "template"];
    let text: Vec<&str> = body
        .descendants()
        .filter_map(|node| match node.value() {
            Node::Text(text) => {
                let inside_hidden = node.ancestors().any(|a| {
                    a.value()
                        .as_element()
                        .is_some_and(|e| hidden.contains(&e.name()))
                });
                (!inside_hidden).then_some(&**text)
            }
            _ => None,
        })
        .collect();
    collapse(&text.join(" "))
}

fn meta_fields(document: &Html) -> Fields {
    let meta = |keys: &[&str]| -> Option<String> {
        keys.iter().find_map(|key| {
            let css = format!("meta[property='{key}'], meta[name='{key}'], meta[itemprop='{key}']");
            let selector = Selector::parse(&css).ok()?;
            document
                .select(&selector)
                .find_map(|el| el.value().attr("content").map(str::to_string).and_then(non_empty))
        })
    };

    let amount = meta(&["product:price:amount", "og:price:amount", "price"]);
    let (price, parsed_currency) = amount
        .as_deref()
        .and_then(parse_price)
        .map_or((None, None), |(p, c)| (Some(p), c));
    let currency = meta(&["product:price:currency", "og:price:currency", "priceCurrency"])
        .map(|c| c.to_uppercase())
        .or(parsed_currency);

    let images = Selector::parse("meta[property='og:image'], meta[name='og:image'], meta[name='twitter:image']")
        .map(|selector| {
            document
                .select(&selector)
                .filter_map(|el| el.value().attr("content").map(str::to_string).and_then(non_empty))
                .collect()
        })
        .unwrap_or_default();

    Fields {
        title: meta(&["og:title", "twitter:title"]),
        price,
        currency,
        seller: meta(&["product:retailer_title", "og:site_name"]),
        description: meta(&["og:description", "description"]),
        images,
    }
}

/// Reads the first schema.org `Product` found in JSON-LD script blocks.
fn json_ld_fields(document: &Html) -> Fields {
    let Ok(selector) = Selector::parse("script[type='application/ld+json']") else {
        return Fields::default();
    };

    document
        .select(&selector)
        .filter_map(|script| serde_json::from_str::<Value>(&script.text().collect::<String>()).ok())
        .find_map(|value| find_product(&value).map(product_fields))
        .unwrap_or_default()
}

fn find_product(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.iter().find_map(find_product),
        Value::Object(map) => {
            let is_product = match map.get("@type") {
                Some(Value::String(t)) => t == "Product",
                Some(Value::Array(types)) => types.iter().any(|t| t == "Product"),
                _ => false,
            };
            if is_product {
                Some(value)
            } else {
                map.get("@graph").and_then(find_product)
            }
        }
        _ => None,
    }
}

fn product_fields(product: &Value) -> Fields {
    let text = |v: Option<&Value>| -> Option<String> {
        match v? {
            Value::String(s) => non_empty(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Object(map) => map.get("name").and_then(|n| n.as_str()).map(str::to_string),
            _ => None,
        }
    };

    let offer = match product.get("offers") {
        Some(Value::Array(offers)) => offers.first(),
        other => other,
    };
    let offer_field = |key: &str| offer.and_then(|o| o.get(key));

    let price = match offer_field("price").or_else(|| offer_field("lowPrice")) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => parse_price(s).map(|(p, _)| p),
        _ => None,
    };
    let seller = text(offer_field("seller")).or_else(|| text(product.get("brand")));

    Fields {
        title: text(product.get("name")),
        price,
        currency: text(offer_field("priceCurrency")).map(|c| c.to_uppercase()),
        seller,
        description: text(product.get("description")),
        images: product.get("image").map(image_refs).unwrap_or_default(),
    }
}

/// schema.org `image` is a URL, an `ImageObject`, or a list of either.
fn image_refs(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => non_empty(s.clone()).into_iter().collect(),
        Value::Array(items) => items.iter().flat_map(image_refs).collect(),
        Value::Object(map) => map
            .get("url")
            .or_else(|| map.get("contentUrl"))
            .map(image_refs)
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{1,3}(?:[',.\s\x{a0}\x{202f}’]\d{3})+|\d+)(?:[.,](\d{1,2}))?")
            .unwrap_or_else(|e| unreachable!("price pattern is valid: {e}"))
    })
}

/// Parses a price like `CHF 1'299.00`, `12,99 €` or `$1,299.99`.
pub fn parse_price(text: &str) -> Option<(f64, Option<String>)> {
    let caps = number_regex().captures(text)?;
    let integer: String = caps[1].chars().filter(char::is_ascii_digit).collect();
    let fraction = caps.get(2).map_or("0", |m| m.as_str());
    let value: f64 = format!("{integer}.{fraction}").parse().ok()?;
    Some((value, detect_currency(text)))
}

fn detect_currency(text: &str) -> Option<String> {
    let upper = text.to_uppercase();
    let by_code = ["CHF", "EUR", "USD", "GBP", "JPY", "CAD", "AUD"]
        .into_iter()
        .find(|code| upper.contains(code));
    let by_symbol = [("€", "EUR"), ("£", "GBP"), ("$", "USD"), ("¥", "JPY"), ("FR.", "CHF")]
        .into_iter()
        .find(|(symbol, _)| upper.contains(symbol))
        .map(|(_, code)| code);
    by_code.or(by_symbol).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlerConfig;
    use crate::types::{SourceAttribution, VariantKind};
    use chrono::Utc;
    use std::time::Duration;

    fn candidate(url: &str) -> CandidateUrl {
        CandidateUrl {
            url: Url::parse(url).unwrap(),
            discovery_index: 3,
            snippet: Some("Swiss made, only today".into()),
            title_hint: None,
            marketplace: Some("Example".into()),
            sources: vec![SourceAttribution {
                query: "fake watches".into(),
                kind: VariantKind::Seed,
                rank: 1,
                discovered_at: Utc::now(),
            }],
        }
    }

    fn extractor() -> ContentExtractor {
        let mut config = CrawlerConfig::default();
        config.retry_count = 0;
        config.rate_limit.per_host_interval = Duration::ZERO;
        ContentExtractor::new(Arc::new(Fetcher::new(&config).unwrap()))
    }

    /// Tests extraction from a page with schema.org JSON-LD.
    #[test]
    fn test_json_ld_extraction() {
        let html = r#"
            <html><head>
                <script type="application/ld+json">
                {"@context": "https://schema.org", "@graph": [
                    {"@type": "WebPage", "name": "Shop"},
                    {"@type": "Product", "name": "Rolex Submariner",
                     "description": "Brand new, box and papers",
                     "image": ["/img/sub-1.jpg", {"@type": "ImageObject", "url": "https://cdn.example.ch/sub-2.jpg"}, "/img/sub-1.jpg"],
                     "brand": {"@type": "Brand", "name": "Rolex"},
                     "offers": {"@type": "Offer", "price": "149.90", "priceCurrency": "chf",
                                "seller": {"@type": "Organization", "name": "LuxuryDeals24"}}}
                ]}
                </script>
            </head><body><h1>Rolex Submariner</h1><p>Buy now</p></body></html>
        "#;

        let listing = extractor().parse(&candidate("https://shop.example.ch/1"), html, Some("text/html")).unwrap();

        assert_eq!(listing.title.as_deref(), Some("Rolex Submariner"));
        assert_eq!(listing.price, Some(149.90));
        assert_eq!(listing.currency.as_deref(), Some("CHF"));
        assert_eq!(listing.seller_identifier.as_deref(), Some("LuxuryDeals24"));
        assert_eq!(listing.description.as_deref(), Some("Brand new, box and papers"));
        assert!(!listing.partial);
        assert_eq!(listing.discovery_index, 3);
        assert_eq!(listing.raw_snapshot, "Rolex Submariner Buy now");
        assert_eq!(
            listing.images,
            vec!["https://shop.example.ch/img/sub-1.jpg", "https://cdn.example.ch/sub-2.jpg"]
        );
    }

    /// Tests the meta tag and CSS fallbacks.
    #[test]
    fn test_meta_and_css_fallbacks() {
        let html = r#"
            <html><head>
                <meta property="og:title" content="Omega Seamaster - Top Deal">
                <meta name="description" content="Like new">
                <style>.price { color: red }</style>
            </head><body>
                <h1>Omega Seamaster</h1>
                <span class="price">CHF 1'299.00</span>
                <div class="seller-name">watchking</div>
                <script>var tracking = 1;</script>
            </body></html>
        "#;

        let listing = extractor().parse(&candidate("https://shop.example.ch/2"), html, None).unwrap();

        assert_eq!(listing.title.as_deref(), Some("Omega Seamaster - Top Deal"));
        assert_eq!(listing.price, Some(1299.0));
        assert_eq!(listing.currency.as_deref(), Some("CHF"));
        assert_eq!(listing.seller_identifier.as_deref(), Some("watchking"));
        assert_eq!(listing.description.as_deref(), Some("Like new"));
        assert!(!listing.raw_snapshot.contains("tracking"));
    }

    #[test]
    fn test_og_image_tags_are_collected() {
        let html = r#"
            <html><head>
                <meta property="og:title" content="Cartier Tank">
                <meta property="og:image" content="//img.example.ch/tank-front.jpg">
                <meta property="og:image" content="tank-back.jpg">
                <meta property="og:image" content="data:image/png;base64,AAAA">
            </head><body><h1>Cartier Tank</h1></body></html>
        "#;

        let listing = extractor().parse(&candidate("https://shop.example.ch/watches/5"), html, None).unwrap();

        assert_eq!(
            listing.images,
            vec!["https://img.example.ch/tank-front.jpg", "https://shop.example.ch/watches/tank-back.jpg"]
        );
    }

    #[test]
    fn test_page_without_images_has_none() {
        let html = "<html><body><h1>Omega</h1></body></html>";
        let listing = extractor().parse(&candidate("https://shop.example.ch/6"), html, None).unwrap();

        assert!(listing.images.is_empty());
    }

    /// Tests that a page without structured fields is kept as a partial listing.
    #[test]
    fn test_missing_fields_yield_partial_listing() {
        let html = "<html><body><p>Contact us on WhatsApp for prices</p></body></html>";
        let listing = extractor().parse(&candidate("https://shop.example.ch/3"), html, Some("text/html")).unwrap();

        assert!(listing.partial);
        assert_eq!(listing.price, None);
        assert_eq!(listing.snippet.as_deref(), Some("Swiss made, only today"));
        assert!(listing.raw_snapshot.contains("WhatsApp"));
    }

    #[test]
    fn test_empty_and_non_html_pages() {
        let candidate = candidate("https://shop.example.ch/4");
        let extractor = extractor();

        assert_eq!(
            extractor.parse(&candidate, "  ", Some("text/html")).unwrap_err(),
            ExtractionError::EmptyPage
        );
        assert_eq!(
            extractor.parse(&candidate, "<html><body></body></html>", None).unwrap_err(),
            ExtractionError::EmptyPage
        );
        assert!(matches!(
            extractor.parse(&candidate, "%PDF-1.4", Some("application/pdf")),
            Err(ExtractionError::ParseFailure(_))
        ));
    }

    #[test]
    fn test_parse_price_formats() {
        assert_eq!(parse_price("CHF 1'299.00"), Some((1299.0, Some("CHF".into()))));
        assert_eq!(parse_price("12,99 €"), Some((12.99, Some("EUR".into()))));
        assert_eq!(parse_price("$1,299.99"), Some((1299.99, Some("USD".into()))));
        assert_eq!(parse_price("1.299,50 EUR"), Some((1299.5, Some("EUR".into()))));
        assert_eq!(parse_price("Fr. 80.-"), Some((80.0, Some("CHF".into()))));
        assert_eq!(parse_price("149"), Some((149.0, None)));
        assert_eq!(parse_price("price on request"), None);
    }

    #[tokio::test]
    async fn test_extract_fetches_candidate_page() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/listing/7")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(r#"<html><body><h1>Cartier Tank</h1><span itemprop="price" content="89.00">89 USD</span></body></html>"#)
            .create_async()
            .await;

        let candidate = candidate(&format!("{}/listing/7", server.url()));
        let listing = extractor().extract(&candidate).await.unwrap();

        assert_eq!(listing.title.as_deref(), Some("Cartier Tank"));
        assert_eq!(listing.price, Some(89.0));
        assert!(listing.partial);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_extract_reports_fetch_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/missing").with_status(404).create_async().await;

        let candidate = candidate(&format!("{}/missing", server.url()));
        let err = extractor().extract(&candidate).await.unwrap_err();

        assert!(matches!(err, ExtractionError::Fetch(crate::FetchError::Http { status: 404, .. })));
    }
}
