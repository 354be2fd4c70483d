use crate::types::Listing;

/// Maximum number of characters of page text included in a prompt.
const PAGE_TEXT_LIMIT: usize = 1500;

/// The `PromptBuilder` struct is responsible for constructing the
/// classification prompt for one extracted listing.
pub struct PromptBuilder<'a> {
    /// What the scoring service should treat as suspicious.
    context: String,
    /// The listing described in the prompt.
    listing: &'a Listing,
}

impl<'a> PromptBuilder<'a> {
    /// Creates a new `PromptBuilder` for `listing`.
    ///
    /// # Arguments
    ///
    /// * `context` - Description of the fraud pattern being searched for.
    /// * `listing` - The listing to be scored.
    pub fn new(context: impl Into<String>, listing: &'a Listing) -> Self {
        Self {
            context: context.into(),
            listing,
        }
    }

    /// Builds the prompt string.
    ///
    /// The scoring service is asked for a JSON object with a `score` in
    /// `[0, 1]` and a short `rationale`.
    pub fn build(&self) -> String {
        format!(
            "You are checking online marketplace listings for fraud.\n\
             Context: {}\n\n\
             Product Details:\n{}\n\n\
             Rate how likely this listing is fraudulent given the context. \
             Answer only with JSON of the form \
             {{\"score\": <number between 0 and 1>, \"rationale\": \"<one sentence>\"}}.",
            self.context.trim(),
            Self::clean_text(&Self::describe(self.listing))
        )
    }

    fn describe(listing: &Listing) -> String {
        let field = |value: Option<&str>| value.unwrap_or("unknown").to_string();
        let price = match (listing.price, listing.currency.as_deref()) {
            (Some(price), Some(currency)) => format!("{price:.2} {currency}"),
            (Some(price), None) => format!("{price:.2}"),
            (None, _) => "unknown".to_string(),
        };
        let page_text: String = listing.raw_snapshot.chars().take(PAGE_TEXT_LIMIT).collect();

        let mut lines = vec![
            format!("URL: {}", listing.url),
            format!("Title: {}", field(listing.title.as_deref())),
            format!("Price: {price}"),
            format!("Seller: {}", field(listing.seller_identifier.as_deref())),
            format!("Description: {}", field(listing.description.as_deref())),
        ];
        if !listing.images.is_empty() {
            lines.push(format!("Images: {}", listing.images.len()));
        }
        if let Some(marketplace) = &listing.marketplace {
            lines.push(format!("Marketplace: {marketplace}"));
        }
        if let Some(snippet) = &listing.snippet {
            lines.push(format!("Search snippet: {snippet}"));
        }
        if !page_text.is_empty() {
            lines.push(format!("Page text: {page_text}"));
        }
        lines.join("\n")
    }

    /// Cleans the given text by removing blank lines and normalizing whitespace.
    fn clean_text(text: &str) -> String {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split_whitespace().collect::<Vec<&str>>().join(" "))
            .collect::<Vec<String>>()
            .join("\n")
    }
}
