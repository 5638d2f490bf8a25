use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::{PageExtraction, PageFeatures};
use crate::resilience::{CallContext, DependencyError};

use super::OcrProvider;

static RE_TABLE_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\|.*\|\s*$").unwrap());
static RE_SIGNATURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*(signed|signature)\b|/s/|_{8,}").unwrap());

const FORM_FEED: char = '\u{0C}';

/// Reads UTF-8 text documents, one page per form-feed separated section.
#[derive(Debug, Clone, Default)]
pub struct PlainTextProvider;

impl PlainTextProvider {
    pub fn new() -> Self {
        Self
    }

    fn decode(document: &[u8]) -> Result<&str, DependencyError> {
        std::str::from_utf8(document)
            .map_err(|e| DependencyError::validation(format!("document is not UTF-8 text: {}", e)))
    }

    fn pages(text: &str) -> Vec<&str> {
        let trimmed = text.trim_end_matches(FORM_FEED);
        if trimmed.trim().is_empty() {
            return Vec::new();
        }
        trimmed.split(FORM_FEED).collect()
    }
}

impl OcrProvider for PlainTextProvider {
    fn name(&self) -> &str {
        "plain-text"
    }

    fn count_pages(&self, document: &[u8], _ctx: &CallContext<'_>) -> Result<u32, DependencyError> {
        let text = Self::decode(document)?;
        Ok(u32::try_from(Self::pages(text).len()).unwrap_or(u32::MAX))
    }

    fn extract_page(
        &self,
        document: &[u8],
        page_number: u32,
        _ctx: &CallContext<'_>,
    ) -> Result<PageExtraction, DependencyError> {
        let text = Self::decode(document)?;
        let pages = Self::pages(text);
        let index = usize::try_from(page_number).unwrap_or(usize::MAX);
        let page = index
            .checked_sub(1)
            .and_then(|i| pages.get(i))
            .ok_or_else(|| {
                DependencyError::validation(format!(
                    "page {} out of range ({} pages)",
                    page_number,
                    pages.len()
                ))
            })?;

        let text = page.trim().to_string();
        Ok(PageExtraction {
            features: PageFeatures {
                has_table: RE_TABLE_ROW.find_iter(&text).count() >= 2,
                has_image: false,
                has_signature: RE_SIGNATURE.is_match(&text),
            },
            confidence: Some(1.0),
            text,
        })
    }
}
