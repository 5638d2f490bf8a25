//! Seams to the external OCR and rule-extraction capabilities.
//!
//! Providers are plain synchronous traits; every call into them goes through
//! [`ResilienceLayer`](crate::resilience::ResilienceLayer), which passes a
//! [`CallContext`] with the timeout the provider must honour.

pub mod rules;
pub mod text;

use serde::{Deserialize, Serialize};

use crate::pipeline::PageExtraction;
use crate::resilience::{CallContext, DependencyError};

pub use rules::{KeywordRule, KeywordRuleExtractor, RuleMatch};
pub use text::PlainTextProvider;

/// Turns document bytes into per-page text.
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;

    fn count_pages(&self, document: &[u8], ctx: &CallContext<'_>) -> Result<u32, DependencyError>;

    /// `page_number` is 1-based.
    fn extract_page(
        &self,
        document: &[u8],
        page_number: u32,
        ctx: &CallContext<'_>,
    ) -> Result<PageExtraction, DependencyError>;
}

/// A structured rule found in contract text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCandidate {
    pub rule_id: String,
    pub category: String,
    /// The sentence the rule was found in.
    pub excerpt: String,
    pub confidence: f64,
}

/// Turns contract text into rule candidates.
pub trait RuleExtractionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn extract_rules(
        &self,
        text: &str,
        ctx: &CallContext<'_>,
    ) -> Result<Vec<RuleCandidate>, DependencyError>;
}
