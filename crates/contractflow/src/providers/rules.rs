use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::resilience::{CallContext, DependencyError};

use super::{RuleCandidate, RuleExtractionProvider};

/// How a keyword rule recognises a sentence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub contains_any: Option<Vec<String>>,
    #[serde(default)]
    pub contains_all: Option<Vec<String>>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordRule {
    pub id: String,
    pub category: String,
    /// Higher runs first; only the first matching rule claims a sentence.
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "match")]
    pub match_condition: RuleMatch,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.6
}

impl KeywordRule {
    pub fn new(id: &str, category: &str, match_condition: RuleMatch) -> Self {
        Self {
            id: id.to_string(),
            category: category.to_string(),
            priority: 0,
            match_condition,
            confidence: default_confidence(),
        }
    }
}

fn any_of(words: &[&str]) -> RuleMatch {
    RuleMatch {
        contains_any: Some(words.iter().map(|w| w.to_string()).collect()),
        ..Default::default()
    }
}

/// Finds contract rules sentence by sentence with keyword and regex
/// matching. Stands in for an AI extraction service in local runs.
pub struct KeywordRuleExtractor {
    rules: Vec<KeywordRule>,
    /// Pre-compiled regex patterns, indexed by pattern string
    compiled_patterns: HashMap<String, Regex>,
}

impl KeywordRuleExtractor {
    pub fn new(mut rules: Vec<KeywordRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut compiled_patterns = HashMap::new();
        for rule in &rules {
            if let Some(pattern) = &rule.match_condition.pattern {
                if compiled_patterns.contains_key(pattern) {
                    continue;
                }
                match Regex::new(&format!("(?i){}", pattern)) {
                    Ok(regex) => {
                        compiled_patterns.insert(pattern.clone(), regex);
                    }
                    Err(e) => log::warn!("Ignoring invalid pattern in rule '{}': {}", rule.id, e),
                }
            }
        }

        Self {
            rules,
            compiled_patterns,
        }
    }

    /// Common commercial-contract clauses.
    pub fn with_default_rules() -> Self {
        let mut payment = KeywordRule::new(
            "payment-terms",
            "payment",
            RuleMatch {
                pattern: Some(r"\b(pay|payable|invoice[sd]?)\b.*\b(\d+\s+days|monthly|annually)\b".to_string()),
                ..Default::default()
            },
        );
        payment.priority = 10;
        payment.confidence = 0.8;

        Self::new(vec![
            payment,
            KeywordRule::new("termination", "termination", any_of(&["terminate", "termination"])),
            KeywordRule::new(
                "confidentiality",
                "confidentiality",
                any_of(&["confidential", "non-disclosure"]),
            ),
            KeywordRule::new("governing-law", "jurisdiction", any_of(&["governed by", "governing law"])),
            KeywordRule::new("liability-cap", "liability", any_of(&["liability", "indemnif"])),
            KeywordRule::new("renewal", "term", any_of(&["renew", "renewal"])),
        ])
    }

    pub fn rules(&self) -> &[KeywordRule] {
        &self.rules
    }

    /// The first rule matching `sentence`, by priority.
    pub fn match_sentence(&self, sentence: &str) -> Option<&KeywordRule> {
        let lowered = sentence.to_lowercase();
        self.rules
            .iter()
            .find(|rule| self.matches(&rule.match_condition, sentence, &lowered))
    }

    fn matches(&self, condition: &RuleMatch, sentence: &str, lowered: &str) -> bool {
        let has = |s: &String| lowered.contains(&s.to_lowercase());

        if let Some(contains) = &condition.contains {
            return has(contains);
        }
        if let Some(contains_any) = &condition.contains_any {
            return contains_any.iter().any(has);
        }
        if let Some(contains_all) = &condition.contains_all {
            return contains_all.iter().all(has);
        }
        if let Some(pattern) = &condition.pattern {
            if let Some(regex) = self.compiled_patterns.get(pattern) {
                return regex.is_match(sentence);
            }
        }
        false
    }
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(['.', ';', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl RuleExtractionProvider for KeywordRuleExtractor {
    fn name(&self) -> &str {
        "keyword-rules"
    }

    fn extract_rules(
        &self,
        text: &str,
        _ctx: &CallContext<'_>,
    ) -> Result<Vec<RuleCandidate>, DependencyError> {
        Ok(sentences(text)
            .filter_map(|sentence| {
                self.match_sentence(sentence).map(|rule| RuleCandidate {
                    rule_id: rule.id.clone(),
                    category: rule.category.clone(),
                    excerpt: sentence.to_string(),
                    confidence: rule.confidence,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx() -> CallContext<'static> {
        CallContext {
            dependency: "rule-extraction-provider",
            attempt: 1,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_default_rules_find_clauses() {
        let extractor = KeywordRuleExtractor::with_default_rules();
        let text = "Either party may Terminate this agreement with notice. \
                    Invoices are payable within 30 days. The weather is nice.";
        let rules = extractor.extract_rules(text, &ctx()).unwrap();
        let ids: Vec<_> = rules.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["termination", "payment-terms"]);
        assert_eq!(rules[1].confidence, 0.8);
        assert_eq!(rules[1].excerpt, "Invoices are payable within 30 days");
    }

    #[test]
    fn test_priority_decides_between_matches() {
        let mut high = KeywordRule::new("high", "a", any_of(&["lease"]));
        high.priority = 5;
        let low = KeywordRule::new("low", "b", any_of(&["lease"]));
        let extractor = KeywordRuleExtractor::new(vec![low, high]);
        assert_eq!(extractor.match_sentence("The lease").unwrap().id, "high");
    }

    #[test]
    fn test_contains_all() {
        let extractor = KeywordRuleExtractor::new(vec![KeywordRule::new(
            "both",
            "x",
            RuleMatch {
                contains_all: Some(vec!["rent".to_string(), "deposit".to_string()]),
                ..Default::default()
            },
        )]);
        assert!(extractor.match_sentence("rent and deposit").is_some());
        assert!(extractor.match_sentence("rent only").is_none());
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let extractor = KeywordRuleExtractor::new(vec![KeywordRule::new(
            "broken",
            "x",
            RuleMatch {
                pattern: Some("(unclosed".to_string()),
                ..Default::default()
            },
        )]);
        assert!(extractor.match_sentence("(unclosed").is_none());
    }
}
