//! Regex keyword matching over raw page HTML.

use crate::domain::model::Classification;
use crate::domain::ports::Classifier;
use crate::utils::error::{MonitorError, Result};
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

pub const DEFAULT_IN_STOCK_PATTERNS: &[&str] = &[
    r"(?i)add\s+to\s+(cart|basket|bag)",
    r"(?i)\bin\s+stock\b",
    r"(?i)buy\s+now",
    r"(?i)available\s+for\s+(delivery|pickup)",
];

pub const DEFAULT_OUT_OF_STOCK_PATTERNS: &[&str] = &[
    r"(?i)out\s+of\s+stock",
    r"(?i)sold\s+out",
    r"(?i)currently\s+unavailable",
    r"(?i)notify\s+me\s+when\s+available",
    r"(?i)back\s*order",
];

/// What to report when neither pattern list matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguityPolicy {
    /// Report out of stock; a missed alert is cheaper than a false one.
    #[default]
    Conservative,
    Optimistic,
}

#[derive(Debug, Clone, Default)]
pub struct KeywordRules {
    pub in_stock: Vec<String>,
    pub out_of_stock: Vec<String>,
    pub ambiguity: AmbiguityPolicy,
    /// URL substrings that are always reported in stock.
    pub force_in_stock: Vec<String>,
    /// URL substrings that are always reported out of stock.
    pub force_out_of_stock: Vec<String>,
}

impl KeywordRules {
    pub fn with_defaults() -> Self {
        Self {
            in_stock: DEFAULT_IN_STOCK_PATTERNS.iter().map(|p| p.to_string()).collect(),
            out_of_stock: DEFAULT_OUT_OF_STOCK_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            ..Default::default()
        }
    }
}

pub struct KeywordClassifier {
    in_stock: RegexSet,
    out_of_stock: RegexSet,
    ambiguity: AmbiguityPolicy,
    force_in_stock: Vec<String>,
    force_out_of_stock: Vec<String>,
    title: Regex,
    og_title: Regex,
    price: Regex,
    tags: Regex,
}

fn compile_set(field: &str, patterns: &[String]) -> Result<RegexSet> {
    RegexSet::new(patterns).map_err(|e| MonitorError::InvalidConfigValueError {
        field: field.to_string(),
        value: patterns.join(", "),
        reason: e.to_string(),
    })
}

fn builtin(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| MonitorError::ClassificationError {
        url: String::new(),
        message: e.to_string(),
    })
}

impl KeywordClassifier {
    pub fn new(rules: KeywordRules) -> Result<Self> {
        Ok(Self {
            in_stock: compile_set("classifier.in_stock_patterns", &rules.in_stock)?,
            out_of_stock: compile_set("classifier.out_of_stock_patterns", &rules.out_of_stock)?,
            ambiguity: rules.ambiguity,
            force_in_stock: rules.force_in_stock,
            force_out_of_stock: rules.force_out_of_stock,
            title: builtin(r"(?is)<title[^>]*>(.*?)</title>")?,
            og_title: builtin(
                r#"(?is)<meta[^>]+property=["']og:title["'][^>]+content=["']([^"']*)["']"#,
            )?,
            price: builtin(r"(?:[$€£¥]\s?\d[\d,]*(?:\.\d{1,2})?|\d[\d,]*(?:\.\d{1,2})?\s?(?:USD|EUR|GBP))")?,
            tags: builtin(r"(?s)<script.*?</script>|<style.*?</style>|<[^>]+>")?,
        })
    }

    fn extract_title(&self, content: &str) -> Option<String> {
        let raw = self
            .og_title
            .captures(content)
            .or_else(|| self.title.captures(content))?
            .get(1)?
            .as_str();
        let title = decode_entities(raw.split_whitespace().collect::<Vec<_>>().join(" "));
        (!title.is_empty()).then_some(title)
    }

    fn override_for(&self, url: &str) -> Option<bool> {
        if self.force_out_of_stock.iter().any(|p| url.contains(p.as_str())) {
            Some(false)
        } else if self.force_in_stock.iter().any(|p| url.contains(p.as_str())) {
            Some(true)
        } else {
            None
        }
    }
}

/// `&amp;` goes last so an escaped entity such as `&amp;lt;` stays `&lt;`.
fn decode_entities(text: String) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

impl Classifier for KeywordClassifier {
    fn classify(&self, content: &str, url: &str) -> Classification {
        let title = self.extract_title(content).unwrap_or_else(|| url.to_string());
        let text = self.tags.replace_all(content, " ");
        let price = self.price.find(&text).map(|m| m.as_str().trim().to_string());

        if let Some(in_stock) = self.override_for(url) {
            return Classification {
                in_stock,
                title,
                price,
                confidence_note: Some("forced by URL override".to_string()),
            };
        }

        // out-of-stock wording wins: such pages often keep a disabled cart button
        let (in_stock, confidence_note) = match (
            self.in_stock.is_match(&text),
            self.out_of_stock.is_match(&text),
        ) {
            (_, true) => (false, None),
            (true, false) => (true, None),
            (false, false) => match self.ambiguity {
                AmbiguityPolicy::Conservative => (
                    false,
                    Some("no stock keywords found, assuming out of stock".to_string()),
                ),
                AmbiguityPolicy::Optimistic => (
                    true,
                    Some("no stock keywords found, assuming in stock".to_string()),
                ),
            },
        };

        Classification {
            in_stock,
            title,
            price,
            confidence_note,
        }
    }
}
