//! Lead qualification rules for the sale analysis verdict.

use regex::Regex;

use crate::types::SaleAnalysis;

const MIN_CONFIDENCE: f64 = 0.3;

/// A verdict produces a lead only above the confidence floor; the email
/// requirement is checked separately against the visitor's own words.
pub fn qualifies(analysis: &SaleAnalysis) -> bool {
    analysis.has_potential_sale && analysis.confidence_score > MIN_CONFIDENCE
}

/// First email address present in the visitor's message, if any.
pub fn extract_email(text: &str) -> Option<String> {
    let pattern = Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").ok()?;
    pattern.find(text).map(|m| m.as_str().to_string())
}
