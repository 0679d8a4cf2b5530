//! Regex-based detection provider.

use super::Classifier;
use crate::error::ClassificationError;
use pii_sampler_types::{Detection, PiiType};
use regex::Regex;
use serde_json::Value;

struct PatternRule {
    pii_type: PiiType,
    regex: Regex,
    base_confidence: f64,
    /// Added when the field name contains one of `hints`
    hint_boost: f64,
    hints: &'static [&'static str],
    validator: Option<fn(&str) -> bool>,
}

impl PatternRule {
    fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value) && self.validator.map_or(true, |check| check(value))
    }

    fn confidence(&self, field: &str) -> f64 {
        let field = field.to_ascii_lowercase();
        let hinted = self.hints.iter().any(|hint| field.contains(hint));
        let confidence = if hinted {
            self.base_confidence + self.hint_boost
        } else {
            self.base_confidence
        };
        confidence.min(1.0)
    }
}

type RuleSpec = (
    PiiType,
    &'static str,
    f64,
    f64,
    &'static [&'static str],
    Option<fn(&str) -> bool>,
);

const RULES: &[RuleSpec] = &[
    (
        PiiType::Email,
        r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$",
        0.95,
        0.05,
        &["email", "mail"],
        None,
    ),
    (PiiType::Ssn, r"^\d{3}-\d{2}-\d{4}$", 0.9, 0.1, &["ssn", "social"], None),
    (
        PiiType::PhoneNumber,
        r"^(\+?\d{1,3}[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}$",
        0.7,
        0.2,
        &["phone", "mobile", "tel"],
        None,
    ),
    (
        PiiType::CreditCard,
        r"^(?:\d{4}[-\s]?){3}\d{4}$",
        0.85,
        0.1,
        &["card", "cc_", "pan"],
        Some(luhn_valid),
    ),
    (
        PiiType::IpAddress,
        r"^(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)$",
        0.8,
        0.1,
        &["ip"],
        None,
    ),
    (PiiType::Iban, r"^[A-Z]{2}\d{2}[A-Z0-9]{11,30}$", 0.8, 0.15, &["iban", "account"], None),
    (PiiType::AwsAccessKey, r"^(?:AKIA|ASIA)[0-9A-Z]{16}$", 0.95, 0.0, &["aws", "access_key"], None),
    (
        PiiType::DateOfBirth,
        r"^(?:19|20)\d{2}-(?:0[1-9]|1[0-2])-(?:0[1-9]|[12]\d|3[01])$",
        0.5,
        0.35,
        &["dob", "birth"],
        None,
    ),
    (
        PiiType::MacAddress,
        r"^(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$",
        0.85,
        0.1,
        &["mac"],
        None,
    ),
    (
        PiiType::Name,
        r"^[A-Z][a-z]+(?:\s+[A-Z][a-z]+)+$",
        0.4,
        0.35,
        &["name"],
        None,
    ),
    (
        PiiType::Address,
        r"^\d+\s+[A-Za-z0-9.\s]+\s(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr)\.?$",
        0.6,
        0.25,
        &["address", "street"],
        None,
    ),
];

/// Luhn checksum over the digits of `value`.
fn luhn_valid(value: &str) -> bool {
    let digits: Vec<u32> = value.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Built-in provider matching well-known PII formats.
pub struct PatternClassifier {
    rules: Vec<PatternRule>,
}

impl PatternClassifier {
    /// Build a classifier for `enabled` types, or every type when empty.
    pub fn new(enabled: &[PiiType]) -> Result<Self, ClassificationError> {
        let mut rules = Vec::new();
        for (pii_type, pattern, base_confidence, hint_boost, hints, validator) in RULES {
            if !enabled.is_empty() && !enabled.contains(pii_type) {
                continue;
            }
            let regex = Regex::new(pattern).map_err(|e| ClassificationError::InvalidPattern {
                name: pii_type.to_string(),
                reason: e.to_string(),
            })?;
            rules.push(PatternRule {
                pii_type: *pii_type,
                regex,
                base_confidence: *base_confidence,
                hint_boost: *hint_boost,
                hints: *hints,
                validator: *validator,
            });
        }
        Ok(Self { rules })
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Classifier for PatternClassifier {
    fn name(&self) -> &str {
        "pattern"
    }

    fn classify(&self, field: &str, samples: &[Value]) -> Result<Vec<Detection>, ClassificationError> {
        let texts: Vec<String> = samples.iter().filter_map(as_text).collect();
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self
            .rules
            .iter()
            .filter_map(|rule| {
                let matched = texts.iter().filter(|t| rule.matches(t)).count();
                (matched > 0).then(|| Detection {
                    pii_type: rule.pii_type,
                    confidence: rule.confidence(field),
                    matched_samples: matched,
                })
            })
            .collect())
    }
}
