//! PII detection results

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of personal data a provider can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiiType {
    Email,
    PhoneNumber,
    Ssn,
    CreditCard,
    IpAddress,
    Iban,
    AwsAccessKey,
    DateOfBirth,
    MacAddress,
    Name,
    Address,
}

impl PiiType {
    pub const ALL: [PiiType; 11] = [
        PiiType::Email,
        PiiType::PhoneNumber,
        PiiType::Ssn,
        PiiType::CreditCard,
        PiiType::IpAddress,
        PiiType::Iban,
        PiiType::AwsAccessKey,
        PiiType::DateOfBirth,
        PiiType::MacAddress,
        PiiType::Name,
        PiiType::Address,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PiiType::Email => "EMAIL",
            PiiType::PhoneNumber => "PHONE_NUMBER",
            PiiType::Ssn => "SSN",
            PiiType::CreditCard => "CREDIT_CARD",
            PiiType::IpAddress => "IP_ADDRESS",
            PiiType::Iban => "IBAN",
            PiiType::AwsAccessKey => "AWS_ACCESS_KEY",
            PiiType::DateOfBirth => "DATE_OF_BIRTH",
            PiiType::MacAddress => "MAC_ADDRESS",
            PiiType::Name => "NAME",
            PiiType::Address => "ADDRESS",
        }
    }

    /// Schema tag attached to fields holding this type
    pub fn tag(&self) -> &'static str {
        match self {
            PiiType::Email => "PII-Email",
            PiiType::PhoneNumber => "PII-Phone-Number",
            PiiType::Ssn => "PII-SSN",
            PiiType::CreditCard => "PII-Credit-Card",
            PiiType::IpAddress => "PII-IP-Address",
            PiiType::Iban => "PII-IBAN",
            PiiType::AwsAccessKey => "PII-AWS-Access-Key",
            PiiType::DateOfBirth => "PII-Date-Of-Birth",
            PiiType::MacAddress => "PII-MAC-Address",
            PiiType::Name => "PII-Name",
            PiiType::Address => "PII-Address",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for PiiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider finding for a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub pii_type: PiiType,
    pub confidence: f64,
    /// How many of the supplied samples matched
    pub matched_samples: usize,
}

/// Final verdict for a field after thresholds are applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldClassification {
    pub field: String,
    pub pii_types: Vec<PiiType>,
    pub confidence: f64,
    pub detection_rate: f64,
    pub tags: Vec<String>,
}

impl FieldClassification {
    pub fn new(field: impl Into<String>, detections: &[Detection], sample_count: usize) -> Self {
        let mut pii_types: Vec<PiiType> = detections.iter().map(|d| d.pii_type).collect();
        pii_types.sort();
        pii_types.dedup();

        let confidence = detections
            .iter()
            .map(|d| d.confidence)
            .fold(0.0_f64, f64::max);
        let matched = detections.iter().map(|d| d.matched_samples).max().unwrap_or(0);
        let detection_rate = if sample_count == 0 {
            0.0
        } else {
            matched as f64 / sample_count as f64
        };

        let mut tags = Vec::with_capacity(pii_types.len() + 1);
        if !pii_types.is_empty() {
            tags.push("PII".to_string());
        }
        tags.extend(pii_types.iter().map(|t| t.tag().to_string()));

        Self {
            field: field.into(),
            pii_types,
            confidence,
            detection_rate,
            tags,
        }
    }
}
