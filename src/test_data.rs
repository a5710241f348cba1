//! Benchmark input records.
//!
//! A test data file is a JSON array of records:
//!
//! ```json
//! [
//!   { "message_id": 1, "message_name": "test_1", "message_value": ["0A1F", "FFFF", "0003"], "target": 0 }
//! ]
//! ```
//!
//! Older generators wrote `message_id` as either a number or a string and
//! `message_value` items as strings or numbers. Both shapes are accepted
//! here and normalized to strings; nothing past this module sees the raw
//! forms.

use crate::envelope::DataMessage;
use crate::sender::OutboundMessage;
use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// One normalized input record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestDataItem {
    pub message_id: String,
    pub message_name: String,
    pub message_value: Vec<String>,
    /// Missing in malformed files; reported by [`validate_test_data`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl TestDataItem {
    /// Turn the record into a sendable message whose payload is the
    /// binary-encoded [`DataMessage`]. Unrouted records go to target 0.
    pub fn to_outbound(&self) -> OutboundMessage {
        let payload = DataMessage::new(self.message_name.clone(), self.message_value.clone()).encode();
        OutboundMessage {
            message_id: Some(self.message_id.clone()),
            target: self.target.unwrap_or(0),
            payload,
            topic: None,
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ValueRepr {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl ValueRepr {
    fn into_string(self) -> String {
        match self {
            ValueRepr::Text(text) => text,
            ValueRepr::Number(number) => number.to_string(),
            ValueRepr::Bool(flag) => flag.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RawTestDataItem {
    message_id: IdRepr,
    #[serde(default)]
    message_name: String,
    #[serde(default)]
    message_value: Vec<ValueRepr>,
    #[serde(default)]
    target: Option<u32>,
    #[serde(default)]
    metadata: BTreeMap<String, ValueRepr>,
}

impl From<RawTestDataItem> for TestDataItem {
    fn from(raw: RawTestDataItem) -> Self {
        let message_id = match raw.message_id {
            IdRepr::Text(text) => text,
            IdRepr::Unsigned(n) => n.to_string(),
            IdRepr::Signed(n) => n.to_string(),
        };
        Self {
            message_id,
            message_name: raw.message_name,
            message_value: raw.message_value.into_iter().map(ValueRepr::into_string).collect(),
            target: raw.target,
            metadata: raw
                .metadata
                .into_iter()
                .map(|(key, value)| (key, value.into_string()))
                .collect(),
        }
    }
}

pub fn parse_test_data(text: &str) -> Result<Vec<TestDataItem>> {
    let raw: Vec<RawTestDataItem> =
        serde_json::from_str(text).context("Test data must be a JSON array of records")?;
    Ok(raw.into_iter().map(TestDataItem::from).collect())
}

pub fn load_test_data(path: &Path) -> Result<Vec<TestDataItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read test data from {}", path.display()))?;
    let items = parse_test_data(&text)
        .with_context(|| format!("Failed to parse test data in {}", path.display()))?;
    info!("Loaded {} test records from {}", items.len(), path.display());
    Ok(items)
}

/// A problem found in a test data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataIssue {
    MissingTarget { message_id: String },
    DuplicateId { message_id: String },
    TargetOutOfRange { message_id: String, target: u32, receivers: u32 },
}

impl fmt::Display for DataIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataIssue::MissingTarget { message_id } => {
                write!(f, "message {} has no target", message_id)
            }
            DataIssue::DuplicateId { message_id } => {
                write!(f, "message id {} appears more than once", message_id)
            }
            DataIssue::TargetOutOfRange {
                message_id,
                target,
                receivers,
            } => write!(
                f,
                "message {} targets receiver {} but only {} receivers exist",
                message_id, target, receivers
            ),
        }
    }
}

/// Check every record against a fleet of `receivers` receivers.
pub fn validate_test_data(items: &[TestDataItem], receivers: u32) -> Vec<DataIssue> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();

    for item in items {
        if !seen.insert(item.message_id.as_str()) {
            issues.push(DataIssue::DuplicateId {
                message_id: item.message_id.clone(),
            });
        }
        match item.target {
            None => issues.push(DataIssue::MissingTarget {
                message_id: item.message_id.clone(),
            }),
            Some(target) if target >= receivers => issues.push(DataIssue::TargetOutOfRange {
                message_id: item.message_id.clone(),
                target,
                receivers,
            }),
            Some(_) => {}
        }
    }

    issues
}

/// Generate `count` records spread round-robin over `receivers` receivers,
/// each carrying 3 to 32 random 16-bit hex values.
pub fn generate_test_data(count: usize, receivers: u32) -> Vec<TestDataItem> {
    let mut rng = rand::thread_rng();
    let receivers = receivers.max(1) as usize;

    (0..count)
        .map(|i| {
            let values = rng.gen_range(3..=32);
            TestDataItem {
                message_id: (i + 1).to_string(),
                message_name: format!("test_{}", i + 1),
                message_value: (0..values)
                    .map(|_| format!("{:04X}", rng.gen_range(0..=0xFFFFu32)))
                    .collect(),
                target: Some((i % receivers) as u32),
                metadata: BTreeMap::new(),
            }
        })
        .collect()
}

pub fn write_test_data(path: &Path, items: &[TestDataItem]) -> Result<()> {
    let json = serde_json::to_string_pretty(items).context("Failed to serialize test data")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write test data to {}", path.display()))?;
    debug!("Wrote {} test records to {}", items.len(), path.display());
    Ok(())
}
