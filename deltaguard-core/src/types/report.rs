use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static CVE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)CVE-\d{4}-\d{4,7}").expect("valid CVE pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Aggregate severity counts stored on the job when it finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeveritySummary {
    pub total_findings: u32,
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl SeveritySummary {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let count = |level: &str| {
            findings
                .iter()
                .filter(|finding| {
                    finding
                        .severity
                        .as_deref()
                        .is_some_and(|sev| sev.to_ascii_lowercase().contains(level))
                })
                .count() as u32
        };
        Self {
            total_findings: findings.len() as u32,
            critical: count("critical"),
            high: count("high"),
            medium: count("medium"),
            low: count("low"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    source_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    findings: Vec<RawFinding>,
    #[serde(default)]
    summary: Option<Value>,
}

/// Primary output of the scan process.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub findings: Vec<Finding>,
    /// Summary exactly as the scanner reported it, when it did.
    pub reported_summary: Option<Value>,
}

impl ScanReport {
    /// Parses scanner stdout. JSON output is preferred; plain text falls back
    /// to extracting CVE identifiers line by line. Returns `None` when nothing
    /// recognisable was found.
    pub fn parse(output: &str) -> Option<Self> {
        match serde_json::from_str::<RawReport>(output) {
            Ok(raw) => Some(Self::from_raw(raw)),
            Err(_) => Self::parse_text(output),
        }
    }

    fn from_raw(raw: RawReport) -> Self {
        let findings = raw
            .findings
            .into_iter()
            .map(|finding| Finding {
                id: match finding.id {
                    Some(Value::String(id)) => id,
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                },
                title: finding.title,
                description: finding.description,
                severity: finding.severity,
                source: finding.source_ids.into_iter().next(),
            })
            .collect();
        Self {
            findings,
            reported_summary: raw.summary.filter(|summary| !summary.is_null()),
        }
    }

    fn parse_text(output: &str) -> Option<Self> {
        let findings: Vec<Finding> = output
            .lines()
            .filter_map(|line| {
                let id = CVE_PATTERN.find(line)?.as_str().to_string();
                let description = line
                    .split_once(':')
                    .map(|(_, rest)| rest.trim())
                    .filter(|rest| !rest.is_empty())
                    .map(str::to_string);
                Some(Finding {
                    id,
                    title: None,
                    description,
                    severity: None,
                    source: Some("NVD".to_string()),
                })
            })
            .collect();

        if findings.is_empty() {
            None
        } else {
            Some(Self {
                findings,
                reported_summary: None,
            })
        }
    }

    pub fn severity_summary(&self) -> SeveritySummary {
        SeveritySummary::from_findings(&self.findings)
    }

    /// Summary payload stored on the job: the scanner's own summary when
    /// present, otherwise counts derived from the findings.
    pub fn summary_value(&self) -> Value {
        match &self.reported_summary {
            Some(summary) => summary.clone(),
            None => serde_json::to_value(self.severity_summary()).unwrap_or(Value::Null),
        }
    }
}
