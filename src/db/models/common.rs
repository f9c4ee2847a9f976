//! Common types shared between deployment and pipeline records.

use serde::{Deserialize, Serialize};

/// Severity of a quality or security finding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A structured quality-gate finding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Blocker {
    pub severity: Severity,
    /// Finding category (e.g. "security", "coverage", "complexity")
    #[serde(default)]
    pub category: String,
    pub message: String,
    /// Suggested remediation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Blocker {
    pub fn is_critical_security(&self) -> bool {
        self.severity == Severity::Critical && self.category == "security"
    }
}

/// Runtime metrics for a deployed application, as reported by the metrics backend
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApplicationMetrics {
    /// CPU usage in cores
    #[serde(default)]
    pub cpu: f64,
    /// Memory usage in bytes
    #[serde(default)]
    pub memory: f64,
    /// Fraction of failed requests (0.0 - 1.0)
    #[serde(default)]
    pub error_rate: f64,
    /// Average response time in milliseconds
    #[serde(default)]
    pub response_time_ms: f64,
    /// Requests per second
    #[serde(default)]
    pub request_rate: f64,
    #[serde(default)]
    pub pod_count: u32,
    #[serde(default)]
    pub ready_pods: u32,
}

/// Timestamp helper shared by all records
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Milliseconds elapsed between two RFC 3339 timestamps, if both parse
pub fn duration_ms(started_at: &str, finished_at: &str) -> Option<u64> {
    let start = chrono::DateTime::parse_from_rfc3339(started_at).ok()?;
    let end = chrono::DateTime::parse_from_rfc3339(finished_at).ok()?;
    u64::try_from((end - start).num_milliseconds()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn test_duration_ms() {
        let ms = duration_ms("2024-01-01T00:00:00Z", "2024-01-01T00:00:01.500Z");
        assert_eq!(ms, Some(1500));
        assert_eq!(duration_ms("garbage", "2024-01-01T00:00:00Z"), None);
        // Negative durations are not representable
        assert_eq!(duration_ms("2024-01-01T00:00:01Z", "2024-01-01T00:00:00Z"), None);
    }

    #[test]
    fn test_critical_security_blocker() {
        let blocker = Blocker {
            severity: Severity::Critical,
            category: "security".to_string(),
            message: "SQL injection".to_string(),
            remediation: None,
        };
        assert!(blocker.is_critical_security());

        let style = Blocker {
            severity: Severity::Critical,
            category: "style".to_string(),
            message: "too long".to_string(),
            remediation: None,
        };
        assert!(!style.is_critical_security());
    }
}
