use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumIter, EnumString};

/// Aggregation level of a view; decides which label provides the entity key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Level {
    #[default]
    Pod,
    Namespace,
    Node,
    Cluster,
}

impl Level {
    pub fn parse(raw: &str) -> Result<Self> {
        Level::from_str(raw.trim()).map_err(|_| {
            PodlensError::validation(format!(
                "level must be one of pod|namespace|node|cluster, got `{raw}`"
            ))
        })
    }

    /// Label that carries the entity key, `None` for the cluster level.
    pub fn key_label(self) -> Option<&'static str> {
        match self {
            Level::Pod => Some("pod"),
            Level::Namespace => Some("namespace"),
            Level::Node => Some("node"),
            Level::Cluster => None,
        }
    }

    pub fn group_by(self) -> &'static str {
        match self {
            Level::Pod => "by (pod, namespace)",
            Level::Namespace => "by (namespace)",
            Level::Node => "by (node)",
            Level::Cluster => "",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
}

impl MetricKind {
    pub fn parse(raw: &str) -> Result<Self> {
        MetricKind::from_str(raw.trim()).map_err(|_| {
            PodlensError::validation(format!("metric must be one of cpu|memory, got `{raw}`"))
        })
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LatencyDirection {
    Inbound,
    Outbound,
    Combined,
}

impl LatencyDirection {
    pub fn parse(raw: &str) -> Result<Self> {
        LatencyDirection::from_str(raw.trim()).map_err(|_| {
            PodlensError::validation(format!(
                "direction must be one of inbound|outbound|combined, got `{raw}`"
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl WindowUnit {
    fn suffix(self) -> char {
        match self {
            WindowUnit::Seconds => 's',
            WindowUnit::Minutes => 'm',
            WindowUnit::Hours => 'h',
            WindowUnit::Days => 'd',
        }
    }

    fn seconds(self) -> u64 {
        match self {
            WindowUnit::Seconds => 1,
            WindowUnit::Minutes => 60,
            WindowUnit::Hours => 3_600,
            WindowUnit::Days => 86_400,
        }
    }
}

/// Trailing window of an instant query, `{integer}{s|m|h|d}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub amount: u64,
    pub unit: WindowUnit,
}

impl TimeWindow {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || {
            PodlensError::validation(format!(
                "time window must match {{integer}}{{s|m|h|d}}, got `{raw}`"
            ))
        };
        let raw_trimmed = raw.trim();
        let mut chars = raw_trimmed.chars();
        let unit = match chars.next_back().ok_or_else(invalid)? {
            's' => WindowUnit::Seconds,
            'm' => WindowUnit::Minutes,
            'h' => WindowUnit::Hours,
            'd' => WindowUnit::Days,
            _ => return Err(invalid()),
        };
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let amount: u64 = digits.parse().map_err(|_| invalid())?;
        if amount == 0 {
            return Err(invalid());
        }
        Ok(TimeWindow { amount, unit })
    }

    pub fn as_secs(&self) -> u64 {
        self.amount.saturating_mul(self.unit.seconds())
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        TimeWindow {
            amount: 5,
            unit: WindowUnit::Minutes,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

/// `(start, end, step)` of a historical query. Start and end are unix seconds
/// and may be fractional, the step is a whole number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeParams {
    pub start: f64,
    pub end: f64,
    pub step: u64,
}

impl RangeParams {
    pub fn parse(start: &str, end: &str, step: &str) -> Result<Self> {
        let start = parse_seconds("start", start)?;
        let end = parse_seconds("end", end)?;
        let step_trimmed = step.trim();
        if step_trimmed.is_empty() || !step_trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PodlensError::validation(format!(
                "step must be an integer number of seconds, got `{step}`"
            )));
        }
        let step: u64 = step_trimmed.parse().map_err(|_| {
            PodlensError::validation(format!("step is out of range: `{step_trimmed}`"))
        })?;
        Self::new(start, end, step)
    }

    pub fn new(start: f64, end: f64, step: u64) -> Result<Self> {
        if !start.is_finite() || !end.is_finite() {
            return Err(PodlensError::validation("start and end must be finite"));
        }
        if end <= start {
            return Err(PodlensError::validation(format!(
                "end ({end}) must be greater than start ({start})"
            )));
        }
        if step == 0 {
            return Err(PodlensError::validation("step must be positive"));
        }
        Ok(RangeParams { start, end, step })
    }

    /// Range ending at `end` and reaching `span_secs` back.
    pub fn trailing(end: f64, span_secs: u64, step: u64) -> Result<Self> {
        Self::new(end - span_secs as f64, end, step)
    }
}

fn parse_seconds(name: &str, raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    let mut seen_dot = false;
    let well_formed = !trimmed.is_empty()
        && trimmed.bytes().enumerate().all(|(idx, b)| match b {
            b'0'..=b'9' => true,
            b'.' if !seen_dot => {
                seen_dot = true;
                true
            }
            b'-' => idx == 0,
            _ => false,
        });
    if !well_formed {
        return Err(PodlensError::validation(format!(
            "{name} must be numeric seconds, got `{raw}`"
        )));
    }
    trimmed
        .parse::<f64>()
        .map_err(|_| PodlensError::validation(format!("{name} must be numeric seconds, got `{raw}`")))
}

/// Namespace filter accepted by the metrics views. Kubernetes names are
/// DNS-1123 labels, which also keeps the value safe inside a PromQL matcher.
pub fn validate_namespace(raw: &str) -> Result<&str> {
    let ok = !raw.is_empty()
        && raw.len() <= 63
        && raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !raw.starts_with('-')
        && !raw.ends_with('-');
    if ok {
        Ok(raw)
    } else {
        Err(PodlensError::validation(format!(
            "namespace `{raw}` is not a valid Kubernetes name"
        )))
    }
}

/// Object names (pods, deployments) as they may appear in a URL path.
pub fn validate_object_name(raw: &str) -> Result<&str> {
    let ok = !raw.is_empty()
        && raw.len() <= 253
        && raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.');
    if ok {
        Ok(raw)
    } else {
        Err(PodlensError::validation(format!(
            "`{raw}` is not a valid Kubernetes object name"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_accepts_known_values_only() {
        assert_eq!(Level::parse("pod").unwrap(), Level::Pod);
        assert_eq!(Level::parse("cluster").unwrap(), Level::Cluster);
        assert!(Level::parse("deployment").unwrap_err().is_validation());
        assert!(Level::parse("").is_err());
    }

    #[test]
    fn metric_kind_is_cpu_or_memory() {
        assert_eq!(MetricKind::parse("memory").unwrap(), MetricKind::Memory);
        assert!(MetricKind::parse("disk").is_err());
    }

    #[test]
    fn time_window_parses_all_units() {
        assert_eq!(TimeWindow::parse("30s").unwrap().as_secs(), 30);
        assert_eq!(TimeWindow::parse("5m").unwrap().as_secs(), 300);
        assert_eq!(TimeWindow::parse("2h").unwrap().as_secs(), 7_200);
        assert_eq!(TimeWindow::parse("1d").unwrap().as_secs(), 86_400);
        assert_eq!(TimeWindow::parse("15m").unwrap().to_string(), "15m");
    }

    #[test]
    fn time_window_rejects_malformed_input() {
        for raw in ["", "m", "5", "5w", "-5m", "1.5h", "5 m", "0s", "5m;sum(up)"] {
            assert!(TimeWindow::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn range_accepts_fractional_bounds() {
        let range = RangeParams::parse("1700000000.5", "1700003600", "60").unwrap();
        assert_eq!(range.start, 1_700_000_000.5);
        assert_eq!(range.step, 60);
    }

    #[test]
    fn range_rejects_bad_values() {
        assert!(RangeParams::parse("abc", "10", "1").is_err());
        assert!(RangeParams::parse("10", "5", "1").is_err());
        assert!(RangeParams::parse("0", "10", "1.5").is_err());
        assert!(RangeParams::parse("0", "10", "0").is_err());
        assert!(RangeParams::parse("1e9", "2e9", "60").is_err());
    }

    #[test]
    fn namespace_must_be_dns_label() {
        assert!(validate_namespace("team-a").is_ok());
        assert!(validate_namespace("Team").is_err());
        assert!(validate_namespace("a\"}").is_err());
    }
}
