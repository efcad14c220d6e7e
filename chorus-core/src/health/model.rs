use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered from least to most severe, so `max` picks the worst.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum HealthSeverity {
    #[default]
    Ok,
    Notice,
    Warning,
    Error,
}

impl HealthSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthSeverity::Ok => "ok",
            HealthSeverity::Notice => "notice",
            HealthSeverity::Warning => "warning",
            HealthSeverity::Error => "error",
        }
    }
}

impl fmt::Display for HealthSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current diagnostic for one check type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub check_type: String,
    pub severity: HealthSeverity,
    pub message: String,
    pub help_link: Option<String>,
    pub computed_at: DateTime<Utc>,
}

impl HealthCheckResult {
    /// Change detection looks at severity and message only.
    pub fn differs_from(&self, other: &HealthCheckResult) -> bool {
        self.severity != other.severity || self.message != other.message
    }

    /// Differs from an implicit Ok with an empty message, the baseline for
    /// a check that has no cached result yet.
    pub fn differs_from_baseline(&self) -> bool {
        self.severity != HealthSeverity::Ok || !self.message.is_empty()
    }

    pub fn is_ok(&self) -> bool {
        self.severity == HealthSeverity::Ok
    }
}

/// What a check reports; the engine stamps type and time onto it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthCheckOutcome {
    pub severity: HealthSeverity,
    pub message: String,
    pub help_link: Option<String>,
}

impl HealthCheckOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::with_severity(HealthSeverity::Notice, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::with_severity(HealthSeverity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_severity(HealthSeverity::Error, message)
    }

    pub fn with_severity(severity: HealthSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            help_link: None,
        }
    }

    pub fn help_link(mut self, link: impl Into<String>) -> Self {
        self.help_link = Some(link.into());
        self
    }

    pub fn into_result(
        self,
        check_type: impl Into<String>,
        computed_at: DateTime<Utc>,
    ) -> HealthCheckResult {
        HealthCheckResult {
            check_type: check_type.into(),
            severity: self.severity,
            message: self.message,
            help_link: self.help_link,
            computed_at,
        }
    }
}
