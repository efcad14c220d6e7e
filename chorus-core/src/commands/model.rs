use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{CoreError, Result},
    events::CommandSummary,
    types::ids::CommandId,
};

/// Lifecycle states of a command. Queued and Started are the only
/// non-terminal states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    Queued,
    Started,
    Completed,
    Failed,
    Aborted,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "queued",
            CommandStatus::Started => "started",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(CommandStatus::Queued),
            "started" => Ok(CommandStatus::Started),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            "aborted" => Ok(CommandStatus::Aborted),
            other => Err(CoreError::InvalidParameters(format!(
                "unknown command status `{other}`"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CommandTrigger {
    Manual,
    Scheduled,
}

impl CommandTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandTrigger::Manual => "manual",
            CommandTrigger::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for CommandTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandTrigger {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(CommandTrigger::Manual),
            "scheduled" => Ok(CommandTrigger::Scheduled),
            other => Err(CoreError::InvalidParameters(format!(
                "unknown command trigger `{other}`"
            ))),
        }
    }
}

/// Ordered parameter mapping. Keys iterate in sorted order, which makes the
/// serialized form canonical and usable as part of a dedupe key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandParameters(BTreeMap<String, Value>);

impl CommandParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Integer list parameter such as `albumIds`. A non-array or a
    /// non-integer element is rejected.
    pub fn get_i64_list(&self, key: &str) -> Result<Option<Vec<i64>>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let items = value.as_array().ok_or_else(|| {
            CoreError::InvalidParameters(format!("`{key}` must be an array"))
        })?;
        items
            .iter()
            .map(|item| {
                item.as_i64().ok_or_else(|| {
                    CoreError::InvalidParameters(format!(
                        "`{key}` must only contain integers"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Accepts a JSON object; anything else is invalid.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            Value::Null => Ok(Self::default()),
            other => Err(CoreError::InvalidParameters(format!(
                "parameters must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }

    /// Stable textual form: sorted keys, no whitespace.
    pub fn canonical(&self) -> String {
        self.to_json().to_string()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for CommandParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Identity of a unit of work: command name plus canonical parameters.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DedupeKey(String);

impl DedupeKey {
    pub fn new(name: &str, parameters: &CommandParameters) -> Self {
        Self(format!("{name}:{}", parameters.canonical()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal outcome recorded on a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandResult {
    Succeeded {
        #[serde(default)]
        output: Value,
    },
    Failed {
        message: String,
        /// Cause chain or panic location, when available.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    Aborted {
        reason: String,
    },
}

impl CommandResult {
    /// Failure or abort reason; `None` on success.
    pub fn reason(&self) -> Option<&str> {
        match self {
            CommandResult::Succeeded { .. } => None,
            CommandResult::Failed { message, .. } => Some(message),
            CommandResult::Aborted { reason } => Some(reason),
        }
    }
}

/// One command execution as tracked by the scheduler and persisted by the
/// store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub name: String,
    pub parameters: CommandParameters,
    pub status: CommandStatus,
    pub trigger: CommandTrigger,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Latest progress message reported by the handler.
    pub message: Option<String>,
    pub result: Option<CommandResult>,
}

impl CommandRecord {
    pub fn queued(
        name: impl Into<String>,
        parameters: CommandParameters,
        trigger: CommandTrigger,
    ) -> Self {
        Self {
            id: CommandId::new(),
            name: name.into(),
            parameters,
            status: CommandStatus::Queued,
            trigger,
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            message: None,
            result: None,
        }
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey::new(&self.name, &self.parameters)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time between start and end. Commands aborted while queued have
    /// no duration.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(started), Some(ended)) => Some(ended - started),
            _ => None,
        }
    }

    pub fn summary(&self) -> CommandSummary {
        CommandSummary {
            command_id: self.id,
            name: self.name.clone(),
            trigger: self.trigger,
            status: self.status,
        }
    }

    pub(crate) fn mark_started(&mut self, at: DateTime<Utc>) {
        self.status = CommandStatus::Started;
        self.started_at = Some(at);
    }

    pub(crate) fn finish(&mut self, result: CommandResult, at: DateTime<Utc>) {
        self.status = match &result {
            CommandResult::Succeeded { .. } => CommandStatus::Completed,
            CommandResult::Failed { .. } => CommandStatus::Failed,
            CommandResult::Aborted { .. } => CommandStatus::Aborted,
        };
        self.ended_at = Some(at);
        self.result = Some(result);
    }
}

/// Selection applied by `list`. Empty filters match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandFilter {
    pub name: Option<String>,
    pub statuses: Vec<CommandStatus>,
    pub limit: Option<usize>,
}

impl CommandFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Queued and Started commands only.
    pub fn active() -> Self {
        Self::default()
            .with_status(CommandStatus::Queued)
            .with_status(CommandStatus::Started)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_status(mut self, status: CommandStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &CommandRecord) -> bool {
        let name_ok = self
            .name
            .as_deref()
            .is_none_or(|name| name.eq_ignore_ascii_case(&record.name));
        let status_ok =
            self.statuses.is_empty() || self.statuses.contains(&record.status);
        name_ok && status_ok
    }
}
