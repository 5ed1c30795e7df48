use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Run label used when a card is written without one.
pub const DEFAULT_RUN: &str = "default";

/// Default blocking-show timeout in seconds.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bind: {0}")]
    Bind(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("transport: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Table,
    Chart,
    Markdown,
    KeyValue,
    Section,
}

impl CardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardKind::Table => "table",
            CardKind::Chart => "chart",
            CardKind::Markdown => "markdown",
            CardKind::KeyValue => "key_value",
            CardKind::Section => "section",
        }
    }
}

impl std::str::FromStr for CardKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "table" => Ok(CardKind::Table),
            "chart" => Ok(CardKind::Chart),
            "markdown" => Ok(CardKind::Markdown),
            "key_value" => Ok(CardKind::KeyValue),
            "section" => Ok(CardKind::Section),
            other => Err(Error::Validation(format!("unknown card kind: {other}"))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    #[default]
    Append,
    Top,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Append => "append",
            Position::Top => "top",
        }
    }
}

impl std::str::FromStr for Position {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "append" => Ok(Position::Append),
            "top" => Ok(Position::Top),
            other => Err(Error::Validation(format!("unknown position: {other}"))),
        }
    }
}

/// A stored card as returned by reads and pushed over SSE.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct Card {
    pub id: String,
    pub kind: CardKind,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub run: String,
    pub position: Position,
    pub created: String,
    pub interactive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_send: Option<String>,
}

/// A card write request from the calling process.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct CardSubmission {
    pub kind: Option<CardKind>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    /// Reuse an existing card id instead of appending.
    #[serde(default)]
    pub replace: Option<String>,
    /// Fail a replace whose id is unknown instead of appending.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub on_send: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct RunSummary {
    pub label: String,
    pub created: String,
    pub last_activity: String,
    pub card_count: u64,
}

/// Durable record of a user-initiated "send to agent" action.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct PendingRequest {
    pub id: String,
    pub card_id: String,
    pub run: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    pub created: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum UiAction {
    Confirm,
    Skip,
    Send,
    Click,
    Select,
}

/// An inbound browser event against a card.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct UiEvent {
    pub card_id: String,
    pub action: UiAction,
    #[serde(default)]
    pub message: Option<String>,
    /// Tabular selection carried by confirm/send/select actions.
    #[serde(default)]
    pub selection: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeAction {
    Confirm,
    Skip,
    Timeout,
}

/// Result of a blocking show. Timeout is a normal outcome, not an error.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ShowOutcome {
    pub action: OutcomeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
}

impl ShowOutcome {
    pub fn timeout() -> Self {
        Self {
            action: OutcomeAction::Timeout,
            message: None,
            summary: "no response before timeout".into(),
            artifact_id: None,
        }
    }
}

/// Status block served at /about and consumed by `server_status`.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct About {
    pub service: String,
    pub version: String,
    pub pid: u32,
    pub port: u16,
    pub uptime_secs: u64,
    pub runs: u64,
}

/// Minimal shape validation for a card payload. Content stays opaque
/// beyond this.
pub fn validate_card(kind: CardKind, payload: &Value, title: Option<&str>) -> Result<()> {
    match kind {
        CardKind::Table => validate_table(payload),
        CardKind::Chart => match payload {
            Value::Object(_) => Ok(()),
            _ => Err(Error::Validation("chart payload must be an object spec".into())),
        },
        CardKind::Markdown => match payload {
            Value::String(_) => Ok(()),
            Value::Object(map) => match map.get("text") {
                Some(Value::String(_)) => Ok(()),
                _ => Err(Error::Validation(
                    "markdown payload must be a string or carry a \"text\" string".into(),
                )),
            },
            _ => Err(Error::Validation(
                "markdown payload must be a string or carry a \"text\" string".into(),
            )),
        },
        CardKind::KeyValue => match payload {
            Value::Object(map) => {
                for (k, v) in map {
                    if v.is_object() || v.is_array() {
                        return Err(Error::Validation(format!(
                            "key_value payload must be flat; key {k:?} holds a nested value"
                        )));
                    }
                }
                Ok(())
            }
            _ => Err(Error::Validation("key_value payload must be a flat object".into())),
        },
        CardKind::Section => {
            if title.map(|t| !t.trim().is_empty()).unwrap_or(false) {
                Ok(())
            } else {
                Err(Error::Validation("section cards require a title".into()))
            }
        }
    }
}

fn validate_table(payload: &Value) -> Result<()> {
    let Value::Object(map) = payload else {
        return Err(Error::Validation("table payload must be an object".into()));
    };
    let columns = match map.get("columns") {
        Some(Value::Array(cols)) if !cols.is_empty() => cols,
        _ => {
            return Err(Error::Validation(
                "table payload must name at least one column".into(),
            ))
        }
    };
    for col in columns {
        let named = match col {
            Value::String(s) => !s.is_empty(),
            Value::Object(c) => matches!(c.get("name"), Some(Value::String(s)) if !s.is_empty()),
            _ => false,
        };
        if !named {
            return Err(Error::Validation("table columns must be named".into()));
        }
    }
    let rows = match map.get("rows") {
        Some(Value::Array(rows)) => rows,
        None => return Ok(()),
        _ => return Err(Error::Validation("table rows must be an array".into())),
    };
    for row in rows {
        let homogeneous = match row {
            Value::Array(cells) => cells.len() == columns.len(),
            Value::Object(_) => true,
            _ => false,
        };
        if !homogeneous {
            return Err(Error::Validation(
                "table rows must be records or arrays matching the column count".into(),
            ));
        }
    }
    Ok(())
}

/// Parse a run-age cutoff such as "7d", "24h", "90m", "30s". A bare
/// integer is read as days; "0d" means every run regardless of age.
pub fn parse_older_than(input: &str) -> Result<chrono::Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::Validation("empty duration".into()));
    }
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "d"),
    };
    let n: i64 = digits
        .parse()
        .map_err(|_| Error::Validation(format!("bad duration: {input:?}")))?;
    let dur = match unit {
        "d" => chrono::Duration::try_days(n),
        "h" => chrono::Duration::try_hours(n),
        "m" => chrono::Duration::try_minutes(n),
        "s" => chrono::Duration::try_seconds(n),
        _ => return Err(Error::Validation(format!("bad duration unit: {input:?}"))),
    };
    dur.ok_or_else(|| Error::Validation(format!("duration out of range: {input:?}")))
}
