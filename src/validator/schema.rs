//! Per-entity schema definitions
//!
//! Each entity is checked as JSON against a declarative list of field
//! rules: presence, type, string length, numeric range, allowed values and
//! format. Nested fields use dotted paths (`preferences.theme`).

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveTime};
use regex::Regex;
use serde_json::Value;

use crate::model::parse_timestamp;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid")
});

/// Expected JSON type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// JSON string
    String,
    /// JSON integer
    Integer,
    /// Any JSON number
    Number,
    /// JSON boolean
    Boolean,
    /// JSON object
    Object,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
        }
    }
}

/// String format validators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// ISO-8601 timestamp
    Timestamp,
    /// Calendar date `YYYY-MM-DD`
    Date,
    /// Clock time `HH:MM` or `HH:MM:SS`
    Time,
    /// Email address
    Email,
}

impl Format {
    /// Whether `value` satisfies the format
    pub fn check(self, value: &str) -> bool {
        match self {
            Self::Timestamp => parse_timestamp(value).is_some(),
            Self::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
            Self::Time => {
                NaiveTime::parse_from_str(value, "%H:%M").is_ok()
                    || NaiveTime::parse_from_str(value, "%H:%M:%S").is_ok()
            }
            Self::Email => EMAIL_RE.is_match(value),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Timestamp => "ISO-8601 timestamp",
            Self::Date => "date (YYYY-MM-DD)",
            Self::Time => "time (HH:MM)",
            Self::Email => "email address",
        }
    }
}

/// Rules for one field
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Dotted field path
    pub path: &'static str,
    /// Expected type
    pub field_type: FieldType,
    /// Must be present, non-null and (for strings) non-empty
    pub required: bool,
    /// Minimum string length
    pub min_len: Option<usize>,
    /// Maximum string length
    pub max_len: Option<usize>,
    /// Minimum numeric value
    pub min: Option<f64>,
    /// Maximum numeric value
    pub max: Option<f64>,
    /// Allowed string values
    pub allowed: Option<&'static [&'static str]>,
    /// String format
    pub format: Option<Format>,
}

impl FieldSpec {
    fn new(path: &'static str, field_type: FieldType) -> Self {
        Self {
            path,
            field_type,
            required: false,
            min_len: None,
            max_len: None,
            min: None,
            max: None,
            allowed: None,
            format: None,
        }
    }

    /// String field
    pub fn string(path: &'static str) -> Self {
        Self::new(path, FieldType::String)
    }

    /// Integer field
    pub fn integer(path: &'static str) -> Self {
        Self::new(path, FieldType::Integer)
    }

    /// Boolean field
    pub fn boolean(path: &'static str) -> Self {
        Self::new(path, FieldType::Boolean)
    }

    /// Object field
    pub fn object(path: &'static str) -> Self {
        Self::new(path, FieldType::Object)
    }

    /// Mark as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Bound string length
    pub fn length(mut self, min: usize, max: usize) -> Self {
        self.min_len = Some(min);
        self.max_len = Some(max);
        self
    }

    /// Bound numeric value
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Lower-bound numeric value
    pub fn at_least(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Restrict to listed values
    pub fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }

    /// Require a string format
    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    fn check(&self, record: &Value) -> Option<FieldViolation> {
        let value = lookup(record, self.path);
        let violation = |rule: &'static str, message: String| {
            Some(FieldViolation {
                field: self.path.to_string(),
                rule,
                message,
            })
        };

        let value = match value {
            None | Some(Value::Null) => {
                return if self.required {
                    violation("required", format!("{} is required", self.path))
                } else {
                    None
                };
            }
            Some(Value::String(s)) if s.trim().is_empty() && self.required => {
                return violation("required", format!("{} must not be empty", self.path));
            }
            Some(value) => value,
        };

        if !self.field_type.matches(value) {
            return violation(
                "type",
                format!("{} must be of type {}", self.path, self.field_type.name()),
            );
        }

        if let Some(text) = value.as_str() {
            let len = text.chars().count();
            if let Some(min) = self.min_len {
                if len < min {
                    return violation(
                        "length",
                        format!("{} must be at least {} characters", self.path, min),
                    );
                }
            }
            if let Some(max) = self.max_len {
                if len > max {
                    return violation(
                        "length",
                        format!("{} must be at most {} characters", self.path, max),
                    );
                }
            }
            if let Some(allowed) = self.allowed {
                if !allowed.contains(&text) {
                    return violation(
                        "enum",
                        format!("{} must be one of {}", self.path, allowed.join(", ")),
                    );
                }
            }
            if let Some(format) = self.format {
                if !format.check(text) {
                    return violation(
                        "format",
                        format!("{} must be a valid {}", self.path, format.name()),
                    );
                }
            }
        }

        if let Some(number) = value.as_f64() {
            if let Some(min) = self.min {
                if number < min {
                    return violation("range", format!("{} must be >= {}", self.path, min));
                }
            }
            if let Some(max) = self.max {
                if number > max {
                    return violation("range", format!("{} must be <= {}", self.path, max));
                }
            }
        }

        None
    }
}

/// A failed field rule
#[derive(Debug, Clone, PartialEq)]
pub struct FieldViolation {
    /// Dotted field path
    pub field: String,
    /// Rule that failed (required, type, length, range, enum, format)
    pub rule: &'static str,
    /// Description
    pub message: String,
}

/// Field rules for one entity type
#[derive(Debug, Clone)]
pub struct EntitySchema {
    /// Entity name
    pub name: &'static str,
    /// Field rules
    pub fields: Vec<FieldSpec>,
}

impl EntitySchema {
    /// Check a JSON record, collecting every violation
    pub fn check(&self, record: &Value) -> Vec<FieldViolation> {
        if !record.is_object() {
            return vec![FieldViolation {
                field: String::new(),
                rule: "type",
                message: format!("{} record must be an object", self.name),
            }];
        }
        self.fields.iter().filter_map(|f| f.check(record)).collect()
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |current, segment| current.get(segment))
}

const THEMES: &[&str] = &["light", "dark", "system"];
const SESSION_STATUSES: &[&str] = &["active", "paused", "completed", "stopped"];
const SESSION_TYPES: &[&str] = &["focus", "short_break", "long_break"];

/// User profile schema
pub static USER_SCHEMA: LazyLock<EntitySchema> = LazyLock::new(|| EntitySchema {
    name: "user",
    fields: vec![
        FieldSpec::string("id").required().length(1, 128),
        FieldSpec::string("email")
            .required()
            .length(3, 254)
            .format(Format::Email),
        FieldSpec::string("name").required().length(1, 100),
        FieldSpec::string("createdAt")
            .required()
            .format(Format::Timestamp),
        FieldSpec::string("updatedAt").format(Format::Timestamp),
        FieldSpec::object("preferences"),
        FieldSpec::string("preferences.theme").one_of(THEMES),
        FieldSpec::integer("preferences.focusDuration").range(1.0, 180.0),
        FieldSpec::integer("preferences.breakDuration").range(1.0, 60.0),
        FieldSpec::boolean("preferences.notifications"),
        FieldSpec::boolean("preferences.soundEnabled"),
    ],
});

/// Session schema, shared by active sessions
pub static SESSION_SCHEMA: LazyLock<EntitySchema> = LazyLock::new(|| EntitySchema {
    name: "session",
    fields: vec![
        FieldSpec::string("id").required().length(1, 128),
        FieldSpec::string("userId").required().length(1, 128),
        FieldSpec::string("startTime")
            .required()
            .format(Format::Timestamp),
        FieldSpec::string("endTime").format(Format::Timestamp),
        FieldSpec::integer("duration").range(0.0, 1440.0),
        FieldSpec::string("status").required().one_of(SESSION_STATUSES),
        FieldSpec::string("sessionType").one_of(SESSION_TYPES),
        FieldSpec::string("completedAt").format(Format::Timestamp),
        FieldSpec::string("stoppedAt").format(Format::Timestamp),
        FieldSpec::string("notes").length(0, 2000),
    ],
});

/// Statistics schema
pub static STATS_SCHEMA: LazyLock<EntitySchema> = LazyLock::new(|| EntitySchema {
    name: "stats",
    fields: vec![
        FieldSpec::string("userId").required().length(1, 128),
        FieldSpec::integer("totalSessions").required().at_least(0.0),
        FieldSpec::integer("completedSessions").at_least(0.0),
        FieldSpec::integer("stoppedSessions").at_least(0.0),
        FieldSpec::integer("totalFocusMinutes").at_least(0.0),
        FieldSpec::integer("completedFocusMinutes").at_least(0.0),
        FieldSpec::integer("currentStreak").at_least(0.0),
        FieldSpec::integer("longestStreak").at_least(0.0),
        FieldSpec::string("lastSessionDate").format(Format::Date),
        FieldSpec::string("updatedAt").format(Format::Timestamp),
    ],
});

/// Meeting schema
pub static MEETING_SCHEMA: LazyLock<EntitySchema> = LazyLock::new(|| EntitySchema {
    name: "meeting",
    fields: vec![
        FieldSpec::string("id").required().length(1, 128),
        FieldSpec::string("userId").required().length(1, 128),
        FieldSpec::string("title").required().length(1, 200),
        FieldSpec::string("date").required().format(Format::Date),
        FieldSpec::string("time").required().format(Format::Time),
        FieldSpec::integer("duration").required().range(1.0, 1440.0),
        FieldSpec::string("description").length(0, 2000),
        FieldSpec::string("createdAt")
            .required()
            .format(Format::Timestamp),
        FieldSpec::string("updatedAt").format(Format::Timestamp),
    ],
});
