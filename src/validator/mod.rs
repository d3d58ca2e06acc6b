//! Dataset validation
//!
//! [`DatasetValidator`] checks an [`ExportDataset`] in five passes:
//!
//! 1. **Structure**: schema version and top-level collections. A failure
//!    here short-circuits with a heavy score penalty.
//! 2. **Schema**: per-entity field rules (see [`schema`]).
//! 3. **Business rules**: cross-field rules (see [`rules`]).
//! 4. **Referential integrity**: orphans and owner mismatches are errors;
//!    stats/session count drift is a warning (see [`integrity`]).
//! 5. **Scoring**: a 0–100 quality score and ranked recommendations.
//!
//! Records are checked in fixed-size batches. Once `max_errors` errors have
//! been recorded, further schema and business issues are counted but not
//! stored, so a badly damaged dataset still produces a complete score.
//! Integrity errors are always stored.
//!
//! # Example
//!
//! ```ignore
//! use kvshift::validator::{validate_dataset, ValidationOptions};
//!
//! let result = validate_dataset(&dataset, &ValidationOptions::default());
//! if !result.is_valid {
//!     for issue in result.errors.all() {
//!         eprintln!("{}", issue.message);
//!     }
//! }
//! ```

pub mod integrity;
pub mod rules;
pub mod schema;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ValidationConfig;
use crate::model::{ExportDataset, SCHEMA_VERSION};

use integrity::{check_integrity, IntegrityFinding};
use schema::{EntitySchema, MEETING_SCHEMA, SESSION_SCHEMA, STATS_SCHEMA, USER_SCHEMA};

/// Score deducted when the structural pass fails
pub const STRUCTURE_PENALTY: f64 = 50.0;
/// Score deducted per referential integrity error
pub const INTEGRITY_PENALTY: f64 = 10.0;
/// Collections every serialized dataset must carry
const REQUIRED_COLLECTIONS: [&str; 4] = ["users", "sessions", "stats", "meetings"];

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Validation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOptions {
    /// Records per batch
    pub batch_size: usize,
    /// Stop storing errors after this many
    pub max_errors: usize,
    /// Record count above which batching is recommended
    pub large_dataset_threshold: usize,
    /// Warnings also make the dataset invalid
    pub strict: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self::from(&ValidationConfig::default())
    }
}

impl From<&ValidationConfig> for ValidationOptions {
    fn from(config: &ValidationConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_errors: config.max_errors.max(1),
            large_dataset_threshold: config.large_dataset_threshold,
            strict: config.strict,
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Validation pass an issue came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueCategory {
    /// Top-level shape
    Structure,
    /// Per-entity field rules
    Schema,
    /// Cross-field rules
    Business,
    /// Referential integrity
    Integrity,
}

/// Issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Makes the record (and dataset) invalid
    Error,
    /// Reported, tolerated
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// Entity an issue is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// The dataset as a whole
    Dataset,
    /// User profile
    User,
    /// Session
    Session,
    /// Stats
    Stats,
    /// Meeting
    Meeting,
    /// Active session
    ActiveSession,
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Pass that produced it
    pub category: IssueCategory,
    /// Severity
    pub severity: Severity,
    /// Entity kind
    pub entity: EntityKind,
    /// Record id, if the issue concerns one record
    pub record_id: Option<String>,
    /// Owning user, if known
    pub user_id: Option<String>,
    /// Field path, if the issue concerns one field
    pub field: Option<String>,
    /// Rule name
    pub rule: String,
    /// Description
    pub message: String,
}

/// Issues grouped by pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorizedIssues {
    /// Structural issues
    pub structure: Vec<ValidationIssue>,
    /// Schema issues
    pub schema: Vec<ValidationIssue>,
    /// Business rule issues
    pub business: Vec<ValidationIssue>,
    /// Referential issues
    pub integrity: Vec<ValidationIssue>,
}

impl CategorizedIssues {
    fn push(&mut self, issue: ValidationIssue) {
        match issue.category {
            IssueCategory::Structure => self.structure.push(issue),
            IssueCategory::Schema => self.schema.push(issue),
            IssueCategory::Business => self.business.push(issue),
            IssueCategory::Integrity => self.integrity.push(issue),
        }
    }

    /// Total issue count
    pub fn len(&self) -> usize {
        self.structure.len() + self.schema.len() + self.business.len() + self.integrity.len()
    }

    /// Whether no issues were recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every issue, structure first
    pub fn all(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.structure
            .iter()
            .chain(&self.schema)
            .chain(&self.business)
            .chain(&self.integrity)
    }
}

/// Per-entity pass/fail counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    /// Users passing schema and business rules
    pub valid_users: usize,
    /// Users failing
    pub invalid_users: usize,
    /// Sessions passing
    pub valid_sessions: usize,
    /// Sessions failing
    pub invalid_sessions: usize,
    /// Stats passing
    pub valid_stats: usize,
    /// Stats failing
    pub invalid_stats: usize,
    /// Meetings passing
    pub valid_meetings: usize,
    /// Meetings failing
    pub invalid_meetings: usize,
    /// Active sessions passing
    pub valid_active_sessions: usize,
    /// Active sessions failing
    pub invalid_active_sessions: usize,
}

impl EntityCounts {
    /// Records passing every per-record check
    pub fn valid_records(&self) -> usize {
        self.valid_users
            + self.valid_sessions
            + self.valid_stats
            + self.valid_meetings
            + self.valid_active_sessions
    }

    /// Records checked
    pub fn total_records(&self) -> usize {
        self.valid_records()
            + self.invalid_users
            + self.invalid_sessions
            + self.invalid_stats
            + self.invalid_meetings
            + self.invalid_active_sessions
    }

    fn tally(&mut self, entity: EntityKind, valid: bool) {
        let slot = match (entity, valid) {
            (EntityKind::User, true) => &mut self.valid_users,
            (EntityKind::User, false) => &mut self.invalid_users,
            (EntityKind::Session, true) => &mut self.valid_sessions,
            (EntityKind::Session, false) => &mut self.invalid_sessions,
            (EntityKind::Stats, true) => &mut self.valid_stats,
            (EntityKind::Stats, false) => &mut self.invalid_stats,
            (EntityKind::Meeting, true) => &mut self.valid_meetings,
            (EntityKind::Meeting, false) => &mut self.invalid_meetings,
            (EntityKind::ActiveSession, true) => &mut self.valid_active_sessions,
            (EntityKind::ActiveSession, false) => &mut self.invalid_active_sessions,
            (EntityKind::Dataset, _) => return,
        };
        *slot += 1;
    }
}

/// Recommendation priority, most urgent first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Stop and fix before doing anything else
    Critical,
    /// Review before migrating
    High,
    /// Worth acting on
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// A ranked recommendation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Urgency
    pub priority: Priority,
    /// Advice
    pub message: String,
}

impl Recommendation {
    /// Create a recommendation
    pub fn new(priority: Priority, message: impl Into<String>) -> Self {
        Self {
            priority,
            message: message.into(),
        }
    }
}

/// Outcome of validating a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// No errors (and, in strict mode, no warnings)
    pub is_valid: bool,
    /// Quality score in `[0, 100]`
    pub score: u8,
    /// Errors by pass
    pub errors: CategorizedIssues,
    /// Warnings by pass
    pub warnings: CategorizedIssues,
    /// Per-entity counts
    pub counts: EntityCounts,
    /// Ranked recommendations
    pub recommendations: Vec<Recommendation>,
    /// Records checked
    pub total_records: usize,
    /// Errors found, including those not stored past `max_errors`
    pub error_total: usize,
    /// Whether `max_errors` cut off error storage. Integrity errors are
    /// stored regardless.
    pub truncated: bool,
}

impl ValidationResult {
    /// Referential integrity errors
    pub fn integrity_errors(&self) -> &[ValidationIssue] {
        &self.errors.integrity
    }

    /// Whether `rule` failed for `record_id`
    pub fn has_failure(&self, rule: &str, record_id: &str) -> bool {
        self.errors
            .all()
            .any(|i| i.rule == rule && i.record_id.as_deref() == Some(record_id))
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        format!(
            "valid={} score={} errors={} warnings={} records={}",
            self.is_valid,
            self.score,
            self.error_total,
            self.warnings.len(),
            self.total_records
        )
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

struct Collector {
    errors: CategorizedIssues,
    warnings: CategorizedIssues,
    error_total: usize,
    integrity_total: usize,
    max_errors: usize,
    truncated: bool,
}

impl Collector {
    fn new(max_errors: usize) -> Self {
        Self {
            errors: CategorizedIssues::default(),
            warnings: CategorizedIssues::default(),
            error_total: 0,
            integrity_total: 0,
            max_errors,
            truncated: false,
        }
    }

    fn push(&mut self, issue: ValidationIssue) {
        match issue.severity {
            Severity::Warning => self.warnings.push(issue),
            Severity::Error => {
                self.error_total += 1;
                if issue.category == IssueCategory::Integrity {
                    // Never capped: orphans must always be reported.
                    self.integrity_total += 1;
                    self.errors.push(issue);
                } else if self.errors.len() < self.max_errors {
                    self.errors.push(issue);
                } else {
                    self.truncated = true;
                }
            }
        }
    }
}

/// A record queued for the schema and business passes
struct Pending {
    entity: EntityKind,
    record_id: String,
    user_id: String,
    schema: &'static EntitySchema,
    value: Value,
    rule_failures: Vec<(Severity, rules::RuleFailure)>,
}

/// Multi-pass dataset validator
pub struct DatasetValidator {
    options: ValidationOptions,
}

impl DatasetValidator {
    /// Create a validator
    pub fn new(options: ValidationOptions) -> Self {
        Self { options }
    }

    /// Validate a typed dataset
    pub fn validate(&self, dataset: &ExportDataset) -> ValidationResult {
        let mut collector = Collector::new(self.options.max_errors);

        if let Some(issue) = check_version(dataset.schema_version) {
            collector.push(issue);
            return self.finish(collector, EntityCounts::default(), true, 0);
        }

        let pending = self.collect_records(dataset);
        let total_records = pending.len();
        let mut counts = EntityCounts::default();

        for (batch_no, batch) in pending.chunks(self.options.batch_size).enumerate() {
            for record in batch {
                let valid = self.check_record(record, &mut collector);
                counts.tally(record.entity, valid);
            }
            debug!(
                batch = batch_no,
                size = batch.len(),
                errors = collector.error_total,
                "validated batch"
            );
        }

        for finding in check_integrity(dataset) {
            collector.push(integrity_issue(&finding));
        }

        let result = self.finish(collector, counts, false, total_records);
        info!(
            valid = result.is_valid,
            score = result.score,
            errors = result.error_total,
            warnings = result.warnings.len(),
            "dataset validated"
        );
        result
    }

    /// Validate a serialized dataset, checking its shape before decoding it
    pub fn validate_json(&self, value: &Value) -> ValidationResult {
        let mut collector = Collector::new(self.options.max_errors);
        let structural = check_structure(value);
        if !structural.is_empty() {
            for issue in structural {
                collector.push(issue);
            }
            return self.finish(collector, EntityCounts::default(), true, 0);
        }

        match serde_json::from_value::<ExportDataset>(value.clone()) {
            Ok(dataset) => self.validate(&dataset),
            Err(e) => {
                collector.push(structure_issue("decode", format!("dataset cannot be decoded: {e}")));
                self.finish(collector, EntityCounts::default(), true, 0)
            }
        }
    }

    fn collect_records(&self, dataset: &ExportDataset) -> Vec<Pending> {
        let mut pending = Vec::with_capacity(dataset.record_count());

        let duplicate: Vec<(String, rules::RuleFailure)> =
            rules::duplicate_emails(dataset.users.values());

        for (key, user) in &dataset.users {
            let mut failures: Vec<(Severity, rules::RuleFailure)> = duplicate
                .iter()
                .filter(|(uid, _)| uid == &user.id)
                .map(|(_, f)| (Severity::Error, f.clone()))
                .collect();
            if !user.id.is_empty() && &user.id != key {
                failures.push((
                    Severity::Error,
                    rules::RuleFailure {
                        rule: "index_key_matches_id",
                        field: "id",
                        message: format!("user stored under {key} has id {}", user.id),
                    },
                ));
            }
            pending.push(Pending {
                entity: EntityKind::User,
                record_id: key.clone(),
                user_id: key.clone(),
                schema: &USER_SCHEMA,
                value: to_value(user),
                rule_failures: failures,
            });
        }

        for (uid, sessions) in &dataset.sessions {
            for session in sessions {
                pending.push(Pending {
                    entity: EntityKind::Session,
                    record_id: session.id.clone(),
                    user_id: uid.clone(),
                    schema: &SESSION_SCHEMA,
                    value: to_value(session),
                    rule_failures: tag_errors(rules::check_session(session)),
                });
            }
        }

        for (uid, stats) in &dataset.stats {
            pending.push(Pending {
                entity: EntityKind::Stats,
                record_id: uid.clone(),
                user_id: uid.clone(),
                schema: &STATS_SCHEMA,
                value: to_value(stats),
                rule_failures: tag_errors(rules::check_stats(stats)),
            });
        }

        for (uid, meetings) in &dataset.meetings {
            for meeting in meetings {
                pending.push(Pending {
                    entity: EntityKind::Meeting,
                    record_id: meeting.id.clone(),
                    user_id: uid.clone(),
                    schema: &MEETING_SCHEMA,
                    value: to_value(meeting),
                    rule_failures: Vec::new(),
                });
            }
        }

        for (uid, session) in &dataset.active_sessions {
            pending.push(Pending {
                entity: EntityKind::ActiveSession,
                record_id: session.id.clone(),
                user_id: uid.clone(),
                schema: &SESSION_SCHEMA,
                value: to_value(session),
                rule_failures: tag_errors(rules::check_session(session)),
            });
        }

        pending
    }

    /// Schema then business rules for one record; returns whether it passed
    fn check_record(&self, record: &Pending, collector: &mut Collector) -> bool {
        let mut valid = true;

        for violation in record.schema.check(&record.value) {
            valid = false;
            collector.push(ValidationIssue {
                category: IssueCategory::Schema,
                severity: Severity::Error,
                entity: record.entity,
                record_id: Some(record.record_id.clone()),
                user_id: Some(record.user_id.clone()),
                field: Some(violation.field),
                rule: violation.rule.to_string(),
                message: violation.message,
            });
        }

        for (severity, failure) in &record.rule_failures {
            if *severity == Severity::Error {
                valid = false;
            }
            collector.push(ValidationIssue {
                category: IssueCategory::Business,
                severity: *severity,
                entity: record.entity,
                record_id: Some(record.record_id.clone()),
                user_id: Some(record.user_id.clone()),
                field: Some(failure.field.to_string()),
                rule: failure.rule.to_string(),
                message: failure.message.clone(),
            });
        }

        valid
    }

    fn finish(
        &self,
        collector: Collector,
        counts: EntityCounts,
        structure_failed: bool,
        total_records: usize,
    ) -> ValidationResult {
        let integrity_errors = collector.integrity_total;
        let score = compute_score(structure_failed, &counts, integrity_errors);

        let is_valid = !structure_failed
            && collector.error_total == 0
            && !(self.options.strict && !collector.warnings.is_empty());

        let recommendations = recommend(
            score,
            is_valid,
            structure_failed,
            total_records,
            self.options.large_dataset_threshold,
            integrity_errors,
        );

        ValidationResult {
            is_valid,
            score,
            errors: collector.errors,
            warnings: collector.warnings,
            counts,
            recommendations,
            total_records,
            error_total: collector.error_total,
            truncated: collector.truncated,
        }
    }
}

/// Validate `dataset` with `options`
pub fn validate_dataset(dataset: &ExportDataset, options: &ValidationOptions) -> ValidationResult {
    DatasetValidator::new(options.clone()).validate(dataset)
}

/// Score a validation outcome.
///
/// Starts at 100, loses [`STRUCTURE_PENALTY`] on structural failure, is
/// capped at the percentage of individually valid records, then loses
/// [`INTEGRITY_PENALTY`] per referential integrity error.
pub fn compute_score(structure_failed: bool, counts: &EntityCounts, integrity_errors: usize) -> u8 {
    let mut score = 100.0_f64;
    if structure_failed {
        score -= STRUCTURE_PENALTY;
    }

    let total = counts.total_records();
    if total > 0 {
        let valid_pct = (counts.valid_records() as f64 / total as f64 * 100.0).floor();
        score = score.min(valid_pct);
    }

    score -= INTEGRITY_PENALTY * integrity_errors as f64;
    score.clamp(0.0, 100.0).round() as u8
}

fn recommend(
    score: u8,
    is_valid: bool,
    structure_failed: bool,
    total_records: usize,
    threshold: usize,
    integrity_errors: usize,
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    if structure_failed {
        recommendations.push(Recommendation::new(
            Priority::Critical,
            "Dataset structure is invalid; re-export the data before migrating",
        ));
    }

    if score < 50 {
        recommendations.push(Recommendation::new(
            Priority::Critical,
            "Critical data quality issues; stop and fix the reported errors before migrating",
        ));
    } else if score < 80 {
        recommendations.push(Recommendation::new(
            Priority::High,
            "Data quality issues detected; review the reported errors before migrating",
        ));
    }

    if integrity_errors > 0 {
        recommendations.push(Recommendation::new(
            Priority::High,
            format!("Resolve {integrity_errors} referential integrity errors; orphaned records cannot be migrated"),
        ));
    }

    if total_records > threshold {
        recommendations.push(Recommendation::new(
            Priority::Medium,
            format!("Large dataset ({total_records} records); migrate in batches"),
        ));
    }

    if integrity_errors == 0 && !structure_failed {
        let message = if is_valid {
            "Data is ready for migration".to_string()
        } else {
            "No referential integrity problems; fix the reported errors and the data will be ready for migration".to_string()
        };
        recommendations.push(Recommendation::new(Priority::Low, message));
    }

    recommendations.sort_by_key(|r| r.priority);
    recommendations
}

fn check_version(version: u32) -> Option<ValidationIssue> {
    if version == 0 || version > SCHEMA_VERSION {
        Some(structure_issue(
            "schema_version",
            format!("unsupported schema version {version} (supported: 1..={SCHEMA_VERSION})"),
        ))
    } else {
        None
    }
}

fn check_structure(value: &Value) -> Vec<ValidationIssue> {
    let Some(object) = value.as_object() else {
        return vec![structure_issue("shape", "dataset must be a JSON object")];
    };

    let mut issues = Vec::new();
    match object.get("schema_version").and_then(Value::as_u64) {
        Some(version) => {
            let version = u32::try_from(version).unwrap_or(u32::MAX);
            issues.extend(check_version(version));
        }
        None => issues.push(structure_issue(
            "schema_version",
            "schema_version is missing or not a number",
        )),
    }

    for name in REQUIRED_COLLECTIONS {
        match object.get(name) {
            Some(Value::Object(_)) => {}
            Some(_) => issues.push(structure_issue(name, format!("{name} must be an object keyed by user id"))),
            None => issues.push(structure_issue(name, format!("{name} is missing"))),
        }
    }

    if !object.get("metadata").is_some_and(Value::is_object) {
        issues.push(structure_issue("metadata", "metadata is missing or not an object"));
    }

    issues
}

fn structure_issue(field: &str, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        category: IssueCategory::Structure,
        severity: Severity::Error,
        entity: EntityKind::Dataset,
        record_id: None,
        user_id: None,
        field: Some(field.to_string()),
        rule: "structure".to_string(),
        message: message.into(),
    }
}

fn integrity_issue(finding: &IntegrityFinding) -> ValidationIssue {
    let (entity, record_id, user_id, rule) = match finding {
        IntegrityFinding::Orphan {
            kind,
            record_id,
            owner_id,
        } => (child_entity(*kind), Some(record_id.clone()), owner_id.clone(), "orphan_record"),
        IntegrityFinding::OwnerMismatch {
            kind,
            record_id,
            owner_id,
            ..
        } => (child_entity(*kind), Some(record_id.clone()), owner_id.clone(), "owner_mismatch"),
        IntegrityFinding::CountMismatch { user_id, .. } => {
            (EntityKind::Stats, Some(user_id.clone()), user_id.clone(), "session_count_mismatch")
        }
    };

    ValidationIssue {
        category: IssueCategory::Integrity,
        severity: if finding.is_error() {
            Severity::Error
        } else {
            Severity::Warning
        },
        entity,
        record_id,
        user_id: Some(user_id),
        field: Some("userId".to_string()),
        rule: rule.to_string(),
        message: finding.message(),
    }
}

fn child_entity(kind: integrity::ChildKind) -> EntityKind {
    match kind {
        integrity::ChildKind::Session => EntityKind::Session,
        integrity::ChildKind::Stats => EntityKind::Stats,
        integrity::ChildKind::Meeting => EntityKind::Meeting,
        integrity::ChildKind::ActiveSession => EntityKind::ActiveSession,
    }
}

fn tag_errors(failures: Vec<rules::RuleFailure>) -> Vec<(Severity, rules::RuleFailure)> {
    failures.into_iter().map(|f| (Severity::Error, f)).collect()
}

fn to_value<T: Serialize>(record: &T) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

/// Ids of users with at least one stored error
pub fn users_with_errors(result: &ValidationResult) -> BTreeSet<String> {
    result
        .errors
        .all()
        .filter_map(|i| i.user_id.clone())
        .collect()
}
