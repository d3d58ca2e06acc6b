//! Shared test utilities for kvshift integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

use std::sync::Arc;

use kvshift::config::Config;
use kvshift::model::{ExportDataset, Session, UserProfile, UserStats};
use kvshift::orchestrator::Orchestrator;
use kvshift::store::{write_dataset, MemoryKvStore, MemoryRemoteStore, MemorySink};

// ============================================================================
// Record builders
// ============================================================================

/// A user profile that passes every schema rule.
#[allow(dead_code)]
pub fn user(id: &str) -> UserProfile {
    UserProfile {
        id: id.into(),
        email: format!("{id}@example.com"),
        name: format!("User {id}"),
        created_at: "2024-01-01T00:00:00Z".into(),
        ..Default::default()
    }
}

/// A 25 minute completed focus session starting `day` days into January.
#[allow(dead_code)]
pub fn completed_session(id: &str, user_id: &str, day: u32) -> Session {
    Session {
        id: id.into(),
        user_id: user_id.into(),
        start_time: format!("2024-01-{day:02}T10:00:00Z"),
        end_time: Some(format!("2024-01-{day:02}T10:25:00Z")),
        duration: Some(25),
        status: "completed".into(),
        session_type: Some("focus".into()),
        completed_at: Some(format!("2024-01-{day:02}T10:25:00Z")),
        ..Default::default()
    }
}

/// A focus session stopped after ten minutes.
#[allow(dead_code)]
pub fn stopped_session(id: &str, user_id: &str, day: u32) -> Session {
    Session {
        id: id.into(),
        user_id: user_id.into(),
        start_time: format!("2024-01-{day:02}T14:00:00Z"),
        end_time: Some(format!("2024-01-{day:02}T14:10:00Z")),
        duration: Some(10),
        status: "stopped".into(),
        session_type: Some("focus".into()),
        stopped_at: Some(format!("2024-01-{day:02}T14:10:00Z")),
        ..Default::default()
    }
}

/// `users` users, each with three completed and two stopped sessions and
/// matching stats. No meetings.
#[allow(dead_code)]
pub fn sample_dataset(users: usize) -> ExportDataset {
    let mut dataset = ExportDataset::new("test");
    for n in 1..=users {
        let uid = format!("user-{n}");
        dataset.users.insert(uid.clone(), user(&uid));
        let sessions = vec![
            completed_session(&format!("{uid}-s1"), &uid, 2),
            completed_session(&format!("{uid}-s2"), &uid, 3),
            completed_session(&format!("{uid}-s3"), &uid, 4),
            stopped_session(&format!("{uid}-s4"), &uid, 4),
            stopped_session(&format!("{uid}-s5"), &uid, 5),
        ];
        dataset.sessions.insert(uid.clone(), sessions);
        dataset.stats.insert(
            uid.clone(),
            UserStats {
                user_id: uid.clone(),
                total_sessions: 5,
                completed_sessions: 3,
                stopped_sessions: 2,
                total_focus_minutes: 95,
                completed_focus_minutes: 75,
                current_streak: 2,
                longest_streak: 3,
                last_session_date: Some("2024-01-05".into()),
                updated_at: Some("2024-01-05T14:10:00Z".into()),
                ..Default::default()
            },
        );
    }
    dataset.refresh_statistics();
    dataset
}

// ============================================================================
// Engine helpers
// ============================================================================

/// An orchestrator over in-memory stores, plus handles to those stores.
#[allow(dead_code)]
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub local: Arc<MemoryKvStore>,
    pub remote: Arc<MemoryRemoteStore>,
    pub sink: Arc<MemorySink>,
}

/// Seed a local store with `dataset` and wire an orchestrator around it.
#[allow(dead_code)]
pub fn harness(dataset: &ExportDataset) -> Harness {
    harness_with_config(dataset, Config::default())
}

/// Like [`harness`] with a custom configuration.
#[allow(dead_code)]
pub fn harness_with_config(dataset: &ExportDataset, config: Config) -> Harness {
    let local = Arc::new(MemoryKvStore::new());
    write_dataset(local.as_ref(), dataset).expect("seed local store");
    let remote = Arc::new(MemoryRemoteStore::new());
    let sink = Arc::new(MemorySink::new());
    let orchestrator = Orchestrator::new(config, local.clone(), remote.clone(), sink.clone());
    Harness {
        orchestrator,
        local,
        remote,
        sink,
    }
}
