use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::machine::Transition;
use super::status::{JobStatus, StatusInfo};

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_DESCRIPTION_LEN: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub owner: String,
    pub collaborators: Vec<String>,
    pub filename: String,
    pub status: JobStatus,
    pub failed: bool,
    pub has_output: bool,
    pub has_errors: bool,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn status_info(&self) -> StatusInfo {
        self.status.info()
    }

    /// Reviewers may read run output at any time; everyone else once released.
    pub fn can_view_run_output(&self, viewer_is_reviewer: bool) -> bool {
        viewer_is_reviewer || self.status == JobStatus::Released
    }

    pub fn is_visible_to(&self, user: &str) -> bool {
        self.owner == user || self.collaborators.iter().any(|c| c == user)
    }
}

/// A submission as received from the owner.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub description: String,
    pub owner: String,
    pub collaborators: Vec<String>,
    pub filename: String,
    pub archive: Vec<u8>,
}

impl NewJob {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(format!("name must be at most {} characters", MAX_NAME_LEN));
        }
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            ));
        }
        if self.owner.trim().is_empty() {
            return Err("owner must not be empty".into());
        }
        if self.archive.is_empty() {
            return Err("archive must not be empty".into());
        }
        Ok(())
    }
}

/// Byte streams stored alongside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobField {
    Archive,
    Output,
    Errors,
}

impl BlobField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Output => "output",
            Self::Errors => "errors",
        }
    }
}

/// Captured streams carried by the complete/fail/error callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub output: Option<Vec<u8>>,
    pub errors: Option<Vec<u8>>,
}

impl RunOutput {
    /// Empty streams are treated as absent.
    pub fn normalized(self) -> Self {
        Self {
            output: self.output.filter(|b| !b.is_empty()),
            errors: self.errors.filter(|b| !b.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub id: i64,
    pub job_id: i64,
    pub transition: Transition,
    pub source: JobStatus,
    pub target: JobStatus,
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub job_id: i64,
    pub text: String,
    pub by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventKind {
    Comment,
    StateChange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub kind: HistoryEventKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub user: Option<String>,
}

// API view types
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    pub job: Job,
    pub status_info: StatusInfo,
    pub action_required: Option<Comment>,
}

/// Merge comments and transition log entries into one timeline.
pub fn build_history(comments: &[Comment], log: &[TransitionLogEntry]) -> Vec<HistoryEvent> {
    let mut events: Vec<HistoryEvent> = comments
        .iter()
        .map(|c| HistoryEvent {
            kind: HistoryEventKind::Comment,
            timestamp: c.timestamp,
            message: c.text.clone(),
            user: Some(c.by.clone()),
        })
        .chain(log.iter().map(|entry| HistoryEvent {
            kind: HistoryEventKind::StateChange,
            timestamp: entry.timestamp,
            message: entry.transition.history_message().to_string(),
            user: entry.actor.clone(),
        }))
        .collect();
    events.sort_by_key(|e| e.timestamp);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: 1,
            name: "Hello Job".into(),
            description: String::new(),
            owner: "toejam".into(),
            collaborators: vec!["earl".into()],
            filename: "hello.tar.gz".into(),
            status,
            failed: false,
            has_output: false,
            has_errors: false,
            submitted_at: now,
            updated_at: now,
        }
    }

    fn new_job() -> NewJob {
        NewJob {
            name: "Hello Job".into(),
            description: "Return output with Hello World text".into(),
            owner: "toejam".into(),
            collaborators: vec![],
            filename: "hello.tar.gz".into(),
            archive: vec![0x1f, 0x8b],
        }
    }

    #[test]
    fn test_output_visible_to_reviewer_before_release() {
        let j = job(JobStatus::PendingOutputReview);
        assert!(j.can_view_run_output(true));
        assert!(!j.can_view_run_output(false));
        assert!(job(JobStatus::Released).can_view_run_output(false));
    }

    #[test]
    fn test_visibility_includes_collaborators() {
        let j = job(JobStatus::Queued);
        assert!(j.is_visible_to("toejam"));
        assert!(j.is_visible_to("earl"));
        assert!(!j.is_visible_to("lewanda"));
    }

    #[test]
    fn test_new_job_validation() {
        assert!(new_job().validate().is_ok());

        let mut long_name = new_job();
        long_name.name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(long_name.validate().is_err());

        let mut no_archive = new_job();
        no_archive.archive.clear();
        assert!(no_archive.validate().is_err());

        let mut long_description = new_job();
        long_description.description = "x".repeat(MAX_DESCRIPTION_LEN + 1);
        assert!(long_description.validate().is_err());
    }

    #[test]
    fn test_run_output_normalizes_empty_streams() {
        let out = RunOutput {
            output: Some(b"Hello".to_vec()),
            errors: Some(Vec::new()),
        }
        .normalized();
        assert_eq!(out.output.as_deref(), Some(&b"Hello"[..]));
        assert!(out.errors.is_none());
    }

    #[test]
    fn test_history_is_ordered_by_timestamp() {
        let t0 = Utc::now();
        let log = vec![
            TransitionLogEntry {
                id: 1,
                job_id: 1,
                transition: Transition::ApproveCode,
                source: JobStatus::PendingCodeReview,
                target: JobStatus::Queued,
                actor: Some("reviewer".into()),
                timestamp: t0,
            },
            TransitionLogEntry {
                id: 2,
                job_id: 1,
                transition: Transition::RunJob,
                source: JobStatus::Queued,
                target: JobStatus::Running,
                actor: None,
                timestamp: t0 + Duration::seconds(20),
            },
        ];
        let comments = vec![Comment {
            id: 1,
            job_id: 1,
            text: "Looks fine".into(),
            by: "reviewer".into(),
            timestamp: t0 + Duration::seconds(10),
        }];

        let history = build_history(&comments, &log);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].kind, HistoryEventKind::StateChange);
        assert_eq!(history[1].kind, HistoryEventKind::Comment);
        assert_eq!(history[1].message, "Looks fine");
        assert_eq!(history[2].message, "The job has started running.");
        assert!(history[2].user.is_none());
    }
}
