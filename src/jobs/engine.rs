use std::sync::Arc;

use tracing::{error, info, warn};

use super::db::{DbHandle, TransitionChange};
use super::machine::{SideEffect, Transition};
use super::models::{
    BlobField, Comment, HistoryEvent, Job, JobDetail, NewJob, RunOutput, build_history,
};
use crate::dispatch::Dispatcher;
use crate::errors::JobError;

/// Single entry point for every job status change.
///
/// Each transition is a read-validate-write against the store: the guard is
/// checked against the current status and the write is conditional on that
/// status still holding, so two concurrent callbacks cannot both succeed from
/// the same source state.
#[derive(Clone)]
pub struct JobEngine {
    db: DbHandle,
    dispatcher: Arc<dyn Dispatcher>,
}

impl JobEngine {
    pub fn new(db: DbHandle, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { db, dispatcher }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub async fn submit(&self, new: NewJob) -> Result<Job, JobError> {
        new.validate()
            .map_err(|message| JobError::Invalid { id: 0, message })?;
        let job = self
            .db
            .call(move |db| db.create_job(&new))
            .await
            .map_err(JobError::Database)?;
        info!(job_id = job.id, owner = %job.owner, "Job submitted");
        Ok(job)
    }

    pub async fn get(&self, id: i64) -> Result<Job, JobError> {
        self.db
            .call(move |db| db.get_job(id))
            .await
            .map_err(JobError::Database)?
            .ok_or(JobError::JobNotFound { id })
    }

    pub async fn list(&self, include_deleted: bool) -> Result<Vec<Job>, JobError> {
        self.db
            .call(move |db| db.list_jobs(include_deleted))
            .await
            .map_err(JobError::Database)
    }

    pub async fn detail(&self, id: i64) -> Result<JobDetail, JobError> {
        let job = self.get(id).await?;
        let action_required = self
            .db
            .call(move |db| db.latest_comment(id))
            .await
            .map_err(JobError::Database)?;
        Ok(JobDetail {
            status_info: job.status_info(),
            job,
            action_required,
        })
    }

    pub async fn read_blob(&self, id: i64, field: BlobField) -> Result<Option<Vec<u8>>, JobError> {
        self.get(id).await?;
        self.db
            .call(move |db| db.read_blob(id, field))
            .await
            .map_err(JobError::Database)
    }

    pub async fn comment(&self, id: i64, text: String, by: String) -> Result<Comment, JobError> {
        self.get(id).await?;
        self.db
            .call(move |db| db.add_comment(id, &text, &by))
            .await
            .map_err(JobError::Database)
    }

    pub async fn comments(&self, id: i64) -> Result<Vec<Comment>, JobError> {
        self.get(id).await?;
        self.db
            .call(move |db| db.list_comments(id))
            .await
            .map_err(JobError::Database)
    }

    pub async fn history(&self, id: i64) -> Result<Vec<HistoryEvent>, JobError> {
        self.get(id).await?;
        let (comments, log) = self
            .db
            .call(move |db| Ok((db.list_comments(id)?, db.transition_log(id)?)))
            .await
            .map_err(JobError::Database)?;
        Ok(build_history(&comments, &log))
    }

    /// Apply `transition` to job `id`.
    ///
    /// Fails with `InvalidTransition` (job untouched) when the job is not in
    /// the transition's source status. For `approve_code` a failed dispatch
    /// rolls the job into `QUEUED_ERROR` and the dispatch error is returned.
    pub async fn apply_transition(
        &self,
        id: i64,
        transition: Transition,
        change: TransitionChange,
    ) -> Result<Job, JobError> {
        let spec = transition.spec();
        let job = self.get(id).await?;
        if job.status != spec.source {
            warn!(job_id = id, %transition, status = %job.status, "Rejected transition");
            return Err(JobError::InvalidTransition {
                id,
                transition,
                from: job.status,
                expected: spec.source,
            });
        }

        let change = TransitionChange {
            actor: change.actor,
            run_output: change.run_output.normalized(),
        };
        let committed = self
            .db
            .call(move |db| db.commit_transition(id, &spec, &change))
            .await
            .map_err(JobError::Database)?;
        if committed.is_none() {
            // Lost a race: the status changed between the read and the write.
            let current = self.get(id).await?;
            warn!(job_id = id, %transition, status = %current.status, "Concurrent transition won");
            return Err(JobError::InvalidTransition {
                id,
                transition,
                from: current.status,
                expected: spec.source,
            });
        }
        info!(job_id = id, %transition, from = %spec.source, to = %spec.target, "Job transitioned");

        if spec.side_effect == SideEffect::Dispatch {
            self.dispatch(&job).await?;
        }

        self.get(id).await
    }

    /// Hand a freshly queued job to the worker. Any failure on the way,
    /// reading the archive included, rolls the job into `QUEUED_ERROR`.
    async fn dispatch(&self, job: &Job) -> Result<(), JobError> {
        let id = job.id;
        let sent = match self.db.call(move |db| db.read_blob(id, BlobField::Archive)).await {
            Ok(archive) => self
                .dispatcher
                .dispatch(id, &archive.unwrap_or_default(), &job.owner)
                .await
                .map(|_| ())
                .map_err(JobError::Dispatch),
            Err(e) => Err(JobError::Database(e)),
        };
        let Err(e) = sent else {
            return Ok(());
        };

        error!(job_id = id, error = %e, "Dispatch failed, marking job as queue error");
        self.mark_queue_failed(id).await;
        Err(e)
    }

    async fn mark_queue_failed(&self, id: i64) {
        let spec = Transition::QueueFailed.spec();
        match self
            .db
            .call(move |db| db.commit_transition(id, &spec, &TransitionChange::default()))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                let status = self.get(id).await.map(|job| job.status.to_string());
                warn!(job_id = id, ?status, "Job left QUEUED before the queue error was recorded");
            }
            Err(e) => error!(job_id = id, error = %e, "Failed to record queue error"),
        }
    }

    // ── Named transitions ─────────────────────────────────────────────

    pub async fn approve_code(&self, id: i64, by: Option<String>) -> Result<Job, JobError> {
        self.apply_transition(id, Transition::ApproveCode, actor(by)).await
    }

    pub async fn reject_code(&self, id: i64, by: Option<String>) -> Result<Job, JobError> {
        self.apply_transition(id, Transition::RejectCode, actor(by)).await
    }

    pub async fn delete_job(&self, id: i64, by: Option<String>) -> Result<Job, JobError> {
        self.apply_transition(id, Transition::DeleteJob, actor(by)).await
    }

    pub async fn run_job(&self, id: i64) -> Result<Job, JobError> {
        self.apply_transition(id, Transition::RunJob, TransitionChange::default())
            .await
    }

    pub async fn error_job_run(&self, id: i64, errors: Option<Vec<u8>>) -> Result<Job, JobError> {
        let run_output = RunOutput {
            output: None,
            errors,
        };
        self.apply_transition(id, Transition::ErrorJobRun, output(run_output))
            .await
    }

    pub async fn complete_job_run(&self, id: i64, run_output: RunOutput) -> Result<Job, JobError> {
        self.apply_transition(id, Transition::CompleteJobRun, output(run_output))
            .await
    }

    pub async fn fail_job_run(&self, id: i64, run_output: RunOutput) -> Result<Job, JobError> {
        self.apply_transition(id, Transition::FailJobRun, output(run_output))
            .await
    }

    pub async fn approve_output(&self, id: i64, by: Option<String>) -> Result<Job, JobError> {
        self.apply_transition(id, Transition::ApproveOutput, actor(by)).await
    }

    pub async fn reject_output(&self, id: i64, by: Option<String>) -> Result<Job, JobError> {
        self.apply_transition(id, Transition::RejectOutput, actor(by)).await
    }
}

fn actor(by: Option<String>) -> TransitionChange {
    TransitionChange {
        actor: by,
        run_output: RunOutput::default(),
    }
}

fn output(run_output: RunOutput) -> TransitionChange {
    TransitionChange {
        actor: None,
        run_output,
    }
}
