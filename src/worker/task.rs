use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::relay::CallbackRelay;
use super::sandbox::Sandbox;
use crate::dispatch::DispatchMessage;
use crate::dispatch::broker::QueuedJob;
use crate::errors::CallbackError;

/// How a job run was reported back to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReport {
    Completed,
    Failed,
    Errored,
}

/// Runs one dispatched job end to end: report start, execute, report the
/// outcome. Holds no job state between runs.
pub struct JobRunner {
    sandbox: Arc<Sandbox>,
    relay: Arc<CallbackRelay>,
}

impl JobRunner {
    pub fn new(sandbox: Arc<Sandbox>, relay: Arc<CallbackRelay>) -> Self {
        Self { sandbox, relay }
    }

    /// Exit code 0 reports `complete`, any other exit code `fail`, and an
    /// execution error `error`. Only callback delivery failures are returned.
    pub async fn run(&self, message: DispatchMessage) -> Result<RunReport, CallbackError> {
        let id = message.id;
        self.relay.start(id).await?;

        let archive = match message.decode_archive() {
            Ok(archive) => archive,
            Err(e) => {
                warn!(job_id = id, error = %e, "Dispatch message carries an undecodable archive");
                self.relay
                    .error(id, &format!("Archive is not valid base64: {}", e))
                    .await?;
                return Ok(RunReport::Errored);
            }
        };

        match self.sandbox.execute(&archive).await {
            Ok(outcome) if outcome.succeeded() => {
                self.relay
                    .complete(id, &outcome.stdout, &outcome.stderr)
                    .await?;
                Ok(RunReport::Completed)
            }
            Ok(outcome) => {
                info!(job_id = id, exit_code = outcome.exit_code, "Job exited with failure");
                self.relay.fail(id, &outcome.stdout, &outcome.stderr).await?;
                Ok(RunReport::Failed)
            }
            Err(e) => {
                error!(job_id = id, error = %e, "Job execution failed");
                self.relay.error(id, &e.to_string()).await?;
                Ok(RunReport::Errored)
            }
        }
    }
}

/// Consume queued jobs until every sender is dropped, then wait for the runs
/// in flight. Each job waits out its countdown before taking one of
/// `concurrency` run slots.
pub async fn consume(
    mut rx: mpsc::UnboundedReceiver<QueuedJob>,
    runner: Arc<JobRunner>,
    concurrency: usize,
) {
    let slots = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some(queued) = queued else { break };
                let runner = runner.clone();
                let slots = slots.clone();
                running.spawn(async move {
                    tokio::time::sleep(queued.delay).await;
                    let Ok(_slot) = slots.acquire_owned().await else {
                        return;
                    };
                    let id = queued.message.id;
                    match runner.run(queued.message).await {
                        Ok(report) => info!(job_id = id, ?report, "Job run reported"),
                        Err(e) => error!(job_id = id, error = %e, "Giving up on job callbacks"),
                    }
                });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Job task panicked");
                }
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Job task panicked");
        }
    }
}
