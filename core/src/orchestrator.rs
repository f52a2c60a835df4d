use crate::executor::{ExecutionReport, Executor, WorkflowError, WorkflowRun};
use crate::template::{render_workflow, TemplateVars};
use crate::workflow::Workflow;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONCURRENCY: usize = 2;

#[derive(Debug)]
pub struct WorkflowOutcome {
    pub workflow: String,
    /// Absent when the workflow failed to render.
    pub report: Option<ExecutionReport>,
    pub result: Result<(), WorkflowError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowFailure {
    pub workflow: String,
    pub error: WorkflowError,
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // workflow errors already carry the workflow id
        write!(f, "{}", self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    #[error("{} of {total} workflow(s) failed: {}", failures.len(), join_failures(failures))]
    Failed {
        total: usize,
        failures: Vec<WorkflowFailure>,
    },
}

impl OrchestrationError {
    pub fn failures(&self) -> &[WorkflowFailure] {
        match self {
            OrchestrationError::Failed { failures, .. } => failures,
        }
    }
}

fn join_failures(failures: &[WorkflowFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}

#[derive(Debug)]
pub struct OrchestrationRun {
    /// One entry per workflow, in the order they were given.
    pub outcomes: Vec<WorkflowOutcome>,
    pub result: Result<(), OrchestrationError>,
}

/// Runs many workflows against one target. Parallel workflows share a
/// semaphore of `concurrency` permits; sequential ones run afterwards, one at
/// a time, in declaration order.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    executor: Executor,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub async fn run(
        &self,
        cancel: &CancellationToken,
        workflows: &[Workflow],
        target: &str,
        vars: &TemplateVars,
    ) -> OrchestrationRun {
        let mut vars = vars.clone();
        if vars.get("target").is_none() {
            vars.insert("target", target.trim());
        }

        let mut outcomes: Vec<Option<WorkflowOutcome>> = Vec::with_capacity(workflows.len());
        let mut parallel = Vec::new();
        let mut sequential = Vec::new();
        for (index, workflow) in workflows.iter().enumerate() {
            match render_workflow(workflow, &vars) {
                Ok(rendered) => {
                    outcomes.push(None);
                    if rendered.parallel {
                        parallel.push((index, rendered));
                    } else {
                        sequential.push((index, rendered));
                    }
                }
                Err(err) => {
                    tracing::warn!(workflow = %workflow.id, "failed to render workflow: {err}");
                    outcomes.push(Some(WorkflowOutcome {
                        workflow: workflow.id.clone(),
                        report: None,
                        result: Err(err.into()),
                    }));
                }
            }
        }

        tracing::info!(
            parallel = parallel.len(),
            sequential = sequential.len(),
            concurrency = self.concurrency,
            target,
            "running workflows"
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut running = FuturesUnordered::new();
        for (index, workflow) in &parallel {
            let permits = permits.clone();
            running.push(async move {
                // Held until the workflow finishes.
                let _permit = permits.acquire().await.ok();
                let run = self.executor.run(cancel, workflow, target).await;
                (*index, workflow.id.clone(), run)
            });
        }
        while let Some((index, workflow, run)) = running.next().await {
            outcomes[index] = Some(into_outcome(workflow, run));
        }

        for (index, workflow) in &sequential {
            let run = self.executor.run(cancel, workflow, target).await;
            outcomes[*index] = Some(into_outcome(workflow.id.clone(), run));
        }

        let outcomes: Vec<WorkflowOutcome> = outcomes.into_iter().flatten().collect();
        let failures: Vec<WorkflowFailure> = outcomes
            .iter()
            .filter_map(|outcome| {
                outcome.result.as_ref().err().map(|error| WorkflowFailure {
                    workflow: outcome.workflow.clone(),
                    error: error.clone(),
                })
            })
            .collect();

        let result = if failures.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::Failed {
                total: outcomes.len(),
                failures,
            })
        };
        OrchestrationRun { outcomes, result }
    }
}

fn into_outcome(workflow: String, run: WorkflowRun) -> WorkflowOutcome {
    WorkflowOutcome {
        workflow,
        report: Some(run.report),
        result: run.result,
    }
}
