use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use redraft_core::error::{RedraftError, Result};
use redraft_core::event::EventBus;
use redraft_core::state::{ResearchState, RunInput, StateUpdate};
use redraft_core::types::{RunId, WorkflowEvent};

use super::policy::UnitPolicies;
use super::store::{RunInfo, RunStatus, UnitRecord, UnitStore};
use crate::graph::{GraphRuntime, Services, Target};

/// Result of a durable run.
#[derive(Debug, Clone)]
pub struct DurableOutcome {
    pub run_id: RunId,
    pub state: ResearchState,
    pub draft: String,
    /// Units executed by this dispatch.
    pub executed_units: Vec<String>,
    /// Units satisfied from the store without calling any service.
    pub replayed_units: Vec<String>,
    /// Whether this dispatch picked up an earlier one.
    pub resumed: bool,
}

/// Durable unit id: step index plus node id. Stores order units by the step
/// itself, so the padding is cosmetic.
pub fn unit_id(step: usize, node_id: &str) -> String {
    format!("{:03}-{}", step, node_id)
}

/// Drives a [`GraphRuntime`] with each node execution as a recorded unit of
/// work.
///
/// The orchestration loop itself does no I/O besides the store: routing is a
/// pure function of the state, and the state is a pure function of the input
/// and the recorded updates. Re-dispatching a run id therefore walks the same
/// unit ids, replays what was recorded and executes only the rest.
pub struct DurableRunner {
    runtime: Arc<GraphRuntime>,
    store: Arc<dyn UnitStore>,
    policies: UnitPolicies,
    event_bus: Option<Arc<EventBus>>,
}

impl DurableRunner {
    pub fn new(runtime: Arc<GraphRuntime>, store: Arc<dyn UnitStore>) -> Self {
        Self {
            runtime,
            store,
            policies: UnitPolicies::default(),
            event_bus: None,
        }
    }

    pub fn with_policies(mut self, policies: UnitPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Status of a run, if it was ever dispatched.
    pub fn status(&self, run_id: &RunId) -> Result<Option<RunInfo>> {
        self.store.run_info(run_id.as_str())
    }

    /// Recorded units of a run, in execution order.
    pub fn units(&self, run_id: &RunId) -> Result<Vec<UnitRecord>> {
        let mut records = Vec::new();
        for id in self.store.completed_units(run_id.as_str())? {
            if let Some(record) = self.store.fetch_unit(run_id.as_str(), &id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Start or resume a run.
    ///
    /// The first dispatch pins the input and the graph fingerprint; a later
    /// dispatch of the same run id with either one different is rejected.
    pub async fn run(
        &self,
        run_id: &RunId,
        input: RunInput,
        services: &Services,
        cancel: &CancellationToken,
    ) -> Result<DurableOutcome> {
        input.validate()?;
        let input_json = serde_json::to_string(&input)?;
        let state = input.into_state()?;
        let limit = self.runtime.step_limit(&state)?;
        let graph = self.runtime.fingerprint();

        let info = self.store.begin_run(run_id.as_str(), &input_json, &graph)?;
        if info.input_json != input_json {
            return Err(RedraftError::InvalidInput(format!(
                "run '{}' was started with a different input",
                run_id
            )));
        }
        if info.graph != graph {
            return Err(RedraftError::InvalidInput(format!(
                "run '{}' was started with a different graph",
                run_id
            )));
        }
        let recorded: HashSet<String> = self
            .store
            .completed_units(run_id.as_str())?
            .into_iter()
            .collect();
        // A crashed dispatch leaves the status at running with units recorded
        let resumed = !recorded.is_empty() || info.status != RunStatus::Running;
        if resumed {
            info!(
                run_id = %run_id,
                previous = %info.status,
                recorded = recorded.len(),
                "Resuming durable run"
            );
        }
        self.store.set_status(run_id.as_str(), RunStatus::Running, None)?;

        self.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            durable: true,
        });

        let result = self
            .drive(run_id, state, limit, &recorded, services, cancel)
            .await
            .map(|outcome| DurableOutcome { resumed, ..outcome });
        match result {
            Ok(outcome) => {
                self.store
                    .set_status(run_id.as_str(), RunStatus::Completed, None)?;
                info!(
                    run_id = %run_id,
                    executed = outcome.executed_units.len(),
                    replayed = outcome.replayed_units.len(),
                    revision_number = outcome.state.revision_number,
                    "Durable run complete"
                );
                self.publish(WorkflowEvent::RunComplete {
                    run_id: run_id.clone(),
                    steps: outcome.executed_units.len() + outcome.replayed_units.len(),
                    revision_number: outcome.state.revision_number,
                });
                Ok(outcome)
            }
            Err(e) => {
                let status = match e {
                    RedraftError::Cancelled => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                };
                let message = e.to_string();
                if let Err(store_err) =
                    self.store
                        .set_status(run_id.as_str(), status, Some(&message))
                {
                    error!(run_id = %run_id, error = %store_err, "Failed to record run status");
                }
                error!(run_id = %run_id, status = %status, error = %message, "Durable run stopped");
                self.publish(WorkflowEvent::RunError {
                    run_id: run_id.clone(),
                    error: message,
                });
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run_id: &RunId,
        mut state: ResearchState,
        max_steps: usize,
        recorded: &HashSet<String>,
        services: &Services,
        cancel: &CancellationToken,
    ) -> Result<DurableOutcome> {
        let mut executed_units = Vec::new();
        let mut replayed_units = Vec::new();
        let mut current = self.runtime.entry().to_string();
        let mut step = 0;

        loop {
            if cancel.is_cancelled() {
                info!(run_id = %run_id, node_id = %current, "Durable run cancelled at unit boundary");
                return Err(RedraftError::Cancelled);
            }
            if step >= max_steps {
                return Err(RedraftError::BoundViolation(format!(
                    "step limit {} reached before the graph terminated",
                    max_steps
                )));
            }

            let unit = unit_id(step, &current);
            let replayed = if recorded.contains(&unit) {
                self.store.fetch_unit(run_id.as_str(), &unit)?
            } else {
                None
            };

            let update: StateUpdate = match replayed {
                Some(record) => {
                    debug!(run_id = %run_id, unit_id = %unit, "Replaying recorded unit");
                    self.publish(WorkflowEvent::UnitReplayed {
                        run_id: run_id.clone(),
                        unit_id: unit.clone(),
                    });
                    replayed_units.push(unit.clone());
                    serde_json::from_str(&record.result_json)?
                }
                None => {
                    self.publish(WorkflowEvent::NodeStarted {
                        run_id: run_id.clone(),
                        step,
                        node_id: current.clone(),
                    });
                    let started = Instant::now();
                    let (update, attempts) = self
                        .execute_unit(run_id, &unit, &current, &state, services, cancel)
                        .await?;
                    let json = serde_json::to_string(&update)?;
                    if !self
                        .store
                        .record_unit(run_id.as_str(), step, &unit, &json, attempts)?
                    {
                        warn!(run_id = %run_id, unit_id = %unit, "Unit already recorded, using the recorded result");
                    }
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    info!(run_id = %run_id, unit_id = %unit, attempts, elapsed_ms, "Unit recorded");
                    executed_units.push(unit.clone());

                    // First write wins
                    let record = self
                        .store
                        .fetch_unit(run_id.as_str(), &unit)?
                        .ok_or_else(|| {
                            RedraftError::Database(format!("unit '{}' missing after record", unit))
                        })?;
                    let update: StateUpdate = serde_json::from_str(&record.result_json)?;
                    self.publish(WorkflowEvent::NodeCompleted {
                        run_id: run_id.clone(),
                        step,
                        node_id: current.clone(),
                        elapsed_ms,
                        revision_number: update.revision_number.unwrap_or(state.revision_number),
                    });
                    update
                }
            };

            state.apply(&current, update)?;

            match self.runtime.next(&current, &state)? {
                Target::End => break,
                Target::Node(next) => current = next,
            }
            step += 1;
        }

        Ok(DurableOutcome {
            run_id: run_id.clone(),
            draft: state.draft.clone(),
            state,
            executed_units,
            replayed_units,
            resumed: false,
        })
    }

    /// Run one unit under its retry policy. Returns the update and the number
    /// of attempts it took.
    async fn execute_unit(
        &self,
        run_id: &RunId,
        unit: &str,
        node_id: &str,
        state: &ResearchState,
        services: &Services,
        cancel: &CancellationToken,
    ) -> Result<(StateUpdate, u32)> {
        let policy = self.policies.for_node(node_id);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                policy.start_to_close,
                self.runtime.run_node(node_id, state, services),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RedraftError::UnitTimeout {
                    unit: unit.to_string(),
                    timeout_secs: policy.start_to_close.as_secs(),
                }),
            };

            let e = match result {
                Ok(update) => return Ok((update, attempt)),
                Err(e) => e,
            };
            if !e.is_retryable() {
                return Err(e);
            }
            if attempt >= policy.max_attempts {
                return Err(RedraftError::TerminalRunFailure {
                    run_id: run_id.to_string(),
                    unit: unit.to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                });
            }

            let backoff = policy.backoff(attempt);
            let failure = RedraftError::RetryableUnitFailure {
                unit: unit.to_string(),
                attempt,
                message: e.to_string(),
            };
            warn!(
                run_id = %run_id,
                max_attempts = policy.max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %failure,
                "Retrying unit"
            );
            self.publish(WorkflowEvent::UnitRetrying {
                run_id: run_id.clone(),
                unit_id: unit.to_string(),
                attempt,
                backoff_ms: backoff.as_millis() as u64,
                error: e.to_string(),
            });

            tokio::select! {
                _ = cancel.cancelled() => return Err(RedraftError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }
}
