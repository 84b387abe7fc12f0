//! Evolution controller actor
//!
//! One single-threaded event loop per agent, owning that agent's
//! [`AgentState`] and consuming a message mailbox. External callers and
//! collaborators talk to the loop through a cloned [`AgentHandle`]; nothing
//! else can reach the state, so no locking happens inside an agent.
//!
//! The tick drives the decision policy; proposals, metric updates, apply
//! outcomes, sandbox verdicts, and delayed validations all arrive as
//! mailbox messages and are processed in receipt order.

use crate::collaborators::{
    CodeValidator, LivePublisher, SandboxRequest, SandboxService, SandboxVerdict,
    SnapshotProvider, VerdictMetrics,
};
use crate::events::{EventSink, EvolutionEvent};
use crate::state::{AgentSnapshot, AgentState, PendingChange, ValidationWindow};
use evo_cluster::ReservationTable;
use evo_core::policy::{self, Decision, PolicyInput, RiskTier};
use evo_core::{
    fingerprint, regression, AgentId, AgentStatus, ChangePayload, ChangeQueue,
    DurableQueueStore, EvolutionConfig, EvolutionError, ExperimentId, Fingerprint, QueueEntry,
    RateLimiter, RegressionVerdict, TriggerContext,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// External collaborators the controller composes with
#[derive(Clone)]
pub struct Collaborators {
    /// Preflight change validator
    pub validator: Arc<dyn CodeValidator>,
    /// Live code publisher
    pub publisher: Arc<dyn LivePublisher>,
    /// Isolated sandbox execution service
    pub sandbox: Arc<dyn SandboxService>,
    /// Resource snapshot provider
    pub snapshots: Arc<dyn SnapshotProvider>,
    /// Durable store backing the change queue
    pub store: Arc<dyn DurableQueueStore>,
}

/// How a proposal was admitted
#[derive(Debug, Clone, PartialEq)]
pub enum ProposeOutcome {
    /// Handed to the live code publisher
    Applying {
        /// Content hash of the change
        fingerprint: Fingerprint,
    },
    /// Submitted to the sandbox
    SandboxSubmitted {
        /// Experiment id returned by the sandbox
        experiment: ExperimentId,
    },
    /// Joined the durable backlog
    Queued {
        /// Content hash of the change
        fingerprint: Fingerprint,
        /// Backlog length after the push
        queue_len: usize,
    },
}

/// Mailbox messages, processed strictly in receipt order
enum AgentMsg {
    Propose {
        payload: ChangePayload,
        trigger: TriggerContext,
        reply: oneshot::Sender<Result<ProposeOutcome, EvolutionError>>,
    },
    UpdateMetrics(HashMap<String, f64>),
    RecordOutcome(bool),
    ForceImprovement(String),
    Tick,
    ApplyCompleted { version: u64 },
    ApplyFailed { reason: String },
    SandboxVerdict {
        experiment: ExperimentId,
        verdict: SandboxVerdict,
        metrics: VerdictMetrics,
    },
    ValidationDue { version: u64 },
    RetryQueue,
    GetState(oneshot::Sender<AgentSnapshot>),
}

/// Cloneable handle to one agent's controller loop
#[derive(Clone)]
pub struct AgentHandle {
    id: AgentId,
    tx: mpsc::Sender<AgentMsg>,
}

impl AgentHandle {
    /// The agent this handle belongs to
    #[inline]
    #[must_use]
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Propose a change
    ///
    /// Preflight-validated, deduplicated by fingerprint, then applied
    /// immediately (idle + rate limit permitting) or queued.
    pub async fn propose(
        &self,
        payload: ChangePayload,
        trigger: TriggerContext,
    ) -> Result<ProposeOutcome, EvolutionError> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentMsg::Propose {
            payload,
            trigger,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EvolutionError::MailboxClosed)?
    }

    /// Merge a metrics delta into the agent's metrics
    pub async fn update_metrics(
        &self,
        delta: HashMap<String, f64>,
    ) -> Result<(), EvolutionError> {
        self.send(AgentMsg::UpdateMetrics(delta)).await
    }

    /// Record one success or failure outcome
    pub async fn record_outcome(&self, success: bool) -> Result<(), EvolutionError> {
        self.send(AgentMsg::RecordOutcome(success)).await
    }

    /// Request an improvement on the next tick, bypassing gating
    pub async fn force_improvement(&self, reason: impl Into<String>) -> Result<(), EvolutionError> {
        self.send(AgentMsg::ForceImprovement(reason.into())).await
    }

    /// Drive one tick explicitly (tests; the actor also ticks on its own)
    pub async fn tick(&self) -> Result<(), EvolutionError> {
        self.send(AgentMsg::Tick).await
    }

    /// Read-only snapshot of the agent's state
    pub async fn state(&self) -> Result<AgentSnapshot, EvolutionError> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentMsg::GetState(reply)).await?;
        rx.await.map_err(|_| EvolutionError::MailboxClosed)
    }

    /// Publisher callback: the change for `version` was loaded
    pub async fn apply_completed(&self, version: u64) -> Result<(), EvolutionError> {
        self.send(AgentMsg::ApplyCompleted { version }).await
    }

    /// Publisher callback: the in-flight change failed
    pub async fn apply_failed(&self, reason: impl Into<String>) -> Result<(), EvolutionError> {
        self.send(AgentMsg::ApplyFailed {
            reason: reason.into(),
        })
        .await
    }

    /// Sandbox callback: an experiment reached a verdict
    pub async fn sandbox_verdict(
        &self,
        experiment: ExperimentId,
        verdict: SandboxVerdict,
        metrics: VerdictMetrics,
    ) -> Result<(), EvolutionError> {
        self.send(AgentMsg::SandboxVerdict {
            experiment,
            verdict,
            metrics,
        })
        .await
    }

    async fn send(&self, msg: AgentMsg) -> Result<(), EvolutionError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| EvolutionError::MailboxClosed)
    }
}

/// Spawns per-agent controller loops
pub struct EvolutionController;

impl EvolutionController {
    /// Spawn the controller loop for one agent
    ///
    /// Restores the agent's durable queue, then runs the actor until every
    /// handle is dropped. Timers (tick, delayed validation, queue retry)
    /// are owned by the spawned task.
    pub fn spawn(
        id: AgentId,
        config: EvolutionConfig,
        collaborators: Collaborators,
        reservations: Arc<ReservationTable>,
        limiter: Arc<RateLimiter>,
        events: EventSink,
    ) -> Result<AgentHandle, EvolutionError> {
        let queue = ChangeQueue::restore(id.clone(), collaborators.store.clone())?;
        let (tx, rx) = mpsc::channel(256);
        let actor = Actor {
            state: AgentState::new(id.clone(), &config),
            queue,
            config,
            collaborators,
            reservations,
            limiter,
            events,
            // Weak, so outstanding timers never keep a handle-less actor
            // alive.
            tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Ok(AgentHandle { id, tx })
    }
}

struct Actor {
    state: AgentState,
    queue: ChangeQueue,
    config: EvolutionConfig,
    collaborators: Collaborators,
    reservations: Arc<ReservationTable>,
    limiter: Arc<RateLimiter>,
    events: EventSink,
    tx: mpsc::WeakSender<AgentMsg>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<AgentMsg>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // An interval fires immediately; consume that so cycle 1 happens
        // one period after spawn.
        ticker.tick().await;

        tracing::info!(agent = %self.state.id, "evolution controller started");
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        tracing::info!(agent = %self.state.id, "evolution controller stopped");
    }

    async fn handle(&mut self, msg: AgentMsg) {
        match msg {
            AgentMsg::Propose {
                payload,
                trigger,
                reply,
            } => {
                let outcome = self.on_propose(payload, trigger).await;
                let _ = reply.send(outcome);
            }
            AgentMsg::UpdateMetrics(delta) => self.state.merge_metrics(delta),
            AgentMsg::RecordOutcome(success) => {
                self.state
                    .bump_metric(if success { policy::SUCCESSES } else { policy::FAILURES });
            }
            AgentMsg::ForceImprovement(reason) => {
                self.state.force_requested = Some(reason);
            }
            AgentMsg::Tick => self.on_tick().await,
            AgentMsg::ApplyCompleted { version } => self.on_apply_completed(version).await,
            AgentMsg::ApplyFailed { reason } => {
                self.note_apply_failure(&reason);
                self.drain_queue().await;
            }
            AgentMsg::SandboxVerdict {
                experiment,
                verdict,
                metrics,
            } => self.on_sandbox_verdict(experiment, verdict, metrics).await,
            AgentMsg::ValidationDue { version } => self.on_validation_due(version).await,
            AgentMsg::RetryQueue => {
                if self.state.status == AgentStatus::Idle {
                    self.drain_queue().await;
                }
            }
            AgentMsg::GetState(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // ---- proposal intake -------------------------------------------------

    async fn on_propose(
        &mut self,
        payload: ChangePayload,
        trigger: TriggerContext,
    ) -> Result<ProposeOutcome, EvolutionError> {
        if let Err(reason) = self.collaborators.validator.validate(&payload) {
            self.events.emit(EvolutionEvent::Invalid {
                agent: self.state.id.clone(),
                reason: reason.clone(),
                cycle: self.state.cycle,
            });
            tracing::debug!(agent = %self.state.id, %reason, "proposal rejected by preflight");
            return Err(EvolutionError::InvalidPayload(reason));
        }

        let fp = fingerprint::fingerprint(&payload);
        if self.is_duplicate(&fp) {
            self.events.emit(EvolutionEvent::Duplicate {
                agent: self.state.id.clone(),
                fingerprint: fp.clone(),
            });
            return Err(EvolutionError::Duplicate(fp));
        }

        let risk = policy::classify_risk(&payload, &self.config.policy);
        if self.state.status == AgentStatus::Idle && self.limiter.allow(&self.state.id) {
            self.start_change(payload, fp, trigger, risk, false).await
        } else {
            let queue_len = self.enqueue(payload, fp.clone(), trigger, false)?;
            if self.state.status == AgentStatus::Idle {
                // Queued only because the limiter denied; retry after the
                // backoff instead of waiting for the next tick.
                self.schedule(self.config.retry_backoff(), AgentMsg::RetryQueue);
            }
            Ok(ProposeOutcome::Queued {
                fingerprint: fp,
                queue_len,
            })
        }
    }

    fn is_duplicate(&self, fp: &Fingerprint) -> bool {
        self.state.knows_fingerprint(fp) || self.queue.contains_fingerprint(fp)
    }

    // ---- tick loop -------------------------------------------------------

    async fn on_tick(&mut self) {
        self.state.cycle += 1;
        self.state.last_score = policy::health_score(&self.state.metrics);
        self.reservations.purge_expired();

        if self.state.status != AgentStatus::Idle {
            self.check_supervision().await;
            return;
        }

        // Backlog first: queued work predates whatever the policy would
        // propose this cycle.
        if !self.queue.is_empty() {
            self.drain_queue().await;
            return;
        }

        let force = self.state.force_requested.take();
        let decision = policy::decide(
            &PolicyInput {
                metrics: &self.state.metrics,
                cycle: self.state.cycle,
                last_improvement_cycle: self.state.last_improvement_cycle,
                last_failure_cycle: self.state.last_failure_cycle,
                force: force.is_some(),
            },
            &self.config.policy,
        );

        let (payload, risk) = match decision {
            Decision::Continue => return,
            Decision::ProposeLocal(payload) => (payload, RiskTier::Local),
            Decision::ProposeSandbox(payload) => (payload, RiskTier::Sandboxed),
        };

        let fp = fingerprint::fingerprint(&payload);
        if self.is_duplicate(&fp) {
            self.events.emit(EvolutionEvent::Duplicate {
                agent: self.state.id.clone(),
                fingerprint: fp,
            });
            return;
        }

        let mut trigger = TriggerContext::new(
            force.clone().unwrap_or_else(|| "policy".to_string()),
            self.state.cycle,
        );
        if force.is_some() {
            trigger = trigger.forced();
        }

        if self.limiter.allow(&self.state.id) {
            if let Err(err) = self.start_change(payload, fp, trigger, risk, false).await {
                tracing::warn!(agent = %self.state.id, %err, "policy proposal did not start");
            }
        } else if let Err(err) = self.enqueue(payload, fp, trigger, false) {
            tracing::warn!(agent = %self.state.id, %err, "could not queue policy proposal");
        } else {
            self.schedule(self.config.retry_backoff(), AgentMsg::RetryQueue);
        }
    }

    async fn check_supervision(&mut self) {
        let stuck = self.state.pending.as_ref().is_some_and(|p| {
            self.state.cycle.saturating_sub(p.started_cycle) >= self.config.stuck_after_ticks
        });
        if stuck {
            let since = self.state.pending.as_ref().map_or(0, |p| p.started_cycle);
            self.events.emit(EvolutionEvent::Stuck {
                agent: self.state.id.clone(),
                since_cycle: since,
                cycle: self.state.cycle,
            });
            tracing::warn!(
                agent = %self.state.id,
                since,
                "pending change never resolved, failing it by supervision"
            );
            self.note_apply_failure("supervision timeout");
            self.drain_queue().await;
        }
    }

    // ---- starting changes ------------------------------------------------

    /// `requeue_front` marks a change that already owned the queue front
    /// (or outranks it, like a rollback): if it cannot start now it returns
    /// to the front instead of rotating behind younger entries.
    async fn start_change(
        &mut self,
        payload: ChangePayload,
        fp: Fingerprint,
        trigger: TriggerContext,
        risk: RiskTier,
        requeue_front: bool,
    ) -> Result<ProposeOutcome, EvolutionError> {
        match risk {
            RiskTier::Local => {
                self.start_local_apply(payload, fp, trigger, false, requeue_front)
                    .await
            }
            RiskTier::Sandboxed => self.start_sandbox(payload, fp, trigger).await,
        }
    }

    async fn start_local_apply(
        &mut self,
        payload: ChangePayload,
        fp: Fingerprint,
        trigger: TriggerContext,
        low_confidence: bool,
        requeue_front: bool,
    ) -> Result<ProposeOutcome, EvolutionError> {
        let agent = self.state.id.clone();

        if !self.reservations.reserve(&agent, &fp) {
            // Another replica is applying the same logical change; keep the
            // entry and try again after its reservation resolves.
            tracing::debug!(agent = %agent, fingerprint = %fp, "reservation held elsewhere, queueing");
            let queue_len = self.enqueue(payload, fp.clone(), trigger, requeue_front)?;
            self.schedule(self.config.retry_backoff(), AgentMsg::RetryQueue);
            return Ok(ProposeOutcome::Queued {
                fingerprint: fp,
                queue_len,
            });
        }

        let baseline = self.collaborators.snapshots.snapshot();
        let target_version = self.state.version + 1;
        self.state.pending = Some(PendingChange {
            payload: payload.clone(),
            fingerprint: fp.clone(),
            trigger,
            baseline: Some(baseline),
            previous: self.state.current_code.clone(),
            started_cycle: self.state.cycle,
            experiment: None,
            low_confidence,
            reserved: true,
        });
        self.state.status = AgentStatus::Applying;
        self.events.emit(EvolutionEvent::Applying {
            agent: agent.clone(),
            fingerprint: fp.clone(),
            target_version,
        });
        tracing::info!(agent = %agent, fingerprint = %fp, target_version, low_confidence, "applying change");

        if let Err(err) = self
            .collaborators
            .publisher
            .enqueue(&agent, &payload, target_version)
            .await
        {
            let reason = err.to_string();
            self.note_apply_failure(&reason);
            return Err(EvolutionError::ApplyFailed(reason));
        }
        Ok(ProposeOutcome::Applying { fingerprint: fp })
    }

    async fn start_sandbox(
        &mut self,
        payload: ChangePayload,
        fp: Fingerprint,
        trigger: TriggerContext,
    ) -> Result<ProposeOutcome, EvolutionError> {
        let agent = self.state.id.clone();
        let request = SandboxRequest {
            agent: agent.clone(),
            payload: payload.clone(),
            fingerprint: fp.clone(),
            trigger: trigger.clone(),
        };
        match self.collaborators.sandbox.submit(request).await {
            Ok(experiment) => {
                self.state.pending = Some(PendingChange {
                    payload,
                    fingerprint: fp.clone(),
                    trigger,
                    baseline: None,
                    previous: None,
                    started_cycle: self.state.cycle,
                    experiment: Some(experiment),
                    low_confidence: false,
                    reserved: false,
                });
                self.state.status = AgentStatus::AwaitingSandbox;
                self.events.emit(EvolutionEvent::SandboxSubmitted {
                    agent,
                    experiment,
                    fingerprint: fp,
                });
                Ok(ProposeOutcome::SandboxSubmitted { experiment })
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::warn!(agent = %agent, %reason, "sandbox submission rejected");
                self.note_apply_failure(&reason);
                Err(EvolutionError::CollaboratorUnreachable(reason))
            }
        }
    }

    // ---- async outcomes --------------------------------------------------

    async fn on_apply_completed(&mut self, reported_version: u64) {
        if self.state.status != AgentStatus::Applying {
            tracing::warn!(agent = %self.state.id, "spurious apply completion ignored");
            return;
        }
        let Some(pending) = self.state.pending.take() else {
            return;
        };
        if pending.reserved {
            self.reservations.release(&self.state.id, &pending.fingerprint);
        }

        self.state.version += 1;
        if reported_version != self.state.version {
            tracing::warn!(
                agent = %self.state.id,
                reported_version,
                local_version = self.state.version,
                "publisher reported a different version"
            );
        }
        self.state.current_code = Some(pending.payload.clone());
        self.state.last_improvement_cycle = self.state.cycle;
        self.state.record_history(self.state.version, pending.trigger.clone());
        // Windows accumulate when applies complete faster than the
        // validation delay; every applied version gets validated.
        self.state.validating.insert(
            self.state.version,
            ValidationWindow {
                version: self.state.version,
                fingerprint: pending.fingerprint,
                baseline: pending.baseline.unwrap_or_default(),
                previous: pending.previous,
            },
        );
        self.state.status = AgentStatus::Idle;

        self.events.emit(EvolutionEvent::Applied {
            agent: self.state.id.clone(),
            version: self.state.version,
        });
        tracing::info!(agent = %self.state.id, version = self.state.version, "change applied");

        self.schedule(
            self.config.validation_delay(),
            AgentMsg::ValidationDue {
                version: self.state.version,
            },
        );
        self.drain_queue().await;
    }

    fn note_apply_failure(&mut self, reason: &str) {
        if let Some(pending) = self.state.pending.take() {
            if pending.reserved {
                self.reservations.release(&self.state.id, &pending.fingerprint);
            }
        }
        self.state.bump_metric(policy::FAILURES);
        self.state.last_failure_cycle = self.state.cycle;
        self.state.status = AgentStatus::Idle;
        self.events.emit(EvolutionEvent::ApplyFailed {
            agent: self.state.id.clone(),
            reason: reason.to_string(),
            cycle: self.state.cycle,
        });
        tracing::warn!(agent = %self.state.id, reason, "apply failed");
    }

    async fn on_sandbox_verdict(
        &mut self,
        experiment: ExperimentId,
        verdict: SandboxVerdict,
        metrics: VerdictMetrics,
    ) {
        let matches_experiment = self
            .state
            .pending
            .as_ref()
            .is_some_and(|p| p.experiment == Some(experiment));
        if self.state.status != AgentStatus::AwaitingSandbox || !matches_experiment {
            tracing::warn!(agent = %self.state.id, %experiment, "verdict for unknown experiment ignored");
            return;
        }

        self.state.merge_metrics(metrics);
        let Some(pending) = self.state.pending.take() else {
            return;
        };
        self.state.status = AgentStatus::Idle;

        match verdict {
            SandboxVerdict::Merge | SandboxVerdict::MergeWithAdaptations => {
                let low_confidence = verdict == SandboxVerdict::MergeWithAdaptations;
                tracing::info!(
                    agent = %self.state.id,
                    %experiment,
                    low_confidence,
                    "sandbox merged, proceeding to local apply"
                );
                if let Err(err) = self
                    .start_local_apply(
                        pending.payload,
                        pending.fingerprint,
                        pending.trigger,
                        low_confidence,
                        true,
                    )
                    .await
                {
                    tracing::warn!(agent = %self.state.id, %err, "post-sandbox apply failed");
                }
            }
            SandboxVerdict::Rollback => {
                self.events.emit(EvolutionEvent::Rollback {
                    agent: self.state.id.clone(),
                    version: self.state.version,
                    reason: format!("sandbox rolled back experiment {experiment}"),
                });
                tracing::info!(agent = %self.state.id, %experiment, "sandbox rolled back, change discarded");
                self.drain_queue().await;
            }
        }
    }

    async fn on_validation_due(&mut self, version: u64) {
        let Some(window) = self.state.validating.remove(&version) else {
            return;
        };

        let current = self.collaborators.snapshots.snapshot();
        match regression::validate(&window.baseline, &current, &self.config.thresholds) {
            RegressionVerdict::Ok => {
                self.state.recents.insert(window.fingerprint);
                self.events.emit(EvolutionEvent::Validated {
                    agent: self.state.id.clone(),
                    version,
                });
                tracing::info!(agent = %self.state.id, version, "change validated");
            }
            RegressionVerdict::Regression(reason) => {
                let err = EvolutionError::RegressionDetected(reason);
                self.reservations.release(&self.state.id, &window.fingerprint);
                self.limiter.reset(&self.state.id);
                self.events.emit(EvolutionEvent::Rollback {
                    agent: self.state.id.clone(),
                    version,
                    reason: err.to_string(),
                });
                tracing::warn!(agent = %self.state.id, version, %err, "rolling back");
                self.resubmit_previous(window, version).await;
            }
        }
    }

    /// Resubmit the pre-change code as a high-priority change, bypassing
    /// the decision policy and fingerprint dedup (the code was applied
    /// before, so its fingerprint is known on purpose).
    async fn resubmit_previous(&mut self, window: ValidationWindow, version: u64) {
        let Some(previous) = window.previous else {
            tracing::warn!(agent = %self.state.id, version, "no previous code to roll back to");
            return;
        };
        let fp = fingerprint::fingerprint(&previous);
        let trigger =
            TriggerContext::new(format!("rollback of v{version}"), self.state.cycle).forced();

        // The rollback target becomes the effective base; a regressing
        // rollback re-applies itself rather than ping-ponging.
        self.state.current_code = Some(previous.clone());

        if self.state.status == AgentStatus::Idle {
            // Counts as an attempt, but the window was just reset.
            let _ = self.limiter.allow(&self.state.id);
            if let Err(err) = self
                .start_local_apply(previous, fp, trigger, false, true)
                .await
            {
                tracing::warn!(agent = %self.state.id, %err, "rollback apply failed");
            }
        } else if let Err(err) = self.enqueue(previous, fp, trigger, true) {
            tracing::error!(agent = %self.state.id, %err, "could not queue rollback change");
        }
    }

    // ---- queue -----------------------------------------------------------

    fn enqueue(
        &mut self,
        payload: ChangePayload,
        fp: Fingerprint,
        trigger: TriggerContext,
        front: bool,
    ) -> Result<usize, EvolutionError> {
        let entry = QueueEntry {
            payload,
            trigger,
            fingerprint: fp.clone(),
            inserted_at: chrono::Utc::now(),
        };
        if front {
            self.queue.push_front(entry)?;
        } else {
            self.queue.push(entry)?;
        }
        let queue_len = self.queue.len();
        self.events.emit(EvolutionEvent::Queued {
            agent: self.state.id.clone(),
            fingerprint: fp,
            queue_len,
        });
        Ok(queue_len)
    }

    async fn drain_queue(&mut self) {
        while self.state.status == AgentStatus::Idle {
            let entry = match self.queue.pop() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(agent = %self.state.id, %err, "queue store failed during drain");
                    break;
                }
            };

            // The entry may have become a duplicate while queued. Forced
            // entries (rollback resubmissions, operator overrides) are
            // exempt: a rollback target is a recently validated fingerprint
            // by definition and must still re-apply.
            if !entry.trigger.forced && self.state.knows_fingerprint(&entry.fingerprint) {
                self.events.emit(EvolutionEvent::Duplicate {
                    agent: self.state.id.clone(),
                    fingerprint: entry.fingerprint,
                });
                continue;
            }

            if !self.limiter.allow(&self.state.id) {
                // Denied, not dropped: back to the front, retried after a
                // fixed backoff, order of the rest preserved.
                if let Err(err) = self.queue.push_front(entry) {
                    tracing::error!(agent = %self.state.id, %err, "could not restore denied entry");
                }
                self.schedule(self.config.retry_backoff(), AgentMsg::RetryQueue);
                break;
            }

            let risk = policy::classify_risk(&entry.payload, &self.config.policy);
            match self
                .start_change(entry.payload, entry.fingerprint, entry.trigger, risk, true)
                .await
            {
                // Reservation held elsewhere; the entry went back to the
                // queue and a retry is scheduled.
                Ok(ProposeOutcome::Queued { .. }) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(agent = %self.state.id, %err, "queued change failed to start");
                    break;
                }
            }
        }
    }

    // ---- misc ------------------------------------------------------------

    fn schedule(&self, delay: Duration, msg: AgentMsg) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(msg).await;
            }
        });
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.state.id.clone(),
            version: self.state.version,
            status: self.state.status,
            cycle: self.state.cycle,
            metrics: self.state.metrics.clone(),
            last_score: self.state.last_score,
            pending_fingerprint: self.state.pending.as_ref().map(|p| p.fingerprint.clone()),
            validating_versions: {
                let mut versions: Vec<u64> = self.state.validating.keys().copied().collect();
                versions.sort_unstable();
                versions
            },
            queue_len: self.queue.len(),
            history: self.state.history.iter().cloned().collect(),
            recent_count: self.state.recents.len(),
        }
    }
}
