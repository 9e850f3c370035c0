//! Scenario orchestration: writes, perturbation, observation and checks.
//!
//! A run executes its plan's steps strictly in order. Whatever happens, the
//! write session is stopped and every outstanding perturbation is released
//! before the report is returned.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::checker::{ConsistencyChecker, ConsistencyResult};
use crate::cluster::{ClusterQuery, KafkaCluster, RecordPublisher, SimulatedCluster};
use crate::config::{HarnessConfig, ScenarioTimings, WriteOptions};
use crate::fault::{release_all, FaultInjector, HostsFile, KubectlControlPlane, PerturbationHandle};
use crate::model::{BackoffPolicy, OffsetSnapshot, TopicDescription, UnitRef};
use crate::observer::ClusterObserver;
use crate::writes::ContinuousWriteSession;
use crate::{Error, Result};

mod catalog;
mod report;

pub use catalog::{FaultAction, OutageChecks, Scenario, ScenarioPlan, Target};
pub use report::{ScenarioReport, Step, StepRecord};

/// A step that did not complete.
struct StepFailure {
    step: Step,
    error: Error,
}

fn at(step: Step) -> impl FnOnce(Error) -> StepFailure {
    move |error| StepFailure { step, error }
}

type StepResult<T> = std::result::Result<T, StepFailure>;

/// Mutable state of one run; torn down on every exit path.
struct Run {
    report: ScenarioReport,
    clock: Instant,
    session: Option<ContinuousWriteSession>,
    perturbations: Vec<PerturbationHandle>,
    backoff: Vec<PerturbationHandle>,
}

impl Run {
    fn new(scenario: Scenario) -> Self {
        Self {
            report: ScenarioReport::new(scenario),
            clock: Instant::now(),
            session: None,
            perturbations: Vec::new(),
            backoff: Vec::new(),
        }
    }

    fn record(&mut self, step: Step, passed: bool, detail: Option<String>) {
        self.report.steps.push(StepRecord {
            step,
            passed,
            at_ms: self.clock.elapsed().as_millis() as u64,
            detail,
        });
    }

    fn passed(&mut self, step: Step, detail: impl Into<String>) {
        let detail = detail.into();
        info!("[{}] {}: {}", self.report.scenario, step, detail);
        self.record(step, true, Some(detail));
    }

    fn observed(&mut self, description: &TopicDescription) {
        self.report.last_description = Some(description.clone());
    }

    fn offsets(&mut self, offsets: &OffsetSnapshot) {
        self.report.last_offsets = Some(offsets.clone());
    }
}

/// Runs scenarios against one cluster.
pub struct ScenarioOrchestrator {
    topic: String,
    observer: ClusterObserver,
    injector: FaultInjector,
    publisher: Arc<dyn RecordPublisher>,
    writes: WriteOptions,
    checker: ConsistencyChecker,
    timings: ScenarioTimings,
    read_back: bool,
}

impl ScenarioOrchestrator {
    pub fn new(
        config: &HarnessConfig,
        query: Arc<dyn ClusterQuery>,
        publisher: Arc<dyn RecordPublisher>,
        injector: FaultInjector,
    ) -> Self {
        Self {
            topic: config.topic.name.clone(),
            observer: ClusterObserver::new(query, config.observer.clone()),
            injector,
            publisher,
            writes: config.writes.clone(),
            checker: ConsistencyChecker::new(config.checker.clone()),
            timings: config.timings.clone(),
            read_back: false,
        }
    }

    /// Against a real cluster driven through kubectl.
    pub fn connect(config: &HarnessConfig) -> Result<Self> {
        let control_plane_config = config.require_control_plane()?;
        let cluster = Arc::new(KafkaCluster::new(
            config.cluster.clone(),
            config.topic.clone(),
        ));
        let control_plane = Arc::new(KubectlControlPlane::new(
            control_plane_config.clone(),
            config.cluster.app_name.clone(),
            config.cluster.replica_count,
        ));
        let injector = FaultInjector::new(control_plane, &config.cluster)
            .with_resolver(Arc::new(HostsFile::new(control_plane_config.hosts_file.clone())));
        Ok(Self::new(config, cluster.clone(), cluster, injector))
    }

    /// Against an in-memory cluster that is also the control plane.
    pub fn simulated(config: &HarnessConfig) -> (Self, Arc<SimulatedCluster>) {
        let cluster = Arc::new(
            SimulatedCluster::new(&config.cluster, config.simulation.clone())
                .with_topic(&config.topic),
        );
        let injector = FaultInjector::new(cluster.clone(), &config.cluster);
        let orchestrator = Self::new(config, cluster.clone(), cluster.clone(), injector);
        (orchestrator, cluster)
    }

    /// Also read the topic back after each run and audit it.
    pub fn with_read_back(mut self, read_back: bool) -> Self {
        self.read_back = read_back;
        self
    }

    pub fn observer(&self) -> &ClusterObserver {
        &self.observer
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }

    pub fn plan(&self, scenario: Scenario) -> ScenarioPlan {
        scenario.plan(&self.timings)
    }

    pub async fn run(&self, scenario: Scenario) -> ScenarioReport {
        self.run_plan(&self.plan(scenario)).await
    }

    /// Run scenarios one after another; a failure does not stop the rest.
    pub async fn run_all(&self, scenarios: &[Scenario]) -> Vec<ScenarioReport> {
        let mut reports = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            reports.push(self.run(*scenario).await);
        }
        reports
    }

    pub async fn run_plan(&self, plan: &ScenarioPlan) -> ScenarioReport {
        info!(
            "Running scenario {} ({}), waits total {:?}",
            plan.scenario,
            plan.scenario.summary(),
            plan.total_wait()
        );
        let mut run = Run::new(plan.scenario);

        let outcome = self.execute(plan, &mut run).await;
        if let Err(failure) = outcome {
            error!(
                "Scenario {} failed at {}: {}",
                plan.scenario, failure.step, failure.error
            );
            run.record(failure.step, false, Some(failure.error.to_string()));
            run.report.failed_step = Some(failure.step);
            run.report.error = Some(failure.error.to_string());
        }

        self.teardown(&mut run).await;

        let mut report = run.report;
        report.passed = report.failed_step.is_none();
        report.finished_at = chrono::Utc::now();
        info!("{}", report.summary());
        report
    }

    async fn execute(&self, plan: &ScenarioPlan, run: &mut Run) -> StepResult<()> {
        let topic = self.topic.as_str();

        let mut session =
            ContinuousWriteSession::new(topic, self.writes.clone(), self.publisher.clone());
        session.clear().await.map_err(at(Step::StartWrites))?;
        session.start().map_err(at(Step::StartWrites))?;
        run.session = Some(session);
        run.passed(Step::StartWrites, format!("writing to {}", topic));

        self.wait(run, Step::Settle, plan.settle).await;

        let baseline = self
            .observer
            .describe_topic(topic, None)
            .await
            .map_err(at(Step::Baseline))?;
        run.report.baseline = Some(baseline.clone());
        run.observed(&baseline);
        let full_replicas = baseline.replicas.clone();
        if baseline.in_sync_replicas != full_replicas {
            return Err(StepFailure {
                step: Step::Baseline,
                error: Error::InvalidState(format!(
                    "ISR {:?} is not the full replica set {:?}",
                    baseline.in_sync_replicas, full_replicas
                )),
            });
        }
        let leader = baseline.leader.ok_or_else(|| StepFailure {
            step: Step::Baseline,
            error: Error::InvalidState(format!("{} has no leader", topic)),
        })?;
        let initial = self
            .observer
            .read_offsets(topic, None)
            .await
            .map_err(at(Step::Baseline))?;
        run.report.initial_offsets = Some(initial.clone());
        run.offsets(&initial);
        run.passed(
            Step::Baseline,
            format!(
                "leader {}, isr {:?}, offsets {:?}",
                leader,
                baseline.in_sync_replicas,
                initial.as_slice()
            ),
        );

        if plan.extend_backoff {
            let handles = self
                .injector
                .set_restart_backoff(BackoffPolicy::Extend)
                .await
                .map_err(at(Step::ExtendBackoff))?;
            run.backoff.extend(handles);
            run.passed(Step::ExtendBackoff, "restart backoff extended on every unit");
        }

        let target = self
            .injector
            .unit_for(leader)
            .await
            .map_err(at(Step::Perturb))?;
        let handles = self
            .perturb(plan, &target)
            .await
            .map_err(at(Step::Perturb))?;
        let applied: Vec<String> = handles.iter().map(|h| h.perturbation().to_string()).collect();
        run.perturbations.extend(handles);
        run.passed(Step::Perturb, applied.join(", "));

        self.wait(run, Step::OutageWindow, plan.outage_window).await;

        let survivor = match plan.outage_checks {
            Some(OutageChecks { via_survivor: true }) => Some(
                self.survivor(&target)
                    .await
                    .map_err(at(Step::OutageCheck))?,
            ),
            _ => None,
        };
        if plan.outage_checks.is_some() {
            let current = self
                .observer
                .describe_topic(topic, survivor.as_ref())
                .await
                .map_err(at(Step::OutageCheck))?;
            run.observed(&current);
            self.checker
                .expect_outage(&full_replicas, leader, &current, true)
                .into_result()
                .map_err(at(Step::OutageCheck))?;
            run.passed(
                Step::OutageCheck,
                format!(
                    "leader {:?}, isr {:?}",
                    current.leader, current.in_sync_replicas
                ),
            );
        }

        if plan.revert_before_progress {
            self.revert(run).await?;
        }

        // Writes acked before the fault took hold do not count as progress
        let resumed = self
            .observer
            .read_offsets(topic, survivor.as_ref())
            .await
            .map_err(at(Step::ResumeOffsets))?;
        run.offsets(&resumed);
        run.report.resumed_offsets = Some(resumed.clone());
        self.checker
            .expect_retained(&initial, &resumed)
            .into_result()
            .map_err(at(Step::ResumeOffsets))?;
        run.passed(
            Step::ResumeOffsets,
            format!("{:?} -> {:?}", initial.as_slice(), resumed.as_slice()),
        );

        if let Some(window) = plan.progress_window {
            self.wait(run, Step::ProgressWindow, window).await;
            let offsets = self
                .observer
                .read_offsets(topic, survivor.as_ref())
                .await
                .map_err(at(Step::ProgressCheck))?;
            run.offsets(&offsets);
            self.checker
                .expect_progress(&resumed, &offsets)
                .into_result()
                .map_err(at(Step::ProgressCheck))?;
            run.passed(
                Step::ProgressCheck,
                format!("{:?} -> {:?}", resumed.as_slice(), offsets.as_slice()),
            );
        }

        if !plan.revert_before_progress {
            self.revert(run).await?;
        }

        self.wait(run, Step::RecoveryWindow, plan.recovery_window).await;

        let recovered = self
            .observer
            .describe_topic(topic, None)
            .await
            .map_err(at(Step::RecoveryCheck))?;
        run.observed(&recovered);
        let previous_leader = plan.leader_changed_after_recovery.then_some(leader);
        self.checker
            .expect_recovered(&full_replicas, &recovered, previous_leader)
            .into_result()
            .map_err(at(Step::RecoveryCheck))?;
        let mut detail = format!(
            "leader {:?}, isr {:?}",
            recovered.leader, recovered.in_sync_replicas
        );
        if plan.progress_window.is_none() {
            let offsets = self
                .observer
                .read_offsets(topic, None)
                .await
                .map_err(at(Step::RecoveryCheck))?;
            run.offsets(&offsets);
            self.checker
                .expect_progress(&resumed, &offsets)
                .into_result()
                .map_err(at(Step::RecoveryCheck))?;
            detail.push_str(&format!(
                ", offsets {:?} -> {:?}",
                resumed.as_slice(),
                offsets.as_slice()
            ));
        }
        run.passed(Step::RecoveryCheck, detail);

        let write_report = match run.session.as_mut() {
            Some(session) => session.stop().await.map_err(at(Step::StopWrites))?,
            None => {
                return Err(StepFailure {
                    step: Step::StopWrites,
                    error: Error::InvalidState("write session was not started".to_string()),
                })
            }
        };
        run.report.write_report = Some(write_report.clone());
        run.passed(
            Step::StopWrites,
            format!(
                "sent {}, acked {}, send errors {}, ack errors {}",
                write_report.records_sent(),
                write_report.records_acked(),
                write_report.counted_send_errors(),
                write_report.counted_ack_errors()
            ),
        );

        let post = self
            .observer
            .read_offsets(topic, None)
            .await
            .map_err(at(Step::Consistency))?;
        run.offsets(&post);
        let result = self
            .check(&write_report, &resumed, &post)
            .await
            .map_err(at(Step::Consistency))?;
        run.report.consistency = Some(result.clone());
        result.into_result().map_err(at(Step::Consistency))?;
        run.passed(Step::Consistency, "all invariants hold");
        Ok(())
    }

    async fn perturb(
        &self,
        plan: &ScenarioPlan,
        target: &UnitRef,
    ) -> Result<Vec<PerturbationHandle>> {
        match (plan.action, plan.target) {
            (FaultAction::Signal(signal), Target::AllReplicas) => {
                let units = self.injector.units().await?;
                self.injector
                    .send_signal_all(&units, signal, self.timings.dispatch_timeout())
                    .await
            }
            (FaultAction::Signal(signal), Target::Leader) => {
                Ok(vec![self.injector.send_signal(target, signal).await?])
            }
            (FaultAction::Isolate, Target::Leader) => Ok(vec![self.injector.isolate(target).await?]),
            (FaultAction::DeleteUnit, Target::Leader) => {
                Ok(vec![self.injector.delete_unit(target).await?])
            }
            (action, Target::AllReplicas) => Err(Error::Config(format!(
                "{:?} cannot target every replica",
                action
            ))),
        }
    }

    /// A unit other than the perturbed one.
    async fn survivor(&self, target: &UnitRef) -> Result<UnitRef> {
        self.injector
            .units()
            .await?
            .into_iter()
            .find(|unit| unit != target)
            .ok_or_else(|| Error::NotFound(format!("no unit besides {}", target)))
    }

    async fn revert(&self, run: &mut Run) -> StepResult<()> {
        let mut reverted = Vec::new();
        for handle in run.perturbations.iter_mut().filter(|h| h.needs_release()) {
            handle.release().await.map_err(at(Step::Revert))?;
            reverted.push(handle.perturbation().to_string());
        }
        if !reverted.is_empty() {
            run.passed(Step::Revert, reverted.join(", "));
        }
        Ok(())
    }

    async fn check(
        &self,
        report: &crate::model::WriteSessionReport,
        pre: &OffsetSnapshot,
        post: &OffsetSnapshot,
    ) -> Result<ConsistencyResult> {
        if self.read_back {
            let log = self.observer.read_records(&self.topic).await?;
            Ok(self.checker.check_with_read_back(report, pre, post, &log))
        } else {
            Ok(self.checker.check(report, pre, post))
        }
    }

    async fn wait(&self, run: &mut Run, step: Step, window: Duration) {
        if window.is_zero() {
            return;
        }
        info!("[{}] {}: waiting {:?}", run.report.scenario, step, window);
        tokio::time::sleep(window).await;
        run.record(step, true, Some(format!("{:?}", window)));
    }

    /// Stop writes and release every perturbation still outstanding.
    async fn teardown(&self, run: &mut Run) {
        if let Some(mut session) = run.session.take() {
            if session.is_running() {
                match session.stop().await {
                    Ok(write_report) => {
                        run.report.write_report.get_or_insert(write_report);
                    }
                    Err(e) => warn!("Failed to stop write session: {}", e),
                }
            }
        }

        let outstanding = run
            .perturbations
            .iter()
            .chain(&run.backoff)
            .filter(|h| h.needs_release())
            .count();
        release_all(&mut run.perturbations).await;
        release_all(&mut run.backoff).await;
        let remaining = run
            .perturbations
            .iter()
            .chain(&run.backoff)
            .filter(|h| h.needs_release())
            .count();

        if outstanding > 0 {
            let detail = format!("released {} of {}", outstanding - remaining, outstanding);
            run.record(Step::Release, remaining == 0, Some(detail));
        }
        if remaining > 0 {
            warn!(
                "{} perturbations could not be reverted; they will be retried in the background",
                remaining
            );
        }
    }
}
