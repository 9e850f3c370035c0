//! The named failure scenarios and their step plans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::ScenarioTimings;
use crate::model::SignalKind;
use crate::Error;

/// A named failure scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    KillLeader,
    RestartLeader,
    FreezeLeader,
    FullClusterCrash,
    FullClusterRestart,
    PodReschedule,
    NetworkCut,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::KillLeader,
        Scenario::RestartLeader,
        Scenario::FreezeLeader,
        Scenario::FullClusterCrash,
        Scenario::FullClusterRestart,
        Scenario::PodReschedule,
        Scenario::NetworkCut,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::KillLeader => "kill-leader",
            Scenario::RestartLeader => "restart-leader",
            Scenario::FreezeLeader => "freeze-leader",
            Scenario::FullClusterCrash => "full-cluster-crash",
            Scenario::FullClusterRestart => "full-cluster-restart",
            Scenario::PodReschedule => "pod-reschedule",
            Scenario::NetworkCut => "network-cut",
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Scenario::KillLeader => "SIGKILL the partition leader with an extended restart delay",
            Scenario::RestartLeader => "SIGTERM the partition leader",
            Scenario::FreezeLeader => "SIGSTOP the partition leader, then SIGCONT it",
            Scenario::FullClusterCrash => "SIGKILL every broker at once with an extended restart delay",
            Scenario::FullClusterRestart => "SIGTERM every broker at once",
            Scenario::PodReschedule => "Delete the leader's pod and follow it to its new address",
            Scenario::NetworkCut => "Isolate the leader from its peers, then restore it",
        }
    }

    /// Step plan for this scenario under the given wait windows.
    pub fn plan(&self, timings: &ScenarioTimings) -> ScenarioPlan {
        let base = ScenarioPlan {
            scenario: *self,
            action: FaultAction::Signal(SignalKind::Kill),
            target: Target::Leader,
            extend_backoff: false,
            settle: timings.settle(),
            outage_window: timings.reelection() * 2,
            outage_checks: None,
            revert_before_progress: false,
            progress_window: Some(timings.client_timeout() * 2),
            recovery_window: Duration::ZERO,
            leader_changed_after_recovery: false,
        };

        match self {
            Scenario::KillLeader => ScenarioPlan {
                extend_backoff: true,
                outage_window: timings.reelection(),
                outage_checks: Some(OutageChecks::default()),
                progress_window: None,
                recovery_window: timings.restart_delay() * 2,
                ..base
            },
            Scenario::RestartLeader => ScenarioPlan {
                action: FaultAction::Signal(SignalKind::Terminate),
                progress_window: Some(timings.client_timeout()),
                ..base
            },
            Scenario::FreezeLeader => ScenarioPlan {
                action: FaultAction::Signal(SignalKind::Stop),
                outage_checks: Some(OutageChecks::default()),
                recovery_window: timings.reelection(),
                ..base
            },
            Scenario::FullClusterCrash => ScenarioPlan {
                target: Target::AllReplicas,
                extend_backoff: true,
                settle: timings.settle() * 2,
                outage_window: timings.restart_delay() * 2,
                ..base
            },
            Scenario::FullClusterRestart => ScenarioPlan {
                action: FaultAction::Signal(SignalKind::Terminate),
                target: Target::AllReplicas,
                ..base
            },
            Scenario::PodReschedule => ScenarioPlan {
                action: FaultAction::DeleteUnit,
                outage_window: timings.reschedule(),
                revert_before_progress: true,
                leader_changed_after_recovery: true,
                ..base
            },
            Scenario::NetworkCut => ScenarioPlan {
                action: FaultAction::Isolate,
                outage_checks: Some(OutageChecks { via_survivor: true }),
                recovery_window: timings.reelection() * 2,
                ..base
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown scenario '{}', expected one of: {}",
                    s,
                    Scenario::ALL.map(|s| s.name()).join(", ")
                ))
            })
    }
}

/// Perturbation a scenario applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Signal(SignalKind),
    Isolate,
    DeleteUnit,
}

/// Which members the perturbation is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The baseline leader of the topic
    Leader,
    /// Every unit, dispatched concurrently
    AllReplicas,
}

/// Assertions evaluated at the end of the outage window.
///
/// The ISR must equal the full replica set minus the target and the leader
/// must have moved off it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutageChecks {
    /// Ask a surviving member instead of any member
    pub via_survivor: bool,
}

/// Ordered step plan of one scenario run.
///
/// Steps: start writes, settle, baseline, perturb, outage window, outage
/// checks, resume offsets, progress window and check, revert, recovery
/// window, recovery checks, stop writes, consistency check.
///
/// Progress is always measured from the offsets read after the outage
/// window. Plans without a progress window check it at recovery instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioPlan {
    pub scenario: Scenario,
    pub action: FaultAction,
    pub target: Target,
    /// Lengthen the supervisor restart delay for the duration of the run
    pub extend_backoff: bool,
    pub settle: Duration,
    pub outage_window: Duration,
    pub outage_checks: Option<OutageChecks>,
    /// Undo the perturbation before the progress window instead of after it
    pub revert_before_progress: bool,
    /// Wait before asserting that writes resumed during the outage
    pub progress_window: Option<Duration>,
    pub recovery_window: Duration,
    /// After recovery the leader must differ from the baseline leader
    pub leader_changed_after_recovery: bool,
}

impl ScenarioPlan {
    /// Wall-clock time the wait windows add up to.
    pub fn total_wait(&self) -> Duration {
        self.settle
            + self.outage_window
            + self.progress_window.unwrap_or_default()
            + self.recovery_window
    }
}
