//! In-memory replicated-log model of a Kafka cluster.
//!
//! Broker health changes are processed as timed events (restart, failure
//! detection, ISR rejoin) in chronological order whenever the model is
//! touched, so results do not depend on how often callers poll. Time comes
//! from `tokio::time`, which lets tests drive whole scenarios on a paused clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};

use super::{partition_for, ClusterQuery, RecordPublisher};
use crate::config::{KafkaConfig, TopicConfig};
use crate::error::KafkaError;
use crate::fault::ControlPlane;
use crate::model::{
    BackoffPolicy, OffsetSnapshot, PublishAck, Record, ReplicaId, SignalKind, TopicDescription,
    UnitRef,
};
use crate::{Error, Result};

/// REQUEST_TIMED_OUT
const REQUEST_TIMED_OUT: i16 = 7;

/// NOT_ENOUGH_REPLICAS
const NOT_ENOUGH_REPLICAS: i16 = 19;

/// Timing model of the simulated cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationProfile {
    /// Time before an unresponsive replica is dropped from the ISR
    pub failure_detection_ms: u64,
    /// Time a recovered replica needs before it rejoins the ISR
    pub catch_up_ms: u64,
    /// Supervisor restart delay
    pub restart_backoff_ms: u64,
    /// Supervisor restart delay under the extend policy
    pub extended_backoff_ms: u64,
    /// Time for a deleted unit to come back on a new host
    pub reschedule_ms: u64,
    /// How long a request to a hung broker blocks before failing
    pub request_stall_ms: u64,
    /// Latency of a successful publish
    pub publish_latency_ms: u64,
    pub min_insync_replicas: usize,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            failure_detection_ms: 6_000,
            catch_up_ms: 4_000,
            restart_backoff_ms: 2_000,
            extended_backoff_ms: 60_000,
            reschedule_ms: 15_000,
            request_stall_ms: 2_000,
            publish_latency_ms: 5,
            min_insync_replicas: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Process {
    Up,
    Frozen,
    Down { restart_at: Instant },
}

#[derive(Debug)]
struct Broker {
    unit: UnitRef,
    process: Process,
    isolated: bool,
    /// Down because the unit was deleted; comes back with a new identity
    rescheduling: bool,
    generation: u32,
    backoff_extended: bool,
    healthy_since: Option<Instant>,
    unhealthy_since: Option<Instant>,
    failure_detected: bool,
}

impl Broker {
    fn healthy(&self) -> bool {
        self.process == Process::Up && !self.isolated
    }

    fn address(&self) -> String {
        format!("10.42.{}.{}", self.unit.index, 10 + self.generation)
    }
}

#[derive(Debug)]
struct TopicState {
    replicas: BTreeSet<ReplicaId>,
    isr: BTreeSet<ReplicaId>,
    leader: Option<ReplicaId>,
    leader_since: Instant,
    logs: Vec<Vec<u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Event {
    Restart(ReplicaId),
    Detect(ReplicaId),
    Rejoin(ReplicaId, String),
}

#[derive(Debug)]
struct State {
    brokers: BTreeMap<ReplicaId, Broker>,
    topics: BTreeMap<String, TopicState>,
    injected_failures: u32,
}

enum PublishOutcome {
    Acked(PublishAck),
    /// Appended on the leader; acks=all waits on an unhealthy ISR member
    Stalled { ack: PublishAck, leader: ReplicaId },
    /// Leader is alive but not answering
    Hung(ReplicaId),
}

/// Simulated Kafka cluster that is also its own control plane.
pub struct SimulatedCluster {
    profile: SimulationProfile,
    broker_id_offset: i32,
    app: String,
    state: Mutex<State>,
}

impl SimulatedCluster {
    /// A cluster of `replica_count` healthy brokers and no topics.
    pub fn new(cluster: &KafkaConfig, profile: SimulationProfile) -> Self {
        let now = Instant::now();
        let brokers = (0..cluster.replica_count)
            .map(|index| {
                let id = ReplicaId(cluster.broker_id_offset + index as i32);
                let broker = Broker {
                    unit: UnitRef::new(cluster.app_name.clone(), index),
                    process: Process::Up,
                    isolated: false,
                    rescheduling: false,
                    generation: 0,
                    backoff_extended: false,
                    healthy_since: Some(now),
                    unhealthy_since: None,
                    failure_detected: false,
                };
                (id, broker)
            })
            .collect();

        Self {
            profile,
            broker_id_offset: cluster.broker_id_offset,
            app: cluster.app_name.clone(),
            state: Mutex::new(State {
                brokers,
                topics: BTreeMap::new(),
                injected_failures: 0,
            }),
        }
    }

    /// Builder form of [`SimulatedCluster::create_topic`].
    pub fn with_topic(self, topic: &TopicConfig) -> Self {
        self.create_topic(topic);
        self
    }

    /// Create a topic on the first `replication_factor` brokers.
    pub fn create_topic(&self, topic: &TopicConfig) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.advance(&self.profile, now);
        let replicas: BTreeSet<ReplicaId> = state
            .brokers
            .keys()
            .copied()
            .take(topic.replication_factor.max(1) as usize)
            .collect();
        let partitions = topic.partitions.max(1) as usize;
        let topic_state = state.fresh_topic(replicas, partitions, now);
        state.topics.insert(topic.name.clone(), topic_state);
    }

    pub fn profile(&self) -> &SimulationProfile {
        &self.profile
    }

    /// Make the next `count` publishes fail after being appended, as a
    /// leader does when the acknowledgement times out.
    pub fn inject_publish_failures(&self, count: u32) {
        self.state.lock().injected_failures += count;
    }

    /// Whether the broker is up and reachable right now.
    pub fn is_healthy(&self, replica: ReplicaId) -> bool {
        let mut state = self.state.lock();
        state.advance(&self.profile, Instant::now());
        state.brokers.get(&replica).is_some_and(Broker::healthy)
    }

    fn replica_of(&self, unit: &UnitRef) -> Result<ReplicaId> {
        if unit.app != self.app {
            return Err(Error::NotFound(format!("unit {}", unit)));
        }
        Ok(ReplicaId(self.broker_id_offset + unit.index as i32))
    }

    fn stall(&self) -> Duration {
        Duration::from_millis(self.profile.request_stall_ms)
    }
}

impl State {
    fn fresh_topic(
        &self,
        replicas: BTreeSet<ReplicaId>,
        partitions: usize,
        now: Instant,
    ) -> TopicState {
        let isr: BTreeSet<ReplicaId> = replicas
            .iter()
            .copied()
            .filter(|id| self.brokers.get(id).is_some_and(Broker::healthy))
            .collect();
        TopicState {
            leader: isr.iter().next().copied(),
            leader_since: now,
            isr,
            replicas,
            logs: vec![Vec::new(); partitions],
        }
    }

    fn broker(&self, id: ReplicaId) -> Result<&Broker> {
        self.brokers
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("replica {}", id)))
    }

    fn broker_mut(&mut self, id: ReplicaId) -> Result<&mut Broker> {
        self.brokers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("replica {}", id)))
    }

    fn is_healthy(&self, id: ReplicaId) -> bool {
        self.brokers.get(&id).is_some_and(Broker::healthy)
    }

    /// Earliest pending event at or before `now`.
    fn next_event(&self, profile: &SimulationProfile, now: Instant) -> Option<(Instant, Event)> {
        let detect = Duration::from_millis(profile.failure_detection_ms);
        let catch_up = Duration::from_millis(profile.catch_up_ms);
        let mut candidates = Vec::new();

        for (id, broker) in &self.brokers {
            if let Process::Down { restart_at } = broker.process {
                candidates.push((restart_at, Event::Restart(*id)));
            }
            if let (false, false, Some(since)) = (
                broker.healthy(),
                broker.failure_detected,
                broker.unhealthy_since,
            ) {
                candidates.push((since + detect, Event::Detect(*id)));
            }
        }

        for (name, topic) in &self.topics {
            let Some(leader) = topic.leader.filter(|l| self.is_healthy(*l)) else {
                continue;
            };
            for id in topic.replicas.difference(&topic.isr) {
                let Some(since) = self.brokers.get(id).and_then(|b| b.healthy_since) else {
                    continue;
                };
                if *id == leader {
                    continue;
                }
                let at = since.max(topic.leader_since) + catch_up;
                candidates.push((at, Event::Rejoin(*id, name.clone())));
            }
        }

        candidates
            .into_iter()
            .filter(|(at, _)| *at <= now)
            .min()
    }

    /// Apply every event due by `now`, in time order.
    fn advance(&mut self, profile: &SimulationProfile, now: Instant) {
        while let Some((at, event)) = self.next_event(profile, now) {
            match event {
                Event::Restart(id) => self.on_restart(id, at),
                Event::Detect(id) => self.on_failure_detected(id, at),
                Event::Rejoin(id, topic) => {
                    if let Some(topic_state) = self.topics.get_mut(&topic) {
                        topic_state.isr.insert(id);
                        debug!("Replica {} rejoined ISR of {}", id, topic);
                    }
                }
            }
        }
    }

    fn on_restart(&mut self, id: ReplicaId, at: Instant) {
        if let Some(broker) = self.brokers.get_mut(&id) {
            broker.process = Process::Up;
            if broker.rescheduling {
                broker.rescheduling = false;
                broker.generation += 1;
                // The replacement container starts from the default layer
                broker.backoff_extended = false;
            }
            debug!("Replica {} restarted", id);
        }
        self.mark_healthy(id, at);
    }

    fn on_failure_detected(&mut self, id: ReplicaId, at: Instant) {
        if let Some(broker) = self.brokers.get_mut(&id) {
            broker.failure_detected = true;
        }
        self.leave_isr(id, at);
    }

    /// Drop a replica from every ISR it can leave and move its leaderships.
    fn leave_isr(&mut self, id: ReplicaId, at: Instant) {
        let healthy: BTreeSet<ReplicaId> = self
            .brokers
            .iter()
            .filter(|(_, b)| b.healthy())
            .map(|(id, _)| *id)
            .collect();

        for (name, topic) in self.topics.iter_mut() {
            // The last in-sync replica is never evicted
            if topic.isr.len() > 1 && topic.isr.remove(&id) {
                debug!("Replica {} left ISR of {}", id, name);
            }
            if topic.leader == Some(id) {
                topic.leader = topic
                    .isr
                    .iter()
                    .copied()
                    .find(|r| *r != id && healthy.contains(r));
                topic.leader_since = at;
                debug!("Leader of {} moved {} -> {:?}", name, id, topic.leader);
            }
        }
    }

    fn mark_unhealthy(&mut self, id: ReplicaId, at: Instant) {
        if let Some(broker) = self.brokers.get_mut(&id) {
            if broker.unhealthy_since.is_none() {
                broker.unhealthy_since = Some(at);
                broker.failure_detected = false;
            }
            broker.healthy_since = None;
        }
    }

    fn mark_healthy(&mut self, id: ReplicaId, at: Instant) {
        let Some(broker) = self.brokers.get_mut(&id) else {
            return;
        };
        if !broker.healthy() || broker.healthy_since.is_some() {
            return;
        }
        broker.healthy_since = Some(at);
        broker.unhealthy_since = None;
        broker.failure_detected = false;

        // An offline partition comes back with its last in-sync replica
        for (name, topic) in self.topics.iter_mut() {
            if topic.leader.is_none() && topic.isr.contains(&id) {
                topic.leader = Some(id);
                topic.leader_since = at;
                info!("Replica {} elected leader of offline topic {}", id, name);
            }
        }
    }

    fn restart_delay(&self, profile: &SimulationProfile, id: ReplicaId) -> Duration {
        let extended = self.brokers.get(&id).is_some_and(|b| b.backoff_extended);
        Duration::from_millis(if extended {
            profile.extended_backoff_ms
        } else {
            profile.restart_backoff_ms
        })
    }

    fn description(&self, name: &str) -> Result<TopicDescription> {
        let topic = self
            .topics
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("topic {}", name)))?;
        Ok(TopicDescription {
            topic: name.to_string(),
            leader: topic.leader,
            in_sync_replicas: topic.isr.clone(),
            replicas: topic.replicas.clone(),
        })
    }

    /// Fail unless the member a query goes through can answer.
    fn ensure_reachable(&self, target: Option<ReplicaId>) -> Result<()> {
        match target {
            Some(id) => {
                let broker = self.broker(id)?;
                if broker.healthy() {
                    Ok(())
                } else {
                    Err(Error::Unreachable(format!("{} did not answer", broker.unit)))
                }
            }
            None if self.brokers.values().any(Broker::healthy) => Ok(()),
            None => Err(Error::Unreachable("no cluster member answered".to_string())),
        }
    }

    /// Topic whose leader can serve offset and fetch requests.
    fn led_topic(&self, name: &str) -> Result<&TopicState> {
        let topic = self
            .topics
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("topic {}", name)))?;
        match topic.leader {
            Some(leader) if self.is_healthy(leader) => Ok(topic),
            _ => Err(Error::Unreachable(format!("leader of {} unavailable", name))),
        }
    }

    fn begin_publish(
        &mut self,
        name: &str,
        record: &Record,
        profile: &SimulationProfile,
    ) -> Result<PublishOutcome> {
        let topic = self
            .topics
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("topic {}", name)))?;
        let partition = partition_for(record.sequence(), topic.logs.len() as i32);

        let leader = topic.leader.ok_or_else(|| KafkaError::PartitionNotAvailable {
            topic: name.to_string(),
            partition,
        })?;
        let leader_broker = self.broker(leader)?;
        match leader_broker.process {
            Process::Down { .. } => {
                return Err(KafkaError::ConnectionFailed {
                    broker: leader_broker.address(),
                    message: "connection refused".to_string(),
                }
                .into())
            }
            Process::Frozen => return Ok(PublishOutcome::Hung(leader)),
            Process::Up if leader_broker.isolated => return Ok(PublishOutcome::Hung(leader)),
            Process::Up => {}
        }

        if topic.isr.len() < profile.min_insync_replicas {
            return Err(KafkaError::BrokerError {
                code: NOT_ENOUGH_REPLICAS,
                message: format!("ISR of {} below min.insync.replicas", name),
            }
            .into());
        }

        let waiting_on_isr = topic.isr.iter().any(|r| !self.is_healthy(*r));
        let injected = self.injected_failures > 0;

        let topic = self
            .topics
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("topic {}", name)))?;
        let log = &mut topic.logs[partition as usize];
        log.push(record.sequence());
        let ack = PublishAck {
            partition,
            offset: log.len() as i64 - 1,
        };

        if injected {
            self.injected_failures -= 1;
            return Err(KafkaError::BrokerError {
                code: REQUEST_TIMED_OUT,
                message: "injected acknowledgement timeout".to_string(),
            }
            .into());
        }
        if waiting_on_isr {
            return Ok(PublishOutcome::Stalled { ack, leader });
        }
        Ok(PublishOutcome::Acked(ack))
    }
}

#[async_trait]
impl ClusterQuery for SimulatedCluster {
    async fn describe_topic(
        &self,
        topic: &str,
        target: Option<&UnitRef>,
    ) -> Result<TopicDescription> {
        let target = target.map(|u| self.replica_of(u)).transpose()?;
        let mut state = self.state.lock();
        state.advance(&self.profile, Instant::now());
        state.ensure_reachable(target)?;
        state.description(topic)
    }

    async fn read_offsets(&self, topic: &str, target: Option<&UnitRef>) -> Result<OffsetSnapshot> {
        let target = target.map(|u| self.replica_of(u)).transpose()?;
        let mut state = self.state.lock();
        state.advance(&self.profile, Instant::now());
        state.ensure_reachable(target)?;
        let topic = state.led_topic(topic)?;
        Ok(OffsetSnapshot::new(
            topic.logs.iter().map(|log| log.len() as i64).collect(),
        ))
    }

    async fn read_records(&self, topic: &str) -> Result<Vec<u64>> {
        let mut state = self.state.lock();
        state.advance(&self.profile, Instant::now());
        state.ensure_reachable(None)?;
        let topic = state.led_topic(topic)?;
        Ok(topic.logs.iter().flatten().copied().collect())
    }
}

#[async_trait]
impl RecordPublisher for SimulatedCluster {
    async fn publish(&self, topic: &str, record: &Record) -> Result<PublishAck> {
        sleep(Duration::from_millis(self.profile.publish_latency_ms)).await;

        let outcome = {
            let mut state = self.state.lock();
            state.advance(&self.profile, Instant::now());
            state.begin_publish(topic, record, &self.profile)?
        };

        match outcome {
            PublishOutcome::Acked(ack) => Ok(ack),
            PublishOutcome::Hung(leader) => {
                sleep(self.stall()).await;
                Err(KafkaError::Timeout(format!("no response from leader {}", leader)).into())
            }
            PublishOutcome::Stalled { ack, leader } => {
                sleep(self.stall()).await;
                let mut state = self.state.lock();
                state.advance(&self.profile, Instant::now());
                let settled = state.topics.get(topic).is_some_and(|t| {
                    t.leader == Some(leader) && t.isr.iter().all(|r| state.is_healthy(*r))
                });
                if settled {
                    Ok(ack)
                } else {
                    Err(KafkaError::BrokerError {
                        code: REQUEST_TIMED_OUT,
                        message: format!(
                            "sequence {} not replicated to all in-sync replicas",
                            record.sequence()
                        ),
                    }
                    .into())
                }
            }
        }
    }

    async fn reset_topic(&self, topic: &str) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.advance(&self.profile, now);
        state.ensure_reachable(None)?;

        let (replicas, partitions) = match state.topics.get(topic) {
            Some(existing) => (existing.replicas.clone(), existing.logs.len()),
            None => (state.brokers.keys().copied().collect(), 1),
        };
        let fresh = state.fresh_topic(replicas, partitions, now);
        state.topics.insert(topic.to_string(), fresh);
        info!("Reset simulated topic {}", topic);
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for SimulatedCluster {
    async fn send_signal(&self, unit: &UnitRef, signal: SignalKind) -> Result<()> {
        let id = self.replica_of(unit)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.advance(&self.profile, now);

        let restart_at = now + state.restart_delay(&self.profile, id);
        let broker = state.broker_mut(id)?;
        if matches!(broker.process, Process::Down { .. }) {
            return Err(Error::DeliveryFailed {
                target: unit.to_string(),
                message: format!("no running process to receive {}", signal),
            });
        }

        match signal {
            SignalKind::Kill => {
                broker.process = Process::Down { restart_at };
                state.mark_unhealthy(id, now);
            }
            SignalKind::Terminate => {
                broker.process = Process::Down { restart_at };
                state.mark_unhealthy(id, now);
                // Controlled shutdown hands off leadership right away
                state.broker_mut(id)?.failure_detected = true;
                state.leave_isr(id, now);
            }
            SignalKind::Stop => {
                broker.process = Process::Frozen;
                state.mark_unhealthy(id, now);
            }
            SignalKind::Continue => {
                if broker.process == Process::Frozen {
                    broker.process = Process::Up;
                    state.mark_healthy(id, now);
                }
            }
        }
        debug!("Delivered {} to {}", signal, unit);
        Ok(())
    }

    async fn isolate(&self, unit: &UnitRef) -> Result<()> {
        let id = self.replica_of(unit)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.advance(&self.profile, now);
        state.broker_mut(id)?.isolated = true;
        state.mark_unhealthy(id, now);
        Ok(())
    }

    async fn restore_network(&self, unit: &UnitRef) -> Result<()> {
        let id = self.replica_of(unit)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.advance(&self.profile, now);
        let broker = state.broker_mut(id)?;
        if broker.isolated {
            broker.isolated = false;
            state.mark_healthy(id, now);
        }
        Ok(())
    }

    async fn delete_unit(&self, unit: &UnitRef) -> Result<()> {
        let id = self.replica_of(unit)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.advance(&self.profile, now);

        let broker = state.broker_mut(id)?;
        if broker.rescheduling {
            return Err(Error::DeliveryFailed {
                target: unit.to_string(),
                message: "unit is already being replaced".to_string(),
            });
        }
        broker.process = Process::Down {
            restart_at: now + Duration::from_millis(self.profile.reschedule_ms),
        };
        broker.rescheduling = true;
        state.mark_unhealthy(id, now);
        state.broker_mut(id)?.failure_detected = true;
        state.leave_isr(id, now);
        Ok(())
    }

    async fn set_restart_backoff(&self, unit: &UnitRef, policy: BackoffPolicy) -> Result<()> {
        let id = self.replica_of(unit)?;
        let mut state = self.state.lock();
        state.advance(&self.profile, Instant::now());
        let broker = state.broker_mut(id)?;
        if broker.rescheduling {
            return Err(Error::DeliveryFailed {
                target: unit.to_string(),
                message: "container is not running".to_string(),
            });
        }
        broker.backoff_extended = policy == BackoffPolicy::Extend;
        Ok(())
    }

    async fn unit_address(&self, unit: &UnitRef) -> Result<String> {
        let id = self.replica_of(unit)?;
        let mut state = self.state.lock();
        state.advance(&self.profile, Instant::now());
        let broker = state.broker(id)?;
        if broker.rescheduling {
            return Err(Error::Unreachable(format!("{} has no address yet", unit)));
        }
        Ok(broker.address())
    }

    async fn list_units(&self) -> Result<Vec<UnitRef>> {
        let state = self.state.lock();
        Ok(state.brokers.values().map(|b| b.unit.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "ha-test-topic";

    fn cluster() -> SimulatedCluster {
        let config = KafkaConfig::with_bootstrap(vec!["sim:9092".to_string()]);
        SimulatedCluster::new(&config, SimulationProfile::default()).with_topic(&TopicConfig {
            name: TOPIC.to_string(),
            partitions: 1,
            replication_factor: 3,
        })
    }

    fn unit(index: u32) -> UnitRef {
        UnitRef::new("kafka-k8s", index)
    }

    async fn describe(cluster: &SimulatedCluster) -> TopicDescription {
        cluster.describe_topic(TOPIC, None).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_topic_is_fully_replicated() {
        let cluster = cluster();
        let description = describe(&cluster).await;
        assert_eq!(description.leader, Some(ReplicaId(100)));
        assert_eq!(description.in_sync_replicas, ReplicaId::set([100, 101, 102]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_leader_is_detected_then_rejoins() {
        let cluster = cluster();
        cluster
            .set_restart_backoff(&unit(0), BackoffPolicy::Extend)
            .await
            .unwrap();
        cluster.send_signal(&unit(0), SignalKind::Kill).await.unwrap();

        // Not detected yet
        assert_eq!(describe(&cluster).await.leader, Some(ReplicaId(100)));

        sleep(Duration::from_secs(7)).await;
        let description = describe(&cluster).await;
        assert_eq!(description.leader, Some(ReplicaId(101)));
        assert_eq!(description.in_sync_replicas, ReplicaId::set([101, 102]));

        // Restarted at 60s, still catching up
        sleep(Duration::from_secs(54)).await;
        assert!(cluster.is_healthy(ReplicaId(100)));
        assert!(!describe(&cluster)
            .await
            .in_sync_replicas
            .contains(&ReplicaId(100)));

        sleep(Duration::from_secs(4)).await;
        assert_eq!(
            describe(&cluster).await.in_sync_replicas,
            ReplicaId::set([100, 101, 102])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_moves_leadership_immediately() {
        let cluster = cluster();
        cluster
            .send_signal(&unit(0), SignalKind::Terminate)
            .await
            .unwrap();
        let description = describe(&cluster).await;
        assert_eq!(description.leader, Some(ReplicaId(101)));
        assert_eq!(description.in_sync_replicas, ReplicaId::set([101, 102]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_isr_member_is_kept() {
        let cluster = cluster();
        for index in 0..3 {
            cluster
                .set_restart_backoff(&unit(index), BackoffPolicy::Extend)
                .await
                .unwrap();
            cluster.send_signal(&unit(index), SignalKind::Kill).await.unwrap();
        }

        sleep(Duration::from_secs(10)).await;
        assert!(cluster.describe_topic(TOPIC, None).await.is_err());

        sleep(Duration::from_secs(55)).await;
        let description = describe(&cluster).await;
        assert_eq!(description.leader, Some(ReplicaId(102)));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(
            describe(&cluster).await.in_sync_replicas,
            ReplicaId::set([100, 101, 102])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_to_dead_process_fails() {
        let cluster = cluster();
        cluster.send_signal(&unit(1), SignalKind::Kill).await.unwrap();
        let err = cluster
            .send_signal(&unit(1), SignalKind::Kill)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_network_without_isolation_is_noop() {
        let cluster = cluster();
        cluster.restore_network(&unit(2)).await.unwrap();
        cluster.restore_network(&unit(2)).await.unwrap();
        assert!(cluster.is_healthy(ReplicaId(102)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_unit_cannot_answer() {
        let cluster = cluster();
        cluster.isolate(&unit(0)).await.unwrap();
        let err = cluster
            .describe_topic(TOPIC, Some(&unit(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
        assert!(cluster.describe_topic(TOPIC, Some(&unit(1))).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_unit_changes_address() {
        let cluster = cluster();
        let before = cluster.unit_address(&unit(0)).await.unwrap();
        cluster.delete_unit(&unit(0)).await.unwrap();
        assert!(cluster.unit_address(&unit(0)).await.is_err());

        sleep(Duration::from_secs(16)).await;
        let after = cluster.unit_address(&unit(0)).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_appends_and_offsets_advance() {
        let cluster = cluster();
        for sequence in 0..3 {
            let ack = cluster.publish(TOPIC, &Record::new(sequence)).await.unwrap();
            assert_eq!(ack.offset, sequence as i64);
        }
        let offsets = cluster.read_offsets(TOPIC, None).await.unwrap();
        assert_eq!(offsets.as_slice(), &[3]);
        assert_eq!(cluster.read_records(TOPIC).await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_failure_leaves_duplicate_on_retry() {
        let cluster = cluster();
        cluster.inject_publish_failures(1);
        let err = cluster.publish(TOPIC, &Record::new(0)).await.unwrap_err();
        assert!(err.kind().is_ack_phase());
        cluster.publish(TOPIC, &Record::new(0)).await.unwrap();
        assert_eq!(cluster.read_records(TOPIC).await.unwrap(), vec![0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_topic_discards_records() {
        let cluster = cluster();
        cluster.publish(TOPIC, &Record::new(0)).await.unwrap();
        cluster.reset_topic(TOPIC).await.unwrap();
        assert_eq!(cluster.read_offsets(TOPIC, None).await.unwrap().as_slice(), &[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_topic_is_not_found() {
        let cluster = cluster();
        let err = cluster.describe_topic("nope", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
