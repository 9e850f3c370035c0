//! Configuration structures for HA scenario runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checker::TolerancePolicy;
use crate::cluster::SimulationProfile;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Cluster under test
    pub cluster: KafkaConfig,

    /// Topic the continuous writes go to
    #[serde(default)]
    pub topic: TopicConfig,

    /// Continuous write loop options
    #[serde(default)]
    pub writes: WriteOptions,

    /// Observation query options
    #[serde(default)]
    pub observer: ObserverOptions,

    /// Scenario wait windows
    #[serde(default)]
    pub timings: ScenarioTimings,

    /// Kubernetes control plane (required unless running simulated)
    #[serde(default)]
    pub control_plane: Option<ControlPlaneConfig>,

    /// Consistency checker tolerance
    #[serde(default)]
    pub checker: TolerancePolicy,

    /// In-memory cluster model used by `--simulate`
    #[serde(default)]
    pub simulation: SimulationProfile,
}

/// Kafka cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap servers
    pub bootstrap_servers: Vec<String>,

    /// Security configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// TCP connection tuning
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Application name of the broker units (`kafka-k8s`)
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Broker id of unit 0; broker ids are `offset + unit index`
    #[serde(default = "default_broker_id_offset")]
    pub broker_id_offset: i32,

    /// Number of broker units in the cluster
    #[serde(default = "default_replica_count")]
    pub replica_count: u32,

    /// Address of a single member; `{app}` and `{index}` are substituted
    #[serde(default = "default_member_address_template")]
    pub member_address_template: String,
}

fn default_app_name() -> String {
    "kafka-k8s".to_string()
}

fn default_broker_id_offset() -> i32 {
    100
}

fn default_replica_count() -> u32 {
    3
}

fn default_member_address_template() -> String {
    "{app}-{index}.{app}-endpoints:9092".to_string()
}

impl KafkaConfig {
    /// Config pointing at the given bootstrap servers with defaults elsewhere.
    pub fn with_bootstrap(servers: Vec<String>) -> Self {
        Self {
            bootstrap_servers: servers,
            security: SecurityConfig::default(),
            connection: ConnectionConfig::default(),
            app_name: default_app_name(),
            broker_id_offset: default_broker_id_offset(),
            replica_count: default_replica_count(),
            member_address_template: default_member_address_template(),
        }
    }

    /// Resolve the address of unit `index` from the template.
    pub fn member_address(&self, index: u32) -> String {
        self.member_address_template
            .replace("{app}", &self.app_name)
            .replace("{index}", &index.to_string())
    }

    /// Host part of a member address (what name resolution must map).
    pub fn member_host(&self, index: u32) -> String {
        let address = self.member_address(index);
        match address.rsplit_once(':') {
            Some((host, _)) => host.to_string(),
            None => address,
        }
    }
}

/// Security configuration for Kafka connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Security protocol
    #[serde(default)]
    pub security_protocol: SecurityProtocol,

    /// SASL mechanism (if using SASL)
    #[serde(default)]
    pub sasl_mechanism: Option<SaslMechanism>,

    /// SASL username
    #[serde(default)]
    pub sasl_username: Option<String>,

    /// SASL password
    #[serde(default)]
    pub sasl_password: Option<String>,
}

/// Security protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    SaslPlaintext,
}

/// SASL mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum SaslMechanism {
    Plain,
}

/// TCP socket options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,
    #[serde(default = "default_keepalive_time_secs")]
    pub keepalive_time_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tcp_keepalive: true,
            keepalive_time_secs: default_keepalive_time_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            tcp_nodelay: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_keepalive_time_secs() -> u64 {
    60
}

fn default_keepalive_interval_secs() -> u64 {
    20
}

/// Harness topic settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_topic_name")]
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i16,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: default_topic_name(),
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
        }
    }
}

fn default_topic_name() -> String {
    "ha-test-topic".to_string()
}

fn default_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i16 {
    3
}

/// Continuous write loop options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Publish attempts per record before it is recorded as failed (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds (default: 100)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay in milliseconds (default: 5000)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Bound on a single publish call in milliseconds (default: 10000)
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Pause between consecutive records in milliseconds (default: 50)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl WriteOptions {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_publish_timeout_ms() -> u64 {
    10_000
}

fn default_interval_ms() -> u64 {
    50
}

/// Observation query options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverOptions {
    /// Bound on one metadata/offset query in milliseconds (default: 15000)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Attempts per observation before surfacing the error (default: 3)
    #[serde(default = "default_observer_attempts")]
    pub attempts: u32,

    /// Delay between observation attempts in milliseconds (default: 1000)
    #[serde(default = "default_observer_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            attempts: default_observer_attempts(),
            retry_delay_ms: default_observer_retry_delay_ms(),
        }
    }
}

impl ObserverOptions {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_query_timeout_ms() -> u64 {
    15_000
}

fn default_observer_attempts() -> u32 {
    3
}

fn default_observer_retry_delay_ms() -> u64 {
    1_000
}

/// Scenario wait windows, tuned to the broker's reelection and client timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioTimings {
    /// Time for surviving brokers to notice a lost leader (default: 25)
    #[serde(default = "default_reelection_secs")]
    pub reelection_secs: u64,

    /// Extended supervisor restart delay (default: 60)
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,

    /// Producer-side request timeout (default: 30)
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,

    /// Writes allowed to accumulate before the first perturbation (default: 5)
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,

    /// Time for a deleted unit to be rescheduled and settle (default: 90)
    #[serde(default = "default_reschedule_secs")]
    pub reschedule_secs: u64,

    /// Join timeout for concurrent multi-target dispatch (default: 30)
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
}

impl Default for ScenarioTimings {
    fn default() -> Self {
        Self {
            reelection_secs: default_reelection_secs(),
            restart_delay_secs: default_restart_delay_secs(),
            client_timeout_secs: default_client_timeout_secs(),
            settle_secs: default_settle_secs(),
            reschedule_secs: default_reschedule_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
        }
    }
}

impl ScenarioTimings {
    pub fn reelection(&self) -> Duration {
        Duration::from_secs(self.reelection_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn reschedule(&self) -> Duration {
        Duration::from_secs(self.reschedule_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

fn default_reelection_secs() -> u64 {
    25
}

fn default_restart_delay_secs() -> u64 {
    60
}

fn default_client_timeout_secs() -> u64 {
    30
}

fn default_settle_secs() -> u64 {
    5
}

fn default_reschedule_secs() -> u64 {
    90
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

/// Kubernetes control plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Namespace (Juju model) the cluster runs in
    pub namespace: String,

    /// kubectl binary
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    /// Workload container inside each pod
    #[serde(default = "default_container")]
    pub container: String,

    /// Pattern matched by `pkill -f` to find the broker process
    #[serde(default = "default_process_pattern")]
    pub process_pattern: String,

    /// Pebble binary inside the workload container
    #[serde(default = "default_pebble")]
    pub pebble: String,

    /// Pebble service name of the broker
    #[serde(default = "default_service")]
    pub service: String,

    /// Restart backoff applied by the extend policy in seconds (default: 60)
    #[serde(default = "default_restart_delay_secs")]
    pub extended_backoff_secs: u64,

    /// Hosts file kept in sync with unit addresses
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,

    /// Name of the NetworkChaos resource used for isolation
    #[serde(default = "default_network_chaos_name")]
    pub network_chaos_name: String,

    /// Bound on each kubectl invocation in seconds (default: 60)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl ControlPlaneConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_container() -> String {
    "kafka".to_string()
}

fn default_process_pattern() -> String {
    "kafka.Kafka".to_string()
}

fn default_pebble() -> String {
    "/charm/bin/pebble".to_string()
}

fn default_service() -> String {
    "kafka".to_string()
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

fn default_network_chaos_name() -> String {
    "network-loss-primary".to_string()
}

fn default_command_timeout_secs() -> u64 {
    60
}

impl HarnessConfig {
    /// Parse a YAML configuration document.
    pub fn from_yaml_str(content: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load and validate a YAML configuration file.
    pub async fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_yaml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.cluster.bootstrap_servers.is_empty() {
            return Err(crate::Error::Config(
                "cluster.bootstrap_servers must not be empty".to_string(),
            ));
        }

        if self.cluster.replica_count == 0 {
            return Err(crate::Error::Config(
                "cluster.replica_count must be > 0".to_string(),
            ));
        }

        if !self.cluster.member_address_template.contains("{index}") {
            return Err(crate::Error::Config(
                "cluster.member_address_template must contain {index}".to_string(),
            ));
        }

        if self.cluster.security.security_protocol == SecurityProtocol::SaslPlaintext
            && (self.cluster.security.sasl_username.is_none()
                || self.cluster.security.sasl_password.is_none())
        {
            return Err(crate::Error::Config(
                "sasl_username and sasl_password are required for SASL_PLAINTEXT".to_string(),
            ));
        }

        if self.topic.name.is_empty() {
            return Err(crate::Error::Config("topic.name must not be empty".to_string()));
        }

        if self.topic.partitions <= 0 {
            return Err(crate::Error::Config("topic.partitions must be > 0".to_string()));
        }

        if self.topic.replication_factor <= 0
            || self.topic.replication_factor as u32 > self.cluster.replica_count
        {
            return Err(crate::Error::Config(format!(
                "topic.replication_factor ({}) must be between 1 and replica_count ({})",
                self.topic.replication_factor, self.cluster.replica_count
            )));
        }

        if self.writes.max_attempts == 0 {
            return Err(crate::Error::Config(
                "writes.max_attempts must be > 0".to_string(),
            ));
        }

        if self.writes.initial_backoff_ms > self.writes.max_backoff_ms {
            return Err(crate::Error::Config(format!(
                "writes.initial_backoff_ms ({}) > writes.max_backoff_ms ({})",
                self.writes.initial_backoff_ms, self.writes.max_backoff_ms
            )));
        }

        if self.writes.publish_timeout_ms == 0 || self.observer.query_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "publish and query timeouts must be > 0".to_string(),
            ));
        }

        if self.observer.attempts == 0 {
            return Err(crate::Error::Config(
                "observer.attempts must be > 0".to_string(),
            ));
        }

        if self.timings.dispatch_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "timings.dispatch_timeout_secs must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate that a real control plane is configured.
    pub fn require_control_plane(&self) -> crate::Result<&ControlPlaneConfig> {
        self.control_plane.as_ref().ok_or_else(|| {
            crate::Error::Config(
                "control_plane section is required unless running simulated".to_string(),
            )
        })
    }
}
