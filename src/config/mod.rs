use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub deployment: DeploymentSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub terraform: TerraformConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub quality: QualityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: default_admin_token(),
        }
    }
}

fn default_admin_token() -> String {
    // Generate a random token if not provided
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Pipeline engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Base delay of the step retry backoff
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound of the step retry backoff
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Script steps without their own timeout are killed after this long
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_workflow_poll_interval_secs")]
    pub workflow_poll_interval_secs: u64,
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            script_timeout_secs: default_script_timeout_secs(),
            workflow_poll_interval_secs: default_workflow_poll_interval_secs(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_script_timeout_secs() -> u64 {
    600
}

fn default_workflow_poll_interval_secs() -> u64 {
    15
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

impl PipelineSettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn workflow_poll_interval(&self) -> Duration {
        Duration::from_secs(self.workflow_poll_interval_secs)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }
}

/// Deployment orchestrator tuning
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSettings {
    /// Budget for a workload to become ready after a rollout call
    #[serde(default = "default_rollout_timeout_secs")]
    pub rollout_timeout_secs: u64,
    /// Delay before the post-deploy quality check runs
    #[serde(default = "default_quality_monitor_delay_secs")]
    pub quality_monitor_delay_secs: u64,
    /// Budget for a repository build workflow to finish
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_workflow_poll_interval_secs")]
    pub build_poll_interval_secs: u64,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            rollout_timeout_secs: default_rollout_timeout_secs(),
            quality_monitor_delay_secs: default_quality_monitor_delay_secs(),
            build_timeout_secs: default_build_timeout_secs(),
            build_poll_interval_secs: default_workflow_poll_interval_secs(),
        }
    }
}

fn default_rollout_timeout_secs() -> u64 {
    600
}

fn default_quality_monitor_delay_secs() -> u64 {
    300
}

fn default_build_timeout_secs() -> u64 {
    1800
}

impl DeploymentSettings {
    pub fn rollout_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_timeout_secs)
    }

    pub fn quality_monitor_delay(&self) -> Duration {
        Duration::from_secs(self.quality_monitor_delay_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn build_poll_interval(&self) -> Duration {
        Duration::from_secs(self.build_poll_interval_secs)
    }
}

/// Background job queue tuning
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Attempts before a job is moved to the dead letter list
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_queue_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_queue_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_queue_backoff_cap_ms(),
        }
    }
}

fn default_queue_max_attempts() -> u32 {
    3
}

fn default_queue_backoff_cap_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Kubeconfig context to use; the in-cluster or default context otherwise
    pub context: Option<String>,
    /// Field manager name for server-side apply
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context: None,
            field_manager: default_field_manager(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_field_manager() -> String {
    "conveyor".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_docker_socket")]
    pub socket: String,
    /// Image scanner binary (trivy-compatible JSON output)
    #[serde(default = "default_scanner")]
    pub scanner: String,
    pub registry_username: Option<String>,
    pub registry_password: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket: default_docker_socket(),
            scanner: default_scanner(),
            registry_username: None,
            registry_password: None,
        }
    }
}

fn default_docker_socket() -> String {
    if cfg!(windows) {
        "npipe:////./pipe/docker_engine".to_string()
    } else {
        "/var/run/docker.sock".to_string()
    }
}

fn default_scanner() -> String {
    "trivy".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
    /// Token with `actions:write` and `deployments:write`
    pub token: Option<String>,
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: default_github_api_url(),
        }
    }
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerraformConfig {
    #[serde(default = "default_terraform_binary")]
    pub binary: String,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            binary: default_terraform_binary(),
        }
    }
}

fn default_terraform_binary() -> String {
    "terraform".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrometheusConfig {
    /// Base URL of the Prometheus HTTP API, e.g. http://prometheus:9090
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QualityConfig {
    /// Base URL of the quality evaluation service
    pub url: Option<String>,
    pub api_key: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    /// Problems that would make the server misbehave at runtime
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.pipeline.backoff_base_ms > self.pipeline.backoff_cap_ms {
            problems.push("pipeline.backoff_base_ms exceeds pipeline.backoff_cap_ms".to_string());
        }
        if self.queue.max_attempts == 0 {
            problems.push("queue.max_attempts must be at least 1".to_string());
        }
        if self.auth.admin_token.len() < 16 {
            problems.push("auth.admin_token should be at least 16 characters".to_string());
        }
        if self.github.token.is_none() {
            problems.push("github.token is not set; repository sources and github-action steps are unavailable".to_string());
        }
        problems
    }
}
