// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator Configuration Types
//
// Defines the configuration schema for the orchestrating node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Storage backend selection
// - Container runtime, port range and naming defaults
// - Execution and health-probe timeouts
// - Metering interval, rate card and default budget
// - Logging and metrics settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::billing::RateCard;
use crate::domain::repository::{PostgresConfig, StorageBackend};

pub const API_VERSION: &str = "aghub.dev/v1";
pub const KIND: &str = "OrchestratorConfig";

/// Top-level Kubernetes-style configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfigManifest {
    /// API version (must be "aghub.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "OrchestratorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: OrchestratorConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfigSpec {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub billing: BillingConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl StorageConfig {
    /// `None` for a postgres backend without a database URL.
    pub fn to_backend(&self) -> Option<StorageBackend> {
        match self.backend {
            StorageBackendKind::Memory => Some(StorageBackend::InMemory),
            StorageBackendKind::Postgres => self.database_url.as_ref().map(|url| {
                StorageBackend::PostgreSQL(PostgresConfig {
                    connection_string: url.clone(),
                    max_connections: self.max_connections,
                })
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker socket path or URL; local defaults when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket: Option<String>,

    /// Base image for agents that ship no Dockerfile
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Port networked agents listen on inside the container
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    #[serde(default = "default_port_range")]
    pub external_port_range: PortRange,

    /// Host the published ports are reachable on
    #[serde(default = "default_endpoint_host")]
    pub endpoint_host: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,

    /// Default bound on waiting for container removal
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,

    #[serde(default = "default_removal_poll_interval", with = "humantime_serde")]
    pub removal_poll_interval: Duration,

    /// Grace period handed to the runtime before it kills the container
    #[serde(default = "default_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Log lines captured from failed containers
    #[serde(default = "default_log_tail")]
    pub log_tail: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: None,
            base_image: default_base_image(),
            internal_port: default_internal_port(),
            external_port_range: default_port_range(),
            endpoint_host: default_endpoint_host(),
            cpu_millis: None,
            memory_limit_mb: None,
            stop_timeout: default_stop_timeout(),
            removal_poll_interval: default_removal_poll_interval(),
            stop_grace: default_stop_grace(),
            log_tail: default_log_tail(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Bound on a single `POST /chat` call
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Bound on a single in-container exec
    #[serde(default = "default_exec_timeout", with = "humantime_serde")]
    pub exec_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            exec_timeout: default_exec_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_collection_interval", with = "humantime_serde")]
    pub collection_interval: Duration,

    #[serde(default)]
    pub rates: RateCard,

    /// Applied to users without their own budget; unlimited when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_monthly_budget: Option<f64>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            collection_interval: default_collection_interval(),
            rates: RateCard::default(),
            default_monthly_budget: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_backend() -> StorageBackendKind {
    StorageBackendKind::Memory
}

fn default_max_connections() -> u32 {
    10
}

fn default_base_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_internal_port() -> u16 {
    8080
}

fn default_port_range() -> PortRange {
    PortRange {
        start: 20000,
        end: 29999,
    }
}

fn default_endpoint_host() -> String {
    "127.0.0.1".to_string()
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_removal_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_log_tail() -> usize {
    200
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_exec_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_collection_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9091
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for OrchestratorConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "aghub-orchestrator".to_string(),
                version: None,
                labels: None,
            },
            spec: OrchestratorConfigSpec::default(),
        }
    }
}

impl OrchestratorConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AGHUB_CONFIG_PATH environment variable
    /// 2. ./aghub-config.yaml (working directory)
    /// 3. ~/.aghub/config.yaml (user home)
    /// 4. /etc/aghub/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AGHUB_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./aghub-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aghub").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/aghub/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("AGHUB_DATABASE_URL") {
            tracing::info!("Environment override: AGHUB_DATABASE_URL (backend=postgres)");
            self.spec.storage.database_url = Some(url);
            self.spec.storage.backend = StorageBackendKind::Postgres;
        }

        if let Some(socket) = lookup("AGHUB_DOCKER_SOCKET") {
            tracing::info!("Environment override: AGHUB_DOCKER_SOCKET={}", socket);
            self.spec.runtime.docker_socket = Some(socket);
        }

        if let Some(val) = lookup("AGHUB_COLLECTION_INTERVAL") {
            match humantime_serde::re::humantime::parse_duration(&val) {
                Ok(interval) => {
                    tracing::info!("Environment override: AGHUB_COLLECTION_INTERVAL={}", val);
                    self.spec.billing.collection_interval = interval;
                }
                Err(e) => {
                    tracing::warn!(
                        "Invalid value for AGHUB_COLLECTION_INTERVAL: '{}' ({}). Ignoring.",
                        val,
                        e
                    );
                }
            }
        }

        if let Some(host) = lookup("AGHUB_ENDPOINT_HOST") {
            tracing::info!("Environment override: AGHUB_ENDPOINT_HOST={}", host);
            self.spec.runtime.endpoint_host = host;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let range = self.spec.runtime.external_port_range;
        if range.is_empty() {
            anyhow::bail!(
                "spec.runtime.external_port_range is empty ({}-{})",
                range.start,
                range.end
            );
        }
        if range.start < 1024 {
            anyhow::bail!(
                "spec.runtime.external_port_range must start at or above 1024 (got {})",
                range.start
            );
        }

        if self.spec.billing.collection_interval.is_zero() {
            anyhow::bail!("spec.billing.collection_interval must be greater than zero");
        }

        if self.spec.billing.rates.has_negative_rate() {
            anyhow::bail!("spec.billing.rates must be finite and non-negative");
        }

        if let Some(budget) = self.spec.billing.default_monthly_budget {
            if budget < 0.0 {
                anyhow::bail!("spec.billing.default_monthly_budget cannot be negative");
            }
        }

        if self.spec.storage.backend == StorageBackendKind::Postgres
            && self
                .spec
                .storage
                .database_url
                .as_deref()
                .map_or(true, str::is_empty)
        {
            anyhow::bail!("spec.storage.database_url is required for the postgres backend");
        }

        match self.spec.observability.log_format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("Unknown log_format '{}'. Expected 'text' or 'json'", other),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_manifest() {
        let manifest = OrchestratorConfigManifest::default();
        assert_eq!(manifest.api_version, "aghub.dev/v1");
        assert_eq!(manifest.kind, "OrchestratorConfig");
        assert_eq!(manifest.spec.billing.collection_interval, Duration::from_secs(30));
        assert_eq!(manifest.spec.storage.backend, StorageBackendKind::Memory);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_storage_backend_selection() {
        let mut storage = StorageConfig::default();
        assert!(matches!(storage.to_backend(), Some(StorageBackend::InMemory)));

        storage.backend = StorageBackendKind::Postgres;
        assert!(storage.to_backend().is_none());

        storage.database_url = Some("postgres://aghub@localhost/aghub".to_string());
        match storage.to_backend() {
            Some(StorageBackend::PostgreSQL(config)) => {
                assert_eq!(config.max_connections, 10);
                assert!(config.connection_string.ends_with("/aghub"));
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_yaml_with_humantime_durations() {
        let yaml = r#"
apiVersion: aghub.dev/v1
kind: OrchestratorConfig
metadata:
  name: test-node
spec:
  storage:
    backend: postgres
    database_url: postgres://aghub@localhost/aghub
  runtime:
    external_port_range: { start: 31000, end: 31010 }
    stop_timeout: 45s
  billing:
    collection_interval: 1m
    rates:
      cpu_per_vcpu_hour: 4.16
      memory_per_gb_hour: 0.56
    default_monthly_budget: 25.0
"#;
        let manifest = OrchestratorConfigManifest::from_yaml_str(yaml).unwrap();
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.spec.runtime.stop_timeout, Duration::from_secs(45));
        assert_eq!(manifest.spec.runtime.internal_port, 8080);
        assert_eq!(manifest.spec.billing.collection_interval, Duration::from_secs(60));
        assert_eq!(manifest.spec.billing.rates.cpu_per_vcpu_hour, 4.16);
        assert_eq!(
            manifest.spec.billing.rates.network_per_gb,
            RateCard::default().network_per_gb
        );
        assert_eq!(manifest.spec.billing.default_monthly_budget, Some(25.0));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let yaml = serde_yaml::to_string(&OrchestratorConfigManifest::default()).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let manifest = OrchestratorConfigManifest::from_yaml_file(file.path()).unwrap();
        assert_eq!(manifest.metadata.name, "aghub-orchestrator");

        let missing = OrchestratorConfigManifest::load_or_default(Some(PathBuf::from(
            "/nonexistent/aghub-config.yaml",
        )));
        assert!(missing.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut manifest = OrchestratorConfigManifest::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("AGHUB_DATABASE_URL", "postgres://db/aghub"),
            ("AGHUB_COLLECTION_INTERVAL", "15s"),
            ("AGHUB_ENDPOINT_HOST", "10.0.0.5"),
        ]);
        manifest.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(manifest.spec.storage.backend, StorageBackendKind::Postgres);
        assert_eq!(
            manifest.spec.storage.database_url.as_deref(),
            Some("postgres://db/aghub")
        );
        assert_eq!(manifest.spec.billing.collection_interval, Duration::from_secs(15));
        assert_eq!(manifest.spec.runtime.endpoint_host, "10.0.0.5");
        assert!(manifest.spec.runtime.docker_socket.is_none());

        manifest.apply_overrides_from(|key| {
            (key == "AGHUB_COLLECTION_INTERVAL").then(|| "soon".to_string())
        });
        assert_eq!(manifest.spec.billing.collection_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_validation() {
        let mut manifest = OrchestratorConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.runtime.external_port_range = PortRange { start: 500, end: 600 };
        assert!(manifest.validate().is_err());
        manifest.spec.runtime.external_port_range = PortRange { start: 3000, end: 2000 };
        assert!(manifest.validate().is_err());
        manifest.spec.runtime.external_port_range = default_port_range();

        manifest.spec.billing.collection_interval = Duration::ZERO;
        assert!(manifest.validate().is_err());
        manifest.spec.billing.collection_interval = default_collection_interval();

        manifest.spec.billing.rates.memory_per_gb_hour = -0.1;
        assert!(manifest.validate().is_err());
        manifest.spec.billing.rates = RateCard::default();

        manifest.spec.storage.backend = StorageBackendKind::Postgres;
        assert!(manifest.validate().is_err());
        manifest.spec.storage.database_url = Some("postgres://localhost/aghub".to_string());
        assert!(manifest.validate().is_ok());
    }
}
