//! Configuration management for the FHIR server

use crate::validation::ProfilePolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub fhir: FhirConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL used for `fullUrl`, `Location` and paging links.
    /// Default: `http://localhost:8080/fhir`
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Maximum request body size in bytes. Prevents DoS via large payloads.
    /// Default: 10 MB
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: default_base_url(),
            max_request_body_size: default_max_request_body_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FhirConfig {
    #[serde(default = "default_fhir_version")]
    pub version: String,
    #[serde(default)]
    pub search: FhirSearchConfig,
    /// Default Prefer header return behavior when client doesn't specify one.
    /// Valid values: "minimal", "representation", "operationoutcome"
    /// Default: "representation" (return full resource)
    #[serde(default = "default_prefer_return")]
    pub default_prefer_return: String,
    /// Allow clients to create resources via PUT with client-defined IDs.
    /// When false, an update of an unknown id is rejected.
    /// Default: true (allow update-as-create)
    #[serde(default = "default_true")]
    pub allow_update_create: bool,
    /// Skip the write when an update carries the same content as the current
    /// version (meta.versionId and meta.lastUpdated ignored).
    #[serde(default = "default_true")]
    pub skippable_updates: bool,
    /// `If-None-Match: *` on an existing resource answers 304 when true,
    /// 412 Precondition Failed otherwise.
    #[serde(default)]
    pub if_none_match_returns_not_modified: bool,
    /// Largest number of matches a conditional delete may remove.
    /// Default: 10
    #[serde(default = "default_conditional_delete_max_number")]
    pub conditional_delete_max_number: usize,
    /// Accept any resource type not listed under `resources`.
    #[serde(default = "default_true")]
    pub open: bool,
    /// Per resource type interaction allow-list and profile policy.
    /// The `Resource` key applies to every type without its own entry.
    #[serde(default)]
    pub resources: HashMap<String, ResourceConfig>,
}

impl Default for FhirConfig {
    fn default() -> Self {
        Self {
            version: default_fhir_version(),
            search: FhirSearchConfig::default(),
            default_prefer_return: default_prefer_return(),
            allow_update_create: true,
            skippable_updates: true,
            if_none_match_returns_not_modified: false,
            conditional_delete_max_number: default_conditional_delete_max_number(),
            open: true,
            resources: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceConfig {
    /// Allowed interactions (`create`, `read`, `vread`, `history`, `search`,
    /// `update`, `patch`, `delete`). `None` allows everything.
    #[serde(default)]
    pub interactions: Option<Vec<String>>,
    #[serde(default)]
    pub profiles: Option<ProfilePolicy>,
}

/// Interactions a resource type may be restricted to.
pub const INTERACTIONS: &[&str] = &[
    "create", "read", "vread", "history", "search", "update", "patch", "delete",
];

impl FhirConfig {
    fn resource_config(&self, resource_type: &str) -> Option<&ResourceConfig> {
        self.resources
            .get(resource_type)
            .or_else(|| self.resources.get("Resource"))
    }

    /// Check whether `interaction` may run against `resource_type`.
    pub fn check_interaction(&self, interaction: &str, resource_type: &str) -> crate::Result<()> {
        let allowed = match self.resources.get(resource_type) {
            Some(cfg) => cfg
                .interactions
                .as_ref()
                .map_or(true, |list| list.iter().any(|i| i == interaction)),
            None if !self.open => false,
            None => self
                .resources
                .get("Resource")
                .and_then(|cfg| cfg.interactions.as_ref())
                .map_or(true, |list| list.iter().any(|i| i == interaction)),
        };

        if allowed {
            Ok(())
        } else {
            Err(crate::Error::BusinessRule(format!(
                "The requested interaction of type '{}' is not allowed for resource type '{}'",
                interaction, resource_type
            )))
        }
    }

    /// Profile policy for `resource_type`, falling back to the `Resource` entry.
    pub fn profile_policy(&self, resource_type: &str) -> Option<&ProfilePolicy> {
        self.resources
            .get(resource_type)
            .and_then(|cfg| cfg.profiles.as_ref())
            .or_else(|| self.resource_config("Resource")?.profiles.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FhirSearchConfig {
    /// Default page size when _count is not specified.
    /// Default: 10
    #[serde(default = "default_search_default_count")]
    pub default_count: usize,
    /// Maximum allowed _count value to prevent overly large result sets.
    /// Default: 1000
    #[serde(default = "default_search_max_count")]
    pub max_count: usize,
    /// Maximum number of _include/_revinclude resources in one page.
    /// Default: 1000
    #[serde(default = "default_search_max_includes")]
    pub max_includes: usize,
    /// Ignore unknown or malformed search parameters (with a warning) instead
    /// of rejecting the request.
    #[serde(default = "default_true")]
    pub lenient: bool,
}

impl Default for FhirSearchConfig {
    fn default() -> Self {
        Self {
            default_count: default_search_default_count(),
            max_count: default_search_max_count(),
            max_includes: default_search_max_includes(),
            lenient: true,
        }
    }
}

/// Bounded retry for reindex and erase.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts before a retryable data-access error is surfaced. Default: 5
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Resources per reindex call when no explicit count is given. Default: 10
    #[serde(default = "default_reindex_window")]
    pub reindex_window: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_backoff_ms: default_retry_base_backoff_ms(),
            max_backoff_ms: default_retry_max_backoff_ms(),
            reindex_window: default_reindex_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON formatting for logs (recommended for production)
    #[serde(default)]
    pub json: bool,

    /// Enable file logging in addition to console
    #[serde(default)]
    pub file_enabled: bool,

    /// Directory for log files (default: ./logs)
    #[serde(default = "default_log_directory")]
    pub file_directory: String,

    /// Log file prefix (default: fhir-server)
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    /// Log rotation: daily, hourly, minutely, never (default: daily)
    #[serde(default = "default_log_rotation")]
    pub file_rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file_enabled: false,
            file_directory: default_log_directory(),
            file_prefix: default_log_file_prefix(),
            file_rotation: default_log_rotation(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            fhir: FhirConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_base_url() -> String {
    "http://localhost:8080/fhir".to_string()
}

fn default_max_request_body_size() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_fhir_version() -> String {
    "R4".to_string()
}

fn default_true() -> bool {
    true
}

fn default_prefer_return() -> String {
    "representation".to_string()
}

fn default_conditional_delete_max_number() -> usize {
    10
}

fn default_search_default_count() -> usize {
    10
}

fn default_search_max_count() -> usize {
    1000
}

fn default_search_max_includes() -> usize {
    1000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_backoff_ms() -> u64 {
    10
}

fn default_retry_max_backoff_ms() -> u64 {
    500
}

fn default_reindex_window() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directory() -> String {
    "./logs".to_string()
}

fn default_log_file_prefix() -> String {
    "fhir-server".to_string()
}

fn default_log_rotation() -> String {
    "daily".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            // Start with defaults
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("server.base_url", default_base_url())?
            .set_default(
                "server.max_request_body_size",
                default_max_request_body_size() as i64,
            )?
            .set_default("fhir.version", default_fhir_version())?
            .set_default(
                "fhir.search.default_count",
                default_search_default_count() as i64,
            )?
            .set_default("fhir.search.max_count", default_search_max_count() as i64)?
            .set_default(
                "fhir.search.max_includes",
                default_search_max_includes() as i64,
            )?
            .set_default("fhir.search.lenient", default_true())?
            .set_default("fhir.default_prefer_return", default_prefer_return())?
            .set_default("fhir.allow_update_create", default_true())?
            .set_default("fhir.skippable_updates", default_true())?
            .set_default("fhir.if_none_match_returns_not_modified", false)?
            .set_default(
                "fhir.conditional_delete_max_number",
                default_conditional_delete_max_number() as i64,
            )?
            .set_default("fhir.open", default_true())?
            .set_default("retry.max_attempts", default_retry_max_attempts() as i64)?
            .set_default(
                "retry.base_backoff_ms",
                default_retry_base_backoff_ms() as i64,
            )?
            .set_default("retry.max_backoff_ms", default_retry_max_backoff_ms() as i64)?
            .set_default("retry.reindex_window", default_reindex_window() as i64)?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            .set_default("logging.file_enabled", false)?
            .set_default("logging.file_directory", default_log_directory())?
            .set_default("logging.file_prefix", default_log_file_prefix())?
            .set_default("logging.file_rotation", default_log_rotation())?
            // Add config file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables
            // Uses double underscore (__) to map to nested config structure
            // Example: FHIR__SERVER__PORT → config.server.port
            .add_source(
                config::Environment::with_prefix("FHIR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        Ok(addr.parse()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        match self.fhir.default_prefer_return.as_str() {
            "minimal" | "representation" | "operationoutcome" => {}
            other => {
                return Err(format!(
                    "fhir.default_prefer_return must be one of minimal, representation, operationoutcome (got '{}')",
                    other
                ))
            }
        }

        if self.fhir.search.default_count > self.fhir.search.max_count {
            return Err("fhir.search.default_count must be <= fhir.search.max_count".to_string());
        }
        if self.fhir.conditional_delete_max_number == 0 {
            return Err("fhir.conditional_delete_max_number must be > 0".to_string());
        }

        for (resource_type, cfg) in &self.fhir.resources {
            if let Some(interactions) = &cfg.interactions {
                if let Some(unknown) = interactions.iter().find(|i| !INTERACTIONS.contains(&i.as_str())) {
                    return Err(format!(
                        "fhir.resources.{}.interactions contains unknown interaction '{}'",
                        resource_type, unknown
                    ));
                }
            }
        }

        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".to_string());
        }
        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            return Err("retry.max_backoff_ms must be >= retry.base_backoff_ms".to_string());
        }
        if self.retry.reindex_window == 0 {
            return Err("retry.reindex_window must be > 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted() -> FhirConfig {
        let mut fhir = FhirConfig {
            open: false,
            ..Default::default()
        };
        fhir.resources.insert(
            "Patient".to_string(),
            ResourceConfig {
                interactions: Some(vec!["read".to_string(), "search".to_string()]),
                profiles: None,
            },
        );
        fhir.resources.insert("Observation".to_string(), ResourceConfig::default());
        fhir
    }

    #[test]
    fn interaction_allow_list() {
        let fhir = restricted();
        assert!(fhir.check_interaction("read", "Patient").is_ok());
        let err = fhir.check_interaction("create", "Patient").unwrap_err();
        assert_eq!(
            err.to_string(),
            "The requested interaction of type 'create' is not allowed for resource type 'Patient'"
        );
        assert!(fhir.check_interaction("delete", "Observation").is_ok());
        assert!(fhir.check_interaction("read", "Encounter").is_err());
    }

    #[test]
    fn open_config_falls_back_to_generic_entry() {
        let mut fhir = FhirConfig::default();
        assert!(fhir.check_interaction("delete", "Encounter").is_ok());
        fhir.resources.insert(
            "Resource".to_string(),
            ResourceConfig {
                interactions: Some(vec!["read".to_string()]),
                profiles: Some(ProfilePolicy {
                    at_least_one: vec!["http://example.org/p".to_string()],
                    ..Default::default()
                }),
            },
        );
        assert!(fhir.check_interaction("delete", "Encounter").is_err());
        assert!(fhir.profile_policy("Encounter").is_some());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
        let mut config = Config::default();
        config.fhir.default_prefer_return = "everything".to_string();
        assert!(config.validate().is_err());
    }
}
