//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Listener configuration
    pub listener: ListenerConfig,
    /// Directory connection configuration
    pub directory: DirectoryConfig,
    /// Directory schema (filters and attribute names)
    pub schema: SchemaConfig,
    /// Policy cache configuration
    pub policy_cache: PolicyCacheConfig,
    /// Decryption keyring configuration
    pub keyring: KeyringConfig,
    /// Response behavior configuration
    pub response: ResponseConfig,
}

/// Unix-domain socket listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Path of the Unix-domain socket to bind
    pub socket_path: String,
    /// Peer UIDs allowed to connect (empty = any)
    pub allowed_uids: Vec<u32>,
    /// Peer GIDs allowed to connect (empty = any)
    pub allowed_gids: Vec<u32>,
    /// Number of requests handled concurrently across all connections
    pub workers: usize,
    /// Socket read timeout (idle connections are closed after this)
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Socket write timeout
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/oath-sockd/socket".to_string(),
            allowed_uids: Vec::new(),
            allowed_gids: Vec::new(),
            workers: 8,
            read_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// Directory connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Directory server URL (`ldap://`, `ldaps://`, or `ldapi://`)
    pub url: String,
    /// DN to bind as (anonymous when unset)
    pub bind_dn: Option<String>,
    /// Password for the bind DN (supports `env:VAR_NAME`)
    pub bind_password: Option<String>,
    /// Connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-operation timeout
    #[serde(with = "humantime_serde")]
    pub op_timeout: Duration,
    /// Retry attempts on transient connection loss
    pub retry_attempts: u32,
    /// Fixed delay between retry attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: "ldapi://%2Frun%2Fslapd%2Fldapi".to_string(),
            bind_dn: None,
            bind_password: None,
            connect_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl DirectoryConfig {
    /// Resolve the bind password (expand `env:VAR_NAME` references)
    #[must_use]
    pub fn resolve_bind_password(&self) -> Option<String> {
        self.bind_password.as_ref().map(|pw| {
            if let Some(var_name) = pw.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| pw.clone())
            } else {
                pw.clone()
            }
        })
    }
}

/// Directory schema: the filters that recognize OTP entries and the
/// attribute names this deployment uses. Defaults follow the OATH-LDAP
/// schema; every name can be overridden for local variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Filter an entry must match to count as an OTP-capable principal
    pub principal_filter: String,
    /// Filter an entry must match to count as a fully-provisioned token
    pub token_filter: String,
    /// COMPARE assertions on this attribute trigger OTP validation
    pub compare_attr: String,
    /// Principal: credential hash
    pub password_attr: String,
    /// Principal: reference to the token entry (defaults to self when absent)
    pub token_ref_attr: String,
    /// Principal: validity-period start; unset disables the check
    pub not_before_attr: Option<String>,
    /// Principal: validity-period end; unset disables the check
    pub not_after_attr: Option<String>,
    /// Principal: failure-timestamp history
    pub failure_time_attr: String,
    /// Token: HOTP counter
    pub counter_attr: String,
    /// Token: shared secret blob
    pub secret_attr: String,
    /// Token: token identifier
    pub token_id_attr: String,
    /// Token: reference to the policy entry
    pub policy_ref_attr: String,
    /// Token: time the secret was provisioned
    pub secret_time_attr: String,
    /// Token: consecutive failure count
    pub failure_count_attr: String,
    /// Token: last successful validation timestamp
    pub last_login_attr: String,
    /// Token: last failed validation timestamp
    pub last_failure_attr: String,
    /// Operational attribute used as `secret_time_attr` fallback
    pub create_timestamp_attr: String,
    /// Policy: OTP length in digits
    pub otp_length_attr: String,
    /// Policy: counter look-ahead window
    pub look_ahead_attr: String,
    /// Policy: maximum usage count
    pub max_usage_attr: String,
    /// Policy: maximum secret age in seconds
    pub secret_max_age_attr: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            principal_filter: "(&(objectClass=oathHOTPUser)(oathHOTPToken=*))".to_string(),
            token_filter: "(&(objectClass=oathHOTPToken)(oathHOTPCounter>=0)(oathSecret=*))"
                .to_string(),
            compare_attr: "oathHOTPValue".to_string(),
            password_attr: "userPassword".to_string(),
            token_ref_attr: "oathHOTPToken".to_string(),
            not_before_attr: Some("aeNotBefore".to_string()),
            not_after_attr: Some("aeNotAfter".to_string()),
            failure_time_attr: "pwdFailureTime".to_string(),
            counter_attr: "oathHOTPCounter".to_string(),
            secret_attr: "oathSecret".to_string(),
            token_id_attr: "oathTokenIdentifier".to_string(),
            policy_ref_attr: "oathHOTPParams".to_string(),
            secret_time_attr: "oathSecretTime".to_string(),
            failure_count_attr: "oathFailureCount".to_string(),
            last_login_attr: "oathLastLogin".to_string(),
            last_failure_attr: "oathLastFailure".to_string(),
            create_timestamp_attr: "createTimestamp".to_string(),
            otp_length_attr: "oathOTPLength".to_string(),
            look_ahead_attr: "oathHOTPLookAhead".to_string(),
            max_usage_attr: "oathMaxUsageCount".to_string(),
            secret_max_age_attr: "oathSecretMaxAge".to_string(),
        }
    }
}

/// Policy cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyCacheConfig {
    /// Enable policy caching
    pub enabled: bool,
    /// TTL for cached policy entries
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for PolicyCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(600),
        }
    }
}

/// Decryption keyring configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeyringConfig {
    /// Glob pattern for key files; unset means stored secrets are plain
    /// base32 and no envelope decryption is available
    pub key_files: Option<String>,
}

/// Response behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResponseConfig {
    /// Attach a diagnostic reason code to rejections. Off by default:
    /// rejection responses must be byte-identical regardless of cause.
    pub verbose: bool,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (OATH_SOCKD_ prefix)
        figment = figment.merge(Env::prefixed("OATH_SOCKD_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        // Expand ${VAR} in string-valued settings
        config.expand_env_vars();

        config.validate()?;

        Ok(config)
    }

    /// Fail fast on settings that would only surface mid-request.
    fn validate(&self) -> Result<()> {
        if self.listener.workers == 0 {
            return Err(Error::Config("listener.workers must be at least 1".into()));
        }
        if self.listener.socket_path.is_empty() {
            return Err(Error::Config("listener.socket_path must be set".into()));
        }
        for (name, filter) in [
            ("schema.principal_filter", &self.schema.principal_filter),
            ("schema.token_filter", &self.schema.token_filter),
        ] {
            if !filter.starts_with('(') || !filter.ends_with(')') {
                return Err(Error::Config(format!(
                    "{name} is not a parenthesized LDAP filter: {filter}"
                )));
            }
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        self.listener.socket_path = Self::expand_string(&re, &self.listener.socket_path);
        self.directory.url = Self::expand_string(&re, &self.directory.url);
        if let Some(glob) = &self.keyring.key_files {
            self.keyring.key_files = Some(Self::expand_string(&re, glob));
        }
        self.schema.principal_filter = Self::expand_string(&re, &self.schema.principal_filter);
        self.schema.token_filter = Self::expand_string(&re, &self.schema.token_filter);
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures<'_>| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listener.workers, 8);
        assert_eq!(config.policy_cache.ttl, Duration::from_secs(600));
        assert!(!config.response.verbose);
        assert_eq!(config.schema.compare_attr, "oathHOTPValue");
        assert_eq!(config.schema.not_before_attr.as_deref(), Some("aeNotBefore"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = Config {
            listener: ListenerConfig {
                workers: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_filter() {
        let config = Config {
            schema: SchemaConfig {
                principal_filter: "objectClass=oathHOTPUser".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oath-sockd.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "listener:\n  socket_path: /tmp/test.sock\n  workers: 2\nresponse:\n  verbose: true"
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.listener.socket_path, "/tmp/test.sock");
        assert_eq!(config.listener.workers, 2);
        assert!(config.response.verbose);
        // Untouched sections keep their defaults
        assert_eq!(config.schema.counter_attr, "oathHOTPCounter");
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/oath-sockd.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_duration_parsing() {
        let yaml = "listener:\n  read_timeout: 90s\n  write_timeout: 500ms\n";
        let config: Config = serde_yaml_from(yaml);
        assert_eq!(config.listener.read_timeout, Duration::from_secs(90));
        assert_eq!(config.listener.write_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_resolve_bind_password_env() {
        // Uses PATH as a stand-in env var that is always present
        let config = DirectoryConfig {
            bind_password: Some("env:PATH".to_string()),
            ..Default::default()
        };
        let resolved = config.resolve_bind_password().unwrap();
        assert_ne!(resolved, "env:PATH");
        assert!(!resolved.is_empty());
    }

    fn serde_yaml_from(yaml: &str) -> Config {
        Figment::new()
            .merge(figment::providers::Yaml::string(yaml))
            .extract()
            .unwrap()
    }
}
