//! Configuration loading.
//!
//! TOML is the sole config source; CLI flags (`--batch-size`, `--interval`,
//! `--fast`, `--verbose`) override the corresponding values when present.
//! Default config path: `/etc/thermal-streamer/config.toml`.
//!
//! # Credential selection
//! Exactly one of `pat` (static bearer) or `private_key_file` (signed-token
//! mode) must be present under `[snowflake]`.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (validated, defaulted)
// ---------------------------------------------------------------------------

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub account: AccountConfig,
    pub credential: CredentialSource,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub user: String,
    pub account: String,
    pub url: String,
    pub role: String,
    pub database: String,
    pub schema: String,
    pub pipe: String,
    pub channel_name: String,
}

/// Exactly one credential source is configured.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    StaticBearer(String),
    SignedKeyFile(String),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub batch_size: usize,
    pub interval_seconds: f64,
    pub fast: bool,
    pub sensor_refresh_seconds: f64,
    pub system_refresh_seconds: f64,
}

impl RuntimeConfig {
    /// Pacing pause between readings within a batch: 50ms in "fast" mode,
    /// 500ms otherwise (spec §4.8, §6).
    pub fn intra_batch_delay(&self) -> std::time::Duration {
        if self.fast {
            std::time::Duration::from_millis(50)
        } else {
            std::time::Duration::from_millis(500)
        }
    }

    pub fn inter_batch_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.interval_seconds)
    }
}

/// CLI-sourced overrides, applied on top of the TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub batch_size: Option<usize>,
    pub interval: Option<f64>,
    pub fast: bool,
    pub verbose: bool,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    snowflake: Option<RawAccountConfig>,
    runtime: Option<RawRuntimeConfig>,
}

#[derive(Debug, Deserialize)]
struct RawAccountConfig {
    user: Option<String>,
    account: Option<String>,
    url: Option<String>,
    role: Option<String>,
    database: Option<String>,
    schema: Option<String>,
    pipe: Option<String>,
    channel_name: Option<String>,
    pat: Option<String>,
    private_key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRuntimeConfig {
    batch_size: Option<usize>,
    interval_seconds: Option<f64>,
    fast: Option<bool>,
    sensor_refresh_seconds: Option<f64>,
    system_refresh_seconds: Option<f64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path, applying CLI overrides.
pub fn load_config_from_path(
    path: &Path,
    overrides: &CliOverrides,
) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str, overrides)
}

/// Load config from the default path `/etc/thermal-streamer/config.toml`.
pub fn load_config(overrides: &CliOverrides) -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/thermal-streamer/config.toml"), overrides)
}

/// Load config from a TOML string, applying CLI overrides.
pub fn load_config_from_str(
    toml_str: &str,
    overrides: &CliOverrides,
) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_account = raw
        .snowflake
        .ok_or_else(|| ConfigError::MissingField("snowflake".to_owned()))?;

    let user = raw_account
        .user
        .ok_or_else(|| ConfigError::MissingField("snowflake.user".to_owned()))?;
    let account = raw_account
        .account
        .ok_or_else(|| ConfigError::MissingField("snowflake.account".to_owned()))?;
    let url = raw_account
        .url
        .ok_or_else(|| ConfigError::MissingField("snowflake.url".to_owned()))?;
    let role = raw_account
        .role
        .ok_or_else(|| ConfigError::MissingField("snowflake.role".to_owned()))?;
    let database = raw_account
        .database
        .ok_or_else(|| ConfigError::MissingField("snowflake.database".to_owned()))?;
    let schema = raw_account
        .schema
        .ok_or_else(|| ConfigError::MissingField("snowflake.schema".to_owned()))?;
    let pipe = raw_account
        .pipe
        .ok_or_else(|| ConfigError::MissingField("snowflake.pipe".to_owned()))?;
    let channel_name = raw_account
        .channel_name
        .ok_or_else(|| ConfigError::MissingField("snowflake.channel_name".to_owned()))?;

    let credential = match (raw_account.pat, raw_account.private_key_file) {
        (Some(pat), None) => CredentialSource::StaticBearer(pat),
        (None, Some(path)) => CredentialSource::SignedKeyFile(path),
        (None, None) => {
            return Err(ConfigError::MissingField(
                "exactly one of snowflake.pat or snowflake.private_key_file".to_owned(),
            ));
        }
        (Some(_), Some(_)) => {
            return Err(ConfigError::InvalidValue(
                "snowflake.pat and snowflake.private_key_file are mutually exclusive".to_owned(),
            ));
        }
    };

    let raw_runtime = raw.runtime.unwrap_or(RawRuntimeConfig {
        batch_size: None,
        interval_seconds: None,
        fast: None,
        sensor_refresh_seconds: None,
        system_refresh_seconds: None,
    });

    let batch_size = overrides
        .batch_size
        .or(raw_runtime.batch_size)
        .unwrap_or(10);
    if batch_size == 0 {
        return Err(ConfigError::InvalidValue(
            "runtime.batch_size must be >= 1".to_owned(),
        ));
    }
    let interval_seconds = overrides
        .interval
        .or(raw_runtime.interval_seconds)
        .unwrap_or(5.0);
    let fast = overrides.fast || raw_runtime.fast.unwrap_or(false);
    let sensor_refresh_seconds = raw_runtime.sensor_refresh_seconds.unwrap_or(5.0);
    let system_refresh_seconds = raw_runtime.system_refresh_seconds.unwrap_or(60.0);

    Ok(Config {
        account: AccountConfig {
            user,
            account,
            url,
            role,
            database,
            schema,
            pipe,
            channel_name,
        },
        credential,
        runtime: RuntimeConfig {
            batch_size,
            interval_seconds,
            fast,
            sensor_refresh_seconds,
            system_refresh_seconds,
        },
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [snowflake]
            user = "svc_user"
            account = "ab12345"
            url = "https://ab12345.snowflakecomputing.com"
            role = "ingest_role"
            database = "db"
            schema = "public"
            pipe = "pipe1"
            channel_name = "edge-1"
            pat = "static-token-abc"
        "#
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let cfg = load_config_from_str(minimal_toml(), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.account.user, "svc_user");
        assert_eq!(cfg.runtime.batch_size, 10);
        assert!((cfg.runtime.interval_seconds - 5.0).abs() < f64::EPSILON);
        assert!(!cfg.runtime.fast);
        match cfg.credential {
            CredentialSource::StaticBearer(t) => assert_eq!(t, "static-token-abc"),
            CredentialSource::SignedKeyFile(_) => panic!("expected static bearer"),
        }
    }

    #[test]
    fn cli_overrides_take_precedence_over_toml() {
        let overrides = CliOverrides {
            batch_size: Some(25),
            interval: Some(1.5),
            fast: true,
            verbose: false,
        };
        let cfg = load_config_from_str(minimal_toml(), &overrides).unwrap();
        assert_eq!(cfg.runtime.batch_size, 25);
        assert!((cfg.runtime.interval_seconds - 1.5).abs() < f64::EPSILON);
        assert!(cfg.runtime.fast);
    }

    #[test]
    fn rejects_both_pat_and_private_key_file() {
        let toml_str = r#"
            [snowflake]
            user = "u"
            account = "a"
            url = "https://a.snowflakecomputing.com"
            role = "r"
            database = "d"
            schema = "s"
            pipe = "p"
            channel_name = "c"
            pat = "tok"
            private_key_file = "/tmp/key.p8"
        "#;
        let err = load_config_from_str(toml_str, &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn rejects_missing_credential() {
        let toml_str = r#"
            [snowflake]
            user = "u"
            account = "a"
            url = "https://a.snowflakecomputing.com"
            role = "r"
            database = "d"
            schema = "s"
            pipe = "p"
            channel_name = "c"
        "#;
        let err = load_config_from_str(toml_str, &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn loads_from_a_real_file_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, minimal_toml().as_bytes()).unwrap();
        let cfg = load_config_from_path(file.path(), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.account.account, "ab12345");
    }

    #[test]
    fn rejects_zero_batch_size() {
        let overrides = CliOverrides {
            batch_size: Some(0),
            ..Default::default()
        };
        let err = load_config_from_str(minimal_toml(), &overrides).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}
