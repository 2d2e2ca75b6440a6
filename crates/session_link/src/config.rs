use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use shared::domain::{DeviceId, ProtocolInfo, SessionIdentity, UserId};
use tracing::{debug, warn};

use crate::{
    error::LinkError,
    reconnect::{
        ReconnectPolicy, DEFAULT_BASE_DELAY, DEFAULT_GROWTH_FACTOR, DEFAULT_JITTER_MAX,
        DEFAULT_JITTER_MIN, DEFAULT_MAX_DELAY, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    },
    retry::{RetryExecutor, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL_MS},
    transport::{TransportConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL},
};

pub const DEFAULT_CONFIG_FILE: &str = "link.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub server_url: String,
    pub user_id: i64,
    pub device_id: Option<i64>,
    pub protocol: String,
    pub protocol_version: String,
    pub connect_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_jitter_min_ms: u64,
    pub reconnect_jitter_max_ms: u64,
    pub reconnect_growth_factor: f64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub rest_max_retries: u32,
    pub rest_retry_interval_ms: i64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        let protocol = ProtocolInfo::default();
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            user_id: 1,
            device_id: None,
            protocol: protocol.protocol,
            protocol_version: protocol.version,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL.as_millis() as u64,
            reconnect_base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            reconnect_jitter_min_ms: DEFAULT_JITTER_MIN.as_millis() as u64,
            reconnect_jitter_max_ms: DEFAULT_JITTER_MAX.as_millis() as u64,
            reconnect_growth_factor: DEFAULT_GROWTH_FACTOR,
            reconnect_max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            rest_max_retries: DEFAULT_MAX_RETRIES,
            rest_retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
        }
    }
}

impl LinkSettings {
    pub fn identity(&self) -> SessionIdentity {
        let identity = SessionIdentity::new(self.server_url.clone(), UserId(self.user_id));
        match self.device_id {
            Some(device_id) => identity.with_device(DeviceId(device_id)),
            None => identity,
        }
    }

    pub fn protocol_info(&self) -> ProtocolInfo {
        ProtocolInfo {
            protocol: self.protocol.clone(),
            version: self.protocol_version.clone(),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
        }
    }

    pub fn reconnect_policy(&self) -> Result<ReconnectPolicy, LinkError> {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            jitter_min: Duration::from_millis(self.reconnect_jitter_min_ms),
            jitter_max: Duration::from_millis(self.reconnect_jitter_max_ms),
            growth_factor: self.reconnect_growth_factor,
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.rest_max_retries, self.rest_retry_interval_ms)
    }
}

/// Defaults, then `link.toml` (or the file named by `LINK_CONFIG`), then
/// `LINK_*` and `APP__*` environment variables.
pub fn load_settings() -> LinkSettings {
    load_settings_from(None)
}

/// Like [`load_settings`] with an explicit file taking precedence over
/// `LINK_CONFIG`.
pub fn load_settings_from(path: Option<&Path>) -> LinkSettings {
    resolve_settings(path, &|key| std::env::var(key).ok())
}

fn resolve_settings(path: Option<&Path>, env: &dyn Fn(&str) -> Option<String>) -> LinkSettings {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| env("LINK_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut settings = match fs::read_to_string(&path) {
        Ok(raw) => match toml::from_str::<LinkSettings>(&raw) {
            Ok(settings) => {
                debug!(path = %path.display(), "config: loaded settings file");
                settings
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "config: ignoring malformed settings file");
                LinkSettings::default()
            }
        },
        Err(_) => LinkSettings::default(),
    };

    apply_env_overrides(&mut settings, env);
    settings
}

fn apply_env_overrides(settings: &mut LinkSettings, env: &dyn Fn(&str) -> Option<String>) {
    override_from_env(env, "SERVER_URL", &mut settings.server_url);
    override_from_env(env, "USER_ID", &mut settings.user_id);
    let mut device_id = settings.device_id.unwrap_or_default();
    if override_from_env(env, "DEVICE_ID", &mut device_id) {
        settings.device_id = Some(device_id);
    }
    override_from_env(env, "PROTOCOL", &mut settings.protocol);
    override_from_env(env, "PROTOCOL_VERSION", &mut settings.protocol_version);
    override_from_env(env, "CONNECT_TIMEOUT_MS", &mut settings.connect_timeout_ms);
    override_from_env(
        env,
        "KEEP_ALIVE_INTERVAL_MS",
        &mut settings.keep_alive_interval_ms,
    );
    override_from_env(
        env,
        "RECONNECT_BASE_DELAY_MS",
        &mut settings.reconnect_base_delay_ms,
    );
    override_from_env(
        env,
        "RECONNECT_JITTER_MIN_MS",
        &mut settings.reconnect_jitter_min_ms,
    );
    override_from_env(
        env,
        "RECONNECT_JITTER_MAX_MS",
        &mut settings.reconnect_jitter_max_ms,
    );
    override_from_env(
        env,
        "RECONNECT_GROWTH_FACTOR",
        &mut settings.reconnect_growth_factor,
    );
    override_from_env(
        env,
        "RECONNECT_MAX_DELAY_MS",
        &mut settings.reconnect_max_delay_ms,
    );
    override_from_env(
        env,
        "MAX_RECONNECT_ATTEMPTS",
        &mut settings.max_reconnect_attempts,
    );
    override_from_env(env, "REST_MAX_RETRIES", &mut settings.rest_max_retries);
    override_from_env(
        env,
        "REST_RETRY_INTERVAL_MS",
        &mut settings.rest_retry_interval_ms,
    );
}

/// `APP__<KEY>` wins over `LINK_<KEY>`. Unparsable values are ignored.
fn override_from_env<T>(env: &dyn Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> bool
where
    T: FromStr,
    T::Err: Display,
{
    let mut applied = false;
    for var in [format!("LINK_{key}"), format!("APP__{key}")] {
        let Some(raw) = env(&var) else {
            continue;
        };
        match raw.trim().parse::<T>() {
            Ok(value) => {
                *slot = value;
                applied = true;
            }
            Err(err) => warn!(var = %var, %err, "config: ignoring invalid override"),
        }
    }
    applied
}
