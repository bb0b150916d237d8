use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lift::{
    CountdownPolicy, LoopConfig, StagingZoneConfig, TemplateCatalog, TransferSettings,
    DEFAULT_LEDGER_TIMEOUT,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CONFIG_ENV_VAR: &str = "LIFT_CONFIG";
pub const PORT_ENV_VAR: &str = "LIFT_PORT";
pub const CAPACITY_ENV_VAR: &str = "LIFT_CAPACITY";
pub const COUNTDOWN_ENV_VAR: &str = "LIFT_COUNTDOWN_SECONDS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountdownPolicySetting {
    #[default]
    WhileOccupied,
    Always,
}

impl From<CountdownPolicySetting> for CountdownPolicy {
    fn from(value: CountdownPolicySetting) -> Self {
        match value {
            CountdownPolicySetting::WhileOccupied => CountdownPolicy::WhileOccupied,
            CountdownPolicySetting::Always => CountdownPolicy::Always,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiftConfig {
    pub port: u16,
    pub zone_capacity: usize,
    pub countdown_seconds: f32,
    pub countdown_policy: CountdownPolicySetting,
    pub world_template: String,
    pub lobby_avatar_template: String,
    pub transfer_avatar_template: String,
    pub ledger_timeout_ms: u64,
    pub destroy_delay_ms: u64,
    pub instance_unload_grace_ms: u64,
    pub loader_latency_ticks: u32,
    pub target_tps: u32,
    pub max_ticks_per_frame: u32,
    pub metrics_log_interval_ms: u64,
}

impl Default for LiftConfig {
    fn default() -> Self {
        Self {
            port: 46100,
            zone_capacity: 2,
            countdown_seconds: 15.0,
            countdown_policy: CountdownPolicySetting::WhileOccupied,
            world_template: "Game".to_string(),
            lobby_avatar_template: "LobbyPlayer".to_string(),
            transfer_avatar_template: "GamePlayer".to_string(),
            ledger_timeout_ms: DEFAULT_LEDGER_TIMEOUT.as_millis() as u64,
            destroy_delay_ms: 500,
            instance_unload_grace_ms: 5_000,
            loader_latency_ticks: 3,
            target_tps: 30,
            max_ticks_per_frame: 5,
            metrics_log_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path} at {at}: {source}")]
    Parse {
        path: PathBuf,
        at: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} template `{name}` is not defined in the template catalog")]
    UnknownTemplate { kind: &'static str, name: String },
}

/// Reads `LIFT_CONFIG` when set, otherwise starts from defaults, then
/// applies the single-value env overrides.
pub fn load_config_from_env() -> Result<LiftConfig, ConfigError> {
    let mut config = match env::var(CONFIG_ENV_VAR) {
        Ok(path) => load_config_file(Path::new(&path))?,
        Err(_) => LiftConfig::default(),
    };
    apply_env_overrides(&mut config, |var| env::var(var).ok());
    Ok(config)
}

pub fn load_config_file(path: &Path) -> Result<LiftConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&raw, path)
}

pub fn parse_config_str(raw: &str, path: &Path) -> Result<LiftConfig, ConfigError> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    serde_path_to_error::deserialize::<_, LiftConfig>(&mut deserializer).map_err(|error| {
        let at = error.path().to_string();
        ConfigError::Parse {
            path: path.to_path_buf(),
            at: if at.is_empty() { ".".to_string() } else { at },
            source: error.into_inner(),
        }
    })
}

pub fn apply_env_overrides<F>(config: &mut LiftConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = parse_override::<u16, _>(&lookup, PORT_ENV_VAR) {
        config.port = port;
    }
    if let Some(capacity) = parse_override::<usize, _>(&lookup, CAPACITY_ENV_VAR) {
        config.zone_capacity = capacity;
    }
    if let Some(seconds) = parse_override::<f32, _>(&lookup, COUNTDOWN_ENV_VAR) {
        config.countdown_seconds = seconds;
    }
}

fn parse_override<T, F>(lookup: &F, var: &'static str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                env_var = var,
                value = raw.as_str(),
                "invalid env override value; falling back to config"
            );
            None
        }
    }
}

/// Template ids the server resolved from configured names.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub transfer: TransferSettings,
    pub lobby_avatar_template: lift::AvatarTemplateId,
    pub loop_config: LoopConfig,
}

impl LiftConfig {
    pub fn resolve(&self, catalog: &TemplateCatalog) -> Result<ResolvedSettings, ConfigError> {
        let world_template = catalog
            .world_id_by_name(&self.world_template)
            .ok_or_else(|| ConfigError::UnknownTemplate {
                kind: "world",
                name: self.world_template.clone(),
            })?;
        let lobby_avatar_template = catalog
            .avatar_id_by_name(&self.lobby_avatar_template)
            .ok_or_else(|| ConfigError::UnknownTemplate {
                kind: "avatar",
                name: self.lobby_avatar_template.clone(),
            })?;
        let transfer_avatar_template = catalog
            .avatar_id_by_name(&self.transfer_avatar_template)
            .ok_or_else(|| ConfigError::UnknownTemplate {
                kind: "avatar",
                name: self.transfer_avatar_template.clone(),
            })?;
        let spawn_point = catalog
            .world(world_template)
            .map(|world| world.spawn_point)
            .unwrap_or_default();

        let mut transfer =
            TransferSettings::new(world_template, transfer_avatar_template, spawn_point);
        transfer.zone = StagingZoneConfig {
            capacity: self.zone_capacity,
            countdown_seconds: self.countdown_seconds,
            policy: self.countdown_policy.into(),
        };
        transfer.ledger_timeout = Duration::from_millis(self.ledger_timeout_ms);
        transfer.destroy_delay = Duration::from_millis(self.destroy_delay_ms);
        transfer.instance_unload_grace = Duration::from_millis(self.instance_unload_grace_ms);

        Ok(ResolvedSettings {
            transfer,
            lobby_avatar_template,
            loop_config: LoopConfig {
                target_tps: self.target_tps,
                max_ticks_per_frame: self.max_ticks_per_frame,
                metrics_log_interval: Duration::from_millis(self.metrics_log_interval_ms),
                ..LoopConfig::default()
            },
        })
    }
}
