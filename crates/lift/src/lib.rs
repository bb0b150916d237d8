use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod authority;
pub mod avatars;
pub mod client;
pub mod clock;
pub mod content;
pub mod dispatcher;
pub mod handoff;
pub mod handshake;
pub mod instances;
pub mod ledger;
pub mod metrics;
pub mod registry;
mod types;
pub mod view;
pub mod zone;

pub use authority::{
    AuthorityPorts, ReadyOutcome, TransferAuthority, TransferSettings, ZoneEntry,
    DEFAULT_LEDGER_TIMEOUT,
};
pub use avatars::{Avatar, AvatarLocation, AvatarSpawner, AvatarWorld, SpawnError};
pub use client::{
    ClientAgentSettings, ClientEvent, ClientPhase, ClientTransferAgent,
    DEFAULT_CLIENT_LOAD_TIMEOUT,
};
pub use clock::{FixedStepClock, LoopConfig, StepPlan};
pub use content::{
    load_template_catalog, AvatarTemplate, AvatarTemplateId, Capability, CatalogError,
    CatalogErrorCode, SourceLocation, TemplateCatalog, WorldTemplate, WorldTemplateId,
};
pub use dispatcher::{DispatchError, GroupDispatcher, LoadContinuation};
pub use handoff::{CommitReceipt, DestroyQueue, HandoffError};
pub use handshake::{
    decode_client_message, decode_server_message, encode_line, ClientMessage, ReadyRejection,
    ServerMessage, WireError,
};
pub use instances::{
    InstanceHandle, InstanceState, LoadCompletion, LoadError, LoadOutcome, SimulatedWorldLoader,
    WorldInstances, WorldLoader,
};
pub use ledger::{LedgerEntry, LedgerError, PendingTransferLedger, RemovalReason};
pub use metrics::{MetricsLogGate, TransferMetricsHandle, TransferMetricsSnapshot};
pub use registry::{ConnectionRecord, ConnectionRegistry, InMemoryRegistry, RebindError};
pub use types::{AuthorityFlags, AvatarRef, ConnectionId, InstanceId, InstanceIdAllocator, Vec3};
pub use view::{format_countdown, format_membership, NullView, TransferView, ViewState};
pub use zone::{CountdownPolicy, EnterOutcome, StagingZone, StagingZoneConfig, ZoneConfigError};

pub const ROOT_ENV_VAR: &str = "LIFT_ROOT";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub root: PathBuf,
    pub templates_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to resolve current executable path: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("current executable path has no parent directory: {0}")]
    ExeHasNoParent(PathBuf),
    #[error(
        "LIFT_ROOT is set but does not point to a valid project root: {path}\n\
A valid root must contain Cargo.toml and assets/templates/."
    )]
    InvalidEnvRoot { path: PathBuf },
    #[error(
        "Could not detect project root by walking upward from executable directory: {start_dir}\n\
Expected a directory containing Cargo.toml and assets/templates/.\n\
Set {env_var} explicitly, for example:\n\
Bash/zsh: export {env_var}=\"/path/to/lift\""
    )]
    RootNotFound {
        start_dir: PathBuf,
        env_var: &'static str,
    },
}

pub fn resolve_app_paths() -> Result<AppPaths, StartupError> {
    let root = resolve_root()?;
    let templates_dir = templates_dir(&root);
    Ok(AppPaths {
        root,
        templates_dir,
    })
}

fn resolve_root() -> Result<PathBuf, StartupError> {
    match env::var(ROOT_ENV_VAR) {
        Ok(value) => {
            let normalized = normalize_path(&PathBuf::from(value));
            if is_repo_marker(&normalized) {
                Ok(normalized)
            } else {
                Err(StartupError::InvalidEnvRoot { path: normalized })
            }
        }
        Err(env::VarError::NotPresent) => {
            let exe = env::current_exe().map_err(StartupError::CurrentExe)?;
            let exe_dir = exe
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| StartupError::ExeHasNoParent(exe.clone()))?;

            for candidate in exe_dir.ancestors() {
                if is_repo_marker(candidate) {
                    return Ok(normalize_path(candidate));
                }
            }

            Err(StartupError::RootNotFound {
                start_dir: normalize_path(&exe_dir),
                env_var: ROOT_ENV_VAR,
            })
        }
        Err(source) => Err(StartupError::EnvVar {
            var: ROOT_ENV_VAR,
            source,
        }),
    }
}

fn templates_dir(root: &Path) -> PathBuf {
    root.join("assets").join("templates")
}

fn is_repo_marker(path: &Path) -> bool {
    path.join("Cargo.toml").is_file() && templates_dir(path).is_dir()
}

fn normalize_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn repo_marker_requires_cargo_toml_and_templates() {
        let temp = TempDir::new().expect("temp");
        assert!(!is_repo_marker(temp.path()));

        fs::write(temp.path().join("Cargo.toml"), "[workspace]\n").expect("write");
        assert!(!is_repo_marker(temp.path()));

        fs::create_dir_all(temp.path().join("assets").join("templates")).expect("mkdir");
        assert!(is_repo_marker(temp.path()));
    }
}
