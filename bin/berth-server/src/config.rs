//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;

use berth_core::IdleTimeout;

/// Runtime configuration for berth-server.
///
/// Every field has a default so the server works out-of-the-box; the
/// environment contract is:
///
/// | Variable | Meaning |
/// |---|---|
/// | `MODEL_RUNNER_SOCK` | Unix-socket path (default transport) |
/// | `MODEL_RUNNER_PORT` | switch to TCP on this port |
/// | `MODEL_RUNNER_TLS_PORT` | additional TLS listener |
/// | `MODELS_PATH` | model store root |
/// | `MODEL_RUNNER_IDLE_TIMEOUT` | idle eviction budget, `"0"` disables |
/// | `MODEL_RUNNER_SLOTS` | runner pool size |
/// | `DISABLE_METRICS` | disable the `/metrics` aggregation route |
/// | `DMR_ORIGINS` | comma-separated CORS allow-list |
/// | `MODEL_RUNNER_LOG` / `MODEL_RUNNER_LOG_JSON` | tracing filter / JSON logs |
/// | `MODEL_RUNNER_{GGUF,SAFETENSORS,MLX,DIFFUSION}_BIN` | engine binary overrides |
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix-socket path used when `MODEL_RUNNER_PORT` is unset.
    pub socket_path: PathBuf,

    /// When set, listen on TCP `127.0.0.1:<port>` instead of the socket.
    pub tcp_port: Option<u16>,

    /// When set, run an additional TLS listener on this port with
    /// auto-generated certificates under the user config directory.
    pub tls_port: Option<u16>,

    /// Root directory of the disk model store.
    pub models_path: PathBuf,

    /// Idle-eviction budget for runner slots.
    pub idle_timeout: IdleTimeout,

    /// Runner pool size (1–4).
    pub slot_count: usize,

    /// When `true`, `/metrics` answers 404.
    pub disable_metrics: bool,

    /// CORS allow-list.  `None` applies the transport-dependent default:
    /// localhost origins in TCP mode, unrestricted over the socket.
    pub origins: Option<Vec<String>>,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Scratch directory for runner sockets and working dirs.
    pub scratch_dir: PathBuf,

    /// Per-backend engine binary overrides.
    pub gguf_bin: Option<PathBuf>,
    pub safetensors_bin: Option<PathBuf>,
    pub mlx_bin: Option<PathBuf>,
    pub diffusion_bin: Option<PathBuf>,
}

impl Config {
    /// Build [`Config`] from environment variables.  Fails on values that
    /// are present but invalid (bad idle timeout, bad port, bad slot
    /// count); absent values fall back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let idle_timeout = match std::env::var("MODEL_RUNNER_IDLE_TIMEOUT") {
            Ok(raw) => IdleTimeout::parse(&raw)
                .map_err(|e| anyhow::anyhow!("MODEL_RUNNER_IDLE_TIMEOUT: {e}"))?,
            Err(_) => IdleTimeout::default(),
        };

        let tcp_port = parse_optional::<u16>("MODEL_RUNNER_PORT")?;
        let tls_port = parse_optional::<u16>("MODEL_RUNNER_TLS_PORT")?;

        let slot_count = parse_optional::<usize>("MODEL_RUNNER_SLOTS")?.unwrap_or(2);
        if !(1..=4).contains(&slot_count) {
            anyhow::bail!("MODEL_RUNNER_SLOTS must be between 1 and 4, got {slot_count}");
        }

        let models_path = std::env::var_os("MODELS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_models_path);

        Ok(Self {
            socket_path: std::env::var_os("MODEL_RUNNER_SOCK")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("model-runner.sock")),
            tcp_port,
            tls_port,
            models_path,
            idle_timeout,
            slot_count,
            disable_metrics: flag("DISABLE_METRICS"),
            origins: std::env::var("DMR_ORIGINS").ok().map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_owned())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
            log_level: env_or("MODEL_RUNNER_LOG", "info"),
            log_json: flag("MODEL_RUNNER_LOG_JSON"),
            scratch_dir: std::env::temp_dir().join("berth"),
            gguf_bin: std::env::var_os("MODEL_RUNNER_GGUF_BIN").map(PathBuf::from),
            safetensors_bin: std::env::var_os("MODEL_RUNNER_SAFETENSORS_BIN").map(PathBuf::from),
            mlx_bin: std::env::var_os("MODEL_RUNNER_MLX_BIN").map(PathBuf::from),
            diffusion_bin: std::env::var_os("MODEL_RUNNER_DIFFUSION_BIN").map(PathBuf::from),
        })
    }

    /// Origins to allow when the caller did not configure any: localhost
    /// over TCP, unrestricted over the Unix socket.
    pub fn effective_origins(&self) -> Option<Vec<String>> {
        match (&self.origins, self.tcp_port) {
            (Some(origins), _) => Some(origins.clone()),
            (None, Some(_)) => Some(
                [
                    "http://localhost",
                    "https://localhost",
                    "http://127.0.0.1",
                    "https://127.0.0.1",
                ]
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            ),
            (None, None) => None,
        }
    }
}

fn default_models_path() -> PathBuf {
    dirs_next::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("berth")
        .join("models")
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn parse_optional<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}")),
        Err(_) => Ok(None),
    }
}
