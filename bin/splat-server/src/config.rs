//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use splat_core::{JobSettings, OpacityEncoding, TargetFormat, ToolCommand, ToolRunner};

/// Runtime configuration for splat-server.
///
/// Every field has a default so the server starts without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// Root for per-task inputs, tool output and artifacts.
    pub work_dir: PathBuf,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated CORS allow list; `None` allows any origin.
    pub cors_allowed_origins: Option<String>,

    pub tool_program: String,

    /// Whitespace-separated argument template, see [`ToolCommand`].
    pub tool_args: String,

    pub tool_timeout_secs: u64,

    /// Bytes of stdout/stderr kept per tool run.
    pub output_tail_bytes: usize,

    /// Per-image upload limit.
    pub max_upload_bytes: usize,

    /// Whole-request body limit for the upload routes.
    pub max_request_bytes: usize,

    /// Tool processes allowed to run at once.
    pub batch_workers: usize,

    pub output_format: TargetFormat,

    pub opacity_encoding: OpacityEncoding,

    pub max_dropped_ratio: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_owned(),
            work_dir: PathBuf::from("./uploads"),
            log_level: "info".to_owned(),
            log_json: false,
            cors_allowed_origins: None,
            tool_program: "sharp".to_owned(),
            tool_args: "predict -i {input_dir} -o {output_dir}".to_owned(),
            tool_timeout_secs: 300,
            output_tail_bytes: 8 * 1024,
            max_upload_bytes: 100 * 1024 * 1024,
            max_request_bytes: 512 * 1024 * 1024,
            batch_workers: 2,
            output_format: TargetFormat::Ply,
            opacity_encoding: OpacityEncoding::Logit,
            max_dropped_ratio: 0.25,
        }
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_address: env_or("SPLAT_BIND", &d.bind_address),
            work_dir: std::env::var_os("SPLAT_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.work_dir),
            log_level: env_or("SPLAT_LOG", &d.log_level),
            log_json: std::env::var("SPLAT_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(d.log_json),
            cors_allowed_origins: std::env::var("SPLAT_CORS_ORIGINS").ok(),
            tool_program: env_or("SPLAT_TOOL_PROGRAM", &d.tool_program),
            tool_args: env_or("SPLAT_TOOL_ARGS", &d.tool_args),
            tool_timeout_secs: parse_env("SPLAT_TOOL_TIMEOUT_SECS", d.tool_timeout_secs),
            output_tail_bytes: parse_env("SPLAT_OUTPUT_TAIL_BYTES", d.output_tail_bytes),
            max_upload_bytes: parse_env("SPLAT_MAX_UPLOAD_BYTES", d.max_upload_bytes),
            max_request_bytes: parse_env("SPLAT_MAX_REQUEST_BYTES", d.max_request_bytes),
            batch_workers: parse_env("SPLAT_BATCH_WORKERS", d.batch_workers),
            output_format: parse_env("SPLAT_OUTPUT_FORMAT", d.output_format),
            opacity_encoding: parse_env("SPLAT_OPACITY_ENCODING", d.opacity_encoding),
            max_dropped_ratio: parse_env("SPLAT_MAX_DROPPED_RATIO", d.max_dropped_ratio),
        }
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            work_dir: self.work_dir.clone(),
            timeout: Duration::from_secs(self.tool_timeout_secs),
            output_format: self.output_format,
            opacity_encoding: self.opacity_encoding,
            max_dropped_ratio: self.max_dropped_ratio,
            max_upload_bytes: self.max_upload_bytes,
            workers: self.batch_workers,
        }
    }

    pub fn tool_runner(&self) -> ToolRunner {
        ToolRunner::new(
            ToolCommand::from_template(&self.tool_program, &self.tool_args),
            self.output_tail_bytes,
        )
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
