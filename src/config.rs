//! Gateway configuration, resolved from CLI flags and the environment.

use std::path::PathBuf;

use clap::Args;

use crate::sdk::BackendKind;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_ISOLATE_URL: &str = "http://localhost:8080";

/// Sandbox-side directory that uploads land in.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Flags of the `serve` subcommand.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Public base URL used to build download links
    /// [default: http://localhost:<port>]
    #[arg(long, env = "HOST_URL")]
    pub host_url: Option<String>,

    /// Sandbox backend
    #[arg(long, env = "SANDBOX_BACKEND", value_enum, default_value_t = BackendKind::Mock)]
    pub backend: BackendKind,

    /// Base URL of the isolate server (isolate backend only)
    #[arg(long, env = "ISOLATE_URL", default_value = DEFAULT_ISOLATE_URL)]
    pub isolate_url: String,

    /// Directory under which per-sandbox scratch directories are created
    /// [default: system temp dir]
    #[arg(long, env = "SCRATCH_ROOT")]
    pub scratch_root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// Base of every `download_url`, without a trailing slash.
    pub host_url: String,
    pub backend: BackendKind,
    pub isolate_url: String,
    pub scratch_root: PathBuf,
}

impl GatewayConfig {
    pub fn from_args(args: ServeArgs) -> Self {
        let host_url = args
            .host_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| format!("http://localhost:{}", args.port));
        Self {
            port: args.port,
            host_url: host_url.trim_end_matches('/').to_string(),
            backend: args.backend,
            isolate_url: args.isolate_url.trim_end_matches('/').to_string(),
            scratch_root: args.scratch_root.unwrap_or_else(std::env::temp_dir),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host_url: format!("http://localhost:{DEFAULT_PORT}"),
            backend: BackendKind::Mock,
            isolate_url: DEFAULT_ISOLATE_URL.to_string(),
            scratch_root: std::env::temp_dir(),
        }
    }
}
