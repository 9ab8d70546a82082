use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    AstoriaConfig,
    AstoriaBrokerSocket,
    AstoriaCacheDir,
    RustLog,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::AstoriaConfig => "ASTORIA_CONFIG",
            EnvVar::AstoriaBrokerSocket => "ASTORIA_BROKER_SOCKET",
            EnvVar::AstoriaCacheDir => "ASTORIA_CACHE_DIR",
            EnvVar::RustLog => "RUST_LOG",
        }
    }
}

const SOCKET_NAME: &str = "astoria.sock";
const FALLBACK_CACHE_DIR: &str = "/var/cache";
const ASTORIA_SUBDIR: &str = "astoria";

/// Set and non-empty.
fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str()).ok().filter(|v| !v.is_empty())
}

/// Config file override ($ASTORIA_CONFIG)
pub fn config_path() -> Option<PathBuf> {
    let val = env_opt(EnvVar::AstoriaConfig).map(PathBuf::from);
    tracing::trace!(value = ?val, "ASTORIA_CONFIG env var");
    val
}

/// Broker socket override ($ASTORIA_BROKER_SOCKET)
pub fn broker_socket() -> Option<PathBuf> {
    let val = env_opt(EnvVar::AstoriaBrokerSocket).map(PathBuf::from);
    tracing::trace!(value = ?val, "ASTORIA_BROKER_SOCKET env var");
    val
}

/// Cache directory override ($ASTORIA_CACHE_DIR)
pub fn cache_dir() -> Option<PathBuf> {
    let val = env_opt(EnvVar::AstoriaCacheDir).map(PathBuf::from);
    tracing::trace!(value = ?val, "ASTORIA_CACHE_DIR env var");
    val
}

pub fn rust_log_set() -> bool {
    env_opt(EnvVar::RustLog).is_some()
}

/// $XDG_RUNTIME_DIR/astoria.sock, or the temp dir when there is no runtime dir.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_NAME)
}

/// ~/.cache/astoria, or /var/cache/astoria for system users.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CACHE_DIR))
        .join(ASTORIA_SUBDIR)
}
