use clap::Parser;

/// Router configuration.
///
/// Parsed once at startup from environment variables; pass `&Config` (or the
/// `Services` aggregate holding it) through, no global state.
#[derive(Parser, Clone)]
pub struct Config {
    /// Log level: debug, info, warn, error.
    #[arg(long, env = "LOG_LEVEL", default_value = "debug")]
    pub log_level: String,

    /// Emit logs as JSON instead of plain text.
    #[arg(long, env = "LOG_STRUCTURED", default_value_t = false)]
    pub log_structured: bool,

    /// Port to listen on.
    #[arg(long, env = "PUB_PORT", default_value_t = 7205)]
    pub listen_port: u16,

    /// Protocol used to reach Job backends.
    #[arg(long, env = "FORWARD_TO_PROTOCOL", default_value = "http")]
    pub forward_to_protocol: String,

    /// Version stamp reported by the health endpoint.
    #[arg(long, env = "GIT_VERSION", default_value = "")]
    pub git_version: String,

    /// Base URL of the Lifecycle control plane.
    #[arg(
        long,
        env = "LIFECYCLE_URL",
        default_value = "http://127.0.0.1:7202/lifecycle"
    )]
    pub lifecycle_url: String,

    /// Whether callers must authenticate.
    #[arg(long, env = "AUTH_REQUIRED", default_value_t = true)]
    pub auth_required: bool,

    /// Include authentication failure details in responses.
    #[arg(long, env = "AUTH_DEBUG", default_value_t = false)]
    pub auth_debug: bool,

    /// Internal token used to authenticate to Lifecycle.
    #[arg(long, env = "LIFECYCLE_AUTH_TOKEN", default_value = "")]
    pub lifecycle_token: String,

    /// Header carrying the request tracing id.
    #[arg(
        long,
        env = "REQUEST_TRACING_HEADER",
        default_value = "X-Request-Tracing-Id"
    )]
    pub request_tracing_header: String,

    /// Header carrying the resolved caller name, forwarded to Jobs.
    #[arg(long, env = "CALLER_NAME_HEADER", default_value = "X-Caller-Name")]
    pub caller_name_header: String,

    /// Run as a remote gateway in a foreign cluster.
    #[arg(long, env = "REMOTE_GATEWAY_MODE", default_value_t = false)]
    pub remote_gateway_mode: bool,

    /// Shared token authenticating main <-> remote gateway calls.
    #[arg(long, env = "REMOTE_GATEWAY_TOKEN", default_value = "")]
    pub remote_gateway_token: String,

    /// Service name; endpoints are also mounted under this prefix.
    #[arg(long, env = "SERVICE_NAME", default_value = "pub")]
    pub service_name: String,

    /// DNS hostname resolving to all replica addresses. Empty disables
    /// discovery and the instance behaves standalone.
    #[arg(long, env = "REPLICA_DISCOVERY_HOSTNAME", default_value = "")]
    pub replica_discovery_hostname: String,

    /// Maximum number of attempts for an async job call (1 means no retry).
    #[arg(long, env = "ASYNC_MAX_ATTEMPTS", default_value_t = 2)]
    pub async_max_attempts: i32,

    /// Seconds to wait before retrying a crashed async job call.
    #[arg(long, env = "ASYNC_TASK_RETRY_INTERVAL", default_value_t = 10)]
    pub async_task_retry_interval: u64,

    /// Seconds to keep cached Lifecycle responses fresh.
    #[arg(long, env = "LIFECYCLE_CACHE_TTL_MIN", default_value_t = 60)]
    pub lifecycle_cache_ttl_min: u64,

    /// Seconds to keep cached Lifecycle responses for stale-serving during a
    /// Lifecycle outage.
    #[arg(long, env = "LIFECYCLE_CACHE_TTL_MAX", default_value_t = 600)]
    pub lifecycle_cache_ttl_max: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("log_level", &self.log_level)
            .field("log_structured", &self.log_structured)
            .field("listen_port", &self.listen_port)
            .field("forward_to_protocol", &self.forward_to_protocol)
            .field("git_version", &self.git_version)
            .field("lifecycle_url", &self.lifecycle_url)
            .field("auth_required", &self.auth_required)
            .field("auth_debug", &self.auth_debug)
            .field("lifecycle_token", &"<redacted>")
            .field("request_tracing_header", &self.request_tracing_header)
            .field("caller_name_header", &self.caller_name_header)
            .field("remote_gateway_mode", &self.remote_gateway_mode)
            .field("remote_gateway_token", &"<redacted>")
            .field("service_name", &self.service_name)
            .field(
                "replica_discovery_hostname",
                &self.replica_discovery_hostname,
            )
            .field("async_max_attempts", &self.async_max_attempts)
            .field("async_task_retry_interval", &self.async_task_retry_interval)
            .field("lifecycle_cache_ttl_min", &self.lifecycle_cache_ttl_min)
            .field("lifecycle_cache_ttl_max", &self.lifecycle_cache_ttl_max)
            .finish()
    }
}

impl Config {
    /// Parse config from environment only (no CLI parsing).
    ///
    /// Parses from a single fake argv element so clap doesn't try to
    /// interpret the process arguments.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["racetrack-pub"]))
    }
}
