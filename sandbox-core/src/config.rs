use std::env;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::OnceCell;

/// Orchestrator configuration loaded once at startup from environment variables.
///
/// Components take their own small config structs (`WarmPoolConfig`,
/// `SyncGateConfig`, …); this struct provides the process-wide defaults the
/// daemon wires into them.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub http_timeout: Duration,
    pub listen_addr: String,

    // Warm pool
    pub pool_size: usize,
    pub pool_ttl: Duration,
    pub pool_replenish_interval: Duration,
    pub pool_typing_trigger: bool,

    // Sync gate
    pub sync_retry_interval: Duration,
    pub sync_max_wait: Duration,

    // Snapshots
    pub snapshot_ttl: Duration,
    pub max_snapshots_per_session: usize,

    // Image builder
    pub max_concurrent_builds: usize,
    pub build_timeout: Duration,
    pub test_timeout: Duration,
    pub rebuild_interval: Duration,
    pub registry_prefix: Option<String>,

    // Image registry retention
    pub max_images_per_branch: usize,
    pub max_image_age: Duration,

    // Local backend
    pub local_base_path: PathBuf,

    // GitHub App credentials
    pub github_app_id: Option<String>,
    pub github_private_key: Option<String>,
    pub github_installation_id: Option<String>,

    // Hosted backend credentials (env fallbacks use these exact names)
    pub hosted_token_id: Option<String>,
    pub hosted_token_secret: Option<String>,
    pub hosted_app_name: Option<String>,
    pub hosted_api_base_url: Option<String>,
}

static CONFIG: OnceCell<OrchestratorConfig> = OnceCell::new();

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    /// Cached after the first call — subsequent calls return the same config.
    pub fn load() -> &'static OrchestratorConfig {
        CONFIG.get_or_init(|| {
            let http_timeout = env_u64("REQUEST_TIMEOUT_SECS", 30);
            let listen_addr =
                env::var("LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:4096".to_string());

            let pool_size = env_usize("WARM_POOL_SIZE", 2);
            let pool_ttl = env_u64("WARM_POOL_TTL_SECS", 1800);
            let pool_replenish_interval = env_u64("WARM_POOL_REPLENISH_INTERVAL_SECS", 60);
            let pool_typing_trigger = env_bool("WARM_POOL_TYPING_TRIGGER", true);

            let sync_retry_interval = env_u64("SYNC_RETRY_INTERVAL_MS", 1000);
            let sync_max_wait = env_u64("SYNC_MAX_WAIT_MS", 120_000);

            let snapshot_ttl = env_u64("SNAPSHOT_TTL_SECS", 86_400);
            let max_snapshots_per_session = env_usize("MAX_SNAPSHOTS_PER_SESSION", 10);

            let max_concurrent_builds = env_usize("MAX_CONCURRENT_BUILDS", 2);
            let build_timeout = env_u64("BUILD_TIMEOUT_SECS", 1800);
            let test_timeout = env_u64("TEST_TIMEOUT_SECS", 600);
            let rebuild_interval = env_u64("REBUILD_INTERVAL_SECS", 1800);
            let registry_prefix = env_opt("IMAGE_REGISTRY_PREFIX");

            let max_images_per_branch = env_usize("MAX_IMAGES_PER_BRANCH", 5);
            let max_image_age = env_u64("MAX_IMAGE_AGE_SECS", 7 * 86_400);

            let local_base_path = env::var("SANDBOX_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sandbox-state"));

            OrchestratorConfig {
                http_timeout: Duration::from_secs(http_timeout),
                listen_addr,
                pool_size,
                pool_ttl: Duration::from_secs(pool_ttl),
                pool_replenish_interval: Duration::from_secs(pool_replenish_interval),
                pool_typing_trigger,
                sync_retry_interval: Duration::from_millis(sync_retry_interval),
                sync_max_wait: Duration::from_millis(sync_max_wait),
                snapshot_ttl: Duration::from_secs(snapshot_ttl),
                max_snapshots_per_session,
                max_concurrent_builds,
                build_timeout: Duration::from_secs(build_timeout),
                test_timeout: Duration::from_secs(test_timeout),
                rebuild_interval: Duration::from_secs(rebuild_interval),
                registry_prefix,
                max_images_per_branch,
                max_image_age: Duration::from_secs(max_image_age),
                local_base_path,
                github_app_id: env_opt("GITHUB_APP_ID"),
                github_private_key: env_opt("GITHUB_APP_PRIVATE_KEY"),
                github_installation_id: env_opt("GITHUB_APP_INSTALLATION_ID"),
                hosted_token_id: env_opt("TOKEN_ID"),
                hosted_token_secret: env_opt("TOKEN_SECRET"),
                hosted_app_name: env_opt("APP_NAME"),
                hosted_api_base_url: env_opt("API_BASE_URL"),
            }
        })
    }
}
