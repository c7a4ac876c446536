use anyhow::Result;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_or_else(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: env_or_else("SERVER_HOST", "0.0.0.0"),
            port: env_or("SERVER_PORT", 8080),
            read_timeout_secs: env_or("SERVER_READ_TIMEOUT_SECS", 30),
            write_timeout_secs: env_or("SERVER_WRITE_TIMEOUT_SECS", 30),
            idle_timeout_secs: env_or("SERVER_IDLE_TIMEOUT_SECS", 120),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_or_else("DATABASE_HOST", "localhost"),
            port: env_or("DATABASE_PORT", 5432),
            username: env_or_else("DATABASE_USER", "postgres"),
            password: env::var("DATABASE_PASSWORD")?,
            database: env_or_else("DATABASE_NAME", "prism_gateway"),
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 20),
        })
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

/// TTLs for the read-through cache, per cached collection.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub user_ttl: Duration,
    pub api_key_ttl: Duration,
    pub model_ttl: Duration,
    pub provider_ttl: Duration,
    pub quota_ttl: Duration,
    /// Short TTL for per-window usage reads; staleness here bounds
    /// over-admission, so keep it tight.
    pub query_ttl: Duration,
}

impl CacheConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_or("CACHE_ENABLED", true),
            user_ttl: Duration::from_secs(env_or("CACHE_USER_TTL_SECS", 600)),
            api_key_ttl: Duration::from_secs(env_or("CACHE_API_KEY_TTL_SECS", 600)),
            model_ttl: Duration::from_secs(env_or("CACHE_MODEL_TTL_SECS", 600)),
            provider_ttl: Duration::from_secs(env_or("CACHE_PROVIDER_TTL_SECS", 300)),
            quota_ttl: Duration::from_secs(env_or("CACHE_QUOTA_TTL_SECS", 300)),
            query_ttl: Duration::from_secs(env_or("CACHE_QUERY_TTL_SECS", 60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub default_ttl: Duration,
    pub retry_interval: Duration,
    pub max_retries: u32,
}

impl LockConfig {
    fn from_env() -> Self {
        Self {
            default_ttl: Duration::from_secs(env_or("LOCK_DEFAULT_TTL_SECS", 5)),
            retry_interval: Duration::from_millis(env_or("LOCK_RETRY_INTERVAL_MS", 100)),
            max_retries: env_or("LOCK_MAX_RETRIES", 3),
        }
    }
}

/// Request-quota values the provisioning plane seeds for newly issued keys.
/// The quota engine itself treats a scope with no quota rows as uncapped.
#[derive(Debug, Clone)]
pub struct RateLimitingConfig {
    pub default_requests_per_minute: u32,
    pub default_requests_per_hour: u32,
    pub default_requests_per_day: u32,
}

impl RateLimitingConfig {
    fn from_env() -> Self {
        Self {
            default_requests_per_minute: env_or("RATE_LIMIT_REQUESTS_PER_MINUTE", 60),
            default_requests_per_hour: env_or("RATE_LIMIT_REQUESTS_PER_HOUR", 1000),
            default_requests_per_day: env_or("RATE_LIMIT_REQUESTS_PER_DAY", 10000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub currency: String,
    /// Decimal places costs are rounded to.
    pub precision: u32,
    /// Fallback per-1000-token price substituted when a pricing row is
    /// missing; the computation never fails a request over pricing.
    pub default_token_price: Decimal,
    pub settle_lock_ttl: Duration,
    pub settle_lock_retries: u32,
}

impl BillingConfig {
    fn from_env() -> Self {
        Self {
            currency: env_or_else("BILLING_CURRENCY", "USD"),
            precision: env_or("BILLING_PRECISION", 6),
            default_token_price: env_or("BILLING_DEFAULT_TOKEN_PRICE", Decimal::ZERO),
            settle_lock_ttl: Duration::from_secs(env_or("BILLING_LOCK_TTL_SECS", 5)),
            settle_lock_retries: env_or("BILLING_LOCK_RETRIES", 3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsyncQuotaConfig {
    pub enabled: bool,
    pub worker_count: usize,
    pub channel_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl AsyncQuotaConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_or("ASYNC_QUOTA_ENABLED", true),
            worker_count: env_or("ASYNC_QUOTA_WORKERS", 3),
            channel_size: env_or("ASYNC_QUOTA_CHANNEL_SIZE", 1000),
            batch_size: env_or("ASYNC_QUOTA_BATCH_SIZE", 10),
            flush_interval: Duration::from_secs(env_or("ASYNC_QUOTA_FLUSH_INTERVAL_SECS", 5)),
            retry_attempts: env_or("ASYNC_QUOTA_RETRY_ATTEMPTS", 3),
            retry_delay: Duration::from_millis(env_or("ASYNC_QUOTA_RETRY_DELAY_MS", 200)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchServiceConfig {
    pub base_url: String,
    pub api_key: String,
    pub max_results: usize,
    pub crawl_results: usize,
    pub crawl_content: bool,
    pub max_content_bytes: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FunctionCallConfig {
    pub enabled: bool,
    pub search: SearchServiceConfig,
}

impl FunctionCallConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_or("FUNCTION_CALL_ENABLED", false),
            search: SearchServiceConfig {
                base_url: env_or_else("SEARCH_SERVICE_URL", "https://api.searchprovider.example"),
                api_key: env_or_else("SEARCH_SERVICE_KEY", ""),
                max_results: env_or("SEARCH_MAX_RESULTS", 5),
                crawl_results: env_or("SEARCH_CRAWL_RESULTS", 3),
                crawl_content: env_or("SEARCH_CRAWL_CONTENT", false),
                max_content_bytes: env_or("SEARCH_MAX_CONTENT_BYTES", 8192),
                timeout: Duration::from_secs(env_or("SEARCH_TIMEOUT_SECS", 30)),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub lock: LockConfig,
    pub rate_limiting: RateLimitingConfig,
    pub billing: BillingConfig,
    pub async_quota: AsyncQuotaConfig,
    pub function_call: FunctionCallConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig::from_env(),
            database: DatabaseConfig::from_env()?,
            cache: CacheConfig::from_env(),
            lock: LockConfig::from_env(),
            rate_limiting: RateLimitingConfig::from_env(),
            billing: BillingConfig::from_env(),
            async_quota: AsyncQuotaConfig::from_env(),
            function_call: FunctionCallConfig::from_env(),
        })
    }

    /// Config for tests and tools that never touch the database config.
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                read_timeout_secs: 5,
                write_timeout_secs: 5,
                idle_timeout_secs: 5,
            },
            database: DatabaseConfig {
                host: "localhost".into(),
                port: 5432,
                username: "postgres".into(),
                password: String::new(),
                database: "prism_gateway_test".into(),
                max_connections: 1,
            },
            cache: CacheConfig {
                enabled: true,
                user_ttl: Duration::from_secs(600),
                api_key_ttl: Duration::from_secs(600),
                model_ttl: Duration::from_secs(600),
                provider_ttl: Duration::from_secs(300),
                quota_ttl: Duration::from_secs(300),
                query_ttl: Duration::from_secs(60),
            },
            lock: LockConfig {
                default_ttl: Duration::from_secs(5),
                retry_interval: Duration::from_millis(10),
                max_retries: 3,
            },
            rate_limiting: RateLimitingConfig {
                default_requests_per_minute: 60,
                default_requests_per_hour: 1000,
                default_requests_per_day: 10000,
            },
            billing: BillingConfig {
                currency: "USD".into(),
                precision: 6,
                default_token_price: Decimal::ZERO,
                settle_lock_ttl: Duration::from_secs(5),
                settle_lock_retries: 3,
            },
            async_quota: AsyncQuotaConfig {
                enabled: true,
                worker_count: 2,
                channel_size: 64,
                batch_size: 4,
                flush_interval: Duration::from_millis(50),
                retry_attempts: 2,
                retry_delay: Duration::from_millis(10),
            },
            function_call: FunctionCallConfig {
                enabled: false,
                search: SearchServiceConfig {
                    base_url: "http://127.0.0.1:0".into(),
                    api_key: String::new(),
                    max_results: 3,
                    crawl_results: 1,
                    crawl_content: false,
                    max_content_bytes: 1024,
                    timeout: Duration::from_secs(1),
                },
            },
        }
    }
}
