use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    pub admin_api_key: String,
    pub app_base_url: String,
    /// Max connections per tenant-schema pool (the catalog pool is sized separately).
    pub tenant_pool_size: u32,
    pub sync_max_retries: i32,
    pub sync_poll_secs: u64,
    pub sync_dispatch_timeout_secs: u64,
    /// A sync error stuck in `processing` longer than this is requeued.
    pub sync_stuck_after_secs: i64,
    // Outbound sync webhooks (optional per external system)
    pub one_c_webhook_url: Option<String>,
    pub crm_webhook_url: Option<String>,
    pub monitoring_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            admin_api_key: env::var("ADMIN_API_KEY")
                .unwrap_or_else(|_| "change_this_admin_key".into()),
            app_base_url: env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost".into()),
            tenant_pool_size: env::var("TENANT_POOL_SIZE")
                .unwrap_or_else(|_| "5".into())
                .parse()?,
            sync_max_retries: env::var("SYNC_MAX_RETRIES")
                .unwrap_or_else(|_| "3".into())
                .parse()?,
            sync_poll_secs: env::var("SYNC_POLL_SECS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
            sync_dispatch_timeout_secs: env::var("SYNC_DISPATCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
            sync_stuck_after_secs: env::var("SYNC_STUCK_AFTER_SECS")
                .unwrap_or_else(|_| "600".into())
                .parse()?,
            one_c_webhook_url: env::var("ONE_C_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            crm_webhook_url: env::var("CRM_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            monitoring_webhook_url: env::var("MONITORING_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
        })
    }

    /// Map of external-service identifier → webhook endpoint, for the sync dispatcher.
    pub fn sync_endpoints(&self) -> HashMap<String, String> {
        let mut endpoints = HashMap::new();
        if let Some(url) = &self.one_c_webhook_url {
            endpoints.insert("one_c".to_string(), url.clone());
        }
        if let Some(url) = &self.crm_webhook_url {
            endpoints.insert("crm".to_string(), url.clone());
        }
        if let Some(url) = &self.monitoring_webhook_url {
            endpoints.insert("monitoring".to_string(), url.clone());
        }
        endpoints
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}
