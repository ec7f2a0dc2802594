//! Cluster-level options. An explicit record threaded into every
//! component at construction; there is no ambient configuration.

use std::time::Duration;

use crate::pool::PoolOptions;

/// Services a cluster node may host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    KeyValue,
    Query,
    Analytics,
    Search,
    Views,
    Management,
}

/// Which address family of the cluster map to dial. `Auto` picks the
/// alternate ("external") block when the bootstrap host matches one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkResolution {
    Default,
    Auto,
    External,
}

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub username: String,
    pub password: String,
    pub tls_enabled: bool,
    pub bootstrap_http_port: u16,
    pub kv_port: u16,
    pub kv_timeout: Duration,
    pub kv_durability_timeout: Duration,
    pub views_timeout: Duration,
    pub query_timeout: Duration,
    pub analytics_timeout: Duration,
    pub search_timeout: Duration,
    pub management_timeout: Duration,
    pub enable_mutation_tokens: bool,
    pub enable_operation_duration_tracing: bool,
    pub enable_config_polling: bool,
    pub config_poll_interval: Duration,
    pub network_resolution: NetworkResolution,
    /// Overrides the TLS-driven SASL mechanism choice when set.
    pub sasl_mechanism: Option<String>,
    pub pool: PoolOptions,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            username: String::new(),
            password: String::new(),
            tls_enabled: false,
            bootstrap_http_port: 8091,
            kv_port: 11210,
            kv_timeout: Duration::from_millis(2_500),
            kv_durability_timeout: Duration::from_secs(10),
            views_timeout: Duration::from_secs(75),
            query_timeout: Duration::from_secs(75),
            analytics_timeout: Duration::from_secs(75),
            search_timeout: Duration::from_secs(75),
            management_timeout: Duration::from_secs(75),
            enable_mutation_tokens: true,
            enable_operation_duration_tracing: false,
            enable_config_polling: true,
            config_poll_interval: Duration::from_millis(2_500),
            network_resolution: NetworkResolution::Auto,
            sasl_mechanism: None,
            pool: PoolOptions::default(),
        }
    }
}

impl ClusterOptions {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        ClusterOptions {
            username: username.into(),
            password: password.into(),
            ..ClusterOptions::default()
        }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        if enabled {
            self.bootstrap_http_port = 18091;
            self.kv_port = 11207;
        }
        self
    }

    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = timeout;
        self
    }

    pub fn with_kv_durability_timeout(mut self, timeout: Duration) -> Self {
        self.kv_durability_timeout = timeout;
        self
    }

    pub fn with_network_resolution(mut self, resolution: NetworkResolution) -> Self {
        self.network_resolution = resolution;
        self
    }

    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub fn timeout_for(&self, service: ServiceType) -> Duration {
        match service {
            ServiceType::KeyValue => self.kv_timeout,
            ServiceType::Query => self.query_timeout,
            ServiceType::Analytics => self.analytics_timeout,
            ServiceType::Search => self.search_timeout,
            ServiceType::Views => self.views_timeout,
            ServiceType::Management => self.management_timeout,
        }
    }
}
