pub mod config;
pub mod db;
pub mod entitlement;
pub mod error;
pub mod llm;
pub mod middleware;
pub mod pipeline;
pub mod providers;
pub mod rate_limit;
pub mod routes;
pub mod telemetry;

use std::sync::Arc;

pub use config::Config;

use db::ReportStore;
use entitlement::EntitlementService;
use pipeline::synthesize::Synthesizer;
use providers::Providers;
use rate_limit::{BucketStore, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub reports: Arc<dyn ReportStore>,
    pub entitlements: EntitlementService,
    pub rate_limiter: RateLimiter,
    pub providers: Arc<Providers>,
    pub synthesizer: Arc<Synthesizer>,
}

impl AppState {
    pub fn new(config: Config, reports: Arc<dyn ReportStore>, buckets: Arc<dyn BucketStore>) -> Self {
        Self {
            entitlements: EntitlementService::new(reports.clone()),
            rate_limiter: RateLimiter::new(buckets),
            providers: Arc::new(Providers::from_config(&config)),
            synthesizer: Arc::new(Synthesizer::from_config(&config)),
            reports,
            config,
        }
    }
}
