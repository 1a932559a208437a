//! Shared application state for the intake daemon.

use crate::admission::RateLimiter;
use crate::config::Config;
use crate::registry::Registry;
use crate::workers::StreamWorkers;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub struct AppState {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub workers: Arc<StreamWorkers>,
    pub limiter: RateLimiter,
    /// This node's own machine identity; a child presenting it is refused.
    pub localhost_guid: Uuid,
    accepting_streams: AtomicBool,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let workers = Arc::new(StreamWorkers::start(config.stream.ingest_threads));
        let localhost_guid = config.stream.node_id.unwrap_or_else(Uuid::new_v4);
        let accepting = config.stream.enabled;
        Arc::new(Self {
            config,
            registry: Arc::new(Registry::new()),
            workers,
            limiter: RateLimiter::new(),
            localhost_guid,
            accepting_streams: AtomicBool::new(accepting),
        })
    }

    /// Whether the streaming service is currently taking connections.
    pub fn accepting_streams(&self) -> bool {
        self.accepting_streams.load(Ordering::Acquire)
    }

    pub fn set_accepting_streams(&self, value: bool) {
        self.accepting_streams.store(value, Ordering::Release);
    }
}
