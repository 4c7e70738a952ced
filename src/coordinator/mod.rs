// src/coordinator/mod.rs
//
// Owns the three independent maintenance loops, spec.md §4.3-4.5/§5.1.
// Grounded in the teacher's `run_coordinator_loop` (src/main.rs) for the
// spawn/shutdown shape, but the loops here share only `Arc<Store>` — no
// `MarketplaceCoordinator`-style in-memory node/job map travels between
// ticks.

pub mod cleanup;
pub mod health;
pub mod scheduling;

use crate::config::CoordinatorConfig;
use crate::store::Store;
use cleanup::CleanupStats;
use health::HealthStats;
use log::{error, info};
use scheduling::SchedulingStats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Coordinator {
    store: Arc<Store>,
    config: CoordinatorConfig,
    pub scheduling_stats: Arc<SchedulingStats>,
    pub health_stats: Arc<HealthStats>,
    pub cleanup_stats: Arc<CleanupStats>,
}

impl Coordinator {
    pub fn new(store: Arc<Store>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            config,
            scheduling_stats: Arc::new(SchedulingStats::default()),
            health_stats: Arc::new(HealthStats::default()),
            cleanup_stats: Arc::new(CleanupStats::default()),
        }
    }

    /// Spawns the three loops and runs until `shutdown` flips to `true`,
    /// checked once per tick by each loop (spec.md §5.2).
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let scheduling = tokio::spawn(ticking_loop(
            "scheduling",
            self.config.scheduling_interval,
            shutdown.clone(),
            {
                let store = self.store.clone();
                let stats = self.scheduling_stats.clone();
                move || {
                    let store = store.clone();
                    let stats = stats.clone();
                    async move {
                        if let Err(e) = scheduling::run_once(&store, &stats).await {
                            error!("scheduling tick failed: {e}");
                        }
                    }
                }
            },
        ));

        let health = tokio::spawn(ticking_loop(
            "health",
            self.config.health_interval,
            shutdown.clone(),
            {
                let store = self.store.clone();
                let config = self.config.clone();
                let stats = self.health_stats.clone();
                move || {
                    let store = store.clone();
                    let config = config.clone();
                    let stats = stats.clone();
                    async move {
                        if let Err(e) = health::run_once(&store, &config, &stats).await {
                            error!("health tick failed: {e}");
                        }
                    }
                }
            },
        ));

        let cleanup = tokio::spawn(ticking_loop(
            "cleanup",
            self.config.cleanup_interval,
            shutdown.clone(),
            {
                let store = self.store.clone();
                let config = self.config.clone();
                let stats = self.cleanup_stats.clone();
                move || {
                    let store = store.clone();
                    let config = config.clone();
                    let stats = stats.clone();
                    async move {
                        if let Err(e) = cleanup::run_once(&store, &config, &stats).await {
                            error!("cleanup tick failed: {e}");
                        }
                    }
                }
            },
        ));

        // LIFO shutdown order, spec.md §5.2: cleanup spawned last, joined
        // first.
        let _ = tokio::join!(cleanup, health, scheduling);
        info!("coordinator loops stopped");
    }
}

async fn ticking_loop<F, Fut>(name: &'static str, interval: Duration, shutdown: Arc<AtomicBool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::Relaxed) {
            info!("{name} loop observed shutdown signal, stopping");
            break;
        }
        tick().await;
    }
}
