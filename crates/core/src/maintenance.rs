//! Periodic image maintenance.
//!
//! On a fixed interval the daemon prunes expired images and downloads any
//! updates for tracked ones. Only one run may be in flight; an overlapping
//! tick is dropped with a note. The interval is read once at construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::config::DaemonConfig;

/// One maintenance pass: prune, then update, logging progress at 10% steps.
pub async fn run_image_maintenance(config: &DaemonConfig) {
    if let Err(e) = config.vault.prune_expired_images().await {
        tracing::warn!(error = %e, "Failed to prune expired images");
    }

    let last_percentage_logged = Mutex::new(-1);
    let monitor = move |percentage: i32| {
        if percentage % 10 == 0 {
            // The callback may repeat a percentage; log each step once.
            let mut last = last_percentage_logged.lock().unwrap();
            if *last != percentage {
                tracing::info!("  {}%", percentage);
                *last = percentage;
            }
        }
        true
    };

    if let Err(e) = config.vault.update_images(&monitor).await {
        tracing::error!("Error updating images: {}", e);
    }
}

/// Spawn the recurring maintenance tick.
pub fn spawn_image_maintenance(config: Arc<DaemonConfig>) -> JoinHandle<()> {
    let period = config.paths.image_refresh_interval();

    tokio::spawn(async move {
        let running = Arc::new(AtomicBool::new(false));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately; skip it

        loop {
            ticker.tick().await;

            if running.swap(true, Ordering::SeqCst) {
                tracing::info!("Image updater already running. Skipping…");
                continue;
            }

            let config = config.clone();
            let running = running.clone();
            tokio::spawn(async move {
                run_image_maintenance(&config).await;
                running.store(false, Ordering::SeqCst);
            });
        }
    })
}
