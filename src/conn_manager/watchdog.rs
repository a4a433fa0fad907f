use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;

use super::conn_state::PrinterConn;

/// Polls the connection for staleness until it quits or a transport call fails
pub async fn run_watchdog(conn: Arc<PrinterConn>, interval: Duration) {
    let mut shutdown = conn.subscribe_shutdown();
    if *shutdown.borrow() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("watchdog for {} stopping", conn.id().to_string());
                    break;
                }
            }
            now = ticker.tick() => {
                if let Err(e) = conn.watchdog_tick(now) {
                    conn.record_fatal(e.context("watchdog refresh"));
                    break;
                }
            }
        }
    }
}
