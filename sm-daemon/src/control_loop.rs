//! The control loop.
//!
//! One cycle: reload settings, fetch a snapshot from the selected endpoint,
//! derive indicators, run the safety logic under the state lock and drive the
//! relays. Settings are re-read every cycle so dashboard edits take effect
//! without a restart. A cycle that errors flips the mode to ERROR but never
//! stops the loop; the relays keep their last commanded state until the next
//! cycle re-evaluates.

use chrono::Utc;
use sm_core::{load_settings, save_state_snapshot, Settings};
use sm_error::Result;
use sm_protocol::{ControlMode, PersistedState};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::controller::{apply_safety_logic, compute_derived_values, SharedState};
use crate::relay::RelayDriver;
use crate::sensor;

/// Cycles between periodic status lines and state persists.
const STATUS_LOG_INTERVAL: u64 = 10;

/// Run the control loop until `shutdown` is set (the notify wakes the sleep).
pub async fn run_control_loop(
    shared: SharedState,
    relay: Arc<RelayDriver>,
    settings_path: PathBuf,
    state_file: PathBuf,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
) {
    info!("Control loop started");

    while !shutdown.load(Ordering::SeqCst) {
        let cycle_start = std::time::Instant::now();
        let settings = load_settings(&settings_path);

        if let Err(e) = run_cycle(&shared, &relay, &settings, &state_file).await {
            error!("Control cycle failed: {}", e);
            let mut state = shared.lock().await;
            state.mode = ControlMode::Error;
            state.last_error = Some(e.to_string());
        }

        // Self-correcting cadence: subtract the cycle's own duration
        let elapsed = cycle_start.elapsed().as_secs_f64();
        let sleep_for = (settings.sleep_time - elapsed).max(0.0);

        tokio::select! {
            _ = notify.notified() => break,
            _ = tokio::time::sleep(Duration::from_secs_f64(sleep_for)) => {}
        }
    }

    info!("Control loop exited");
}

/// One fetch/decide/actuate cycle.
async fn run_cycle(
    shared: &SharedState,
    relay: &RelayDriver,
    settings: &Settings,
    state_file: &Path,
) -> Result<()> {
    let (endpoint, used_primary) = {
        let state = shared.lock().await;
        state.select_endpoint(settings, Utc::now())
    };

    // Fetch without holding the lock; the API stays responsive during retries
    let mut snapshot = sensor::fetch_snapshot(&endpoint, settings).await;
    let fetch_ok = snapshot.valid;
    if fetch_ok {
        compute_derived_values(&mut snapshot, settings);
    }

    let persist = {
        let mut state = shared.lock().await;
        state.cycle_count += 1;

        if fetch_ok {
            state.record_fetch_success(used_primary);
            // Only a good fetch replaces the snapshot; a failed one keeps the
            // last good data visible on the API
            state.snapshot = Some(snapshot);
        } else {
            state.record_fetch_failure(used_primary, Utc::now(), settings);
        }

        let (fan_on, heater_on) = apply_safety_logic(&mut state, settings, Utc::now());
        relay.set_relays(fan_on, heater_on);

        if state.cycle_count % STATUS_LOG_INTERVAL == 0 {
            info!(
                "Control loop #{}: mode={}, fan={}, heater={}",
                state.cycle_count,
                state.mode.as_str(),
                state.fan_status.as_str(),
                state.heater_status.as_str()
            );
            state
                .snapshot
                .as_ref()
                .filter(|s| s.valid)
                .map(|s| PersistedState {
                    snapshot: s.clone(),
                    mode: state.mode,
                    timestamp: Utc::now().to_rfc3339(),
                })
        } else {
            None
        }
    };

    if let Some(record) = persist {
        let path = state_file.to_path_buf();
        match tokio::task::spawn_blocking(move || save_state_snapshot(&path, &record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to persist state snapshot: {}", e),
            Err(e) => warn!("State persist task failed: {}", e),
        }
    }

    Ok(())
}
