//! Process-external signals: watchdog feed, boot-time safe-mode input,
//! deep sleep and hard reset.
//!
//! On a host there is no real deep sleep. Suspension is a watchdog-fed wait
//! followed by re-executing the binary, so nothing volatile survives it,
//! exactly like waking from deep sleep.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::BoardSection;

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

/// Liveness timer. Must be fed at every blocking step and at the top of
/// each cycle, or the node is reset from outside.
pub trait Watchdog {
    fn feed(&self);
}

/// Kernel watchdog device (e.g. `/dev/watchdog`). Any write counts as a
/// feed; the device is never disarmed, so a dead process resets the board.
pub struct DeviceWatchdog {
    file: File,
}

impl DeviceWatchdog {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open watchdog device {path}"))?;
        Ok(Self { file })
    }
}

impl Watchdog for DeviceWatchdog {
    fn feed(&self) {
        if let Err(e) = (&self.file).write_all(b"\0") {
            warn!("watchdog feed failed: {e}");
        }
    }
}

/// Software watchdog for hosts without a device: a monitor thread aborts
/// the process when the feed is older than the timeout. A supervisor
/// (systemd `Restart=always`) then restarts it.
pub struct SoftWatchdog {
    started: Instant,
    last_feed_ms: Arc<AtomicU64>,
}

impl SoftWatchdog {
    pub fn start(timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        let last_feed_ms = Arc::new(AtomicU64::new(0));

        // Weak: the monitor stops once the watchdog itself is dropped.
        let seen = Arc::downgrade(&last_feed_ms);
        std::thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_secs(1));
                let Some(seen) = seen.upgrade() else {
                    return;
                };
                let now_ms = started.elapsed().as_millis() as u64;
                let idle = Duration::from_millis(now_ms.saturating_sub(seen.load(Ordering::Relaxed)));
                if idle > timeout {
                    error!(idle_secs = idle.as_secs(), "watchdog starved, aborting");
                    std::process::abort();
                }
            })
            .context("failed to spawn watchdog thread")?;

        Ok(Self {
            started,
            last_feed_ms,
        })
    }
}

impl Watchdog for SoftWatchdog {
    fn feed(&self) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        self.last_feed_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Device watchdog when configured, software watchdog otherwise.
pub fn start_watchdog(board: &BoardSection) -> Result<Box<dyn Watchdog>> {
    let timeout = Duration::from_secs(board.watchdog_timeout_secs);
    let wd: Box<dyn Watchdog> = match &board.watchdog_device {
        Some(path) => {
            info!(path, "using watchdog device");
            Box::new(DeviceWatchdog::open(path)?)
        }
        None => {
            info!(timeout_secs = timeout.as_secs(), "using software watchdog");
            Box::new(SoftWatchdog::start(timeout)?)
        }
    };
    wd.feed();
    Ok(wd)
}

/// Wait `total`, feeding the watchdog at least every `step`.
pub async fn fed_sleep(total: Duration, step: Duration, watchdog: &dyn Watchdog) {
    let deadline = tokio::time::Instant::now() + total;
    loop {
        watchdog.feed();
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep((deadline - now).min(step)).await;
    }
}

// ---------------------------------------------------------------------------
// Safe mode
// ---------------------------------------------------------------------------

/// Checked once at boot, before anything else runs.
pub fn safe_mode_requested(board: &BoardSection) -> bool {
    if let Some(path) = &board.safe_mode_file {
        if std::path::Path::new(path).exists() {
            info!(path, "safe-mode flag file present");
            return true;
        }
    }
    safe_mode_button(board)
}

/// BOOT button, active low with pull-up.
#[cfg(feature = "gpio")]
fn safe_mode_button(board: &BoardSection) -> bool {
    match rppal::gpio::Gpio::new().and_then(|g| g.get(board.safe_mode_pin)) {
        Ok(pin) => pin.into_input_pullup().is_low(),
        Err(e) => {
            warn!(pin = board.safe_mode_pin, "cannot read safe-mode button: {e}");
            false
        }
    }
}

#[cfg(not(feature = "gpio"))]
fn safe_mode_button(_board: &BoardSection) -> bool {
    false
}

/// Idle forever without touching sensors or network. No watchdog is armed
/// yet, so the board stays parked until someone resets it.
pub fn park_in_safe_mode() -> ! {
    warn!("SAFE MODE: measurement loop disabled, waiting for reset");
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

// ---------------------------------------------------------------------------
// Deep sleep / reset
// ---------------------------------------------------------------------------

/// Hold the node in low-power wait for `minutes`.
pub async fn deep_sleep(minutes: u32, watchdog: &dyn Watchdog) {
    info!(minutes, "entering deep sleep");
    fed_sleep(
        Duration::from_secs(u64::from(minutes) * 60),
        Duration::from_secs(10),
        watchdog,
    )
    .await;
}

/// Start over from process entry. Used after deep sleep and as the hard
/// reset on unrecoverable network loss.
pub fn restart_process() -> ! {
    info!("restarting");
    restart_impl()
}

#[cfg(unix)]
fn restart_impl() -> ! {
    use std::os::unix::process::CommandExt;

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!("cannot locate own executable: {e}");
            std::process::exit(1);
        }
    };
    let err = std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .exec();
    error!("re-exec failed: {err}");
    std::process::exit(1);
}

#[cfg(not(unix))]
fn restart_impl() -> ! {
    // Supervisor restarts us.
    std::process::exit(0);
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::Watchdog;
    use std::cell::Cell;

    #[derive(Default)]
    pub(crate) struct CountingWatchdog {
        feeds: Cell<u32>,
    }

    impl CountingWatchdog {
        pub(crate) fn count(&self) -> u32 {
            self.feeds.get()
        }
    }

    impl Watchdog for CountingWatchdog {
        fn feed(&self) {
            self.feeds.set(self.feeds.get() + 1);
        }
    }
}
