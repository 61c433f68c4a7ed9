//! Network association seen from the cycle: is it up, bring it up, tear it
//! down. Reconnecting is idempotent; waiting for it is bounded.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::board::Watchdog;
use crate::error::NetworkError;

const POLL_INTERVAL: Duration = Duration::from_millis(300);

#[allow(async_fn_in_trait)]
pub trait NetworkHandle {
    async fn is_connected(&mut self) -> bool;
    /// Start (or restart) association. Returns without waiting for it.
    async fn connect(&mut self);
    /// Drop the link completely; used right before a hard reset.
    async fn reset(&mut self);
}

/// Host stand-in for a radio: the OS owns the link, reachability is a TCP
/// connect to a probe address. An empty probe address means always up.
pub struct HostNetwork {
    probe_addr: String,
    probe_timeout: Duration,
}

impl HostNetwork {
    pub fn new(probe_addr: &str) -> Self {
        Self {
            probe_addr: probe_addr.to_string(),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl NetworkHandle for HostNetwork {
    async fn is_connected(&mut self) -> bool {
        if self.probe_addr.is_empty() {
            return true;
        }
        match timeout(self.probe_timeout, TcpStream::connect(&self.probe_addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr = %self.probe_addr, "probe failed: {e}");
                false
            }
            Err(_) => {
                debug!(addr = %self.probe_addr, "probe timed out");
                false
            }
        }
    }

    async fn connect(&mut self) {
        debug!("host network is managed by the OS, nothing to start");
    }

    async fn reset(&mut self) {
        info!("network reset");
    }
}

/// Make sure the link is up, waiting at most `limit` for it. Polls every
/// 300 ms and feeds the watchdog on each poll.
pub async fn ensure_connected<N: NetworkHandle>(
    net: &mut N,
    watchdog: &dyn Watchdog,
    limit: Duration,
) -> Result<(), NetworkError> {
    if net.is_connected().await {
        return Ok(());
    }

    info!(timeout_secs = limit.as_secs(), "network down, connecting");
    net.connect().await;

    let deadline = Instant::now() + limit;
    loop {
        watchdog.feed();
        if net.is_connected().await {
            info!("network connected");
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!(timeout_secs = limit.as_secs(), "network did not come up");
            return Err(NetworkError::ReconnectTimeout {
                waited_secs: limit.as_secs(),
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

// ---------------------------------------------------------------------------
// Scripted link for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::NetworkHandle;

    /// Reports down for the first `down_polls` checks, then up. `None`
    /// never comes up.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedNetwork {
        pub(crate) down_polls: Option<u32>,
        pub(crate) polls: u32,
        pub(crate) connects: u32,
        pub(crate) resets: u32,
    }

    impl ScriptedNetwork {
        pub(crate) fn up() -> Self {
            Self {
                down_polls: Some(0),
                ..Self::default()
            }
        }

        pub(crate) fn up_after(polls: u32) -> Self {
            Self {
                down_polls: Some(polls),
                ..Self::default()
            }
        }

        pub(crate) fn never() -> Self {
            Self::default()
        }
    }

    impl NetworkHandle for ScriptedNetwork {
        async fn is_connected(&mut self) -> bool {
            self.polls += 1;
            matches!(self.down_polls, Some(n) if self.polls > n)
        }

        async fn connect(&mut self) {
            self.connects += 1;
        }

        async fn reset(&mut self) {
            self.resets += 1;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::testing::ScriptedNetwork;
    use super::*;
    use crate::board::testing::CountingWatchdog;

    const LIMIT: Duration = Duration::from_secs(20);

    #[tokio::test(start_paused = true)]
    async fn already_up_skips_connect() {
        let mut net = ScriptedNetwork::up();
        ensure_connected(&mut net, &CountingWatchdog::default(), LIMIT).await.unwrap();
        assert_eq!(net.connects, 0);
        assert_eq!(net.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn comes_up_while_polling() {
        let mut net = ScriptedNetwork::up_after(4);
        let wd = CountingWatchdog::default();
        let start = Instant::now();

        ensure_connected(&mut net, &wd, LIMIT).await.unwrap();
        assert_eq!(net.connects, 1);
        assert_eq!(net.polls, 5);
        // Polls 2..=4 were down, each followed by one interval.
        assert_eq!(start.elapsed(), POLL_INTERVAL * 3);
        assert_eq!(wd.count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_limit() {
        let mut net = ScriptedNetwork::never();
        let start = Instant::now();

        let err = ensure_connected(&mut net, &CountingWatchdog::default(), LIMIT)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::ReconnectTimeout { waited_secs: 20 }));
        assert!(start.elapsed() >= LIMIT);
        assert!(start.elapsed() < LIMIT + POLL_INTERVAL);
    }

    #[tokio::test]
    async fn empty_probe_is_always_up() {
        assert!(HostNetwork::new("").is_connected().await);
    }

    #[tokio::test]
    async fn probe_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(HostNetwork::new(&addr).is_connected().await);
    }
}
