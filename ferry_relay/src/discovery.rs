// Discovery mirror: the relay advertises whatever the upstream advertises.
//
// A background thread probes the upstream with `query_status` every
// `interval` and keeps the last answer. Probes that fail leave the previous
// answer in place. Until the first probe succeeds, a placeholder naming the
// target is served with the listener's own counts.
//
// The thread only holds a `Weak` reference to the provider, so dropping the
// last `Arc` (the relay's listener config) ends it within one interval.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use ferry_protocol::{ServerStatus, StatusProvider, query_status};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::TargetAddr;

/// Default time between upstream probes.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ForeignStatusProvider {
    target: TargetAddr,
    latest: Mutex<Option<ServerStatus>>,
}

impl ForeignStatusProvider {
    /// Create the provider and start probing `target`.
    pub fn start(target: TargetAddr, interval: Duration) -> Arc<Self> {
        let provider = Arc::new(Self {
            target,
            latest: Mutex::new(None),
        });

        let weak = Arc::downgrade(&provider);
        let spawned = thread::Builder::new()
            .name("ferry-status".into())
            .spawn(move || poll(weak, interval));
        if let Err(err) = spawned {
            debug!(error = %err, "cannot start status probe, serving placeholder");
        }
        provider
    }

    /// The last status the upstream answered with.
    pub fn latest(&self) -> Option<ServerStatus> {
        self.latest.lock().clone()
    }

    fn probe(&self, timeout: Duration) {
        let addr = self.target.to_string();
        match query_status(&addr, timeout) {
            Ok(status) => {
                trace!(?status, "upstream status");
                *self.latest.lock() = Some(status);
            }
            Err(err) => debug!(target_addr = %addr, error = %err, "status probe failed"),
        }
    }
}

fn poll(provider: Weak<ForeignStatusProvider>, interval: Duration) {
    let timeout = interval.max(Duration::from_millis(500));
    loop {
        match provider.upgrade() {
            Some(provider) => provider.probe(timeout),
            None => break,
        }
        thread::sleep(interval);
    }
    trace!("status probe stopped");
}

impl StatusProvider for ForeignStatusProvider {
    fn server_status(&self, player_count: usize, max_players: usize) -> ServerStatus {
        match self.latest() {
            Some(status) => status,
            None => ServerStatus {
                server_sub_name: self.target.to_string(),
                player_count,
                max_players,
                ..ServerStatus::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_protocol::{ListenConfig, Listener, StaticStatus};
    use std::time::Instant;

    fn wait_for<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(value) = f() {
                return Some(value);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[test]
    fn placeholder_until_upstream_answers() {
        let port = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };
        let provider =
            ForeignStatusProvider::start(TargetAddr::new("127.0.0.1", port), Duration::from_millis(50));

        let status = provider.server_status(3, 20);
        assert_eq!(status.server_name, "Ferry");
        assert_eq!(status.server_sub_name, format!("127.0.0.1:{port}"));
        assert_eq!((status.player_count, status.max_players), (3, 20));
        assert!(provider.latest().is_none());
    }

    #[test]
    fn mirrors_upstream_status() {
        let upstream = Listener::bind(
            "127.0.0.1:0",
            ListenConfig {
                status_provider: Arc::new(StaticStatus(ServerStatus {
                    server_name: "Upstream Realm".into(),
                    server_sub_name: "survival".into(),
                    ..ServerStatus::default()
                })),
                max_players: 40,
                ..ListenConfig::default()
            },
        )
        .unwrap();
        let target = TargetAddr::new("127.0.0.1", upstream.local_addr().port());
        let provider = ForeignStatusProvider::start(target, Duration::from_millis(50));

        let mirrored = wait_for(Duration::from_secs(5), || provider.latest()).unwrap();
        assert_eq!(mirrored.server_name, "Upstream Realm");
        assert_eq!(mirrored.max_players, 40);

        // The relay's own counts are ignored once the upstream has answered.
        assert_eq!(provider.server_status(0, 1), mirrored);
    }
}
