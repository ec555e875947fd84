// Opens the upstream leg of a session pair.
//
// One `dial()` per accepted client. Calls are independent and run
// concurrently from different pair threads; the only thing they share is the
// token source. Failures go back to the caller unchanged and are never
// retried here.

use std::sync::Arc;
use std::time::Duration;

use ferry_protocol::{Conn, DialError, Dialer, TokenSource};
use tracing::debug;

use crate::config::TargetAddr;

#[derive(Clone)]
pub struct UpstreamDialer {
    target: TargetAddr,
    dialer: Dialer,
}

impl UpstreamDialer {
    pub fn new(
        target: TargetAddr,
        token_source: Arc<dyn TokenSource>,
        display_name: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            target,
            dialer: Dialer {
                display_name: display_name.into(),
                token_source: Some(token_source),
                connect_timeout,
            },
        }
    }

    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    /// Open a logged-in upstream session. The spawn handshake is left to the
    /// session pair's barrier.
    pub fn dial(&self) -> Result<Conn, DialError> {
        let addr = self.target.to_string();
        debug!(target_addr = %addr, "dialing upstream");
        self.dialer.dial(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_protocol::BoxError;
    use std::net::TcpListener;

    struct Fixed(String);

    impl TokenSource for Fixed {
        fn access_token(&self) -> Result<String, BoxError> {
            Ok(self.0.clone())
        }
    }

    struct NoToken;

    impl TokenSource for NoToken {
        fn access_token(&self) -> Result<String, BoxError> {
            Err("signed out".into())
        }
    }

    #[test]
    fn refused_connection_is_reported() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dialer = UpstreamDialer::new(
            TargetAddr::new("127.0.0.1", port),
            Arc::new(Fixed("t".into())),
            "ferry",
            Duration::from_secs(1),
        );
        assert_eq!(dialer.target().port(), port);
        let err = dialer.dial().unwrap_err();
        assert!(matches!(err, DialError::Connect { .. }), "{err:?}");
    }

    #[test]
    fn token_failure_is_reported() {
        let dialer = UpstreamDialer::new(
            TargetAddr::new("127.0.0.1", 1),
            Arc::new(NoToken),
            "ferry",
            Duration::from_secs(1),
        );
        assert!(matches!(dialer.dial(), Err(DialError::Token(_))));
    }
}
