// Microsoft Live device-code sign-in, the production `TokenAuthority`.
//
// `request()` starts a device-code flow: it asks the connect endpoint for a
// user code, prints where to enter it, then polls the token endpoint at the
// advertised interval until the user finishes signing in or the code
// expires. `refresh()` trades the refresh token for a new credential.
//
// Both endpoints take form-encoded POSTs and answer with JSON. The token
// endpoint reports "not yet" as an `authorization_pending` error body, which
// is the only error that keeps the poll going.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::credential::{AuthError, Credential, TokenAuthority};

const CLIENT_ID: &str = "0000000048183522";
const SCOPE: &str = "service::user.auth.xboxlive.com::MBI_SSL";
const CONNECT_URL: &str = "https://login.live.com/oauth20_connect.srf";
const TOKEN_URL: &str = "https://login.live.com/oauth20_token.srf";

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const REFRESH_GRANT: &str = "refresh_token";

#[derive(Debug, Deserialize)]
struct DeviceCode {
    user_code: String,
    device_code: String,
    verification_uri: String,
    #[serde(default = "default_interval")]
    interval: u64,
    expires_in: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_credential(self) -> Credential {
        Credential {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token,
            expiry: self
                .expires_in
                .map(|secs| Utc::now() + TimeDelta::seconds(secs)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

impl From<ErrorResponse> for AuthError {
    fn from(body: ErrorResponse) -> Self {
        AuthError::Server {
            error: body.error,
            description: body.error_description,
        }
    }
}

pub struct LiveDeviceAuth {
    client: Client,
    connect_url: String,
    token_url: String,
}

impl LiveDeviceAuth {
    pub fn new() -> Self {
        Self::with_endpoints(CONNECT_URL, TOKEN_URL)
    }

    /// Use different endpoints, for a local authorization server.
    pub fn with_endpoints(connect_url: impl Into<String>, token_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            connect_url: connect_url.into(),
            token_url: token_url.into(),
        }
    }

    fn start_device_flow(&self) -> Result<DeviceCode, AuthError> {
        let response = self
            .client
            .post(&self.connect_url)
            .form(&[
                ("client_id", CLIENT_ID),
                ("scope", SCOPE),
                ("response_type", "device_code"),
            ])
            .send()?;
        if !response.status().is_success() {
            return Err(response.json::<ErrorResponse>()?.into());
        }
        Ok(response.json()?)
    }

    /// One token request. `Ok(None)` means the user has not finished yet.
    fn token_request(&self, form: &[(&str, &str)]) -> Result<Option<Credential>, AuthError> {
        let response = self.client.post(&self.token_url).form(form).send()?;
        if response.status().is_success() {
            return Ok(Some(response.json::<TokenResponse>()?.into_credential()));
        }
        let body: ErrorResponse = response.json()?;
        if body.error == "authorization_pending" {
            Ok(None)
        } else {
            Err(body.into())
        }
    }
}

impl Default for LiveDeviceAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenAuthority for LiveDeviceAuth {
    fn request(&self) -> Result<Credential, AuthError> {
        let code = self.start_device_flow()?;
        println!(
            "Authenticate at {} using the code {}.",
            code.verification_uri, code.user_code
        );

        let deadline = Instant::now() + Duration::from_secs(code.expires_in);
        let interval = Duration::from_secs(code.interval);
        loop {
            let form = [
                ("client_id", CLIENT_ID),
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", code.device_code.as_str()),
            ];
            if let Some(credential) = self.token_request(&form)? {
                info!("signed in");
                return Ok(credential);
            }
            if Instant::now() + interval >= deadline {
                return Err(AuthError::Expired);
            }
            debug!("authorization pending");
            thread::sleep(interval);
        }
    }

    fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
        if credential.refresh_token.is_empty() {
            return Err(AuthError::NoRefreshToken);
        }
        let form = [
            ("client_id", CLIENT_ID),
            ("scope", SCOPE),
            ("grant_type", REFRESH_GRANT),
            ("refresh_token", credential.refresh_token.as_str()),
        ];
        match self.token_request(&form)? {
            Some(mut refreshed) => {
                // The server may omit a new refresh token; the old one stays valid.
                if refreshed.refresh_token.is_empty() {
                    refreshed.refresh_token = credential.refresh_token.clone();
                }
                Ok(refreshed)
            }
            None => Err(AuthError::Server {
                error: "authorization_pending".into(),
                description: "unexpected pending answer to a refresh".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tiny_http::{Response, Server};

    /// Local authorization server. The token endpoint answers
    /// `authorization_pending` `pending_polls` times before issuing a token.
    struct MockLive {
        base: String,
        polls: Arc<AtomicUsize>,
        bodies: Arc<parking_lot::Mutex<Vec<String>>>,
        _thread: thread::JoinHandle<()>,
    }

    fn mock_live(pending_polls: usize, expires_in: u64) -> MockLive {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let polls = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let thread = {
            let polls = Arc::clone(&polls);
            let bodies = Arc::clone(&bodies);
            thread::spawn(move || {
                for mut request in server.incoming_requests() {
                    let mut body = String::new();
                    request.as_reader().read_to_string(&mut body).unwrap();
                    bodies.lock().push(body.clone());

                    let (status, reply): (u16, String) = if request.url().starts_with("/connect") {
                        (
                            200,
                            format!(
                                r#"{{"user_code":"ABCD-1234","device_code":"dev-1","verification_uri":"https://example.test/link","interval":0,"expires_in":{expires_in}}}"#
                            ),
                        )
                    } else if body.contains("grant_type=refresh_token") {
                        if body.contains("refresh_token=revoked") {
                            (400, r#"{"error":"invalid_grant","error_description":"revoked"}"#.to_string())
                        } else if body.contains("refresh_token=long-lived") {
                            (200, r#"{"access_token":"access-2","token_type":"bearer","expires_in":3600}"#.to_string())
                        } else {
                            (200, r#"{"access_token":"access-2","token_type":"bearer","refresh_token":"refresh-2","expires_in":3600}"#.to_string())
                        }
                    } else if polls.fetch_add(1, Ordering::SeqCst) < pending_polls {
                        (400, r#"{"error":"authorization_pending"}"#.to_string())
                    } else {
                        (200, r#"{"access_token":"access-1","token_type":"bearer","refresh_token":"refresh-1","expires_in":3600}"#.to_string())
                    };
                    let _ = request.respond(Response::from_string(reply).with_status_code(status));
                }
            })
        };

        MockLive {
            base: format!("http://{addr}"),
            polls,
            bodies,
            _thread: thread,
        }
    }

    fn auth_for(mock: &MockLive) -> LiveDeviceAuth {
        LiveDeviceAuth::with_endpoints(
            format!("{}/connect", mock.base),
            format!("{}/token", mock.base),
        )
    }

    #[test]
    fn device_flow_polls_until_signed_in() {
        let mock = mock_live(2, 60);
        let credential = auth_for(&mock).request().unwrap();

        assert_eq!(credential.access_token, "access-1");
        assert_eq!(credential.refresh_token, "refresh-1");
        assert!(credential.is_fresh(Utc::now()));
        assert_eq!(mock.polls.load(Ordering::SeqCst), 3);

        let bodies = mock.bodies.lock();
        assert!(bodies[0].contains("response_type=device_code"));
        assert!(bodies[1].contains("device_code=dev-1"));
    }

    #[test]
    fn expired_device_code_gives_up() {
        let mock = mock_live(usize::MAX, 0);
        let err = auth_for(&mock).request().unwrap_err();
        assert!(matches!(err, AuthError::Expired), "{err:?}");
    }

    #[test]
    fn refresh_exchanges_refresh_token() {
        let mock = mock_live(0, 60);
        let old = Credential {
            access_token: "access-1".into(),
            token_type: "bearer".into(),
            refresh_token: "refresh-1".into(),
            expiry: Some(Utc::now()),
        };
        let refreshed = auth_for(&mock).refresh(&old).unwrap();
        assert_eq!(refreshed.access_token, "access-2");
        assert_eq!(refreshed.refresh_token, "refresh-2");
        assert!(mock.bodies.lock()[0].contains("refresh_token=refresh-1"));
    }

    #[test]
    fn refresh_keeps_old_refresh_token_when_none_is_issued() {
        let mock = mock_live(0, 60);
        let auth = auth_for(&mock);
        let old = Credential {
            access_token: "access-1".into(),
            token_type: "bearer".into(),
            refresh_token: "long-lived".into(),
            expiry: Some(Utc::now()),
        };

        let refreshed = auth.refresh(&old).unwrap();
        assert_eq!(refreshed.access_token, "access-2");
        assert_eq!(refreshed.refresh_token, "long-lived");

        // The kept token still works for the next refresh.
        let again = auth.refresh(&refreshed).unwrap();
        assert_eq!(again.refresh_token, "long-lived");
        let bodies = mock.bodies.lock();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[1].contains("refresh_token=long-lived"));
    }

    #[test]
    fn refresh_rejection_is_server_error() {
        let mock = mock_live(0, 60);
        let old = Credential {
            access_token: "access-1".into(),
            token_type: "bearer".into(),
            refresh_token: "revoked".into(),
            expiry: None,
        };
        let err = auth_for(&mock).refresh(&old).unwrap_err();
        assert!(
            matches!(&err, AuthError::Server { error, .. } if error == "invalid_grant"),
            "{err:?}"
        );
    }

    #[test]
    fn refresh_without_refresh_token_fails_locally() {
        let auth = LiveDeviceAuth::with_endpoints("http://127.0.0.1:1/c", "http://127.0.0.1:1/t");
        let old = Credential {
            access_token: "a".into(),
            token_type: String::new(),
            refresh_token: String::new(),
            expiry: None,
        };
        assert!(matches!(auth.refresh(&old), Err(AuthError::NoRefreshToken)));
    }
}
