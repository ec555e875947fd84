// Access credential: persisted cache and the shared refreshing source.
//
// - `CredentialCache` owns the on-disk file. `obtain()` returns the stored
//   credential when the file exists and parses; when the file is absent it
//   runs the interactive flow of a `TokenAuthority` and stores the result.
//   A file that exists but does not parse is an error, not a reason to
//   re-authenticate.
// - `RefreshingTokenSource` is the one piece of state every session pair
//   shares. Readers take an `Arc<Credential>` snapshot under a read lock.
//   When the snapshot is about to expire, callers serialize on a separate
//   refresh lock and re-check, so a burst of dials against an expiring
//   token performs a single refresh round trip.
//
// The file format matches a plain OAuth2 token record:
// `{"access_token", "token_type", "refresh_token", "expiry"}` with `expiry`
// in RFC 3339.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use ferry_protocol::{BoxError, TokenSource};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A credential is refreshed once it is this close to its expiry.
const EXPIRY_DELTA_SECS: i64 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credential {
    /// Whether the access token can still be used at `now`. A missing expiry,
    /// or the zero timestamp some writers use for "none", never expires.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expiry {
            Some(expiry) if expiry.year() > 1 => {
                expiry - TimeDelta::seconds(EXPIRY_DELTA_SECS) > now
            }
            _ => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authorization server returned {error}: {description}")]
    Server { error: String, description: String },

    #[error("device code expired before sign-in completed")]
    Expired,

    #[error("credential has no refresh token")]
    NoRefreshToken,
}

/// Issues and refreshes credentials.
pub trait TokenAuthority: Send + Sync {
    /// Interactive acquisition of a brand-new credential.
    fn request(&self) -> Result<Credential, AuthError>;

    fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError>;
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file {} is malformed: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("cannot read credential file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("cannot write credential file {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("credential acquisition failed: {0}")]
    Acquire(#[source] AuthError),
}

/// The persisted credential file.
#[derive(Clone, Debug)]
pub struct CredentialCache {
    path: PathBuf,
}

impl CredentialCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored credential, or `None` when there is no file.
    pub fn load(&self) -> Result<Option<Credential>, CredentialError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let credential: Credential =
            serde_json::from_slice(&bytes).map_err(|err| CredentialError::Malformed {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;
        if credential.access_token.is_empty() {
            return Err(CredentialError::Malformed {
                path: self.path.clone(),
                reason: "access_token is empty".into(),
            });
        }
        Ok(Some(credential))
    }

    /// Write `credential`, replacing any previous file.
    pub fn store(&self, credential: &Credential) -> Result<(), CredentialError> {
        let write_err = |source: io::Error| CredentialError::Write {
            path: self.path.clone(),
            source,
        };
        let body = serde_json::to_vec_pretty(credential).map_err(|err| write_err(err.into()))?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        fs::write(&staging, body).map_err(write_err)?;
        fs::rename(&staging, &self.path).map_err(write_err)
    }

    /// Load the stored credential, or acquire and store a new one.
    ///
    /// Storing is best-effort: a credential that was acquired but could not
    /// be written is still returned.
    pub fn obtain(&self, authority: &dyn TokenAuthority) -> Result<Credential, CredentialError> {
        if let Some(credential) = self.load()? {
            debug!(path = %self.path.display(), "using stored credential");
            return Ok(credential);
        }

        info!(path = %self.path.display(), "no stored credential, starting sign-in");
        let credential = authority.request().map_err(CredentialError::Acquire)?;
        if let Err(err) = self.store(&credential) {
            warn!(error = %err, "cannot persist credential");
        }
        Ok(credential)
    }
}

/// Shared, auto-refreshing credential.
pub struct RefreshingTokenSource<A> {
    current: RwLock<Arc<Credential>>,
    refresh_lock: Mutex<()>,
    authority: A,
    cache: Option<CredentialCache>,
}

impl<A: TokenAuthority> RefreshingTokenSource<A> {
    pub fn new(credential: Credential, authority: A) -> Self {
        Self {
            current: RwLock::new(Arc::new(credential)),
            refresh_lock: Mutex::new(()),
            authority,
            cache: None,
        }
    }

    /// Write refreshed credentials back to `cache`.
    pub fn persist_to(mut self, cache: CredentialCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The current credential without refreshing.
    pub fn snapshot(&self) -> Arc<Credential> {
        Arc::clone(&self.current.read())
    }

    /// A credential that is fresh now, refreshing it first if needed.
    pub fn credential(&self) -> Result<Arc<Credential>, AuthError> {
        let snapshot = self.snapshot();
        if snapshot.is_fresh(Utc::now()) {
            return Ok(snapshot);
        }

        let _refreshing = self.refresh_lock.lock();
        // Another caller may have refreshed while we waited.
        let snapshot = self.snapshot();
        if snapshot.is_fresh(Utc::now()) {
            return Ok(snapshot);
        }

        debug!("refreshing credential");
        let refreshed = Arc::new(self.authority.refresh(&snapshot)?);
        *self.current.write() = Arc::clone(&refreshed);
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.store(&refreshed) {
                warn!(error = %err, "cannot persist refreshed credential");
            }
        }
        Ok(refreshed)
    }
}

impl<A: TokenAuthority> TokenSource for RefreshingTokenSource<A> {
    fn access_token(&self) -> Result<String, BoxError> {
        Ok(self.credential()?.access_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Counts calls; refresh sleeps a little to widen the race window.
    struct CountingAuthority {
        requests: AtomicUsize,
        refreshes: AtomicUsize,
    }

    impl CountingAuthority {
        fn new() -> Self {
            Self {
                requests: AtomicUsize::new(0),
                refreshes: AtomicUsize::new(0),
            }
        }
    }

    impl TokenAuthority for CountingAuthority {
        fn request(&self) -> Result<Credential, AuthError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(credential("fresh-access", Some(Utc::now() + TimeDelta::hours(1))))
        }

        fn refresh(&self, old: &Credential) -> Result<Credential, AuthError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(Duration::from_millis(50));
            Ok(Credential {
                access_token: format!("refreshed-{n}"),
                expiry: Some(Utc::now() + TimeDelta::hours(1)),
                ..old.clone()
            })
        }
    }

    struct FailingAuthority;

    impl TokenAuthority for FailingAuthority {
        fn request(&self) -> Result<Credential, AuthError> {
            Err(AuthError::Server {
                error: "access_denied".into(),
                description: "user declined".into(),
            })
        }

        fn refresh(&self, _: &Credential) -> Result<Credential, AuthError> {
            Err(AuthError::NoRefreshToken)
        }
    }

    fn credential(access: &str, expiry: Option<DateTime<Utc>>) -> Credential {
        Credential {
            access_token: access.into(),
            token_type: "bearer".into(),
            refresh_token: "refresh-secret".into(),
            expiry,
        }
    }

    #[test]
    fn freshness_honours_expiry_delta() {
        let now = Utc::now();
        assert!(credential("a", None).is_fresh(now));
        assert!(credential("a", Some(now + TimeDelta::minutes(5))).is_fresh(now));
        assert!(!credential("a", Some(now + TimeDelta::seconds(5))).is_fresh(now));
        assert!(!credential("a", Some(now - TimeDelta::minutes(5))).is_fresh(now));
        assert!(!credential("", None).is_fresh(now));
    }

    #[test]
    fn zero_expiry_means_no_expiry() {
        let stored = r#"{"access_token":"abc","token_type":"bearer","refresh_token":"r","expiry":"0001-01-01T00:00:00Z"}"#;
        let parsed: Credential = serde_json::from_str(stored).unwrap();
        assert!(parsed.is_fresh(Utc::now()));
    }

    #[test]
    fn obtain_without_file_acquires_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join("token.json"));
        let authority = CountingAuthority::new();

        let obtained = cache.obtain(&authority).unwrap();
        assert_eq!(obtained.access_token, "fresh-access");
        assert_eq!(authority.requests.load(Ordering::SeqCst), 1);

        // The written file loads back to the same credential.
        assert_eq!(cache.load().unwrap(), Some(obtained));
    }

    #[test]
    fn obtain_with_file_skips_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join("token.json"));
        let stored = credential("stored-access", Some(Utc::now() - TimeDelta::hours(1)));
        cache.store(&stored).unwrap();

        let authority = CountingAuthority::new();
        let obtained = cache.obtain(&authority).unwrap();

        // Returned as stored, even though it is expired: refreshing is the
        // token source's job.
        assert_eq!(obtained, stored);
        assert_eq!(authority.requests.load(Ordering::SeqCst), 0);
        assert_eq!(authority.refreshes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        fs::write(&path, b"{ not json").unwrap();

        let authority = CountingAuthority::new();
        let err = CredentialCache::new(&path).obtain(&authority).unwrap_err();
        assert!(matches!(err, CredentialError::Malformed { .. }), "{err:?}");
        assert_eq!(authority.requests.load(Ordering::SeqCst), 0);

        fs::write(&path, br#"{"access_token":""}"#).unwrap();
        let err = CredentialCache::new(&path).obtain(&authority).unwrap_err();
        assert!(matches!(err, CredentialError::Malformed { .. }), "{err:?}");
    }

    #[test]
    fn acquisition_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join("token.json"));
        let err = cache.obtain(&FailingAuthority).unwrap_err();
        assert!(matches!(err, CredentialError::Acquire(_)), "{err:?}");
        assert!(!cache.path().exists());
    }

    #[test]
    fn unwritable_cache_still_returns_credential() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join("missing-dir").join("token.json"));
        let obtained = cache.obtain(&CountingAuthority::new()).unwrap();
        assert_eq!(obtained.access_token, "fresh-access");
    }

    #[test]
    fn fresh_credential_is_not_refreshed() {
        let source = RefreshingTokenSource::new(
            credential("still-good", Some(Utc::now() + TimeDelta::hours(1))),
            CountingAuthority::new(),
        );
        assert_eq!(source.access_token().unwrap(), "still-good");
        assert_eq!(source.authority.refreshes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_callers_share_one_refresh() {
        let source = Arc::new(RefreshingTokenSource::new(
            credential("expired", Some(Utc::now() - TimeDelta::minutes(1))),
            CountingAuthority::new(),
        ));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let source = Arc::clone(&source);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    source.access_token().unwrap()
                })
            })
            .collect();
        let tokens: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(source.authority.refreshes.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "refreshed-1"), "{tokens:?}");
    }

    #[test]
    fn refreshed_credential_is_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join("token.json"));
        let source = RefreshingTokenSource::new(
            credential("expired", Some(Utc::now() - TimeDelta::minutes(1))),
            CountingAuthority::new(),
        )
        .persist_to(cache.clone());

        source.access_token().unwrap();
        let stored = cache.load().unwrap().unwrap();
        assert_eq!(stored.access_token, "refreshed-1");
        assert_eq!(stored.refresh_token, "refresh-secret");
    }

    #[test]
    fn refresh_failure_keeps_old_snapshot() {
        let source = RefreshingTokenSource::new(
            credential("expired", Some(Utc::now() - TimeDelta::minutes(1))),
            FailingAuthority,
        );
        assert!(source.access_token().is_err());
        assert_eq!(source.snapshot().access_token, "expired");
    }
}
