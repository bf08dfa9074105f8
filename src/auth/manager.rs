//! Process-wide OAuth credential, project and onboarding state.
//!
//! All shared state lives in one [`CredentialStore`] behind a
//! `parking_lot::RwLock`. The lock is only held for synchronous reads and
//! commits; network calls run outside it and their results are committed
//! under a fresh acquisition. Refreshes and onboardings are each serialized
//! behind an async gate so concurrent callers share one network exchange.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::credentials::{
    Credential, CredentialOrigin, StoredCredential, attach_project_id, load_credential_file,
    parse_credential, read_project_id, save_credential,
};
use super::oauth::{self, OAuthClient};
use super::{HttpClient, token};
use crate::cloudcode::CloudCodeClient;
use crate::cloudcode::discover::{load_code_assist, onboard_user};
use crate::config::{AuthConfig, CloudCodeConfig};
use crate::error::{AuthError, Error, Result};

/// What a remote call needs: a live bearer token and the project to bill.
#[derive(Debug, Clone)]
pub struct AccessContext {
    pub access_token: String,
    pub project_id: String,
}

#[derive(Debug, Default)]
struct CredentialStore {
    credential: Option<Credential>,
    project_id: Option<String>,
    onboarded: bool,
}

pub struct CredentialManager {
    oauth: OAuthClient,
    credential_file: PathBuf,
    env_credentials: Option<String>,
    project_override: Option<String>,
    http: HttpClient,
    api: Arc<CloudCodeClient>,
    store: RwLock<CredentialStore>,
    refresh_gate: tokio::sync::Mutex<()>,
    onboard_gate: tokio::sync::Mutex<()>,
    onboard_poll_interval: Duration,
    onboard_max_attempts: u32,
}

impl CredentialManager {
    pub fn new(auth: &AuthConfig, cloudcode: &CloudCodeConfig, api: Arc<CloudCodeClient>) -> Self {
        Self {
            oauth: OAuthClient::from_config(auth),
            credential_file: auth.credential_file.clone(),
            env_credentials: auth.env_credentials.clone(),
            project_override: auth.project_id.clone().filter(|p| !p.is_empty()),
            http: HttpClient::new(),
            api,
            store: RwLock::new(CredentialStore::default()),
            refresh_gate: tokio::sync::Mutex::new(()),
            onboard_gate: tokio::sync::Mutex::new(()),
            onboard_poll_interval: Duration::from_secs(cloudcode.onboard_poll_interval_secs),
            onboard_max_attempts: cloudcode.onboard_max_attempts.max(1),
        }
    }

    #[cfg(test)]
    fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.oauth.token_url = url.into();
        self
    }

    /// Whether a credential source exists that needs no user interaction.
    pub fn has_stored_credentials(&self) -> bool {
        self.env_credentials.is_some() || self.credential_file.exists()
    }

    pub fn credential_file(&self) -> &std::path::Path {
        &self.credential_file
    }

    pub fn is_onboarded(&self) -> bool {
        self.store.read().onboarded
    }

    /// Returns a valid credential, loading or refreshing it as needed.
    ///
    /// Order: live in-memory credential, `GEMINI_CREDENTIALS`, the credential
    /// file, then (only if `allow_interactive`) the browser flow.
    pub async fn acquire(&self, allow_interactive: bool) -> Result<Credential> {
        let live = self.store.read().credential.clone();
        if let Some(credential) = live {
            if credential.is_valid() {
                return Ok(credential);
            }
            return self.refresh().await;
        }

        if let Some(blob) = &self.env_credentials {
            match parse_credential(blob, CredentialOrigin::Environment) {
                Ok(stored) => {
                    info!("Using credentials from GEMINI_CREDENTIALS");
                    return self.install(stored).await;
                }
                Err(e) => warn!(error = %e, "Ignoring unusable GEMINI_CREDENTIALS"),
            }
        }

        match load_credential_file(&self.credential_file) {
            Ok(Some(stored)) => {
                info!(path = %self.credential_file.display(), "Using credentials from file");
                return self.install(stored).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(path = %self.credential_file.display(), error = %e, "Failed to load credential file")
            }
        }

        if !allow_interactive {
            return Err(Error::Auth(AuthError::CredentialsUnavailable));
        }

        self.login().await
    }

    /// Runs the interactive OAuth flow and persists the result.
    pub async fn login(&self) -> Result<Credential> {
        let tokens = oauth::authorize_interactive(&self.http, &self.oauth).await?;
        let credential = Credential::from_token_response(tokens, CredentialOrigin::InteractiveFlow);

        {
            let mut store = self.store.write();
            store.credential = Some(credential.clone());
            store.onboarded = false;
        }
        let project = self.store.read().project_id.clone();
        self.persist(&credential, project.as_deref());

        info!(path = %self.credential_file.display(), "Authentication successful, credentials saved");
        Ok(credential)
    }

    async fn install(&self, stored: StoredCredential) -> Result<Credential> {
        let StoredCredential {
            credential,
            project_id,
        } = stored;

        // A concurrent caller may have installed (and refreshed) first.
        let current = {
            let mut store = self.store.write();
            if store.project_id.is_none() {
                store.project_id = project_id;
            }
            store.credential.get_or_insert(credential).clone()
        };

        if current.is_valid() {
            return Ok(current);
        }

        debug!("Loaded credential is expired, refreshing");
        self.refresh().await
    }

    /// Exchanges the refresh token for a new access token.
    ///
    /// Callers racing on an expired token wait on one exchange; late arrivals
    /// see the refreshed credential and skip the network call.
    pub async fn refresh(&self) -> Result<Credential> {
        let _gate = self.refresh_gate.lock().await;

        let refresh_token = {
            let store = self.store.read();
            match &store.credential {
                Some(credential) if credential.is_valid() => return Ok(credential.clone()),
                Some(credential) => credential.refresh_token.clone(),
                None => return Err(Error::Auth(AuthError::CredentialsUnavailable)),
            }
        };

        let tokens = token::refresh_access_token(&self.http, &self.oauth, &refresh_token).await?;

        let refreshed = {
            let mut store = self.store.write();
            let Some(credential) = store.credential.as_mut() else {
                return Err(Error::Auth(AuthError::CredentialsUnavailable));
            };
            credential.apply(tokens);
            credential.clone()
        };

        info!(origin = ?refreshed.origin, "Access token refreshed");
        self.persist(&refreshed, None);
        Ok(refreshed)
    }

    /// Project to bill: explicit override, memory, credential file, then
    /// `loadCodeAssist` discovery.
    pub async fn resolve_project(&self, access_token: &str) -> Result<String> {
        if let Some(project) = &self.project_override {
            // Written back once, when the override first replaces the cached id.
            let credential = {
                let mut store = self.store.write();
                if store.project_id.as_deref() == Some(project.as_str()) {
                    None
                } else {
                    store.project_id = Some(project.clone());
                    store.credential.clone()
                }
            };
            if let Some(credential) = credential {
                self.persist(&credential, Some(project));
            }
            return Ok(project.clone());
        }

        if let Some(project) = self.store.read().project_id.clone() {
            return Ok(project);
        }

        if let Some(project) = read_project_id(&self.credential_file) {
            debug!(project_id = %project, "Using project ID cached in credential file");
            self.store.write().project_id = Some(project.clone());
            return Ok(project);
        }

        let response = load_code_assist(&self.api, access_token, None)
            .await
            .map_err(|e| Error::Auth(AuthError::ProjectResolutionFailed(e.to_string())))?;

        let project = response.project_id().map(str::to_string).ok_or_else(|| {
            Error::Auth(AuthError::ProjectResolutionFailed(
                "loadCodeAssist returned no cloudaicompanionProject".to_string(),
            ))
        })?;

        info!(project_id = %project, "Discovered project ID");

        let credential = {
            let mut store = self.store.write();
            store.project_id = Some(project.clone());
            store.credential.clone()
        };
        if let Some(credential) = credential {
            self.persist(&credential, Some(&project));
        }

        Ok(project)
    }

    /// One-time onboarding of `project_id`. Idempotent per process.
    pub async fn onboard(&self, access_token: &str, project_id: &str) -> Result<()> {
        if self.store.read().onboarded {
            return Ok(());
        }

        let _gate = self.onboard_gate.lock().await;
        if self.store.read().onboarded {
            return Ok(());
        }

        let status = load_code_assist(&self.api, access_token, Some(project_id))
            .await
            .map_err(onboarding_failed)?;

        if status.is_onboarded() {
            debug!(project_id, "Project already onboarded");
        } else {
            let tier_id = status.default_tier_id().to_string();
            info!(project_id, tier_id = %tier_id, "Onboarding project");

            let mut attempts = 0u32;
            loop {
                attempts += 1;
                let operation = onboard_user(&self.api, access_token, &tier_id, project_id)
                    .await
                    .map_err(onboarding_failed)?;
                if operation.done {
                    break;
                }
                if attempts >= self.onboard_max_attempts {
                    warn!(attempts, "Onboarding did not complete in time");
                    return Err(Error::Auth(AuthError::OnboardingTimeout { attempts }));
                }
                tokio::time::sleep(self.onboard_poll_interval).await;
            }
            info!(project_id, attempts, "Onboarding complete");
        }

        self.store.write().onboarded = true;
        Ok(())
    }

    /// Acquire, resolve the project and onboard, in that order.
    pub async fn ensure_ready(&self, allow_interactive: bool) -> Result<AccessContext> {
        let credential = self.acquire(allow_interactive).await?;
        let project_id = self.resolve_project(&credential.access_token).await?;
        self.onboard(&credential.access_token, &project_id).await?;

        Ok(AccessContext {
            access_token: credential.access_token,
            project_id,
        })
    }

    /// Writes the credential back to its file.
    ///
    /// Environment credentials are never written, except that a missing
    /// `project_id` is added to an existing file.
    fn persist(&self, credential: &Credential, project_id: Option<&str>) {
        let result = match credential.origin {
            CredentialOrigin::Environment => match project_id {
                Some(project) => attach_project_id(&self.credential_file, project).map(|_| ()),
                None => Ok(()),
            },
            CredentialOrigin::File | CredentialOrigin::InteractiveFlow => {
                save_credential(&self.credential_file, credential, &self.oauth, project_id)
            }
        };

        if let Err(e) = result {
            warn!(path = %self.credential_file.display(), error = %e, "Failed to persist credentials");
        }
    }
}

fn onboarding_failed(e: Error) -> Error {
    match e {
        Error::Auth(_) => e,
        other => Error::Auth(AuthError::OnboardingFailed(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockResponse, MockUpstream};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const VALID_EXPIRY: &str = "2099-01-01T00:00:00Z";
    const PAST_EXPIRY: &str = "2000-01-01T00:00:00Z";

    fn blob(token: &str, expiry: &str, project: Option<&str>) -> String {
        let mut value = json!({
            "token": token,
            "refresh_token": format!("refresh-{token}"),
            "expiry": expiry,
        });
        if let Some(p) = project {
            value["project_id"] = json!(p);
        }
        value.to_string()
    }

    fn manager(
        upstream: &MockUpstream,
        file: PathBuf,
        env: Option<String>,
        project: Option<&str>,
        max_attempts: u32,
    ) -> CredentialManager {
        let auth = AuthConfig {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            credential_file: file,
            callback_port: 0,
            project_id: project.map(str::to_string),
            env_credentials: env,
        };
        let cloudcode = CloudCodeConfig {
            endpoint: upstream.url(),
            timeout_secs: 5,
            onboard_poll_interval_secs: 0,
            onboard_max_attempts: max_attempts,
        };
        let api = Arc::new(CloudCodeClient::new(&cloudcode));
        CredentialManager::new(&auth, &cloudcode, api)
            .with_token_url(format!("{}/token", upstream.url()))
    }

    async fn token_upstream() -> MockUpstream {
        MockUpstream::start(|req| {
            if req.path.starts_with("/token") {
                MockResponse::json(200, json!({"access_token": "fresh", "expires_in": 3600}))
            } else if req.path.contains("loadCodeAssist") {
                MockResponse::json(200, json!({"cloudaicompanionProject": "discovered-proj", "currentTier": {"id": "free-tier"}}))
            } else {
                MockResponse::json(404, json!({"error": {"message": "not found"}}))
            }
        })
        .await
    }

    #[tokio::test]
    async fn test_environment_wins_over_file() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("creds.json");
        std::fs::write(&file, blob("file-token", VALID_EXPIRY, None)).unwrap();

        let mgr = manager(
            &upstream,
            file,
            Some(blob("env-token", VALID_EXPIRY, None)),
            None,
            3,
        );
        let credential = mgr.acquire(false).await.unwrap();
        assert_eq!(credential.access_token, "env-token");
        assert_eq!(credential.origin, CredentialOrigin::Environment);
        assert_eq!(upstream.count("/token"), 0);
    }

    #[tokio::test]
    async fn test_environment_credential_never_rewritten() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("creds.json");
        let original = blob("file-token", VALID_EXPIRY, None);
        std::fs::write(&file, &original).unwrap();

        let mgr = manager(
            &upstream,
            file.clone(),
            Some(blob("env-token", PAST_EXPIRY, None)),
            None,
            3,
        );

        let credential = mgr.acquire(false).await.unwrap();
        assert_eq!(credential.access_token, "fresh");
        assert_eq!(upstream.count("/token"), 1);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), original);

        // Discovery may attach the project id, and nothing else.
        let project = mgr.resolve_project(&credential.access_token).await.unwrap();
        assert_eq!(project, "discovered-proj");
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(saved["project_id"], "discovered-proj");
        assert_eq!(saved["token"], "file-token");
    }

    #[tokio::test]
    async fn test_expired_file_credential_refreshed_and_written_back() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("creds.json");
        std::fs::write(&file, blob("stale", PAST_EXPIRY, Some("p-1"))).unwrap();

        let mgr = manager(&upstream, file.clone(), None, None, 3);
        let credential = mgr.acquire(false).await.unwrap();
        assert_eq!(credential.access_token, "fresh");
        assert_eq!(credential.refresh_token, "refresh-stale");

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(saved["token"], "fresh");
        assert_eq!(saved["project_id"], "p-1");

        let body = String::from_utf8(upstream.requests()[0].body.to_vec()).unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=refresh-stale"));
    }

    #[tokio::test]
    async fn test_no_credentials_without_interaction() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&upstream, dir.path().join("missing.json"), None, None, 3);

        assert!(!mgr.has_stored_credentials());
        let err = mgr.acquire(false).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::CredentialsUnavailable)));
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces() {
        let upstream = MockUpstream::start(|_| {
            MockResponse::json(400, json!({"error": "invalid_grant"}))
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(
            &upstream,
            dir.path().join("creds.json"),
            Some(blob("old", PAST_EXPIRY, None)),
            None,
            3,
        );

        let err = mgr.acquire(false).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::RefreshFailed(_))));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_collapses() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(
            &upstream,
            dir.path().join("creds.json"),
            Some(blob("old", PAST_EXPIRY, None)),
            None,
            3,
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.acquire(false).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().access_token, "fresh");
        }
        assert_eq!(upstream.count("/token"), 1);
    }

    #[tokio::test]
    async fn test_project_resolution_order() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("creds.json");
        std::fs::write(&file, blob("tok", VALID_EXPIRY, Some("file-proj"))).unwrap();

        let mgr = manager(&upstream, file.clone(), None, Some("override-proj"), 3);
        assert_eq!(mgr.resolve_project("tok").await.unwrap(), "override-proj");

        let mgr = manager(&upstream, file, None, None, 3);
        assert_eq!(mgr.resolve_project("tok").await.unwrap(), "file-proj");
        assert_eq!(upstream.count("loadCodeAssist"), 0);
    }

    #[tokio::test]
    async fn test_project_override_saved_to_credential_file() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("creds.json");
        std::fs::write(&file, blob("tok", VALID_EXPIRY, Some("file-proj"))).unwrap();

        let mgr = manager(&upstream, file.clone(), None, Some("override-proj"), 3);
        mgr.acquire(false).await.unwrap();
        assert_eq!(mgr.resolve_project("tok").await.unwrap(), "override-proj");

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(saved["project_id"], "override-proj");
        assert_eq!(saved["token"], "tok");
        assert_eq!(upstream.count("loadCodeAssist"), 0);
    }

    #[tokio::test]
    async fn test_project_discovery_failure() {
        let upstream = MockUpstream::start(|_| MockResponse::json(200, json!({}))).await;
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&upstream, dir.path().join("creds.json"), None, None, 3);

        let err = mgr.resolve_project("tok").await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::ProjectResolutionFailed(_))));
    }

    #[tokio::test]
    async fn test_onboard_skipped_when_current_tier_present() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&upstream, dir.path().join("creds.json"), None, None, 3);

        mgr.onboard("tok", "p").await.unwrap();
        mgr.onboard("tok", "p").await.unwrap();
        assert!(mgr.is_onboarded());
        assert_eq!(upstream.count("loadCodeAssist"), 1);
        assert_eq!(upstream.count("onboardUser"), 0);
    }

    #[tokio::test]
    async fn test_onboard_polls_until_done() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        let upstream = MockUpstream::start(move |req| {
            if req.path.contains("loadCodeAssist") {
                MockResponse::json(
                    200,
                    json!({"allowedTiers": [{"id": "free-tier", "isDefault": true}]}),
                )
            } else {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                MockResponse::json(200, json!({"name": "operations/x", "done": n >= 3}))
            }
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&upstream, dir.path().join("creds.json"), None, None, 5);

        mgr.onboard("tok", "proj").await.unwrap();
        assert_eq!(upstream.count("onboardUser"), 3);

        let submitted = upstream
            .requests()
            .into_iter()
            .find(|r| r.path.contains("onboardUser"))
            .unwrap()
            .json();
        assert_eq!(submitted["tierId"], "free-tier");
        assert_eq!(submitted["cloudaicompanionProject"], "proj");
    }

    #[tokio::test]
    async fn test_onboard_times_out() {
        let upstream = MockUpstream::start(|req| {
            if req.path.contains("loadCodeAssist") {
                MockResponse::json(200, json!({}))
            } else {
                MockResponse::json(200, json!({"done": false}))
            }
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&upstream, dir.path().join("creds.json"), None, None, 2);

        let err = mgr.onboard("tok", "proj").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Auth(AuthError::OnboardingTimeout { attempts: 2 })
        ));
        assert!(!mgr.is_onboarded());

        let submitted = upstream
            .requests()
            .into_iter()
            .find(|r| r.path.contains("onboardUser"))
            .unwrap()
            .json();
        assert_eq!(submitted["tierId"], "legacy-tier");
    }

    #[tokio::test]
    async fn test_concurrent_onboarding_runs_once() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(&upstream, dir.path().join("creds.json"), None, None, 3));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.onboard("tok", "p").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(upstream.count("loadCodeAssist"), 1);
    }

    #[tokio::test]
    async fn test_ensure_ready() {
        let upstream = token_upstream().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("creds.json");
        std::fs::write(&file, blob("tok", VALID_EXPIRY, None)).unwrap();

        let mgr = manager(&upstream, file.clone(), None, None, 3);
        let ctx = mgr.ensure_ready(false).await.unwrap();
        assert_eq!(ctx.access_token, "tok");
        assert_eq!(ctx.project_id, "discovered-proj");
        assert!(mgr.is_onboarded());
        assert_eq!(
            read_project_id(&file).as_deref(),
            Some("discovered-proj")
        );
    }
}
