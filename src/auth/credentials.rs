//! OAuth credential parsing and persistence.
//!
//! The on-disk format is the one written by the Google auth libraries:
//! `{client_id, client_secret, token, refresh_token, token_uri, scopes, expiry, project_id}`.
//! Writes merge into the existing JSON object so unknown fields survive.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use fs2::FileExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;

use super::oauth::{OAuthClient, SCOPES};
use super::token::{TOKEN_URL, TokenResponse};
use crate::error::{AuthError, Error, Result};

/// Tokens are treated as expired this long before their stated expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Where the live credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    Environment,
    File,
    InteractiveFlow,
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expiry: Option<DateTime<Utc>>,
    pub origin: CredentialOrigin,
}

impl Credential {
    pub fn from_token_response(tokens: TokenResponse, origin: CredentialOrigin) -> Self {
        let mut credential = Self {
            access_token: String::new(),
            refresh_token: String::new(),
            token_type: "Bearer".to_string(),
            expiry: None,
            origin,
        };
        credential.apply(tokens);
        credential
    }

    /// Folds a token endpoint reply into this credential.
    ///
    /// The refresh token is only replaced when the reply carries a new one.
    pub fn apply(&mut self, tokens: TokenResponse) {
        self.access_token = tokens.access_token;
        if let Some(refresh) = tokens.refresh_token.filter(|t| !t.is_empty()) {
            self.refresh_token = refresh;
        }
        if let Some(token_type) = tokens.token_type.filter(|t| !t.is_empty()) {
            self.token_type = token_type;
        }
        self.expiry = tokens
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expiry {
            Some(expiry) => expiry - ChronoDuration::seconds(EXPIRY_SKEW_SECS) > now,
            None => true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

/// A credential blob as found in `GEMINI_CREDENTIALS` or the credential file.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub credential: Credential,
    pub project_id: Option<String>,
}

#[derive(Deserialize)]
struct CredentialBlob {
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expiry: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
}

/// Parses a credential blob. A blob without a refresh token is rejected.
pub fn parse_credential(json: &str, origin: CredentialOrigin) -> Result<StoredCredential> {
    let blob: CredentialBlob = serde_json::from_str(json)?;

    let refresh_token = blob
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or(Error::Auth(AuthError::CredentialsUnavailable))?;

    let expiry = blob
        .expiry
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(StoredCredential {
        credential: Credential {
            access_token: blob.token.or(blob.access_token).unwrap_or_default(),
            refresh_token,
            token_type: blob.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expiry,
            origin,
        },
        project_id: blob.project_id.filter(|p| !p.is_empty()),
    })
}

pub fn load_credential_file(path: &Path) -> Result<Option<StoredCredential>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    parse_credential(&content, CredentialOrigin::File).map(Some)
}

/// Reads just the cached `project_id` from the credential file, if any.
pub fn read_project_id(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let map: Map<String, Value> = serde_json::from_str(&content).ok()?;
    map.get("project_id")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

fn read_object(path: &Path) -> Map<String, Value> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

/// Writes the credential into the file, keeping fields this crate does not own.
///
/// An explicit `project_id` wins; otherwise an existing one is preserved.
pub fn save_credential(
    path: &Path,
    credential: &Credential,
    oauth: &OAuthClient,
    project_id: Option<&str>,
) -> Result<()> {
    let mut map = read_object(path);

    map.insert("client_id".into(), Value::String(oauth.client_id.clone()));
    map.insert(
        "client_secret".into(),
        Value::String(oauth.client_secret.clone()),
    );
    map.insert(
        "token".into(),
        Value::String(credential.access_token.clone()),
    );
    map.insert(
        "refresh_token".into(),
        Value::String(credential.refresh_token.clone()),
    );
    map.insert("token_uri".into(), Value::String(TOKEN_URL.to_string()));
    map.insert(
        "scopes".into(),
        Value::Array(SCOPES.iter().map(|s| Value::String(s.to_string())).collect()),
    );
    if let Some(expiry) = credential.expiry {
        map.insert(
            "expiry".into(),
            Value::String(expiry.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
    }
    if let Some(project) = project_id.filter(|p| !p.is_empty()) {
        map.insert("project_id".into(), Value::String(project.to_string()));
    }

    write_atomic(path, &map)
}

/// Adds `project_id` to an existing credential file that lacks one.
///
/// Returns whether the file was changed. Nothing else in the file is touched.
pub fn attach_project_id(path: &Path, project_id: &str) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let mut map = read_object(path);
    if map
        .get("project_id")
        .and_then(Value::as_str)
        .is_some_and(|p| !p.is_empty())
    {
        return Ok(false);
    }
    map.insert("project_id".into(), Value::String(project_id.to_string()));
    write_atomic(path, &map)?;
    Ok(true)
}

/// Writes to a sibling temp file with mode 0600, then renames over `path`.
fn write_atomic(path: &Path, map: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let lock_path = path.with_extension("lock");
    let lock = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    lock.lock_exclusive()?;

    let tmp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(map)?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = (|| -> std::io::Result<()> {
        let mut file = options.open(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();

    let _ = FileExt::unlock(&lock);
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result.map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth() -> OAuthClient {
        OAuthClient {
            client_id: "cid".to_string(),
            client_secret: "csecret".to_string(),
            token_url: TOKEN_URL.to_string(),
            callback_port: 8080,
        }
    }

    fn credential(origin: CredentialOrigin) -> Credential {
        Credential {
            access_token: "ya29.new".to_string(),
            refresh_token: "1//refresh".to_string(),
            token_type: "Bearer".to_string(),
            expiry: Some(Utc::now() + ChronoDuration::hours(1)),
            origin,
        }
    }

    #[test]
    fn test_parse_credential_full() {
        let json = r#"{
            "token": "ya29.tok",
            "refresh_token": "1//r",
            "expiry": "2099-01-01T00:00:00Z",
            "project_id": "proj-1"
        }"#;
        let stored = parse_credential(json, CredentialOrigin::Environment).unwrap();
        assert_eq!(stored.credential.access_token, "ya29.tok");
        assert_eq!(stored.credential.refresh_token, "1//r");
        assert_eq!(stored.credential.origin, CredentialOrigin::Environment);
        assert_eq!(stored.project_id.as_deref(), Some("proj-1"));
        assert!(stored.credential.is_valid());
    }

    #[test]
    fn test_parse_credential_token_wins_over_access_token() {
        let json = r#"{"access_token":"a","token":"b","refresh_token":"r"}"#;
        let stored = parse_credential(json, CredentialOrigin::File).unwrap();
        assert_eq!(stored.credential.access_token, "b");
    }

    #[test]
    fn test_parse_credential_requires_refresh_token() {
        let err = parse_credential(r#"{"token":"t"}"#, CredentialOrigin::File).unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::CredentialsUnavailable)));
        assert!(parse_credential("not json", CredentialOrigin::File).is_err());
    }

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let mut cred = credential(CredentialOrigin::File);

        cred.expiry = Some(now + ChronoDuration::seconds(30));
        assert!(!cred.is_valid_at(now));

        cred.expiry = Some(now + ChronoDuration::seconds(120));
        assert!(cred.is_valid_at(now));

        cred.expiry = Some(now - ChronoDuration::seconds(1));
        assert!(!cred.is_valid_at(now));

        cred.access_token.clear();
        cred.expiry = None;
        assert!(!cred.is_valid_at(now));
    }

    #[test]
    fn test_apply_keeps_refresh_token_when_absent() {
        let mut cred = credential(CredentialOrigin::File);
        cred.apply(TokenResponse {
            access_token: "ya29.fresh".to_string(),
            expires_in: Some(3600),
            refresh_token: None,
            token_type: None,
        });
        assert_eq!(cred.access_token, "ya29.fresh");
        assert_eq!(cred.refresh_token, "1//refresh");
        assert!(cred.is_valid());
    }

    #[test]
    fn test_save_preserves_unrelated_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth_creds.json");
        std::fs::write(
            &path,
            r#"{"refresh_token":"old","project_id":"kept","universe_domain":"googleapis.com"}"#,
        )
        .unwrap();

        save_credential(&path, &credential(CredentialOrigin::File), &oauth(), None).unwrap();

        let saved: Map<String, Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["refresh_token"], "1//refresh");
        assert_eq!(saved["token"], "ya29.new");
        assert_eq!(saved["project_id"], "kept");
        assert_eq!(saved["universe_domain"], "googleapis.com");
        assert_eq!(saved["token_uri"], TOKEN_URL);
        assert_eq!(saved["client_id"], "cid");
        assert_eq!(saved["scopes"].as_array().unwrap().len(), 3);
        assert!(saved["expiry"].as_str().unwrap().ends_with('Z'));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_save_sets_project_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("creds.json");

        save_credential(
            &path,
            &credential(CredentialOrigin::InteractiveFlow),
            &oauth(),
            Some("proj-9"),
        )
        .unwrap();

        let stored = load_credential_file(&path).unwrap().unwrap();
        assert_eq!(stored.project_id.as_deref(), Some("proj-9"));
        assert_eq!(stored.credential.refresh_token, "1//refresh");
        assert_eq!(stored.credential.origin, CredentialOrigin::File);
        assert_eq!(read_project_id(&path).as_deref(), Some("proj-9"));
    }

    #[cfg(unix)]
    #[test]
    fn test_save_uses_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        save_credential(&path, &credential(CredentialOrigin::File), &oauth(), None).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_attach_project_id_only_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");

        assert!(!attach_project_id(&path, "p").unwrap());
        assert!(!path.exists());

        std::fs::write(&path, r#"{"refresh_token":"r","token":"t"}"#).unwrap();
        assert!(attach_project_id(&path, "p1").unwrap());
        assert!(!attach_project_id(&path, "p2").unwrap());

        let saved: Map<String, Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["project_id"], "p1");
        assert_eq!(saved["token"], "t");
        assert_eq!(saved.len(), 3);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_credential_file(&dir.path().join("none.json")).unwrap().is_none());
        assert!(read_project_id(&dir.path().join("none.json")).is_none());
    }
}
