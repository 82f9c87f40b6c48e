use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use directories::ProjectDirs;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::config::Environment;
use crate::error::ArchiveError;
use crate::store;

pub trait AuthProvider {
    fn login(&self, access_token: &str) -> Result<(), ArchiveError>;
    fn logout(&self) -> Result<(), ArchiveError>;
    fn auth_headers(&self) -> Option<HeaderMap>;
    fn token(&self) -> Option<StoredToken>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl StoredToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| expires_at <= Utc::now().timestamp())
            .unwrap_or(false)
    }
}

/// Keeps one access token per environment as JSON in the user config dir.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn for_environment(environment: Environment) -> Result<Self, ArchiveError> {
        let dirs = ProjectDirs::from("org", "isic-archive", "isic-cli").ok_or_else(|| {
            ArchiveError::Auth("unable to resolve config directory".to_string())
        })?;
        Ok(Self::at(
            dirs.config_dir()
                .join(format!("token-{}.json", environment.name())),
        ))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Option<StoredToken> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<StoredToken>(&content) {
            Ok(token) => Some(token),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "ignoring unreadable token file"
                );
                None
            }
        }
    }
}

impl AuthProvider for TokenStore {
    fn login(&self, access_token: &str) -> Result<(), ArchiveError> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(ArchiveError::Auth("no access token given".to_string()));
        }
        let token = StoredToken {
            access_token: access_token.to_string(),
            expires_at: None,
        };
        let content = serde_json::to_vec_pretty(&token)
            .map_err(|err| ArchiveError::Auth(err.to_string()))?;
        let path = camino::Utf8PathBuf::from_path_buf(self.path.clone())
            .map_err(|_| ArchiveError::Auth("token path is not valid UTF-8".to_string()))?;
        store::write_bytes_atomic(&path, &content)
    }

    fn logout(&self) -> Result<(), ArchiveError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ArchiveError::Auth(err.to_string())),
        }
    }

    fn auth_headers(&self) -> Option<HeaderMap> {
        let token = self.token()?;
        let value = HeaderValue::from_str(&format!("Bearer {}", token.access_token)).ok()?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Some(headers)
    }

    fn token(&self) -> Option<StoredToken> {
        self.read().filter(|token| !token.is_expired())
    }
}
