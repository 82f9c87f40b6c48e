use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::download::RetryPolicy;
use crate::error::ArchiveError;

const CONFIG_FILE_NAME: &str = "isic-cli.json";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const MIN_DOWNLOAD_WORKERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Prod,
    Sandbox,
    Dev,
}

impl Environment {
    pub fn from_flags(sandbox: bool, dev: bool) -> Result<Self, ArchiveError> {
        match (sandbox, dev) {
            (true, true) => Err(ArchiveError::ConflictingEnvironments),
            (true, false) => Ok(Environment::Sandbox),
            (false, true) => Ok(Environment::Dev),
            (false, false) => Ok(Environment::Prod),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Environment::Prod => "prod",
            Environment::Sandbox => "sandbox",
            Environment::Dev => "dev",
        }
    }

    pub fn domain(self) -> &'static str {
        match self {
            Environment::Prod => "https://api.isic-archive.com",
            Environment::Sandbox => "https://api-sandbox.isic-archive.com",
            Environment::Dev => "http://127.0.0.1:8000",
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub download_workers: Option<usize>,
    #[serde(default)]
    pub max_download_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub environment: Environment,
    pub domain: String,
    pub api_url: String,
    pub request_timeout: Duration,
    pub download_workers: usize,
    pub retry: RetryPolicy,
}

impl ResolvedConfig {
    pub fn for_environment(environment: Environment) -> Self {
        Self::from_parts(environment, Config::default())
    }

    /// Points every archive endpoint at `domain`, used for local servers.
    pub fn with_domain(mut self, domain: &str) -> Self {
        let domain = domain.trim_end_matches('/');
        self.domain = domain.to_string();
        self.api_url = format!("{domain}/api/v2/");
        self
    }

    fn from_parts(environment: Environment, config: Config) -> Self {
        let domain = environment.domain().to_string();
        let api_url = config
            .api_url
            .map(|url| format!("{}/", url.trim_end_matches('/')))
            .unwrap_or_else(|| format!("{domain}/api/v2/"));
        let mut retry = RetryPolicy::default();
        if let Some(attempts) = config.max_download_attempts {
            retry.max_attempts = attempts.max(1);
        }
        Self {
            environment,
            domain,
            api_url,
            request_timeout: Duration::from_secs(
                config
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            download_workers: config
                .download_workers
                .unwrap_or_else(default_download_workers)
                .max(1),
            retry,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        environment: Environment,
        path: Option<&Path>,
    ) -> Result<ResolvedConfig, ArchiveError> {
        let config = match path {
            Some(path) => Self::read(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::read(&path)?,
                _ => Config::default(),
            },
        };
        Ok(ResolvedConfig::from_parts(environment, config))
    }

    pub fn resolve_config(environment: Environment, config: Config) -> ResolvedConfig {
        ResolvedConfig::from_parts(environment, config)
    }

    fn read(path: &Path) -> Result<Config, ArchiveError> {
        let content =
            fs::read_to_string(path).map_err(|_| ArchiveError::ConfigRead(path.to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| ArchiveError::ConfigParse(err.to_string()))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "isic-archive", "isic-cli")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

pub fn default_download_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(MIN_DOWNLOAD_WORKERS);
    cpus.max(MIN_DOWNLOAD_WORKERS)
}
