use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::TaigaError;
use crate::store::default_cache_root;

pub const DEFAULT_URL: &str = "https://cds.team/taiga";
pub const CONFIG_FILE_NAME: &str = "taiga-cache.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub allow_offline: Option<bool>,
    #[serde(default)]
    pub verify_on_read: Option<bool>,
    #[serde(default)]
    pub http: Option<HttpConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_retries: usize,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub api: ApiConfig,
    pub cache_dir: Utf8PathBuf,
    pub workers: usize,
    pub allow_offline: bool,
    pub verify_on_read: bool,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the first config found in lookup order, applies `TAIGA_URL` and
    /// `TAIGA_TOKEN`, and fills in defaults. No file at all is not an error
    /// unless `path` was given explicitly.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, TaigaError> {
        let config = match path {
            Some(path) => Self::read(PathBuf::from(path))?,
            None => match Self::candidates().into_iter().find(|path| path.exists()) {
                Some(path) => Self::read(path)?,
                None => Config::default(),
            },
        };
        let config = Self::with_overrides(
            config,
            std::env::var("TAIGA_URL").ok(),
            std::env::var("TAIGA_TOKEN").ok(),
        );
        Self::resolve_config(config)
    }

    pub fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dirs) = BaseDirs::new() {
            paths.push(dirs.home_dir().join(".taiga").join(CONFIG_FILE_NAME));
        }
        paths
    }

    fn read(path: PathBuf) -> Result<Config, TaigaError> {
        let content = fs::read_to_string(&path).map_err(|_| TaigaError::ConfigRead(path.clone()))?;
        serde_json::from_str(&content).map_err(|err| TaigaError::ConfigParse(err.to_string()))
    }

    pub fn with_overrides(mut config: Config, url: Option<String>, token: Option<String>) -> Config {
        if let Some(url) = url.filter(|value| !value.trim().is_empty()) {
            config.url = Some(url);
        }
        if let Some(token) = token.filter(|value| !value.trim().is_empty()) {
            config.token = Some(token);
        }
        config
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, TaigaError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(TaigaError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let url = config
            .url
            .unwrap_or_else(|| DEFAULT_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TaigaError::ConfigParse(format!("url must be http(s): {url}")));
        }

        let cache_dir = match config.cache_dir {
            Some(dir) => expand_home(&dir)?,
            None => default_cache_root()?,
        };

        let workers = config.workers.unwrap_or_else(default_workers);
        if workers == 0 {
            return Err(TaigaError::ConfigParse(
                "workers must be at least 1".to_string(),
            ));
        }

        let http = config.http.unwrap_or_default();
        Ok(ResolvedConfig {
            schema_version,
            api: ApiConfig {
                url,
                token: config.token.map(|token| token.trim().to_string()),
                timeout_secs: http.timeout_secs.unwrap_or(120),
                connect_timeout_secs: http.connect_timeout_secs.unwrap_or(10),
                max_retries: http.max_retries.unwrap_or(3),
            },
            cache_dir,
            workers,
            allow_offline: config.allow_offline.unwrap_or(false),
            verify_on_read: config.verify_on_read.unwrap_or(true),
        })
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get().min(4))
        .unwrap_or(2)
}

fn expand_home(dir: &str) -> Result<Utf8PathBuf, TaigaError> {
    let Some(rest) = dir.strip_prefix("~/") else {
        return Ok(Utf8PathBuf::from(dir));
    };
    let home = BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok())
        .ok_or_else(|| TaigaError::ConfigParse("unable to resolve home directory".to_string()))?;
    Ok(home.join(rest))
}
