use std::{
    env, fmt, fs, io,
    path::{Path, PathBuf},
};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::{
    models::SidecarConfig,
    validation::{ConfigGuardRailError, ConfigWarnings, apply_guard_rails},
};

/// Names a configuration file to load.
pub const CONFIG_PATH_ENV: &str = "SIDECAR_CONFIG_PATH";
/// Holds a whole configuration document, TOML or JSON.
pub const CONFIG_INLINE_ENV: &str = "SIDECAR_CONFIG";

/// Files looked for under the working directory, in order.
const DISCOVERY_PATHS: &[&str] = &[
    "sidecar.toml",
    "sidecar.json",
    "config/sidecar.toml",
    "config/sidecar.json",
];

/// Top-level sections of a configuration document.
const SECTIONS: &[&str] = &["restore_job", "storage_client", "logging"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Format implied by the file extension, if it names one.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// JSON documents open with `{`; anything else is read as TOML.
    pub fn sniff(contents: &str) -> Self {
        if contents.trim_start().starts_with('{') {
            Self::Json
        } else {
            Self::Toml
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Toml => "TOML",
            Self::Json => "JSON",
        })
    }
}

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Defaults,
    EnvPath(PathBuf),
    EnvInline,
    Discovered(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defaults => f.write_str("built-in defaults"),
            Self::EnvPath(path) => write!(f, "{CONFIG_PATH_ENV}={}", path.display()),
            Self::EnvInline => f.write_str(CONFIG_INLINE_ENV),
            Self::Discovered(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("cannot read sidecar config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{origin} is not valid {format}: {message}")]
    Syntax {
        origin: String,
        format: ConfigFormat,
        message: String,
    },
    #[error("{origin}: section `{section}` is invalid: {message}")]
    Section {
        origin: String,
        section: &'static str,
        message: String,
    },
    #[error("{origin}: unknown section `{section}`, expected one of {}", SECTIONS.join(", "))]
    UnknownSection { origin: String, section: String },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: SidecarConfig,
    pub source: ConfigSource,
    pub warnings: ConfigWarnings,
}

impl ConfigLoad {
    /// Log where the configuration came from and every guard-rail warning.
    /// Call once tracing is installed.
    pub fn report(&self) {
        info!(source = %self.source, "Loaded sidecar configuration");
        self.warnings.log();
    }
}

/// Resolve the configuration and apply the guard rails.
///
/// Resolution order: the file named by `SIDECAR_CONFIG_PATH`, the inline
/// document in `SIDECAR_CONFIG`, the first of the discovery paths present
/// in the working directory, then defaults.
pub fn load_config() -> Result<ConfigLoad, ConfigLoadError> {
    let (config, source) = if let Some(path) = env_value(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        (SidecarConfig::from_file(&path)?, ConfigSource::EnvPath(path))
    } else if let Some(document) = env_value(CONFIG_INLINE_ENV) {
        let format = ConfigFormat::sniff(&document);
        let config = SidecarConfig::parse(&document, format, CONFIG_INLINE_ENV)?;
        (config, ConfigSource::EnvInline)
    } else if let Some(path) = discover(Path::new(".")) {
        (SidecarConfig::from_file(&path)?, ConfigSource::Discovered(path))
    } else {
        (SidecarConfig::default(), ConfigSource::Defaults)
    };

    let warnings = apply_guard_rails(&config)?;
    Ok(ConfigLoad {
        config,
        source,
        warnings,
    })
}

/// First discovery path that exists under `root`.
pub fn discover(root: &Path) -> Option<PathBuf> {
    DISCOVERY_PATHS
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.is_file())
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl SidecarConfig {
    /// Read a file, choosing the format from its extension and falling back
    /// to the content for anything else.
    pub fn from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let format = ConfigFormat::from_path(path).unwrap_or_else(|| ConfigFormat::sniff(&contents));
        Self::parse(&contents, format, &path.display().to_string())
    }

    /// Parse a document section by section. Absent sections take their
    /// defaults; unknown sections are rejected.
    pub fn parse(contents: &str, format: ConfigFormat, origin: &str) -> Result<Self, ConfigLoadError> {
        let syntax = |message: String| ConfigLoadError::Syntax {
            origin: origin.to_owned(),
            format,
            message,
        };

        let document: Value = match format {
            ConfigFormat::Toml => toml::from_str(contents).map_err(|err| syntax(err.to_string()))?,
            ConfigFormat::Json => {
                serde_json::from_str(contents).map_err(|err| syntax(err.to_string()))?
            }
        };
        let Value::Object(mut sections) = document else {
            return Err(syntax("the document must be a table of sections".into()));
        };

        let config = Self {
            restore_job: section(&mut sections, "restore_job", origin)?,
            storage_client: section(&mut sections, "storage_client", origin)?,
            logging: section(&mut sections, "logging", origin)?,
        };

        if let Some(section) = sections.keys().next() {
            return Err(ConfigLoadError::UnknownSection {
                origin: origin.to_owned(),
                section: section.clone(),
            });
        }
        Ok(config)
    }
}

fn section<T>(sections: &mut Map<String, Value>, name: &'static str, origin: &str) -> Result<T, ConfigLoadError>
where
    T: DeserializeOwned + Default,
{
    match sections.remove(name) {
        None => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|err| ConfigLoadError::Section {
            origin: origin.to_owned(),
            section: name,
            message: err.to_string(),
        }),
    }
}
