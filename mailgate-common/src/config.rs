//! Configuration plumbing shared by every mailgate crate.
//!
//! Each crate owns the section of the configuration it consumes and
//! implements [`Section`] for it. A section starts from its serde defaults,
//! may be replaced by the matching block of the RON configuration file, and
//! is finally overlaid with environment variables read through an
//! [`Environment`]. The composition root collects [`Section::missing`] from
//! all sections so a single startup error names every absent setting.

use std::{
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::de::DeserializeOwned;

use crate::error::{ConfigError, ConfigResult};

/// Variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "MAILGATE_CONFIG";

/// Files consulted, in order, when [`CONFIG_PATH_VAR`] is unset.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = [
    "./mailgate.config.ron",
    "/etc/mailgate/mailgate.config.ron",
];

type Lookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// A source of environment-style settings.
#[derive(Clone)]
pub struct Environment {
    lookup: Arc<Lookup>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}

impl Environment {
    /// Read from the process environment
    #[must_use]
    pub fn system() -> Self {
        Self {
            lookup: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Read from a fixed set of pairs, for tests and embedding.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let values: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self {
            lookup: Arc::new(move |name| values.get(name).cloned()),
        }
    }

    /// The non-empty value of `name`, if set
    pub fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }

    /// Parse `name` when set.
    ///
    /// # Errors
    /// If the value is present but does not parse as `T`.
    pub fn parse<T>(&self, name: &'static str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(name)
            .map(|value| {
                value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
                    name,
                    reason: format!("{value:?}: {err}"),
                })
            })
            .transpose()
    }

    /// Interpret `name` as a boolean flag when set.
    ///
    /// # Errors
    /// If the value is not one of `true/false/1/0/yes/no/on/off`.
    pub fn flag(&self, name: &'static str) -> ConfigResult<Option<bool>> {
        self.string(name)
            .map(|value| match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    name,
                    reason: format!("{value:?} is not a boolean"),
                }),
            })
            .transpose()
    }

    /// Overwrite `target` with `name` when set
    pub fn set_string(&self, name: &str, target: &mut String) {
        if let Some(value) = self.string(name) {
            *target = value;
        }
    }

    /// Overwrite `target` with the parsed value of `name` when set.
    ///
    /// # Errors
    /// If the value is present but does not parse as `T`.
    pub fn set<T>(&self, name: &'static str, target: &mut T) -> ConfigResult<()>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.parse(name)? {
            *target = value;
        }

        Ok(())
    }

    /// Overwrite `target` with the flag `name` when set.
    ///
    /// # Errors
    /// If the value is present but not a boolean.
    pub fn set_flag(&self, name: &'static str, target: &mut bool) -> ConfigResult<()> {
        if let Some(value) = self.flag(name)? {
            *target = value;
        }

        Ok(())
    }
}

/// One crate's block of configuration.
pub trait Section {
    /// Apply environment overrides on top of the current values.
    ///
    /// # Errors
    /// If a variable is set to a value that cannot be interpreted.
    fn overlay(&mut self, env: &Environment) -> ConfigResult<()>;

    /// Names of required settings that are still unset.
    fn missing(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

/// Find the configuration file.
///
/// `MAILGATE_CONFIG` must point at an existing file when set. Otherwise the
/// first of [`DEFAULT_CONFIG_PATHS`] that exists is used, and `None` means
/// the gateway runs from defaults and environment alone.
///
/// # Errors
/// If `MAILGATE_CONFIG` names a file that does not exist.
pub fn locate(env: &Environment) -> ConfigResult<Option<PathBuf>> {
    if let Some(path) = env.string(CONFIG_PATH_VAR) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(Some(path));
        }

        return Err(ConfigError::Invalid {
            name: CONFIG_PATH_VAR,
            reason: format!("{} does not exist", path.display()),
        });
    }

    Ok(DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists()))
}

/// Read and deserialize a RON configuration file.
///
/// # Errors
/// If the file cannot be read or is not valid RON for `T`.
pub fn read_file<T: DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    ron::from_str(&content).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}
