//! Configuration, launch profiles and environment snapshots.
//!
//! The configuration file is located at `~/.tterm/config.toml`:
//!
//! ```toml
//! columns = 120
//! rows = 32
//! allow_transparency = false
//!
//! [profile]
//! command = "pwsh.exe"
//! args = ["-NoLogo"]
//! cwd = "%USERPROFILE%\\src"
//!
//! [profile.env]
//! EDITOR = "code --wait"
//! ```
//!
//! Strings in a profile may reference environment variables as `%NAME%`;
//! they are resolved against an [`Environment`] snapshot when a session is
//! spawned.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::pty::LaunchCommand;
use crate::core::term::TerminalSize;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config path")]
    NoHome,

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config: {0}")]
    Io(#[from] io::Error),
}

/// Persisted settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub columns: u16,
    pub rows: u16,
    pub allow_transparency: bool,
    /// Launch profile; the platform default is used when absent
    pub profile: Option<Profile>,
}

impl Default for Config {
    fn default() -> Self {
        let size = TerminalSize::default();
        Self {
            columns: size.columns(),
            rows: size.rows(),
            allow_transparency: false,
            profile: None,
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to read {}: {}", path.display(), e);
                }
                return Self::default();
            }
        };

        match toml::from_str::<Config>(&content) {
            Ok(mut config) => {
                config.columns = config.columns.max(1);
                config.rows = config.rows.max(1);
                config
            }
            Err(e) => {
                tracing::warn!("Invalid config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Load configuration from the user's home directory
    pub fn load(env: &Environment) -> Self {
        match Self::config_path(env) {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn save(&self, env: &Environment) -> Result<(), ConfigError> {
        let path = Self::config_path(env).ok_or(ConfigError::NoHome)?;
        self.save_to(&path)
    }

    /// `~/.tterm/config.toml`
    pub fn config_path(env: &Environment) -> Option<PathBuf> {
        data_dir(env).map(|dir| dir.join("config.toml"))
    }

    pub fn size(&self) -> TerminalSize {
        TerminalSize::new(self.columns, self.rows)
    }

    pub fn set_size(&mut self, size: TerminalSize) {
        self.columns = size.columns();
        self.rows = size.rows();
    }
}

/// `~/.tterm`, holding the config file and the log
pub fn data_dir(env: &Environment) -> Option<PathBuf> {
    env.home_dir().map(|home| home.join(".tterm"))
}

/// What to run in a new session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub command: String,
    #[serde(rename = "args", skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(rename = "cwd", skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Extra variables, merged over the inherited environment
    #[serde(rename = "env", skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

impl Profile {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// The user's shell, started in their home directory
    pub fn default_for(env: &Environment) -> Self {
        let command = if env.contains("COMSPEC") {
            "%COMSPEC%".to_string()
        } else if env.contains("SHELL") {
            "%SHELL%".to_string()
        } else if cfg!(windows) {
            "cmd.exe".to_string()
        } else {
            "/bin/sh".to_string()
        };

        let working_directory = if env.contains("HOMEDRIVE") && env.contains("HOMEPATH") {
            Some("%HOMEDRIVE%%HOMEPATH%".to_string())
        } else if env.contains("HOME") {
            Some("%HOME%".to_string())
        } else if env.contains("USERPROFILE") {
            Some("%USERPROFILE%".to_string())
        } else {
            None
        };

        Self {
            command,
            working_directory,
            ..Self::default()
        }
    }

    /// Resolve every `%NAME%` reference and build the child's environment
    pub fn expand(&self, env: &Environment) -> LaunchCommand {
        let mut environment = env.clone();
        for (name, value) in &self.environment {
            environment.set(env.expand(name), env.expand(value));
        }

        LaunchCommand {
            program: environment.expand(&self.command),
            arguments: self
                .arguments
                .iter()
                .map(|arg| environment.expand(arg))
                .collect(),
            working_directory: self
                .working_directory
                .as_deref()
                .map(|cwd| PathBuf::from(environment.expand(cwd)))
                .filter(|cwd| !cwd.as_os_str().is_empty()),
            environment,
        }
    }
}

/// Case-insensitive snapshot of environment variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    /// Upper-cased name -> (name as first seen, value)
    vars: BTreeMap<String, (String, String)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current process environment
    pub fn from_os() -> Self {
        std::env::vars_os()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.to_string_lossy().into_owned(),
                )
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(&name.to_uppercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(&name.to_uppercase())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_uppercase();
        let value = value.into();
        match self.vars.get_mut(&key) {
            Some(entry) => entry.1 = value,
            None => {
                self.vars.insert(key, (name, value));
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.vars
            .remove(&name.to_uppercase())
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Replace each `%NAME%` with its value. Unknown names expand to
    /// nothing; a `%` without a closing partner is kept as is.
    pub fn expand(&self, s: &str) -> String {
        let mut result = String::with_capacity(s.len());
        let mut rest = s;

        while let Some(start) = rest.find('%') {
            let after = &rest[start + 1..];
            let Some(len) = after.find('%') else {
                break;
            };
            result.push_str(&rest[..start]);
            result.push_str(self.get(&after[..len]).unwrap_or_default());
            rest = &after[len + 1..];
        }
        result.push_str(rest);
        result
    }

    pub fn home_dir(&self) -> Option<PathBuf> {
        self.get("USERPROFILE")
            .or_else(|| self.get("HOME"))
            .filter(|home| !home.is_empty())
            .map(PathBuf::from)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Self::new();
        for (name, value) in iter {
            env.set(name, value);
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_expand() {
        let env = env(&[("HOME", "/home/ada"), ("Shell", "/bin/zsh")]);
        assert_eq!(env.expand("%HOME%/src"), "/home/ada/src");
        assert_eq!(env.expand("%shell% -l"), "/bin/zsh -l");
        assert_eq!(env.expand("a%MISSING%b"), "ab");
        assert_eq!(env.expand("50% off"), "50% off");
        assert_eq!(env.expand("%HOME%%HOME%"), "/home/ada/home/ada");
        assert_eq!(env.expand("%%"), "");
        assert_eq!(env.expand("plain"), "plain");
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let mut env = env(&[("Path", "a")]);
        assert_eq!(env.get("PATH"), Some("a"));
        env.set("PATH", "b");
        assert_eq!(env.len(), 1);
        assert_eq!(env.iter().collect::<Vec<_>>(), vec![("Path", "b")]);
        assert_eq!(env.remove("path"), Some("b".to_string()));
        assert!(env.is_empty());
    }

    #[test]
    fn test_default_profile_windows_style() {
        let env = env(&[
            ("COMSPEC", "C:\\Windows\\system32\\cmd.exe"),
            ("HOMEDRIVE", "C:"),
            ("HOMEPATH", "\\Users\\ada"),
            ("USERPROFILE", "C:\\Users\\ada"),
        ]);
        let profile = Profile::default_for(&env);
        assert_eq!(profile.command, "%COMSPEC%");
        assert_eq!(profile.working_directory.as_deref(), Some("%HOMEDRIVE%%HOMEPATH%"));

        let launch = profile.expand(&env);
        assert_eq!(launch.program, "C:\\Windows\\system32\\cmd.exe");
        assert_eq!(launch.working_directory, Some(PathBuf::from("C:\\Users\\ada")));
    }

    #[test]
    fn test_default_profile_unix_style() {
        let env = env(&[("SHELL", "/bin/bash"), ("HOME", "/home/ada")]);
        let profile = Profile::default_for(&env);
        assert_eq!(profile.command, "%SHELL%");
        assert_eq!(profile.working_directory.as_deref(), Some("%HOME%"));

        let bare = Profile::default_for(&Environment::new());
        assert!(!bare.command.is_empty());
        assert_eq!(bare.working_directory, None);
    }

    #[test]
    fn test_profile_expand_merges_environment() {
        let env = env(&[("HOME", "/home/ada"), ("LANG", "C")]);
        let mut profile = Profile::new("%TOOLS%/shell");
        profile.arguments = vec!["--rc".to_string(), "%HOME%/.rc".to_string()];
        profile.environment.insert("TOOLS".to_string(), "%HOME%/bin".to_string());
        profile.environment.insert("lang".to_string(), "en_US.UTF-8".to_string());

        let launch = profile.expand(&env);
        assert_eq!(launch.program, "/home/ada/bin/shell");
        assert_eq!(launch.arguments, vec!["--rc", "/home/ada/.rc"]);
        assert_eq!(launch.environment.get("LANG"), Some("en_US.UTF-8"));
        assert_eq!(launch.working_directory, None);
        // The snapshot itself is untouched
        assert_eq!(env.get("TOOLS"), None);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".tterm").join("config.toml");

        let mut config = Config::default();
        config.set_size(TerminalSize::new(132, 43));
        config.profile = Some(Profile::new("pwsh.exe"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded, config);
        assert_eq!(loaded.size(), TerminalSize::new(132, 43));
    }

    #[test]
    fn test_config_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_eq!(Config::load_from(&missing), Config::default());

        let invalid = dir.path().join("invalid.toml");
        fs::write(&invalid, "columns = \"wide\"").unwrap();
        assert_eq!(Config::load_from(&invalid), Config::default());

        let zero = dir.path().join("zero.toml");
        fs::write(&zero, "columns = 0\nrows = 0\n").unwrap();
        assert_eq!(Config::load_from(&zero).size(), TerminalSize::new(1, 1));
    }

    #[test]
    fn test_config_path_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().to_string_lossy().into_owned();
        let env = env(&[("HOME", home.as_str())]);

        let config = Config {
            allow_transparency: true,
            ..Config::default()
        };
        config.save(&env).unwrap();

        let path = Config::config_path(&env).unwrap();
        assert!(path.ends_with(".tterm/config.toml"));
        assert!(Config::load(&env).allow_transparency);
        assert!(matches!(
            Config::default().save(&Environment::new()),
            Err(ConfigError::NoHome)
        ));
    }
}
