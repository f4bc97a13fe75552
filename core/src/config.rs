//! Filter configuration.
//!
//! A [FilterConfig] can be built in code (usually from [FilterConfig::default] with struct update syntax) or read
//! from a JSON, YAML or TOML file. Missing fields in a file take their default value, so a file only needs to list
//! what it changes:
//!
//! ```toml
//! num_particles = 100
//! resample_threshold = 0.4
//! pruning = "shallow"
//! ```
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};
use crate::particle::ResamplingStrategy;
use crate::tree::PruningPolicy;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of particles created at initialization.
    pub num_particles: usize,
    /// Particle count produced by resampling. `None` keeps the current count.
    pub target_particles: Option<usize>,
    /// A scan-match correction is adopted only when its score is strictly greater than this value.
    pub minimum_score: f64,
    /// Divisor of the observation gain, `gain = 1 / (obs_sigma_gain * n)`. Larger values flatten the weights.
    pub obs_sigma_gain: f64,
    /// Resample when the effective sample size drops below this fraction of the particle count.
    pub resample_threshold: f64,
    pub resampling_strategy: ResamplingStrategy,
    pub pruning: PruningPolicy,
    /// Run per-particle work on the rayon thread pool.
    pub parallel: bool,
    /// Seed of the resampling random number generator.
    pub seed: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: 30,
            target_particles: None,
            minimum_score: 0.0,
            obs_sigma_gain: 3.0,
            resample_threshold: 0.5,
            resampling_strategy: ResamplingStrategy::default(),
            pruning: PruningPolicy::default(),
            parallel: true,
            seed: 42,
        }
    }
}

impl FilterConfig {
    /// Check the configuration for values the filter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(SlamError::Config("num_particles must be positive".into()));
        }
        if self.target_particles == Some(0) {
            return Err(SlamError::Config("target_particles must be positive".into()));
        }
        if !(self.obs_sigma_gain.is_finite() && self.obs_sigma_gain > 0.0) {
            return Err(SlamError::Config(format!(
                "obs_sigma_gain must be positive and finite, got {}",
                self.obs_sigma_gain
            )));
        }
        if !(0.0..=1.0).contains(&self.resample_threshold) {
            return Err(SlamError::Config(format!(
                "resample_threshold must lie in [0, 1], got {}",
                self.resample_threshold
            )));
        }
        if self.minimum_score.is_nan() {
            return Err(SlamError::Config("minimum_score is NaN".into()));
        }
        Ok(())
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_json(self, path.as_ref())
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_json(path.as_ref())
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_yaml(self, path.as_ref())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_yaml(path.as_ref())
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_toml(self, path.as_ref())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_toml(path.as_ref())
    }
    /// Write the configuration, choosing the format by file extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_config_file(self, path)
    }
    /// Read a configuration, choosing the format by file extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_config_file(path)
    }
}

/// Serialize any configuration type to a file, choosing the format by extension (.json/.yaml/.yml/.toml).
pub fn write_config_file<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> io::Result<()> {
    let p = path.as_ref();
    match extension(p).as_deref() {
        Some("json") => write_json(value, p),
        Some("yaml") | Some("yml") => write_yaml(value, p),
        Some("toml") => write_toml(value, p),
        _ => Err(unsupported(p)),
    }
}

/// Deserialize any configuration type from a file, choosing the format by extension (.json/.yaml/.yml/.toml).
pub fn read_config_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> io::Result<T> {
    let p = path.as_ref();
    match extension(p).as_deref() {
        Some("json") => read_json(p),
        Some("yaml") | Some("yml") => read_yaml(p),
        Some("toml") => read_toml(p),
        _ => Err(unsupported(p)),
    }
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value).map_err(io::Error::other)
}
fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let file = File::open(path)?;
    serde_json::from_reader(file).map_err(io::Error::other)
}
fn write_yaml<T: Serialize>(value: &T, path: &Path) -> io::Result<()> {
    let mut file = File::create(path)?;
    let s = serde_yaml::to_string(value).map_err(io::Error::other)?;
    file.write_all(s.as_bytes())
}
fn read_yaml<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let file = File::open(path)?;
    serde_yaml::from_reader(file).map_err(io::Error::other)
}
fn write_toml<T: Serialize>(value: &T, path: &Path) -> io::Result<()> {
    let mut file = File::create(path)?;
    let s = toml::to_string(value).map_err(io::Error::other)?;
    file.write_all(s.as_bytes())
}
fn read_toml<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let mut s = String::new();
    File::open(path)?.read_to_string(&mut s)?;
    toml::from_str(&s).map_err(io::Error::other)
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported configuration file extension: {}", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        assert!(FilterConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad = [
            FilterConfig {
                num_particles: 0,
                ..FilterConfig::default()
            },
            FilterConfig {
                target_particles: Some(0),
                ..FilterConfig::default()
            },
            FilterConfig {
                obs_sigma_gain: 0.0,
                ..FilterConfig::default()
            },
            FilterConfig {
                resample_threshold: 1.5,
                ..FilterConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(SlamError::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn file_round_trip_by_extension() {
        let dir = tempdir().unwrap();
        let config = FilterConfig {
            num_particles: 64,
            target_particles: Some(48),
            resampling_strategy: ResamplingStrategy::Residual,
            pruning: PruningPolicy::Shallow,
            parallel: false,
            ..FilterConfig::default()
        };
        for name in ["filter.json", "filter.yaml", "filter.toml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            assert_eq!(FilterConfig::from_file(&path).unwrap(), config, "{name}");
        }
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "num_particles = 12\npruning = \"shallow\"\n").unwrap();
        let config = FilterConfig::from_file(&path).unwrap();
        assert_eq!(config.num_particles, 12);
        assert_eq!(config.pruning, PruningPolicy::Shallow);
        assert_eq!(config.resample_threshold, 0.5);
        assert_eq!(config.resampling_strategy, ResamplingStrategy::Systematic);
    }

    #[test]
    fn unknown_extension_is_an_error() {
        let dir = tempdir().unwrap();
        let err = FilterConfig::default()
            .to_file(dir.path().join("filter.ini"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
