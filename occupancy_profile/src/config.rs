use crate::error::ConfigError;
use crate::profiler::ProbeLinePolicy;
use cache_utils::address::CacheGeometry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum GeometryPreset {
    L1d,
    L2,
}

impl GeometryPreset {
    pub fn geometry(&self) -> CacheGeometry {
        match self {
            GeometryPreset::L1d => CacheGeometry::L1D,
            GeometryPreset::L2 => CacheGeometry::L2,
        }
    }
}

/**
Everything one occupancy profile needs. Read from TOML, e.g.

```toml
warmup_lines = 8
iterations = 1
policy = "all"
target_sets = [0, 256, 511]
output = "results/occupancy/8_warmup.csv"

[geometry]
line_size = 64
sets = 512
associativity = 8
```
*/
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub geometry: CacheGeometry,
    /// Occupation lines per set, the associativity when absent.
    pub cache_lines: Option<usize>,
    pub warmup_lines: usize,
    pub iterations: usize,
    pub policy: ProbeLinePolicy,
    /// Profile these target sets one file each instead of the full sweep.
    pub target_sets: Vec<usize>,
    pub output: PathBuf,
    pub core: Option<usize>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        ProfileConfig {
            geometry: CacheGeometry::L2,
            cache_lines: None,
            warmup_lines: 0,
            iterations: 1,
            policy: ProbeLinePolicy::All,
            target_sets: Vec::new(),
            output: PathBuf::from("results/occupancy/occupancy.csv"),
            core: None,
        }
    }
}

impl ProfileConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    pub fn cache_lines(&self) -> usize {
        self.cache_lines.unwrap_or(self.geometry.associativity)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry.validate()?;
        if self.cache_lines() == 0 {
            return Err(ConfigError::Zero("cache_lines"));
        }
        if let Some(&target) = self.target_sets.iter().find(|&&s| s >= self.geometry.sets) {
            return Err(ConfigError::TargetSetOutOfRange {
                target,
                sets: self.geometry.sets,
            });
        }
        Ok(())
    }

    /// `results/x.csv` becomes `results/x_S<set>.csv`.
    pub fn target_output(&self, target_set: usize) -> PathBuf {
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("occupancy"));
        let extension = self
            .output
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("csv"));
        self.output
            .with_file_name(format!("{}_S{}.{}", stem, target_set, extension))
    }
}
