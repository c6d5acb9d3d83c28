use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::target::FuzzTarget;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStream {
    Stdout,
    #[default]
    Stderr,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    pub command: Vec<String>,
    #[serde(default = "default_max_total_time_secs")]
    pub max_total_time_secs: u64,
    #[serde(default = "default_rss_limit_mb")]
    pub rss_limit_mb: u64,
    #[serde(default)]
    pub extra_flags: Vec<String>,
    #[serde(default)]
    pub progress_stream: ProgressStream,
    #[serde(default)]
    pub debug_attach: Option<String>,
}

pub fn default_max_total_time_secs() -> u64 {
    60
}

pub fn default_rss_limit_mb() -> u64 {
    2048
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            max_total_time_secs: default_max_total_time_secs(),
            rss_limit_mb: default_rss_limit_mb(),
            extra_flags: Vec::new(),
            progress_stream: ProgressStream::default(),
            debug_attach: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

pub fn default_store_root() -> PathBuf {
    PathBuf::from("./kfuzz-out")
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

/// Per-target section. Anything set here wins over the engine-wide values.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub name: String,
    #[serde(default)]
    pub max_total_time_secs: Option<u64>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReproducerSettings {
    #[serde(default = "default_input_type")]
    pub input_type: String,
}

fn default_input_type() -> String {
    "ByteInput".to_string()
}

impl Default for ReproducerSettings {
    fn default() -> Self {
        Self {
            input_type: default_input_type(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct KfuzzConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub targets: Vec<TargetSettings>,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub reproducer: ReproducerSettings,
}

/// Fully resolved settings for one target run: global values with the
/// target's overrides applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub max_total_time_secs: u64,
    pub rss_limit_mb: u64,
    pub properties: BTreeMap<String, String>,
}

impl KfuzzConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: KfuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn target_settings(&self, target: &FuzzTarget) -> Option<&TargetSettings> {
        self.targets.iter().find(|t| t.name == target.name())
    }

    pub fn fuzz_targets(&self) -> Vec<FuzzTarget> {
        self.targets
            .iter()
            .map(|t| FuzzTarget::new(t.name.clone()))
            .collect()
    }

    /// Computes the property set and limits for `target`. Targets that have no
    /// `[[targets]]` section simply inherit the global values.
    pub fn run_settings(&self, target: &FuzzTarget) -> RunSettings {
        let mut properties = self.properties.clone();
        let mut max_total_time_secs = self.engine.max_total_time_secs;
        if let Some(overrides) = self.target_settings(target) {
            properties.extend(
                overrides
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            if let Some(secs) = overrides.max_total_time_secs {
                max_total_time_secs = secs;
            }
        }
        RunSettings {
            max_total_time_secs,
            rss_limit_mb: self.engine.rss_limit_mb,
            properties,
        }
    }
}
