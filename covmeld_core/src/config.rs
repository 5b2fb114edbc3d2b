use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors are raised before any replay or merge work begins.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required external tool could not be found, neither via an explicit
    /// override nor on the search path.
    #[error("Cannot find `{0}`. Check PATH or set an explicit tool path")]
    ToolNotFound(String),

    /// A memory limit string did not match the `<n>[TGkM]` format.
    #[error("`{0}` is not a valid memory limit")]
    InvalidMemLimit(String),
}

/// A process memory limit in AFL's `<n>[TGkM]` notation, normalized to
/// megabytes.
///
/// `T` multiplies by 1024^2, `G` by 1024, `M` (or no suffix) is taken as-is
/// and `k` divides by 1024. A `k` value that is not a multiple of 1024
/// therefore yields a fractional megabyte count, which is passed onward
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemLimit(pub f64);

impl FromStr for MemLimit {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits_end = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, suffix) = value.split_at(digits_end);

        let base: f64 = digits
            .parse()
            .map_err(|_| ConfigError::InvalidMemLimit(value.to_string()))?;

        let megabytes = match suffix {
            "" | "M" => base,
            "T" => base * 1024.0 * 1024.0,
            "G" => base * 1024.0,
            "k" => base / 1024.0,
            _ => return Err(ConfigError::InvalidMemLimit(value.to_string())),
        };

        Ok(MemLimit(megabytes))
    }
}

impl fmt::Display for MemLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.fract() == 0.0 {
            write!(f, "{}", self.0 as u64)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl<'de> Deserialize<'de> for MemLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Names (or explicit paths) of the external binaries the pipelines invoke.
///
/// A bare name is resolved against `PATH` at startup; an absolute or relative
/// path is taken as an explicit override and only checked for existence.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    /// Seed-replay trace generator (afl-showmap compatible).
    #[serde(default = "default_replay_tool")]
    pub replay_tool: String,
    /// Raw profile merger (llvm-profdata compatible).
    #[serde(default = "default_merge_tool")]
    pub merge_tool: String,
    /// Merged profile exporter (llvm-cov compatible).
    #[serde(default = "default_export_tool")]
    pub export_tool: String,
}

fn default_replay_tool() -> String {
    "afl-showmap".to_string()
}
fn default_merge_tool() -> String {
    "llvm-profdata".to_string()
}
fn default_export_tool() -> String {
    "llvm-cov".to_string()
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            replay_tool: default_replay_tool(),
            merge_tool: default_merge_tool(),
            export_tool: default_export_tool(),
        }
    }
}

impl ToolConfig {
    /// Resolves all tool names to concrete paths.
    ///
    /// An unresolvable tool is a startup-time fatal error: no replay or merge
    /// work may begin without it.
    pub fn resolve(&self) -> Result<ResolvedTools, ConfigError> {
        Ok(ResolvedTools {
            replay_tool: resolve_tool(&self.replay_tool)?,
            merge_tool: resolve_tool(&self.merge_tool)?,
            export_tool: resolve_tool(&self.export_tool)?,
        })
    }
}

/// Tool paths after startup resolution.
#[derive(Debug, Clone)]
pub struct ResolvedTools {
    pub replay_tool: PathBuf,
    pub merge_tool: PathBuf,
    pub export_tool: PathBuf,
}

/// Resolves a single tool name against `PATH`, or verifies an explicit path.
pub fn resolve_tool(name: &str) -> Result<PathBuf, ConfigError> {
    let as_path = Path::new(name);
    if as_path.components().count() > 1 {
        // Explicit path override.
        if as_path.is_file() {
            return Ok(as_path.to_path_buf());
        }
        return Err(ConfigError::ToolNotFound(name.to_string()));
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&search_path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(ConfigError::ToolNotFound(name.to_string()))
}

/// Settings for the per-seed replay executor.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReplaySettings {
    /// Per-seed time budget handed to the trace generator, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional memory limit handed to the trace generator.
    #[serde(default)]
    pub mem_limit: Option<MemLimit>,
    /// Sink target program output.
    #[serde(default)]
    pub quiet: bool,
    /// Parallel replay workers.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

fn default_timeout_ms() -> u64 {
    2000
}
fn default_jobs() -> usize {
    1
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            mem_limit: None,
            quiet: false,
            jobs: default_jobs(),
        }
    }
}

/// Settings for the profile merge pipeline.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    /// Parallel profile-generation workers; also forwarded to the merge tool.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Per-seed timeout for the instrumented target, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Environment variable the instrumented target reads the raw profile
    /// path from.
    #[serde(default = "default_profile_env")]
    pub profile_env: String,
}

fn default_profile_env() -> String {
    "LLVM_PROFILE_FILE".to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            timeout_secs: None,
            profile_env: default_profile_env(),
        }
    }
}

/// Settings for the trial series merger.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SeriesSettings {
    /// Intended trial duration; the merged table is extended to this boundary.
    #[serde(default = "default_trial_len_hours")]
    pub trial_len_hours: f64,
}

fn default_trial_len_hours() -> f64 {
    10.0
}

impl Default for SeriesSettings {
    fn default() -> Self {
        Self {
            trial_len_hours: default_trial_len_hours(),
        }
    }
}

/// Settings for the statistical aggregator.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StatsSettings {
    /// Coverage percentile (as a fraction 0 < p <= 1) the AUC is restricted to.
    #[serde(default = "default_percentile")]
    pub percentile: f64,
    /// Bootstrap resample count.
    #[serde(default = "default_resamples")]
    pub resamples: usize,
    /// Two-sided significance level of the bootstrap interval.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// RNG seed for the bootstrap; fixed seeds give reproducible estimates.
    #[serde(default = "default_rng_seed")]
    pub rng_seed: u64,
}

fn default_percentile() -> f64 {
    1.0
}
fn default_resamples() -> usize {
    10_000
}
fn default_alpha() -> f64 {
    0.05
}
fn default_rng_seed() -> u64 {
    0
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            percentile: default_percentile(),
            resamples: default_resamples(),
            alpha: default_alpha(),
            rng_seed: default_rng_seed(),
        }
    }
}

/// Top-level configuration, loaded from TOML.
///
/// Every component receives its slice of this structure at construction;
/// there is no process-global configuration state.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CovmeldConfig {
    #[serde(default)]
    pub tools: ToolConfig,
    #[serde(default)]
    pub replay: ReplaySettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub series: SeriesSettings,
    #[serde(default)]
    pub stats: StatsSettings,
}

impl CovmeldConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CovmeldConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
