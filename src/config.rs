use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::ops::Deref;
use std::{env, fs, path::Path};
use tracing::{info, warn};

pub static DEFAULT_BASE_TAG: &str = "latest";
const DEFAULT_KEEP_VERSIONS: usize = 3;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub images: Vec<ImageTarget>,
}

/// One tracked image, as configured. Read-only during a check cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageTarget {
    pub image: String,
    pub regex: Pattern,
    #[serde(default = "default_base_tag")]
    pub base_tag: String,
    #[serde(default)]
    pub auto_update: bool,
    /// Overrides the registry host parsed from `image`.
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub cleanup_old_images: bool,
    #[serde(default = "default_keep_versions")]
    pub keep_versions: usize,
}

fn default_base_tag() -> String {
    DEFAULT_BASE_TAG.to_string()
}

fn default_keep_versions() -> usize {
    DEFAULT_KEEP_VERSIONS
}

/// A tag-matching regex, compiled once at config load.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Regex::new(pattern).map(Pattern)
    }
}

impl Deref for Pattern {
    type Target = Regex;

    fn deref(&self) -> &Regex {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Pattern::new(&raw).map_err(serde::de::Error::custom)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&raw)?;

    let config: Config = serde_json::from_str(&expanded)
        .context("Failed to parse JSON config after environment variable expansion")?;

    if config.images.is_empty() {
        bail!("Config contains no images to track");
    }

    for target in &config.images {
        if target.keep_versions == 0 {
            bail!(
                "keep_versions for image {} must be at least 1",
                target.image
            );
        }
        let pattern = target.regex.as_str();
        if !pattern.starts_with('^') || !pattern.ends_with('$') {
            warn!(
                "Regex '{}' for image {} is not anchored with ^...$ and may match partial tags",
                pattern, target.image
            );
        }
    }

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variable values.
/// Returns an error if any referenced variable is missing.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut result = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        let var_name = &caps[1];
        let value = env::var(var_name)
            .with_context(|| format!("Missing environment variable: {}", var_name))?;
        result.push_str(&input[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }
    result.push_str(&input[last..]);

    Ok(result)
}
