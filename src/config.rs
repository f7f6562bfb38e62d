//! `ggen.toml` configuration
//!
//! The configuration declares global canonicalization defaults, regeneration
//! policy, resource limits and the list of targets. It is parsed with serde
//! and validated as a whole: every problem is collected into a single
//! [`ConfigError::Invalid`] so one run reports the complete list.
//!
//! ```toml
//! [canonicalize]
//! line_endings = "lf"
//!
//! [regeneration]
//! mode = "partial"
//! full_triggers = { config_change = true, shape_change = true, template_change = false }
//!
//! [[targets]]
//! name = "commands"
//! source = "ontology/cli.ttl"
//! shapes = ["ontology/cli-shapes.ttl"]
//! query = "queries/commands.rq"
//! template = "templates/command.rs.tera"
//! output = "src/commands/{name|snake_case}.rs"
//! group = { key = "command", children = "arguments", fields = ["arg", "argType"] }
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::codegen::canonicalize::{CanonicalOverride, CanonicalRules};
use crate::codegen::hash;
use crate::error::ConfigError;
use crate::sparql::result_mapper::GroupSpec;
use crate::sync::output::OutputPattern;
use crate::template::filters::FilterRegistry;

pub const CONFIG_FILE_NAME: &str = "ggen.toml";

// =============================================================================
// DURATIONS
// =============================================================================

/// A positive duration written as `"30s"`, `"5m"`, `"1h"`, `"250ms"` or a bare
/// integer number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DurationSpec(pub Duration);

impl DurationSpec {
    pub fn from_secs(secs: u64) -> Self {
        DurationSpec(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (number, unit) = text.split_at(split);
        let value: u64 = number
            .parse()
            .map_err(|_| format!("invalid duration `{text}`"))?;
        let duration = match unit.trim() {
            "" | "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            other => return Err(format!("unknown duration unit `{other}` in `{text}`")),
        };
        if duration.is_zero() {
            return Err(format!("duration `{text}` must be positive"));
        }
        Ok(DurationSpec(duration))
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis % 1000 == 0 {
            write!(f, "{}s", millis / 1000)
        } else {
            write!(f, "{millis}ms")
        }
    }
}

impl Serialize for DurationSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DurationSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) if secs > 0 => Ok(DurationSpec::from_secs(secs as u64)),
            Raw::Seconds(secs) => Err(serde::de::Error::custom(format!(
                "duration {secs} must be positive"
            ))),
            Raw::Text(text) => DurationSpec::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalizeConfig {
    #[serde(flatten)]
    pub defaults: CanonicalRules,
    /// Applied in declaration order; later matches win.
    #[serde(default)]
    pub overrides: Vec<CanonicalOverride>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RegenerationMode {
    #[default]
    Partial,
    Full,
}

/// Which changed inputs force every target to rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTriggers {
    #[serde(default = "default_true")]
    pub config_change: bool,
    #[serde(default = "default_true")]
    pub shape_change: bool,
    #[serde(default)]
    pub template_change: bool,
}

impl Default for FullTriggers {
    fn default() -> Self {
        Self {
            config_change: true,
            shape_change: true,
            template_change: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegenerationConfig {
    #[serde(default)]
    pub mode: RegenerationMode,
    #[serde(default)]
    pub full_triggers: FullTriggers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_query_timeout")]
    pub query_timeout: DurationSpec,
    #[serde(default = "default_formatter_timeout")]
    pub formatter_timeout: DurationSpec,
    #[serde(default = "default_run_deadline")]
    pub run_deadline: DurationSpec,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: DurationSpec,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            query_timeout: default_query_timeout(),
            formatter_timeout: default_formatter_timeout(),
            run_deadline: default_run_deadline(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EmitMode {
    #[default]
    Strict,
    Lenient,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmitConfig {
    #[serde(default)]
    pub mode: EmitMode,
    /// Subset of the filter registry made available to templates. All
    /// registered filters when absent.
    #[serde(default)]
    pub filters: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_receipts_dir")]
    pub receipts_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            receipts_dir: default_receipts_dir(),
        }
    }
}

/// One configured binding of source, shapes, query, template and output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub source: PathBuf,
    #[serde(default)]
    pub shapes: Vec<PathBuf>,
    pub query: PathBuf,
    pub template: PathBuf,
    /// Output path pattern, relative to the workspace root. May contain
    /// `{field}` or `{field|filter}` placeholders filled per grouped item.
    pub output: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides `limits.query_timeout` for this target.
    #[serde(default)]
    pub timeout: Option<DurationSpec>,
    #[serde(default)]
    pub group: Option<GroupSpec>,
    #[serde(default)]
    pub emit_mode: Option<EmitMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GgenConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub canonicalize: CanonicalizeConfig,
    #[serde(default)]
    pub regeneration: RegenerationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub emit: EmitConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_query_timeout() -> DurationSpec {
    DurationSpec::from_secs(30)
}

fn default_formatter_timeout() -> DurationSpec {
    DurationSpec::from_secs(10)
}

fn default_run_deadline() -> DurationSpec {
    DurationSpec::from_secs(600)
}

fn default_lock_timeout() -> DurationSpec {
    DurationSpec::from_secs(30)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".ggen/state")
}

fn default_receipts_dir() -> PathBuf {
    PathBuf::from(".ggen/receipts")
}

impl GgenConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn enabled_targets(&self) -> impl Iterator<Item = &TargetConfig> {
        self.targets.iter().filter(|t| t.enabled)
    }

    /// Every problem that would make a run meaningless, in declaration order.
    /// File existence is checked relative to `root`.
    pub fn validate(&self, root: &Path) -> Vec<String> {
        let mut issues = Vec::new();

        if self.limits.workers == 0 {
            issues.push("limits.workers must be at least 1".to_string());
        }

        let registry = FilterRegistry::builtin();
        if let Some(names) = &self.emit.filters {
            for name in names {
                if !registry.contains(name) {
                    issues.push(format!(
                        "emit.filters: unknown filter `{name}` (known: {})",
                        registry.names().join(", ")
                    ));
                }
            }
        }
        let enabled_filters = match FilterRegistry::select(self.emit.filters.as_deref()) {
            Ok(filters) => filters,
            Err(_) => registry,
        };

        for (index, rule) in self.canonicalize.overrides.iter().enumerate() {
            if let Err(err) = globset::Glob::new(&rule.pattern) {
                issues.push(format!(
                    "canonicalize.overrides[{index}]: invalid pattern `{}`: {err}",
                    rule.pattern
                ));
            }
            if let Some(formatter) = &rule.formatter {
                if formatter.command.trim().is_empty() {
                    issues.push(format!(
                        "canonicalize.overrides[{index}]: formatter command is empty"
                    ));
                }
            }
        }

        let mut names = BTreeSet::new();
        let mut literal_outputs: BTreeMap<String, &str> = BTreeMap::new();
        for target in &self.targets {
            let label = if target.name.trim().is_empty() {
                issues.push("a target has an empty name".to_string());
                "<unnamed>"
            } else {
                target.name.as_str()
            };
            if !names.insert(target.name.clone()) {
                issues.push(format!("duplicate target name `{label}`"));
            }

            match OutputPattern::parse(&target.output) {
                Ok(pattern) => {
                    for filter in pattern.filters() {
                        if !enabled_filters.contains(filter) {
                            issues.push(format!(
                                "target `{label}`: output uses unknown or disabled filter `{filter}`"
                            ));
                        }
                    }
                    if pattern.is_templated() && target.group.is_none() {
                        issues.push(format!(
                            "target `{label}`: output placeholders require a `group` declaration"
                        ));
                    }
                    if !pattern.is_templated() && target.enabled {
                        if let Some(other) =
                            literal_outputs.insert(target.output.clone(), label)
                        {
                            issues.push(format!(
                                "targets `{other}` and `{label}` both write `{}`",
                                target.output
                            ));
                        }
                    }
                }
                Err(reason) => issues.push(format!("target `{label}`: output: {reason}")),
            }

            if let Some(group) = &target.group {
                if group.key.trim().is_empty() {
                    issues.push(format!("target `{label}`: group.key is empty"));
                }
            }

            if !target.enabled {
                continue;
            }
            let mut inputs: Vec<(&str, &Path)> = vec![
                ("source", target.source.as_path()),
                ("query", target.query.as_path()),
                ("template", target.template.as_path()),
            ];
            inputs.extend(target.shapes.iter().map(|s| ("shapes", s.as_path())));
            for (kind, path) in inputs {
                if !root.join(path).is_file() {
                    issues.push(format!(
                        "target `{label}`: {kind} file {} not found",
                        path.display()
                    ));
                }
            }
        }

        issues
    }
}

// =============================================================================
// WORKSPACE
// =============================================================================

/// A loaded, validated configuration anchored at its workspace root (the
/// directory containing the configuration file).
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    config_path: PathBuf,
    config_key: String,
    config_hash: String,
    config: GgenConfig,
}

impl Workspace {
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_path = config_path.as_ref();
        let text = fs::read_to_string(config_path).map_err(|e| ConfigError::Read {
            path: config_path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config = GgenConfig::from_toml(&text).map_err(|e| ConfigError::Parse {
            path: config_path.to_path_buf(),
            message: e.to_string(),
        })?;
        let root = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let config_key = config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| CONFIG_FILE_NAME.to_string());

        let issues = config.validate(&root);
        if !issues.is_empty() {
            return Err(ConfigError::Invalid {
                path: config_path.to_path_buf(),
                issues,
            });
        }

        tracing::debug!(
            config = %config_path.display(),
            targets = config.targets.len(),
            "configuration loaded"
        );

        Ok(Self {
            root,
            config_path: config_path.to_path_buf(),
            config_key,
            config_hash: hash::hash_str(&text),
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &GgenConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Workspace-relative key of the configuration file.
    pub fn config_key(&self) -> &str {
        &self.config_key
    }

    /// Hash of the configuration file bytes.
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Stable, forward-slashed key used in receipts and the snapshot.
    pub fn key_for(&self, relative: &Path) -> String {
        relative
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(&self.config.paths.state_dir)
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.root.join(&self.config.paths.receipts_dir)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir().join("deps.json")
    }

    pub fn target(&self, name: &str) -> Result<&TargetConfig, ConfigError> {
        self.config
            .target(name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))
    }

    pub fn query_timeout(&self, target: &TargetConfig) -> Duration {
        target
            .timeout
            .unwrap_or(self.config.limits.query_timeout)
            .as_duration()
    }

    pub fn emit_mode(&self, target: &TargetConfig) -> EmitMode {
        target.emit_mode.unwrap_or(self.config.emit.mode)
    }

    /// Key of the virtual input standing for a target's own settings.
    pub fn target_config_key(&self, target: &TargetConfig) -> String {
        format!("{}#targets.{}", self.config_key, target.name)
    }

    /// Hash of every setting that can influence a target's output bytes.
    pub fn target_config_hash(&self, target: &TargetConfig) -> String {
        let effective = serde_json::json!({
            "target": target,
            "canonicalize": self.config.canonicalize,
            "emit": {
                "mode": self.emit_mode(target),
                "filters": self.config.emit.filters,
            },
        });
        hash::hash_canonical_json(&effective)
    }
}
