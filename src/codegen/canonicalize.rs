//! Stage 4: output canonicalization
//!
//! [`canonicalize`] is a pure, idempotent function over arbitrary bytes:
//! `canonicalize(canonicalize(x)) == canonicalize(x)`. The steps run in a
//! fixed order:
//!
//! 1. decode as UTF-8 (invalid sequences become U+FFFD)
//! 2. Unicode NFC composition
//! 3. CRLF and lone CR become LF
//! 4. trailing whitespace stripped per line (unless preserved)
//! 5. trailing blank lines dropped
//! 6. lines re-joined with the configured ending, plus exactly one final
//!    newline; blank input canonicalizes to empty output
//!
//! [`Canonicalizer`] resolves per-output overrides by glob and runs the
//! optional external formatter before the rules.

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use unicode_normalization::UnicodeNormalization;

use super::formatter::{ExternalFormatter, FailurePolicy, Formattable, FormatterConfig};
use crate::config::CanonicalizeConfig;
use crate::error::FormatterError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    #[default]
    Lf,
    Crlf,
}

impl LineEnding {
    fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::Crlf => "\r\n",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingWhitespace {
    #[default]
    Strip,
    /// Kept for formats where trailing spaces are significant, such as
    /// Markdown hard line breaks.
    Preserve,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnicodeForm {
    #[default]
    Nfc,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRules {
    #[serde(default)]
    pub line_endings: LineEnding,
    #[serde(default)]
    pub trailing_whitespace: TrailingWhitespace,
    #[serde(default = "default_final_newline")]
    pub final_newline: bool,
    #[serde(default)]
    pub unicode: UnicodeForm,
}

fn default_final_newline() -> bool {
    true
}

impl Default for CanonicalRules {
    fn default() -> Self {
        Self {
            line_endings: LineEnding::Lf,
            trailing_whitespace: TrailingWhitespace::Strip,
            final_newline: true,
            unicode: UnicodeForm::Nfc,
        }
    }
}

/// A per-output-pattern override. Unset fields inherit the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalOverride {
    pub pattern: String,
    #[serde(default)]
    pub line_endings: Option<LineEnding>,
    #[serde(default)]
    pub trailing_whitespace: Option<TrailingWhitespace>,
    #[serde(default)]
    pub final_newline: Option<bool>,
    #[serde(default)]
    pub unicode: Option<UnicodeForm>,
    #[serde(default)]
    pub formatter: Option<FormatterConfig>,
}

impl CanonicalOverride {
    fn apply_to(&self, rules: &mut CanonicalRules) {
        if let Some(v) = self.line_endings {
            rules.line_endings = v;
        }
        if let Some(v) = self.trailing_whitespace {
            rules.trailing_whitespace = v;
        }
        if let Some(v) = self.final_newline {
            rules.final_newline = v;
        }
        if let Some(v) = self.unicode {
            rules.unicode = v;
        }
    }
}

pub fn canonicalize(raw: &[u8], rules: &CanonicalRules) -> Vec<u8> {
    let decoded = String::from_utf8_lossy(raw);
    let composed: String = match rules.unicode {
        UnicodeForm::Nfc => decoded.nfc().collect(),
        UnicodeForm::None => decoded.into_owned(),
    };
    let unified = composed.replace("\r\n", "\n").replace('\r', "\n");

    let mut lines: Vec<&str> = unified
        .split('\n')
        .map(|line| match rules.trailing_whitespace {
            TrailingWhitespace::Strip => line.trim_end(),
            TrailingWhitespace::Preserve => line,
        })
        .collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return Vec::new();
    }

    let eol = rules.line_endings.as_str();
    let mut out = lines.join(eol);
    if rules.final_newline {
        out.push_str(eol);
    }
    out.into_bytes()
}

// =============================================================================
// CANONICALIZER
// =============================================================================

/// Rules resolved for one output path.
#[derive(Debug, Clone)]
pub struct ResolvedRules {
    pub rules: CanonicalRules,
    pub formatter: Option<(ExternalFormatter, FailurePolicy)>,
}

#[derive(Debug, Clone, Default)]
pub struct Canonicalized {
    pub bytes: Vec<u8>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Canonicalizer {
    defaults: CanonicalRules,
    overrides: Vec<(GlobMatcher, CanonicalOverride)>,
    formatter_timeout: std::time::Duration,
}

impl Canonicalizer {
    /// Patterns are validated at configuration load; an invalid one here is
    /// skipped with a warning.
    pub fn new(config: &CanonicalizeConfig, formatter_timeout: std::time::Duration) -> Self {
        let overrides = config
            .overrides
            .iter()
            .filter_map(|rule| match Glob::new(&rule.pattern) {
                Ok(glob) => Some((glob.compile_matcher(), rule.clone())),
                Err(err) => {
                    tracing::warn!(pattern = %rule.pattern, error = %err, "ignoring invalid override pattern");
                    None
                }
            })
            .collect();
        Self {
            defaults: config.defaults,
            overrides,
            formatter_timeout,
        }
    }

    pub fn resolve(&self, output: &str) -> ResolvedRules {
        let mut rules = self.defaults;
        let mut formatter = None;
        for (matcher, rule) in &self.overrides {
            if matcher.is_match(output) {
                rule.apply_to(&mut rules);
                if let Some(config) = &rule.formatter {
                    formatter = Some((
                        ExternalFormatter::from_config(config, self.formatter_timeout),
                        config.on_failure,
                    ));
                }
            }
        }
        ResolvedRules { rules, formatter }
    }

    /// Formatter (if any) first, then the rules. A formatter failure is
    /// resolved by its policy: `warn` and `ignore` keep the unformatted
    /// bytes, `error` fails the target.
    pub fn apply(
        &self,
        output: &str,
        raw: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Canonicalized, FormatterError> {
        let resolved = self.resolve(output);
        let mut warnings = Vec::new();

        let formatted = match &resolved.formatter {
            Some((formatter, policy)) => match formatter.format(raw, cancel) {
                Ok(bytes) => bytes,
                Err(err @ FormatterError::Cancelled { .. }) => return Err(err),
                Err(err) => match policy {
                    FailurePolicy::Error => return Err(err),
                    FailurePolicy::Warn => {
                        tracing::warn!(output, error = %err, "formatter failed, keeping unformatted output");
                        warnings.push(format!("{output}: {err}"));
                        raw.to_vec()
                    }
                    FailurePolicy::Ignore => {
                        tracing::debug!(output, error = %err, "formatter failed (ignored)");
                        raw.to_vec()
                    }
                },
            },
            None => raw.to_vec(),
        };

        Ok(Canonicalized {
            bytes: canonicalize(&formatted, &resolved.rules),
            warnings,
        })
    }
}
