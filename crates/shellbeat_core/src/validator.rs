//! Output classification from `ok` / `critical` pattern lists.

use crate::error::{ShellError, ValidationError};
use regex::Regex;

/// Decides whether a command's output means the target is healthy.
pub trait OutputValidator: Send + Sync {
    fn validate(&self, output: &str) -> Result<(), ValidationError>;
}

impl<F> OutputValidator for F
where
    F: Fn(&str) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate(&self, output: &str) -> Result<(), ValidationError> {
        self(output)
    }
}

/// Regex-based validator built from the `check.response` config block.
///
/// Any matching critical pattern rejects the output. When `ok` patterns are
/// configured, at least one of them must match.
#[derive(Debug, Clone, Default)]
pub struct OutputCheck {
    ok: Vec<Regex>,
    critical: Vec<Regex>,
}

impl OutputCheck {
    pub fn new<S: AsRef<str>>(ok: &[S], critical: &[S]) -> Result<Self, ShellError> {
        Ok(Self {
            ok: compile(ok)?,
            critical: compile(critical)?,
        })
    }

    pub fn ok_patterns(&self) -> impl Iterator<Item = &str> {
        self.ok.iter().map(Regex::as_str)
    }
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, ShellError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p.as_ref()).map_err(|e| {
                ShellError::Config(format!("invalid pattern '{}': {}", p.as_ref(), e))
            })
        })
        .collect()
}

impl OutputValidator for OutputCheck {
    fn validate(&self, output: &str) -> Result<(), ValidationError> {
        if let Some(re) = self.critical.iter().find(|re| re.is_match(output)) {
            return Err(ValidationError::new(format!(
                "output matched critical pattern '{}'",
                re.as_str()
            )));
        }
        if !self.ok.is_empty() && !self.ok.iter().any(|re| re.is_match(output)) {
            return Err(ValidationError::new(format!(
                "output matched none of the ok patterns [{}]",
                self.ok_patterns().collect::<Vec<_>>().join(", ")
            )));
        }
        Ok(())
    }
}
