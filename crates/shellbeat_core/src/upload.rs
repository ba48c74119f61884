//! `source:dest[:mode]` upload specs.

use crate::error::ShellError;
use std::fmt;
use std::path::Path;

pub const DEFAULT_MODE: &str = "0755";

/// One file to stage on the target before the check runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSpec {
    pub source: String,
    pub dest: String,
    /// Octal permission string, e.g. `0755`.
    pub mode: String,
}

impl UploadSpec {
    /// Parse `"<localSourcePath>:<remoteDestPath>[:<fileMode>]"`.
    ///
    /// Whitespace around each part is ignored. The mode defaults to `0755`
    /// and must consist of octal digits.
    pub fn parse(spec: &str) -> Result<Self, ShellError> {
        let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(ShellError::Config(format!(
                "upload '{}' should be in format <SourcePath>:<DestPath>[:<Mode>]",
                spec
            )));
        }
        let (source, dest) = (parts[0], parts[1]);
        if source.is_empty() || dest.is_empty() {
            return Err(ShellError::Config(format!(
                "upload '{}' has an empty source or destination",
                spec
            )));
        }

        let mode = parts.get(2).copied().unwrap_or(DEFAULT_MODE);
        if mode.is_empty() || mode.len() > 4 || !mode.chars().all(|c| ('0'..='7').contains(&c)) {
            return Err(ShellError::Config(format!(
                "upload '{}' has an invalid file mode '{}'",
                spec, mode
            )));
        }

        Ok(Self {
            source: source.to_string(),
            dest: dest.to_string(),
            mode: mode.to_string(),
        })
    }
}

impl fmt::Display for UploadSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.dest, self.mode)
    }
}

/// Parse an octal mode string such as `0644`.
pub fn parse_mode(mode: &str) -> Option<u32> {
    u32::from_str_radix(mode, 8).ok()
}

/// Split a destination into `(directory, file name)`.
///
/// A destination ending in `/` names a directory; the file keeps the base
/// name of `source` in that case.
pub fn split_destination(source: &str, dest: &str) -> (String, String) {
    let (dir, name) = match dest.rfind('/') {
        Some(idx) => (&dest[..=idx], &dest[idx + 1..]),
        None => ("", dest),
    };
    let name = if name.is_empty() {
        Path::new(source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        name.to_string()
    };
    (dir.to_string(), name)
}
