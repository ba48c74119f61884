//! EOF-sentinel framing for the attached exec stream.
//!
//! Multiplexed frame headers announce a payload length that stops matching
//! the output once a command runs across several reads, so output is framed by
//! a unique token echoed after the command instead.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use shellbeat_core::ShellError;
use std::fmt::Display;
use uuid::Uuid;

const TOKEN_PREFIX: &str = "shellbeat-eof-";

/// Fresh sentinel for one command.
pub fn eof_token() -> String {
    format!("{}{}", TOKEN_PREFIX, Uuid::new_v4().simple())
}

/// Command line followed by the sentinel echo, which also reports `$?`.
pub fn sentinel_script(command_line: &str, token: &str) -> String {
    format!("{}\necho \"{} $?\"\n", command_line, token)
}

/// Accumulate lines into `output` until one contains `token`, returning the
/// exit status echoed next to the token.
///
/// Text before the token on the sentinel line is kept, so output without a
/// trailing newline survives. `output` is owned by the caller and keeps what
/// arrived even when the read fails or is cancelled. Bytes left after the
/// sentinel line stay in `carry` for the next command. A stream ending before
/// the sentinel is a lost connection.
pub async fn read_until_sentinel<S, E>(
    stream: &mut S,
    carry: &mut Vec<u8>,
    token: &str,
    output: &mut String,
) -> Result<Option<i32>, ShellError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    loop {
        while let Some(end) = carry.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = carry.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(at) = line.find(token) {
                output.push_str(&line[..at]);
                return Ok(line[at + token.len()..].trim().parse().ok());
            }
            output.push_str(&line);
        }

        match stream.next().await {
            Some(Ok(chunk)) => carry.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(ShellError::Transport(e.to_string())),
            None => {
                output.push_str(&String::from_utf8_lossy(carry));
                carry.clear();
                return Err(ShellError::ConnectionLost);
            }
        }
    }
}

/// Single-entry tar archive for the container copy API.
pub fn tar_archive(name: &str, content: &[u8], mode: u32) -> Result<Vec<u8>, ShellError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_mtime(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    );

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, name, content)
        .map_err(|e| ShellError::Upload(format!("failed to archive {}: {}", name, e)))?;
    builder
        .into_inner()
        .map_err(|e| ShellError::Upload(format!("failed to finish archive: {}", e)))
}
