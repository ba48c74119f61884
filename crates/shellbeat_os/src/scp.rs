//! SCP sink mini-protocol: push one file to `scp -t <dir>`.
//!
//! Wire format: `C<mode> <size> <name>\n`, `<size>` raw bytes, one `\0`.
//! The peer answers with status bytes on stdout; a non-zero status is
//! followed by one newline-terminated error message.

/// Header line announcing one file.
pub fn scp_header(mode: &str, size: usize, name: &str) -> String {
    format!("C{} {} {}\n", mode, size, name)
}

/// Everything the sink expects on stdin for a single file.
pub fn scp_payload(mode: &str, name: &str, content: &[u8]) -> Vec<u8> {
    let header = scp_header(mode, content.len(), name);
    let mut payload = Vec::with_capacity(header.len() + content.len() + 1);
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(content);
    payload.push(0);
    payload
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpAck {
    /// Need more bytes.
    Pending,
    Ok,
    Failed(String),
}

/// Interpret the acknowledgement bytes read so far.
///
/// The first byte acknowledges the sink starting, the second is the status of
/// the transfer. A non-zero byte in either position starts an error line.
pub fn parse_scp_ack(buf: &[u8]) -> ScpAck {
    let Some(status_at) = buf.iter().take(2).position(|&b| b != 0) else {
        return if buf.len() >= 2 { ScpAck::Ok } else { ScpAck::Pending };
    };
    let message = &buf[status_at + 1..];
    match message.iter().position(|&b| b == b'\n') {
        Some(end) => ScpAck::Failed(String::from_utf8_lossy(&message[..end]).into_owned()),
        None => ScpAck::Pending,
    }
}

/// Best description of an error line cut short by the stream closing.
pub fn truncated_ack_message(buf: &[u8]) -> String {
    match buf.iter().take(2).position(|&b| b != 0) {
        Some(at) if buf.len() > at + 1 => String::from_utf8_lossy(&buf[at + 1..]).trim().to_string(),
        _ => "scp closed the session before acknowledging the transfer".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_format() {
        assert_eq!(scp_header("0755", 12, "check.sh"), "C0755 12 check.sh\n");
    }

    #[test]
    fn test_payload_carries_exact_bytes() {
        let content = b"#!/bin/sh\necho \x00binary\xff\n";
        let payload = scp_payload("0644", "a.sh", content);

        let header = format!("C0644 {} a.sh\n", content.len());
        let header = header.as_bytes();
        assert_eq!(&payload[..header.len()], header);
        assert_eq!(&payload[header.len()..payload.len() - 1], content);
        assert_eq!(payload.last(), Some(&0));
    }

    #[test]
    fn test_ack_ok() {
        assert_eq!(parse_scp_ack(b""), ScpAck::Pending);
        assert_eq!(parse_scp_ack(b"\x00"), ScpAck::Pending);
        assert_eq!(parse_scp_ack(b"\x00\x00"), ScpAck::Ok);
        assert_eq!(parse_scp_ack(b"\x00\x00\x00"), ScpAck::Ok);
    }

    #[test]
    fn test_ack_status_error() {
        assert_eq!(parse_scp_ack(b"\x00\x01scp: /opt/x: Permission"), ScpAck::Pending);
        assert_eq!(
            parse_scp_ack(b"\x00\x01scp: /opt/x: Permission denied\n"),
            ScpAck::Failed("scp: /opt/x: Permission denied".into())
        );
    }

    #[test]
    fn test_ack_error_on_start() {
        assert_eq!(
            parse_scp_ack(b"\x01scp: /nope: No such file or directory\n"),
            ScpAck::Failed("scp: /nope: No such file or directory".into())
        );
    }

    #[test]
    fn test_truncated_message() {
        assert_eq!(truncated_ack_message(b"\x00\x02lost conn"), "lost conn");
        assert!(truncated_ack_message(b"\x00").contains("before acknowledging"));
    }
}
