//! JSON document emitted for every invocation.

use crate::job::{CheckOutcome, CheckStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shellbeat_core::MonitorConfig;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct CheckEvent {
    pub monitor: MonitorFields,
    pub check: CheckFields,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
    pub shell: ShellFields,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorFields {
    pub name: String,
    pub scheme: &'static str,
    pub host: String,
    pub command: String,
    pub args: String,
    pub dir: String,
    pub username: String,
    pub docker: bool,
    pub occurrence: u32,
    pub docker_filter: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckFields {
    pub ok: String,
    pub critical: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellFields {
    pub response: ResponseFields,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFields {
    pub output: String,
    pub down_count: u32,
    pub attempts: u32,
}

impl CheckEvent {
    pub fn new(monitor: &MonitorConfig, host: &str, outcome: &CheckOutcome) -> Self {
        let request = &monitor.check.request;
        Self {
            monitor: MonitorFields {
                name: monitor.name.clone(),
                scheme: "shell",
                host: host.to_string(),
                command: request.command.clone(),
                args: request.args.join(" "),
                dir: request.dir.clone(),
                username: monitor.username.clone(),
                docker: monitor.docker,
                occurrence: monitor.occurrence,
                docker_filter: monitor.docker_filter.join(" "),
            },
            check: CheckFields {
                ok: monitor.check.response.ok.join(","),
                critical: monitor.check.response.critical.join(","),
            },
            custom: custom_fields(&monitor.custom),
            shell: ShellFields {
                response: ResponseFields {
                    output: outcome.output.clone(),
                    down_count: outcome.down_count,
                    attempts: outcome.attempts,
                },
            },
            status: outcome.status,
            error: outcome.error.clone(),
            started_at: outcome.started_at,
            duration_ms: outcome.duration().num_milliseconds(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// `key:value` strings into a map. The key ends at the first `:`; entries
/// without a key or a value are dropped.
pub fn custom_fields(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| entry.split_once(':'))
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn outcome(error: Option<&str>) -> CheckOutcome {
        let started_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        CheckOutcome {
            status: if error.is_some() { CheckStatus::Down } else { CheckStatus::Up },
            output: "ok".into(),
            error: error.map(String::from),
            attempts: 2,
            down_count: 1,
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(1500),
        }
    }

    #[test]
    fn test_custom_fields() {
        let parsed = custom_fields(&[
            "team:ops".to_string(),
            "url:http://x".to_string(),
            "novalue:".to_string(),
            ":nokey".to_string(),
            "plain".to_string(),
        ]);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["team"], "ops");
        assert_eq!(parsed["url"], "http://x");
    }

    #[test]
    fn test_event_document() {
        let mut monitor = MonitorConfig {
            name: "disk".into(),
            username: "ops".into(),
            custom: vec!["team:ops".into()],
            ..Default::default()
        };
        monitor.check.request.command = "df".into();
        monitor.check.request.args = vec!["-h".into(), "/".into()];
        monitor.check.response.critical = vec!["100%".into(), "9[0-9]%".into()];

        let event = CheckEvent::new(&monitor, "10.0.0.5:22", &outcome(None));
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(json["monitor"]["scheme"], "shell");
        assert_eq!(json["monitor"]["args"], "-h /");
        assert_eq!(json["monitor"]["host"], "10.0.0.5:22");
        assert_eq!(json["check"]["critical"], "100%,9[0-9]%");
        assert_eq!(json["custom"]["team"], "ops");
        assert_eq!(json["shell"]["response"]["down_count"], 1);
        assert_eq!(json["shell"]["response"]["attempts"], 2);
        assert_eq!(json["status"], "up");
        assert_eq!(json["duration_ms"], 1500);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_down_event_without_custom() {
        let event = CheckEvent::new(&MonitorConfig::default(), "localhost:0", &outcome(Some("boom")));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "down");
        assert_eq!(json["error"], "boom");
        assert!(json.get("custom").is_none());
    }
}
