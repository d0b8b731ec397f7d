//! Wire protocol types for the status channel.
//!
//! One descriptor carries both directions:
//! - **Commands** (supervisor -> loader): `{"op": "spawn", "id": "..."}`
//! - **Replies** (loader/worker -> supervisor): objects tagged by `action`
//!
//! Each message is a single JSON object on its own line.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifier the supervisor assigns to a worker.
///
/// Opaque to the loader. Unique within one loader's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A decoded line from the supervisor.
///
/// Decoding is total: anything that is not a well-formed command becomes
/// [`Command::ParseError`] rather than an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fork a new worker with the given identity.
    Spawn { id: WorkerId },

    /// The line could not be understood. Not an actual command.
    ParseError { raw_line: String, cause: String },
}

/// Serde view of the command vocabulary.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Spawn {
        #[serde(default)]
        id: Option<String>,
    },
}

impl Command {
    /// Parse one line (without its trailing newline) into a command.
    pub fn parse(line: &str) -> Command {
        match serde_json::from_str::<Request>(line) {
            Ok(Request::Spawn { id: Some(id) }) if !id.is_empty() => Command::Spawn {
                id: WorkerId::new(id),
            },
            Ok(Request::Spawn { id: Some(_) }) => {
                Command::parse_error(line, "the \"id\" field must not be empty")
            }
            Ok(Request::Spawn { id: None }) => {
                Command::parse_error(line, "must include an \"id\" field")
            }
            Err(e) => Command::parse_error(line, e.to_string()),
        }
    }

    pub fn parse_error(raw_line: impl Into<String>, cause: impl Into<String>) -> Command {
        Command::ParseError {
            raw_line: raw_line.into(),
            cause: cause.into(),
        }
    }
}

/// Messages written to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Reply {
    /// A preload file is about to be loaded.
    Loading { file: PathBuf },

    /// All preload files are loaded; the loader accepts commands now.
    Ready,

    /// A worker was forked. `pid` is informational only.
    Launched {
        id: WorkerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<i32>,
    },

    /// A spawn request did not produce a worker.
    Failed { id: WorkerId, message: String },

    /// A command could not be processed.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },

    /// Sent by the worker itself once its startup is complete.
    Ack { id: WorkerId },

    /// A log line the supervisor may fold into its own logs.
    Log {
        level: LogLevel,
        message: String,
        #[serde(default)]
        fields: BTreeMap<String, serde_json::Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compact(reply: &Reply) -> String {
        serde_json::to_string(reply).unwrap()
    }

    #[test]
    fn parse_spawn() {
        assert_eq!(
            Command::parse(r#"{"op": "spawn", "id": "w1"}"#),
            Command::Spawn { id: "w1".into() }
        );
    }

    #[test]
    fn parse_spawn_ignores_unknown_fields() {
        assert_eq!(
            Command::parse(r#"{"op":"spawn","id":"w2","priority":3}"#),
            Command::Spawn { id: "w2".into() }
        );
    }

    #[test]
    fn parse_spawn_without_id_is_an_error() {
        let line = r#"{"op":"spawn"}"#;
        match Command::parse(line) {
            Command::ParseError { raw_line, cause } => {
                assert_eq!(raw_line, line);
                assert!(cause.contains("\"id\""), "cause: {cause}");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn parse_spawn_with_empty_id_is_an_error() {
        assert!(matches!(
            Command::parse(r#"{"op":"spawn","id":""}"#),
            Command::ParseError { .. }
        ));
    }

    #[test]
    fn parse_spawn_with_numeric_id_is_an_error() {
        assert!(matches!(
            Command::parse(r#"{"op":"spawn","id":12}"#),
            Command::ParseError { .. }
        ));
    }

    #[test]
    fn parse_unknown_op_is_an_error() {
        match Command::parse(r#"{"op":"upgrade"}"#) {
            Command::ParseError { cause, .. } => assert!(cause.contains("upgrade"), "{cause}"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn parse_missing_op_is_an_error() {
        assert!(matches!(
            Command::parse(r#"{"id":"w1"}"#),
            Command::ParseError { .. }
        ));
    }

    #[test]
    fn parse_garbage_keeps_raw_line() {
        match Command::parse("spawn w1") {
            Command::ParseError { raw_line, cause } => {
                assert_eq!(raw_line, "spawn w1");
                assert!(!cause.is_empty());
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn loading_serializes() {
        let reply = Reply::Loading {
            file: PathBuf::from("app/boot.rb"),
        };
        insta::assert_json_snapshot!(reply, @r#"
        {
          "action": "loading",
          "file": "app/boot.rb"
        }
        "#);
    }

    #[test]
    fn ready_serializes() {
        assert_eq!(compact(&Reply::Ready), r#"{"action":"ready"}"#);
    }

    #[test]
    fn launched_serializes() {
        let reply = Reply::Launched {
            id: "w1".into(),
            pid: Some(4242),
        };
        insta::assert_json_snapshot!(reply, @r#"
        {
          "action": "launched",
          "id": "w1",
          "pid": 4242
        }
        "#);
    }

    #[test]
    fn launched_without_pid_omits_it() {
        let reply = Reply::Launched {
            id: "w1".into(),
            pid: None,
        };
        assert_eq!(compact(&reply), r#"{"action":"launched","id":"w1"}"#);
    }

    #[test]
    fn failed_serializes() {
        let reply = Reply::Failed {
            id: "w1".into(),
            message: "duplicate ID".to_string(),
        };
        assert_eq!(
            compact(&reply),
            r#"{"action":"failed","id":"w1","message":"duplicate ID"}"#
        );
    }

    #[test]
    fn error_without_cause_omits_field() {
        let reply = Reply::Error {
            message: "in command processing".to_string(),
            cause: None,
        };
        assert_eq!(
            compact(&reply),
            r#"{"action":"error","message":"in command processing"}"#
        );
    }

    #[test]
    fn error_with_cause_serializes() {
        let reply = Reply::Error {
            message: "in command processing".to_string(),
            cause: Some("expected value at line 1 column 1".to_string()),
        };
        insta::assert_json_snapshot!(reply, @r#"
        {
          "action": "error",
          "message": "in command processing",
          "cause": "expected value at line 1 column 1"
        }
        "#);
    }

    #[test]
    fn ack_serializes() {
        assert_eq!(
            compact(&Reply::Ack { id: "w9".into() }),
            r#"{"action":"ack","id":"w9"}"#
        );
    }

    #[test]
    fn log_serializes_sorted_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("worker_id".to_string(), json!("w1"));
        fields.insert("pid".to_string(), json!(77));
        let reply = Reply::Log {
            level: LogLevel::Info,
            message: "Worker launched".to_string(),
            fields,
        };
        insta::assert_json_snapshot!(reply, @r#"
        {
          "action": "log",
          "level": "info",
          "message": "Worker launched",
          "fields": {
            "pid": 77,
            "worker_id": "w1"
          }
        }
        "#);
    }

    #[test]
    fn replies_deserialize() {
        let reply: Reply = serde_json::from_str(r#"{"action":"failed","id":"a","message":"non-zero exit"}"#).unwrap();
        assert_eq!(
            reply,
            Reply::Failed {
                id: "a".into(),
                message: "non-zero exit".to_string()
            }
        );
        let reply: Reply = serde_json::from_str(r#"{"action":"error","message":"m"}"#).unwrap();
        assert_eq!(
            reply,
            Reply::Error {
                message: "m".to_string(),
                cause: None
            }
        );
    }

    #[test]
    fn log_level_from_tracing() {
        assert_eq!(LogLevel::from(&tracing::Level::WARN), LogLevel::Warn);
        assert_eq!(LogLevel::from(&tracing::Level::TRACE), LogLevel::Trace);
    }
}
