//! Wire protocol between the daemon and its worker children.
//!
//! Transport is JSON objects, one per line: assignments go down the child's
//! stdin, replies come back on its stdout. The child's stderr carries only
//! logs. Exactly one terminal reply is produced per received assignment.

use serde::{Deserialize, Serialize};

/// Parent -> child: run this job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub id: String,
    pub command: String,
}

/// Child -> parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Sent exactly once, after startup, before the first assignment.
    Ready,
    Completed {
        job: JobAssignment,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Failed {
        job: JobAssignment,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_round_trips_through_json_lines() {
        let reply = WorkerReply::Completed {
            job: JobAssignment {
                id: "job-1".into(),
                command: "echo hi".into(),
            },
            output: Some("hi\n".into()),
        };
        let line = serde_json::to_string(&reply).unwrap();
        assert!(!line.contains('\n'));
        let parsed: WorkerReply = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn ready_uses_the_status_tag() {
        let line = serde_json::to_string(&WorkerReply::Ready).unwrap();
        assert_eq!(line, r#"{"status":"ready"}"#);
    }
}
