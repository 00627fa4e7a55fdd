//! Queue socket protocol: one JSON request line and one JSON reply per connection

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Enqueue a stored manifest
    Launch { specfile_path: PathBuf },
    /// Report the in-flight run, pending runs and the number of completed runs
    Show,
    /// Status codes of jobs the daemon still knows about
    GetJobStatusDict,
    /// Finish the queue, then exit
    Stop,
    /// Kill the in-flight worker and exit immediately
    Kill,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowResponse {
    pub current_run: Option<String>,
    pub pending_runs: Vec<String>,
    pub num_completed_runs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

/// Job id to status code
pub type JobStatusDict = BTreeMap<String, u8>;

/// Reply written back to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Launched(LaunchResponse),
    Show(ShowResponse),
    JobStatus(JobStatusDict),
    Ack(AckResponse),
    Error { error: String },
}

impl Response {
    pub fn ack() -> Self {
        Self::Ack(AckResponse { ok: true })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req: Request =
            serde_json::from_str(r#"{"action": "launch", "specfile_path": "/tmp/a-spec.yml"}"#).unwrap();
        assert_eq!(
            req,
            Request::Launch {
                specfile_path: PathBuf::from("/tmp/a-spec.yml")
            }
        );
        assert_eq!(
            serde_json::to_string(&Request::GetJobStatusDict).unwrap(),
            r#"{"action":"get_job_status_dict"}"#
        );
        assert!(serde_json::from_str::<Request>(r#"{"action": "reboot"}"#).is_err());
    }

    #[test]
    fn test_response_shapes() {
        let show = Response::Show(ShowResponse {
            current_run: Some("sort/a".to_string()),
            pending_runs: vec!["sort/b".to_string()],
            num_completed_runs: 2,
        });
        let value: serde_json::Value = serde_json::to_value(&show).unwrap();
        assert_eq!(value["current_run"], "sort/a");
        assert_eq!(value["num_completed_runs"], 2);
        assert_eq!(
            serde_json::to_string(&Response::error("nope")).unwrap(),
            r#"{"error":"nope"}"#
        );
    }
}
