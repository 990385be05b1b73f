//! Remote execution backend.
//!
//! Posts the row to an external script-execution service and waits for the
//! answer. Network errors and timeouts are row failures with the error text
//! as output; they never fail the job.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::{BackendError, BackendKind, BackendOutput, ExecutionRequest, RowBackend};

/// Response body of the execution service. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    out: Option<Value>,
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
}

fn text_of(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

/// HTTP client for the execution service.
#[derive(Debug, Clone)]
pub struct RpcBackend {
    client: Client,
    url: String,
}

impl RpcBackend {
    /// Creates a backend posting to `url` with a per-request `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn payload(request: &ExecutionRequest) -> Value {
        json!({
            "script_path": request.script_path.display().to_string(),
            "rowData": request.row_data,
            "jobId": request.job_id,
            "rowIndex": request.row_index,
            "resultFile": request.result_path.display().to_string(),
            "logFile": request.log_path.display().to_string(),
        })
    }
}

#[async_trait]
impl RowBackend for RpcBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rpc
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<BackendOutput, BackendError> {
        let response = match self
            .client
            .post(&self.url)
            .json(&Self::payload(request))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    job_id = %request.job_id,
                    row_index = request.row_index,
                    error = %e,
                    "Remote execution request failed"
                );
                return Ok(BackendOutput::failure(BackendKind::Rpc, e.to_string()));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Ok(BackendOutput::failure(BackendKind::Rpc, e.to_string())),
        };

        if !status.is_success() {
            return Ok(BackendOutput::failure(
                BackendKind::Rpc,
                format!("execution service returned {}: {}", status, body.trim()),
            ));
        }

        let parsed: RpcResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(BackendOutput::failure(
                    BackendKind::Rpc,
                    format!("invalid response from execution service: {}", e),
                ))
            }
        };

        Ok(BackendOutput {
            code: parsed.code.unwrap_or(0),
            out: text_of(parsed.out),
            err: text_of(parsed.err),
            result: parsed.result,
            backend: BackendKind::Rpc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn request() -> ExecutionRequest {
        let mut row = Map::new();
        row.insert("city".to_string(), Value::String("Oslo".to_string()));
        ExecutionRequest {
            job_id: Uuid::nil(),
            row_index: 4,
            row_data: row,
            script_path: PathBuf::from("/scripts/geo.py"),
            log_path: PathBuf::from("/data/job/logs/row_4.log"),
            result_path: PathBuf::from("/data/job/rows/row_4.json"),
        }
    }

    #[test]
    fn test_payload_fields() {
        let payload = RpcBackend::payload(&request());
        assert_eq!(payload["script_path"], "/scripts/geo.py");
        assert_eq!(payload["rowIndex"], 4);
        assert_eq!(payload["rowData"]["city"], "Oslo");
        assert_eq!(payload["resultFile"], "/data/job/rows/row_4.json");
        assert_eq!(payload["logFile"], "/data/job/logs/row_4.log");
    }

    #[test]
    fn test_text_of_non_string_output() {
        assert_eq!(text_of(None), "");
        assert_eq!(text_of(Some(Value::String("hi".into()))), "hi");
        assert_eq!(text_of(Some(json!({"a": 1}))), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_row_failure() {
        // Port 9 (discard) on localhost is closed in test environments
        let backend = RpcBackend::new("http://127.0.0.1:9/run", Duration::from_secs(2)).unwrap();
        let out = backend.execute(&request()).await.unwrap();
        assert_eq!(out.code, 1);
        assert!(!out.out.is_empty());
        assert_eq!(out.out, out.err);
        assert_eq!(out.backend, BackendKind::Rpc);
    }
}
