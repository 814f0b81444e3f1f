use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Categorical outcome of one submission.
///
/// `CompileError`, `RuntimeError`, `Timeout` and `ResourceExceeded` are
/// deterministic outcomes of user code. `InternalError` means the sandbox
/// infrastructure failed, and `Cancelled` means the caller gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    Cancelled,
    InternalError,
}

impl Verdict {
    pub const ALL: [Verdict; 7] = [
        Verdict::Success,
        Verdict::CompileError,
        Verdict::RuntimeError,
        Verdict::Timeout,
        Verdict::ResourceExceeded,
        Verdict::Cancelled,
        Verdict::InternalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Success => "success",
            Verdict::CompileError => "compile_error",
            Verdict::RuntimeError => "runtime_error",
            Verdict::Timeout => "timeout",
            Verdict::ResourceExceeded => "resource_exceeded",
            Verdict::Cancelled => "cancelled",
            Verdict::InternalError => "internal_error",
        }
    }

    /// True for verdicts produced by the submitted program itself.
    pub fn is_user_outcome(&self) -> bool {
        matches!(
            self,
            Verdict::Success
                | Verdict::CompileError
                | Verdict::RuntimeError
                | Verdict::Timeout
                | Verdict::ResourceExceeded
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `source_code` and `stdin` are encoded in a request body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Utf8,
    Base64,
}

/// Submission intake payload, as received over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub encoding: PayloadEncoding,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("field `{field}` is not valid base64: {source}")]
    InvalidBase64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,
}

impl SubmissionRequest {
    fn decode(&self, field: &'static str, value: &str) -> Result<Vec<u8>, PayloadError> {
        match self.encoding {
            PayloadEncoding::Utf8 => Ok(value.as_bytes().to_vec()),
            PayloadEncoding::Base64 => general_purpose::STANDARD
                .decode(value)
                .map_err(|source| PayloadError::InvalidBase64 { field, source }),
        }
    }

    /// Decode the payload into a fresh submission with a new id.
    pub fn into_submission(self) -> Result<Submission, PayloadError> {
        if self.timeout_ms == Some(0) {
            return Err(PayloadError::ZeroTimeout);
        }
        let source = self.decode("source_code", &self.source_code)?;
        let stdin = match self.stdin.as_deref() {
            Some(raw) => Some(self.decode("stdin", raw)?),
            None => None,
        };
        Ok(Submission::new(
            self.language,
            source,
            stdin,
            self.timeout_ms.map(Duration::from_millis),
        ))
    }
}

/// One caller-supplied unit of code plus optional input
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: Uuid,
    pub language: String,
    pub source: Vec<u8>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(
        language: impl Into<String>,
        source: impl Into<Vec<u8>>,
        stdin: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            language: language.into(),
            source: source.into(),
            stdin,
            timeout,
            created_at: Utc::now(),
        }
    }
}

/// Final, immutable result of one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub submission_id: Uuid,
    pub language: String,
    pub verdict: Verdict,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub exit_code: Option<i64>,
    pub elapsed_ms: u64,
    /// CPU time the sandbox spent in the reported phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
    /// Sandbox memory high-water mark
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_peak_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(encoding: PayloadEncoding, source: &str, stdin: Option<&str>) -> SubmissionRequest {
        SubmissionRequest {
            language: "python3.12".to_string(),
            source_code: source.to_string(),
            stdin: stdin.map(str::to_string),
            timeout_ms: None,
            encoding,
        }
    }

    #[test]
    fn test_verdict_wire_names() {
        assert_eq!(serde_json::to_string(&Verdict::CompileError).unwrap(), "\"compile_error\"");
        assert_eq!(serde_json::to_string(&Verdict::ResourceExceeded).unwrap(), "\"resource_exceeded\"");
        for verdict in Verdict::ALL {
            let json = serde_json::to_string(&verdict).unwrap();
            assert_eq!(json, format!("\"{}\"", verdict));
        }
    }

    #[test]
    fn test_user_outcomes() {
        assert!(Verdict::Timeout.is_user_outcome());
        assert!(Verdict::CompileError.is_user_outcome());
        assert!(!Verdict::Cancelled.is_user_outcome());
        assert!(!Verdict::InternalError.is_user_outcome());
    }

    #[test]
    fn test_request_defaults() {
        let req: SubmissionRequest =
            serde_json::from_str(r#"{"language":"cpp11","source_code":"int main(){}"}"#).unwrap();
        assert_eq!(req.encoding, PayloadEncoding::Utf8);
        assert!(req.stdin.is_none());
        assert!(req.timeout_ms.is_none());
    }

    #[test]
    fn test_utf8_payload() {
        let sub = request(PayloadEncoding::Utf8, "print(1+1)", Some("5\n"))
            .into_submission()
            .unwrap();
        assert_eq!(sub.source, b"print(1+1)");
        assert_eq!(sub.stdin.as_deref(), Some(&b"5\n"[..]));
        assert_eq!(sub.language, "python3.12");
    }

    #[test]
    fn test_base64_payload() {
        let sub = request(PayloadEncoding::Base64, "cHJpbnQoMSsxKQ==", None)
            .into_submission()
            .unwrap();
        assert_eq!(sub.source, b"print(1+1)");
        assert!(sub.stdin.is_none());
    }

    #[test]
    fn test_invalid_base64_names_field() {
        let err = request(PayloadEncoding::Base64, "cHJpbnQoMSsxKQ==", Some("@@@"))
            .into_submission()
            .unwrap_err();
        assert!(err.to_string().contains("stdin"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut req = request(PayloadEncoding::Utf8, "x", None);
        req.timeout_ms = Some(0);
        assert!(matches!(req.into_submission(), Err(PayloadError::ZeroTimeout)));
    }

    #[test]
    fn test_submission_ids_unique() {
        let a = Submission::new("cpp11", "a", None, None);
        let b = Submission::new("cpp11", "a", None, None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_result_omits_empty_detail() {
        let result = ExecutionResult {
            submission_id: Uuid::new_v4(),
            language: "python3.12".to_string(),
            verdict: Verdict::Success,
            stdout: "2\n".to_string(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: Some(0),
            elapsed_ms: 12,
            cpu_time_ms: None,
            memory_peak_bytes: Some(9 * 1024 * 1024),
            detail: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["verdict"], "success");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["memory_peak_bytes"], 9 * 1024 * 1024);
        assert!(json.get("cpu_time_ms").is_none());
        assert!(json.get("detail").is_none());
    }
}
