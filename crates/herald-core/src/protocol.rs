//! Plaintext bodies of the rumors exchanged with the scheduler.
//!
//! Requests travel in kind-7701 rumors, responses in kind-7702 rumors, both
//! inside wraps. Bodies are JSON objects discriminated by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::PreviewKeyCapsule;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SchedulerRequest {
    /// Ask for the root secret and mailbox id
    KeyRequest,
    /// `payload` is a signed note event sealed under the submit subkey
    SubmitNote {
        job_id: String,
        scheduled_at: u64,
        payload: String,
    },
    /// `payload` is a signed kind-6 repost sealed under the submit subkey
    SubmitRepost {
        job_id: String,
        scheduled_at: u64,
        payload: String,
    },
    /// `payload` is sealed under the dm subkey, `preview` under the preview key
    SubmitDm {
        job_id: String,
        scheduled_at: u64,
        recipient: String,
        payload: String,
        preview: String,
    },
    Retry {
        job_id: String,
    },
    Cancel {
        job_id: String,
    },
    /// Rebuild the mailbox index and pages from the scheduler's own state
    Repair,
    Support {
        action: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        details: Value,
    },
    RegisterPreviewCapsule {
        capsule: PreviewKeyCapsule,
    },
}

impl SchedulerRequest {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerRequest::KeyRequest => "key_request",
            SchedulerRequest::SubmitNote { .. } => "submit_note",
            SchedulerRequest::SubmitRepost { .. } => "submit_repost",
            SchedulerRequest::SubmitDm { .. } => "submit_dm",
            SchedulerRequest::Retry { .. } => "retry",
            SchedulerRequest::Cancel { .. } => "cancel",
            SchedulerRequest::Repair => "repair",
            SchedulerRequest::Support { .. } => "support",
            SchedulerRequest::RegisterPreviewCapsule { .. } => "register_preview_capsule",
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            SchedulerRequest::SubmitNote { job_id, .. }
            | SchedulerRequest::SubmitRepost { job_id, .. }
            | SchedulerRequest::SubmitDm { job_id, .. }
            | SchedulerRequest::Retry { job_id }
            | SchedulerRequest::Cancel { job_id } => Some(job_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SchedulerResponse {
    KeyGrant {
        /// Hex root secret
        root: String,
        /// Opaque mailbox id chosen by the scheduler
        mailbox: String,
    },
    Ack {
        /// Rumor id of the request being answered
        request_id: String,
        #[serde(default)]
        job_id: Option<String>,
    },
    Error {
        request_id: String,
        message: String,
    },
}

impl SchedulerResponse {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            SchedulerResponse::Ack { request_id, .. } | SchedulerResponse::Error { request_id, .. } => {
                Some(request_id)
            }
            SchedulerResponse::KeyGrant { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        assert_eq!(
            serde_json::to_value(SchedulerRequest::KeyRequest).unwrap(),
            json!({"type": "key_request"})
        );
        let cancel = SchedulerRequest::Cancel {
            job_id: "j1".into(),
        };
        assert_eq!(
            serde_json::to_value(&cancel).unwrap(),
            json!({"type": "cancel", "jobId": "j1"})
        );
        assert_eq!(cancel.job_id(), Some("j1"));
    }

    #[test]
    fn test_parse_key_grant() {
        let grant: SchedulerResponse = serde_json::from_value(json!({
            "type": "key_grant",
            "root": "00",
            "mailbox": "mb-1"
        }))
        .unwrap();
        assert_eq!(
            grant,
            SchedulerResponse::KeyGrant {
                root: "00".into(),
                mailbox: "mb-1".into()
            }
        );
        assert!(serde_json::from_value::<SchedulerResponse>(json!({"type": "other"})).is_err());
    }
}
