//! Job envelope decoding.
//!
//! Queue bodies look like
//! `{"metadata": {"jobId": "..."}, "payload": "<json>"}` where `payload`
//! is either a JSON-encoded string or an inline object, and the decoded
//! payload carries the ComfyUI workflow graph under `prompt`.

use serde::Deserialize;
use serde_json::Value;

use imagex_cloud::queue::QueueMessage;
use imagex_core::types::JobId;

/// Reasons a queue message cannot be turned into a job. None of them
/// go away on redelivery.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message body is not a valid job envelope: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("metadata.jobId is missing or empty")]
    MissingJobId,

    #[error("payload is missing")]
    MissingPayload,

    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    #[error("payload has no object-valued `prompt` workflow")]
    MissingWorkflow,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Deserialize)]
struct Metadata {
    #[serde(rename = "jobId", default)]
    job_id: Option<String>,
}

/// A received queue message with its job decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMessage {
    pub message_id: String,
    pub receipt_handle: String,
    /// Queue-reported delivery count, `1` on first delivery.
    pub receive_count: u32,
    pub job_id: JobId,
    /// The ComfyUI workflow graph to execute.
    pub workflow: Value,
}

impl JobMessage {
    pub fn parse(message: &QueueMessage) -> Result<Self, MessageError> {
        let envelope: Envelope =
            serde_json::from_str(&message.body).map_err(MessageError::InvalidJson)?;

        let job_id = envelope
            .metadata
            .and_then(|m| m.job_id)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(MessageError::MissingJobId)?;

        let payload = match envelope.payload {
            None | Some(Value::Null) => return Err(MessageError::MissingPayload),
            Some(Value::String(encoded)) => {
                serde_json::from_str::<Value>(&encoded).map_err(MessageError::InvalidPayload)?
            }
            Some(inline) => inline,
        };

        let workflow = match payload {
            Value::Object(mut fields) => match fields.remove("prompt") {
                Some(prompt @ Value::Object(_)) => prompt,
                _ => return Err(MessageError::MissingWorkflow),
            },
            _ => return Err(MessageError::MissingWorkflow),
        };

        Ok(Self {
            message_id: message.message_id.clone(),
            receipt_handle: message.receipt_handle.clone(),
            receive_count: message.receive_count,
            job_id,
            workflow,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn queue_message(body: impl Into<String>) -> QueueMessage {
        QueueMessage {
            message_id: "m-1".into(),
            receipt_handle: "r-1".into(),
            body: body.into(),
            receive_count: 2,
        }
    }

    #[test]
    fn string_payload_is_decoded() {
        let payload = json!({ "prompt": { "3": { "class_type": "KSampler" } } }).to_string();
        let body = json!({ "metadata": { "jobId": "job-1" }, "payload": payload }).to_string();

        let job = JobMessage::parse(&queue_message(body)).unwrap();
        assert_eq!(job.job_id, "job-1");
        assert_eq!(job.receive_count, 2);
        assert_eq!(job.receipt_handle, "r-1");
        assert_eq!(job.workflow["3"]["class_type"], "KSampler");
    }

    #[test]
    fn inline_payload_is_accepted() {
        let body = json!({
            "metadata": { "jobId": "job-2" },
            "payload": { "prompt": { "1": {} } }
        })
        .to_string();
        let job = JobMessage::parse(&queue_message(body)).unwrap();
        assert_eq!(job.workflow, json!({ "1": {} }));
    }

    #[test]
    fn non_json_body_is_rejected() {
        assert_matches!(
            JobMessage::parse(&queue_message("not json")),
            Err(MessageError::InvalidJson(_))
        );
    }

    #[test]
    fn missing_or_blank_job_id_is_rejected() {
        for body in [
            json!({ "payload": "{}" }),
            json!({ "metadata": {}, "payload": "{}" }),
            json!({ "metadata": { "jobId": "  " }, "payload": "{}" }),
        ] {
            assert_matches!(
                JobMessage::parse(&queue_message(body.to_string())),
                Err(MessageError::MissingJobId)
            );
        }
    }

    #[test]
    fn payload_problems_are_reported() {
        let missing = json!({ "metadata": { "jobId": "j" } }).to_string();
        assert_matches!(
            JobMessage::parse(&queue_message(missing)),
            Err(MessageError::MissingPayload)
        );

        let garbled = json!({ "metadata": { "jobId": "j" }, "payload": "{oops" }).to_string();
        assert_matches!(
            JobMessage::parse(&queue_message(garbled)),
            Err(MessageError::InvalidPayload(_))
        );

        let no_prompt =
            json!({ "metadata": { "jobId": "j" }, "payload": "{\"steps\": 20}" }).to_string();
        assert_matches!(
            JobMessage::parse(&queue_message(no_prompt)),
            Err(MessageError::MissingWorkflow)
        );

        let scalar_prompt =
            json!({ "metadata": { "jobId": "j" }, "payload": { "prompt": "draw a cat" } })
                .to_string();
        assert_matches!(
            JobMessage::parse(&queue_message(scalar_prompt)),
            Err(MessageError::MissingWorkflow)
        );
    }
}
