use serde_json::{json, Map, Value};

use crate::constants::ABORT_PATH;
use crate::transport::StreamRequest;
use crate::types::{Origin, Submission};

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

pub fn stream_url(submission: &Submission) -> String {
    join_url(&submission.endpoint.base_url, &submission.endpoint.endpoint)
}

pub fn abort_url(submission: &Submission) -> String {
    join_url(&submission.endpoint.base_url, ABORT_PATH)
}

/// Request body for the streaming endpoint. Endpoint options are copied in
/// without overriding any of the fields set here.
pub fn project_body(submission: &Submission) -> Value {
    let user = &submission.user_message;
    let mut body = Map::new();
    body.insert("text".into(), json!(user.text));
    body.insert("messageId".into(), json!(user.message_id));
    body.insert("parentMessageId".into(), json!(user.parent_message_id));
    body.insert(
        "conversationId".into(),
        json!(submission.conversation_id.as_deref().filter(|_| !submission.is_new_conversation())),
    );
    body.insert("endpoint".into(), json!(submission.endpoint.endpoint));
    if let Some(model) = submission.model() {
        body.insert("model".into(), json!(model));
    }
    body.insert("responseMessageId".into(), json!(submission.initial_response.message_id));
    body.insert("isRegenerate".into(), json!(submission.is_regenerate));
    body.insert("isContinued".into(), json!(submission.is_continued));
    body.insert("isTemporary".into(), json!(submission.is_temporary));
    body.insert(
        "isAddedRequest".into(),
        json!(submission.origin == Origin::AddedRequest),
    );

    for (key, value) in &submission.endpoint.options {
        if !body.contains_key(key) {
            body.insert(key.clone(), value.clone());
        }
    }
    Value::Object(body)
}

pub fn project_submission(submission: &Submission, token: Option<String>) -> StreamRequest {
    StreamRequest {
        url: stream_url(submission),
        body: project_body(submission),
        token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EndpointOptions, Message};

    fn submission() -> Submission {
        let mut options = Map::new();
        options.insert("temperature".into(), json!(0.2));
        options.insert("text".into(), json!("should not override"));
        Submission {
            user_message: Message {
                message_id: "u1".into(),
                text: "2+2?".into(),
                ..Default::default()
            },
            conversation_id: Some("new".into()),
            endpoint: EndpointOptions {
                endpoint: "openAI".into(),
                model: Some("gpt-4o".into()),
                base_url: "http://localhost:3080/api/ask/".into(),
                options,
            },
            initial_response: Message {
                message_id: "r1".into(),
                ..Default::default()
            },
            origin: Origin::AddedRequest,
            ..Default::default()
        }
    }

    #[test]
    fn body_carries_flags_and_options() {
        let body = project_body(&submission());
        assert_eq!(body["text"], "2+2?");
        assert_eq!(body["conversationId"], Value::Null);
        assert_eq!(body["isAddedRequest"], true);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["responseMessageId"], "r1");
    }

    #[test]
    fn urls_join_cleanly() {
        let s = submission();
        assert_eq!(stream_url(&s), "http://localhost:3080/api/ask/openAI");
        assert_eq!(abort_url(&s), "http://localhost:3080/api/ask/abort");
    }
}
