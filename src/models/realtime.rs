use serde::{ Serialize, Deserialize };
use serde_json::{ json, Value };

pub const HEARTBEAT_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_CHANGES: &str = "postgres_changes";

/// Envelope shared by every frame on the realtime socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RealtimeFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

pub fn chat_topic(conversation_id: &str) -> String {
    format!("realtime:chat-{}", conversation_id)
}

impl RealtimeFrame {
    pub fn join(
        topic: &str,
        table: &str,
        conversation_id: &str,
        access_token: Option<&str>,
        reference: String
    ) -> Self {
        let mut payload =
            json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "INSERT",
                    "schema": "public",
                    "table": table,
                    "filter": format!("chat_id=eq.{}", conversation_id),
                }],
            },
        });
        if let Some(token) = access_token.filter(|t| !t.is_empty()) {
            payload["access_token"] = Value::String(token.to_string());
        }
        Self {
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload,
            join_ref: Some(reference.clone()),
            reference: Some(reference),
        }
    }

    pub fn leave(topic: &str, reference: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference),
            join_ref: None,
        }
    }

    pub fn heartbeat(reference: String) -> Self {
        Self {
            topic: HEARTBEAT_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference),
            join_ref: None,
        }
    }

    pub fn classify(&self) -> InboundEvent {
        match self.event.as_str() {
            EVENT_REPLY => {
                let status = self.payload
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("error");
                InboundEvent::Reply {
                    reference: self.reference.clone(),
                    ok: status == "ok",
                    response: self.payload.get("response").cloned().unwrap_or(Value::Null),
                }
            }
            EVENT_CHANGES =>
                match serde_json::from_value::<ChangesPayload>(self.payload.clone()) {
                    Ok(ChangesPayload { data }) => InboundEvent::Change(data),
                    Err(e) => InboundEvent::Malformed(e.to_string()),
                }
            // Older servers push the change flat, named after the operation.
            "INSERT" | "UPDATE" | "DELETE" =>
                match serde_json::from_value::<ChangeData>(self.payload.clone()) {
                    Ok(data) => InboundEvent::Change(data),
                    Err(e) => InboundEvent::Malformed(e.to_string()),
                }
            EVENT_ERROR => InboundEvent::ChannelError(self.payload.to_string()),
            EVENT_CLOSE => InboundEvent::ChannelClosed,
            other => InboundEvent::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangesPayload {
    data: ChangeData,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ChangeData {
    #[serde(rename = "type")]
    pub change_type: String,
    pub table: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub record: Value,
}

impl ChangeData {
    pub fn is_insert_into(&self, table: &str) -> bool {
        self.change_type.eq_ignore_ascii_case("INSERT") && self.table == table
    }
}

#[derive(Debug, PartialEq)]
pub enum InboundEvent {
    Reply {
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    Change(ChangeData),
    ChannelError(String),
    ChannelClosed,
    Malformed(String),
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_filters_by_conversation() {
        let frame = RealtimeFrame::join(&chat_topic("c9"), "messages", "c9", Some("key"), "1".into());
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["topic"], "realtime:chat-c9");
        assert_eq!(wire["event"], "phx_join");
        assert_eq!(wire["ref"], "1");
        assert_eq!(wire["join_ref"], "1");
        assert_eq!(wire["payload"]["access_token"], "key");
        let change = &wire["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "messages");
        assert_eq!(change["filter"], "chat_id=eq.c9");
    }

    #[test]
    fn classify_reply_and_change() {
        let reply: RealtimeFrame = serde_json::from_value(
            json!({
                "topic": "realtime:chat-c9",
                "event": "phx_reply",
                "payload": { "status": "ok", "response": {} },
                "ref": "1"
            })
        ).unwrap();
        assert!(
            matches!(reply.classify(), InboundEvent::Reply { ok: true, reference: Some(r), .. } if r == "1")
        );

        let change: RealtimeFrame = serde_json::from_value(
            json!({
                "topic": "realtime:chat-c9",
                "event": "postgres_changes",
                "payload": {
                    "data": {
                        "type": "INSERT",
                        "table": "messages",
                        "schema": "public",
                        "record": { "id": "m1" }
                    },
                    "ids": [1]
                },
                "ref": null
            })
        ).unwrap();
        match change.classify() {
            InboundEvent::Change(data) => {
                assert!(data.is_insert_into("messages"));
                assert_eq!(data.record["id"], "m1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn classify_close_and_unknown() {
        let close = RealtimeFrame {
            topic: "t".into(),
            event: EVENT_CLOSE.into(),
            payload: Value::Null,
            reference: None,
            join_ref: None,
        };
        assert_eq!(close.classify(), InboundEvent::ChannelClosed);
        let presence = RealtimeFrame { event: "presence_state".into(), ..close };
        assert_eq!(presence.classify(), InboundEvent::Other("presence_state".into()));
    }
}
