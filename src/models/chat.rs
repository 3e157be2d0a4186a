use chrono::{ DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc };
use serde::{ Deserialize, Deserializer, Serialize, Serializer };
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Student,
    Bot,
    Admin,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Student => "student",
            Sender::Bot => "bot",
            Sender::Admin => "admin",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored utterance. Field names follow the store's `messages` columns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "chat_id", deserialize_with = "id_string")]
    pub conversation_id: String,
    pub sender: Sender,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Bot,
    AwaitingHuman,
    Human,
    Closed,
}

impl ChatStatus {
    /// Lower sorts first in the admin inbox.
    pub fn priority(&self) -> u8 {
        match self {
            ChatStatus::AwaitingHuman => 1,
            ChatStatus::Human => 2,
            ChatStatus::Bot => 3,
            ChatStatus::Closed => 4,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChatStatus::Bot => "Bot",
            ChatStatus::AwaitingHuman => "Pending reply",
            ChatStatus::Human => "Replied",
            ChatStatus::Closed => "Closed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Followup {
    pub student_email: String,
    pub student_phone: String,
    #[serde(with = "timestamp")]
    pub preferred_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub status: ChatStatus,
    #[serde(default)]
    pub followups: Vec<Followup>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartChatResponse {
    #[serde(deserialize_with = "id_string")]
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConversationList {
    #[serde(default)]
    pub chats: Vec<Conversation>,
}

/// Body of both gateway send routes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewMessage {
    pub content: String,
}

/// Row written to the store; `id` and `created_at` are assigned server-side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewMessageRow {
    pub chat_id: String,
    pub sender: Sender,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FollowupRow {
    pub chat_id: String,
    #[serde(flatten)]
    pub followup: Followup,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error> where D: Deserializer<'de> {
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

/// Accepts RFC 3339, offset-less ISO / Postgres text timestamps (taken as UTC)
/// and epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub mod timestamp {
    use super::*;
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Text(String),
        Millis(i64),
    }

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
        where S: Serializer
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
        where D: Deserializer<'de>
    {
        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Text(raw) =>
                parse_timestamp(&raw).ok_or_else(||
                    D::Error::custom(format!("invalid timestamp '{}'", raw))
                ),
            RawTimestamp::Millis(ms) =>
                Utc.timestamp_millis_opt(ms)
                    .single()
                    .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {}", ms))),
        }
    }
}
