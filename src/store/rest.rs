use async_trait::async_trait;
use log::{ debug, error };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE } };
use serde_json::Value;
use std::time::Duration;

use crate::cli::Args;
use crate::error::{ ensure_success, ChatError, Result };
use crate::models::chat::{ FollowupRow, NewMessageRow };
use crate::models::{ Followup, Message, Sender };
use super::MessageStore;

const PREFER: &str = "Prefer";

/// Table access over the store's REST surface (`/rest/v1/{table}`).
pub struct RestMessageStore {
    http: HttpClient,
    base_url: String,
    messages_table: String,
    followups_table: String,
}

impl RestMessageStore {
    pub fn new(
        base_url: &str,
        api_key: &str,
        messages_table: &str,
        followups_table: &str,
        timeout: Duration
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if !api_key.is_empty() {
            let key = HeaderValue::from_str(api_key).map_err(|e|
                ChatError::Validation(format!("Invalid store API key format: {}", e))
            )?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                ChatError::Validation(format!("Invalid store API key format: {}", e))
            )?;
            headers.insert("apikey", key);
            headers.insert(AUTHORIZATION, bearer);
        }

        let http = HttpClient::builder().default_headers(headers).timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            messages_table: messages_table.to_string(),
            followups_table: followups_table.to_string(),
        })
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        Self::new(
            &args.store_url,
            &args.store_api_key,
            &args.messages_table,
            &args.followups_table,
            Duration::from_secs(args.request_timeout_secs)
        )
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }
}

#[async_trait]
impl MessageStore for RestMessageStore {
    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let filter = format!("eq.{}", conversation_id);
        let response = self.http
            .get(self.table_url(&self.messages_table))
            .query(&[("chat_id", filter.as_str()), ("order", "created_at.asc"), ("select", "*")])
            .send().await?;
        let rows: Vec<Value> = ensure_success(response, "history fetch").await?.json().await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<Message>(row) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    error!("Error parsing message row for {}: {}", conversation_id, e);
                }
            }
        }
        // Stable: rows sharing a timestamp keep the store's order.
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!("Fetched {} messages for {}", messages.len(), conversation_id);
        Ok(messages)
    }

    async fn insert(&self, conversation_id: &str, sender: Sender, content: &str) -> Result<Message> {
        let row = NewMessageRow {
            chat_id: conversation_id.to_string(),
            sender,
            content: content.to_string(),
        };
        let response = self.http
            .post(self.table_url(&self.messages_table))
            .header(PREFER, "return=representation")
            .json(&row)
            .send().await?;
        let mut inserted: Vec<Message> = ensure_success(response, "message insert").await?
            .json().await?;
        if inserted.is_empty() {
            return Err(ChatError::Transport("store returned no row for insert".to_string()));
        }
        Ok(inserted.swap_remove(0))
    }

    async fn insert_followup(&self, conversation_id: &str, followup: &Followup) -> Result<()> {
        let row = FollowupRow {
            chat_id: conversation_id.to_string(),
            followup: followup.clone(),
        };
        let response = self.http
            .post(self.table_url(&self.followups_table))
            .header(PREFER, "return=minimal")
            .json(&row)
            .send().await?;
        ensure_success(response, "followup insert").await?;
        Ok(())
    }
}
