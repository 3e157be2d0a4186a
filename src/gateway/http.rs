use async_trait::async_trait;
use log::{ debug, info };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE } };
use std::time::Duration;

use crate::cli::Args;
use crate::error::{ ensure_success, ChatError, Result };
use crate::models::chat::NewMessage;
use crate::models::{ Conversation, ConversationList, StartChatResponse };
use super::DispatchGateway;

pub struct HttpGateway {
    http: HttpClient,
    base_url: String,
    admin_cookie: Option<HeaderValue>,
}

impl HttpGateway {
    pub fn new(
        base_url: &str,
        admin_session: Option<&str>,
        admin_cookie_name: &str,
        timeout: Duration
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = HttpClient::builder().default_headers(headers).timeout(timeout).build()?;

        let admin_cookie = match admin_session.map(str::trim).filter(|s| !s.is_empty()) {
            Some(session) => {
                let value = HeaderValue::from_str(&format!("{}={}", admin_cookie_name, session))
                    .map_err(|e| ChatError::Auth(format!("Invalid admin session format: {}", e)))?;
                Some(value)
            }
            None => None,
        };

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_cookie,
        })
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        Self::new(
            &args.backend_url,
            args.admin_session.as_deref(),
            &args.admin_cookie_name,
            Duration::from_secs(args.request_timeout_secs)
        )
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base_url, route)
    }

    fn admin_cookie(&self) -> Result<HeaderValue> {
        self.admin_cookie
            .clone()
            .ok_or_else(|| ChatError::Auth("admin session credential is not configured".to_string()))
    }
}

#[async_trait]
impl DispatchGateway for HttpGateway {
    async fn start_conversation(&self) -> Result<StartChatResponse> {
        let response = self.http.post(self.url("/chat/start")).send().await?;
        let started: StartChatResponse = ensure_success(response, "start chat").await?
            .json().await?;
        info!("Started conversation {}", started.chat_id);
        Ok(started)
    }

    async fn send_student_message(&self, conversation_id: &str, content: &str) -> Result<()> {
        let response = self.http
            .post(self.url(&format!("/chat/{}/message", conversation_id)))
            .json(&NewMessage { content: content.to_string() })
            .send().await?;
        ensure_success(response, "student message").await?;
        debug!("Student message accepted for {}", conversation_id);
        Ok(())
    }

    async fn send_admin_reply(&self, conversation_id: &str, content: &str) -> Result<()> {
        let cookie = self.admin_cookie()?;
        let response = self.http
            .post(self.url(&format!("/admin/chat/{}/reply", conversation_id)))
            .header(COOKIE, cookie)
            .json(&NewMessage { content: content.to_string() })
            .send().await?;
        ensure_success(response, "admin reply").await?;
        debug!("Admin reply accepted for {}", conversation_id);
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let cookie = self.admin_cookie()?;
        let response = self.http.get(self.url("/admin/chats")).header(COOKIE, cookie).send().await?;
        let list: ConversationList = ensure_success(response, "chat listing").await?.json().await?;
        Ok(list.chats)
    }
}
