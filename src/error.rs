use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Network or channel failure: history fetch, feed connect, dispatch call.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Admin credential missing, expired or rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

impl ChatError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::Auth(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ChatError::Transport(_))
    }

    /// Maps a non-success HTTP status (plus the response body, if any) onto the taxonomy.
    pub fn from_status(status: StatusCode, context: &str, body: &str) -> Self {
        let detail = if body.trim().is_empty() {
            format!("{} returned {}", context, status)
        } else {
            format!("{} returned {}: {}", context, status, body.trim())
        };
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChatError::Auth(detail),
            StatusCode::NOT_FOUND => ChatError::NotFound(detail),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ChatError::Validation(detail)
            }
            _ => ChatError::Transport(detail),
        }
    }
}

/// Passes a 2xx response through, otherwise reads the body and maps the status.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    context: &str
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChatError::from_status(status, context, &body))
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ChatError::from_status(status, "request", &err.to_string()),
            None => ChatError::Transport(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(format!("websocket: {}", err))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Transport(format!("invalid JSON: {}", err))
    }
}

impl From<url::ParseError> for ChatError {
    fn from(err: url::ParseError) -> Self {
        ChatError::Transport(format!("invalid URL: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert!(ChatError::from_status(StatusCode::UNAUTHORIZED, "reply", "").is_auth());
        assert!(ChatError::from_status(StatusCode::FORBIDDEN, "reply", "").is_auth());
        assert!(matches!(
            ChatError::from_status(StatusCode::NOT_FOUND, "send", ""),
            ChatError::NotFound(_)
        ));
        assert!(matches!(
            ChatError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "send", "bad"),
            ChatError::Validation(_)
        ));
        assert!(ChatError::from_status(StatusCode::BAD_GATEWAY, "send", "").is_transport());
    }

    #[test]
    fn body_is_kept_in_detail() {
        let err = ChatError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "start", " boom ");
        assert_eq!(
            err.to_string(),
            "Transport error: start returned 500 Internal Server Error: boom"
        );
    }
}
