use log::info;
use std::fmt;

use crate::error::{ ChatError, Result };
use crate::models::chat::parse_timestamp;
use crate::models::Followup;
use crate::store::MessageStore;

const MIN_PHONE_LEN: usize = 6;

/// Call-back request as typed in by the student.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BookCallRequest {
    pub email: String,
    pub phone: String,
    pub preferred_time: String,
}

/// Per-field problems, in field order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldErrors(pub Vec<(&'static str, String)>);

impl FieldErrors {
    fn push(&mut self, field: &'static str, message: &str) {
        self.0.push((field, message.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, message)| message.as_str())
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0
            .iter()
            .map(|(field, message)| format!("{}: {}", field, message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl From<FieldErrors> for ChatError {
    fn from(errors: FieldErrors) -> Self {
        ChatError::Validation(errors.to_string())
    }
}

fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() {
        return false;
    }
    match domain.find('.') {
        Some(dot) => dot > 0 && !domain.ends_with('.'),
        None => false,
    }
}

fn phone_error(phone: &str) -> Option<&'static str> {
    let allowed = |c: char| c.is_ascii_digit() || c == '+' || c == '-' || c.is_whitespace();
    if !phone.chars().all(allowed) {
        Some("Invalid phone number")
    } else if phone.chars().count() < MIN_PHONE_LEN {
        Some("Phone number must be at least 6 characters")
    } else {
        None
    }
}

impl BookCallRequest {
    pub fn validate(&self) -> std::result::Result<Followup, FieldErrors> {
        let mut errors = FieldErrors::default();

        let email = self.email.trim();
        if !is_valid_email(email) {
            errors.push("email", "Invalid email address");
        }

        let phone = self.phone.trim();
        if let Some(message) = phone_error(phone) {
            errors.push("phone", message);
        }

        let time = self.preferred_time.trim();
        let preferred_time = if time.is_empty() {
            errors.push("preferred_time", "Preferred time is required");
            None
        } else {
            let parsed = parse_timestamp(time);
            if parsed.is_none() {
                errors.push("preferred_time", "Invalid preferred time");
            }
            parsed
        };

        match preferred_time {
            Some(preferred_time) if errors.is_empty() =>
                Ok(Followup {
                    student_email: email.to_string(),
                    student_phone: phone.to_string(),
                    preferred_time,
                }),
            _ => Err(errors),
        }
    }
}

/// Validates `request` and records it against the conversation.
pub async fn book_call(
    store: &dyn MessageStore,
    conversation_id: &str,
    request: &BookCallRequest
) -> Result<Followup> {
    if conversation_id.trim().is_empty() {
        return Err(ChatError::Validation("conversation id must not be empty".to_string()));
    }
    let followup = request.validate()?;
    store.insert_followup(conversation_id, &followup).await?;
    info!("Call booked for {} at {}", conversation_id, followup.preferred_time);
    Ok(followup)
}
