use log::{ info, warn };
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::backend::Backend;
use crate::error::{ ChatError, Result };
use crate::followup::{ book_call, BookCallRequest };
use crate::gateway::local::STAFF_REQUEST;
use crate::inbox::{ short_label, ChatFilter, InboxPanel };
use crate::models::{ Conversation, Message, Sender };
use crate::store::InMemoryStore;
use crate::synchronizer::ConversationSynchronizer;

pub fn format_message(message: &Message) -> String {
    format!(
        "[{}] {:<7} {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.sender.as_str(),
        message.content
    )
}

pub fn format_conversation(chat: &Conversation) -> String {
    let mut line = format!(
        "{}  {}  {}",
        short_label(&chat.id),
        chat.created_at.format("%Y-%m-%d %H:%M"),
        chat.status.label()
    );
    if !chat.followups.is_empty() {
        line.push_str("  [Call Scheduled]");
    }
    line
}

pub async fn start(backend: &Backend) -> Result<()> {
    let started = backend.gateway.start_conversation().await?;
    println!("chat_id: {}", started.chat_id);
    if let Some(greeting) = started.greeting {
        println!("greeting: {}", greeting);
    }
    Ok(())
}

pub async fn watch(backend: &Backend, chat_id: &str) -> Result<()> {
    let sync = ConversationSynchronizer::open(chat_id, backend).await?;
    let mut receiver = sync.watch();
    let mut printed: HashSet<String> = HashSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        {
            let state = receiver.borrow_and_update();
            for message in &state.messages {
                if printed.insert(message.id.clone()) {
                    println!("{}", format_message(message));
                }
            }
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, closing {}", chat_id);
                break;
            }
            changed = receiver.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    sync.close().await;
    Ok(())
}

/// Sends through a synchronizer and waits up to `wait` for the row to come back.
pub async fn send(
    backend: &Backend,
    chat_id: &str,
    content: &str,
    admin: bool,
    wait: Duration
) -> Result<()> {
    let sync = ConversationSynchronizer::open(chat_id, backend).await?;
    let before: HashSet<String> = sync
        .wait_loaded().await
        .messages.into_iter()
        .map(|m| m.id)
        .collect();

    let result = if admin {
        sync.send_as_admin(content).await
    } else {
        sync.send_as_student(content).await
    };
    if let Err(e) = result {
        sync.close().await;
        if e.is_auth() {
            eprintln!("Admin session rejected; log in again and set ADMIN_SESSION.");
        }
        return Err(e);
    }

    let sender = if admin { Sender::Admin } else { Sender::Student };
    let expected = content.trim();
    let mut receiver = sync.watch();
    let confirmed = matches!(
        timeout(
            wait,
            receiver.wait_for(|state| {
                state.messages
                    .iter()
                    .any(|m| !before.contains(&m.id) && m.sender == sender && m.content == expected)
            })
        ).await,
        Ok(Ok(_))
    );

    if confirmed {
        println!("sent and confirmed");
    } else {
        warn!("No confirmation for {} within {:?}", chat_id, wait);
        println!("sent (not yet visible)");
    }
    sync.close().await;
    Ok(())
}

pub async fn chats(backend: &Backend, filter: &str) -> Result<()> {
    let filter = filter
        .parse::<ChatFilter>()
        .map_err(|e| ChatError::Validation(e.to_string()))?;
    let panel = InboxPanel::load(backend, filter).await?;
    if panel.cards().is_empty() {
        println!("No chats");
    }
    for card in panel.cards() {
        println!("{}", format_conversation(&card.conversation));
        let state = card.sync.wait_loaded().await;
        if let Some(last) = state.messages.last() {
            println!("    {}", format_message(last));
        }
    }
    panel.close_all().await;
    Ok(())
}

pub async fn book(backend: &Backend, chat_id: &str, request: &BookCallRequest) -> Result<()> {
    let followup = book_call(backend.store.as_ref(), chat_id, request).await?;
    println!(
        "Call booked for {} at {}",
        short_label(chat_id),
        followup.preferred_time.format("%Y-%m-%d %H:%M UTC")
    );
    Ok(())
}

/// A student and staff exchange against a throwaway in-process store.
pub async fn demo() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let backend = Backend::in_memory(store, true);

    let started = backend.gateway.start_conversation().await?;
    let chat_id = started.chat_id;
    let sync = ConversationSynchronizer::open(&chat_id, &backend).await?;
    sync.wait_loaded().await;

    sync.send_as_student(STAFF_REQUEST).await?;
    sync.send_as_admin("Hi! Applications close on 30 June.").await?;

    let mut receiver = sync.watch();
    let settled = matches!(
        timeout(Duration::from_secs(2), receiver.wait_for(|state| state.messages.len() >= 3)).await,
        Ok(Ok(_))
    );
    if !settled {
        warn!("Demo feed did not deliver every message in time");
    }
    for message in sync.messages() {
        println!("{}", format_message(&message));
    }

    let request = BookCallRequest {
        email: "student@example.edu".to_string(),
        phone: "+1 555 0100".to_string(),
        preferred_time: "2030-01-15T10:00".to_string(),
    };
    book(&backend, &chat_id, &request).await?;

    sync.close().await;
    chats(&backend, "all").await
}
