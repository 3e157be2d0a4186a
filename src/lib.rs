pub mod backend;
pub mod cli;
pub mod commands;
pub mod error;
pub mod feed;
pub mod followup;
pub mod gateway;
pub mod inbox;
pub mod models;
pub mod sequence;
pub mod store;
pub mod synchronizer;

use backend::Backend;
use cli::{ Args, Command };
use followup::BookCallRequest;
use log::info;
use std::error::Error;
use std::time::Duration;

fn set_or_unset(value: Option<&str>) -> &'static str {
    match value {
        Some(v) if !v.trim().is_empty() => "set",
        _ => "unset",
    }
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Backend URL: {}", args.backend_url);
    info!("Admin Session: {}", set_or_unset(args.admin_session.as_deref()));
    info!("Admin Cookie Name: {}", args.admin_cookie_name);
    info!("Request Timeout: {}s", args.request_timeout_secs);
    info!("Store Type: {}", args.store_type);
    info!("Store URL: {}", args.store_url);
    info!("Store API Key: {}", set_or_unset(Some(&args.store_api_key)));
    info!("Messages Table: {}", args.messages_table);
    info!("Followups Table: {}", args.followups_table);
    info!("Realtime URL: {}", args.realtime_url.as_deref().unwrap_or("(derived)"));
    info!("Feed Heartbeat: {}s", args.feed_heartbeat_secs);
    info!("Feed Join Timeout: {}s", args.feed_join_timeout_secs);
    info!("Feed Reconnect: {}", args.feed_reconnect);
    if args.feed_reconnect {
        info!("Feed Backoff Initial: {}ms", args.feed_backoff_initial_ms);
        info!("Feed Backoff Max: {}ms", args.feed_backoff_max_ms);
    }
    info!("-------------------------");

    // Demo brings its own in-process backend; every other command builds one from args.
    let backend = || Backend::from_args(&args);
    match &args.command {
        Command::Demo => commands::demo().await?,
        Command::Start => commands::start(&backend()?).await?,
        Command::Watch { chat_id } => commands::watch(&backend()?, chat_id).await?,
        Command::Send { chat_id, content, admin, wait_secs } => {
            let wait = Duration::from_secs(*wait_secs);
            commands::send(&backend()?, chat_id, content, *admin, wait).await?
        }
        Command::Chats { filter } => commands::chats(&backend()?, filter).await?,
        Command::BookCall { chat_id, email, phone, time } => {
            let request = BookCallRequest {
                email: email.clone(),
                phone: phone.clone(),
                preferred_time: time.clone(),
            };
            commands::book(&backend()?, chat_id, &request).await?
        }
    }

    Ok(())
}
