use clap::{ Parser, Subcommand };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Backend Args ---
    /// Base URL of the chat backend (conversation bootstrap and message submission).
    #[arg(long, env = "BACKEND_URL", default_value = "http://127.0.0.1:8000")]
    pub backend_url: String,

    /// Admin session credential, sent as a cookie on admin routes.
    #[arg(long, env = "ADMIN_SESSION")]
    pub admin_session: Option<String>,

    /// Cookie name carrying the admin session.
    #[arg(long, env = "ADMIN_COOKIE_NAME", default_value = "session")]
    pub admin_cookie_name: String,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "15")]
    pub request_timeout_secs: u64,

    // --- Store Args ---
    /// Message store type (rest, memory)
    #[arg(long, env = "STORE_TYPE", default_value = "rest")]
    pub store_type: String,

    /// Store REST endpoint (e.g., http://127.0.0.1:54321)
    #[arg(long, env = "STORE_URL", default_value = "http://127.0.0.1:54321")]
    pub store_url: String,

    /// API key for the store, sent as `apikey` and as a bearer token.
    #[arg(long, env = "STORE_API_KEY", default_value = "")]
    pub store_api_key: String,

    /// Table holding conversation messages.
    #[arg(long, env = "MESSAGES_TABLE", default_value = "messages")]
    pub messages_table: String,

    /// Table holding call booking requests.
    #[arg(long, env = "FOLLOWUPS_TABLE", default_value = "followups")]
    pub followups_table: String,

    // --- Change Feed Args ---
    /// Realtime websocket endpoint. Derived from STORE_URL when not set.
    #[arg(long, env = "REALTIME_URL")]
    pub realtime_url: Option<String>,

    /// Seconds between channel heartbeats.
    #[arg(long, env = "FEED_HEARTBEAT_SECS", default_value = "25")]
    pub feed_heartbeat_secs: u64,

    /// Seconds to wait for the server to acknowledge a channel join.
    #[arg(long, env = "FEED_JOIN_TIMEOUT_SECS", default_value = "10")]
    pub feed_join_timeout_secs: u64,

    /// Reconnect a dropped channel and re-read history to catch up.
    /// When off, a dropped channel leaves the conversation frozen.
    #[arg(long, env = "FEED_RECONNECT", default_value = "false")]
    pub feed_reconnect: bool,

    /// First reconnect delay in milliseconds; doubles per failed attempt.
    #[arg(long, env = "FEED_BACKOFF_INITIAL_MS", default_value = "500")]
    pub feed_backoff_initial_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds.
    #[arg(long, env = "FEED_BACKOFF_MAX_MS", default_value = "30000")]
    pub feed_backoff_max_ms: u64,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start a new conversation and print its id and greeting.
    Start,

    /// Follow a conversation live until Ctrl-C.
    Watch {
        chat_id: String,
    },

    /// Send a message as the student, or as staff with --admin.
    Send {
        chat_id: String,
        content: String,

        #[arg(long)]
        admin: bool,

        /// Seconds to wait for the message to come back through the change feed.
        #[arg(long, default_value = "3")]
        wait_secs: u64,
    },

    /// List conversations for staff (pending, all, call-scheduled).
    Chats {
        #[arg(long, default_value = "pending")]
        filter: String,
    },

    /// Ask for a call back about a conversation.
    BookCall {
        chat_id: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        phone: String,

        /// Preferred time, RFC 3339 or YYYY-MM-DDTHH:MM (UTC).
        #[arg(long)]
        time: String,
    },

    /// Play a short student/staff exchange against an in-process store.
    Demo,
}

impl Args {
    pub fn log_filter(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}
