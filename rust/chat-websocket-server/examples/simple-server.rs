//! Minimal CLI to run the chat WebSocket server with SQLite persistence
//!
//! Usage:
//!   cargo run -p chat-websocket-server --example simple-server -- [--host 127.0.0.1] [--port 9000] [--db chat.db]
//!   cargo run -p chat-websocket-server --example simple-server -- --addr 0.0.0.0:9000 --user alice=s3cret --path /ws
//!
//! Notes:
//! - Tokens are looked up in the `users` table; `--user NAME=TOKEN` seeds it.
//! - Connections without a token join as guests.
//! - Defaults to 127.0.0.1:9000 and ./chat.db if not specified.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use std::{error::Error, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use chat_websocket_server::protocol::ChannelId;
use chat_websocket_server::{
    serve_incoming_with_config, ChatStore, Identity, MuteRecord, ServerConfig, StoreError,
    StoredMessage, UserId,
};

#[derive(Parser, Debug)]
#[command(name = "simple-server", about = "Chat WebSocket server with SQLite persistence")]
struct Args {
    #[arg(short = 'a', long, value_name = "ADDR", conflicts_with_all = ["host", "port"], help = "Full socket address to bind, e.g. 0.0.0.0:9000")]
    addr: Option<String>,

    #[arg(
        short = 'H',
        long,
        default_value = "127.0.0.1",
        help = "Host to bind when --addr not provided"
    )]
    host: String,

    #[arg(
        short = 'p',
        long,
        default_value_t = 9000,
        help = "Port to bind when --addr not provided"
    )]
    port: u16,

    #[arg(
        short = 'd',
        long = "db",
        value_name = "PATH",
        default_value = "chat.db",
        help = "SQLite database path"
    )]
    db: PathBuf,

    #[arg(long, value_name = "PATH", help = "Only accept WebSocket upgrades on this path, e.g. /ws")]
    path: Option<String>,

    #[arg(long, value_name = "MS", help = "Close connections that send no hello within this window")]
    handshake_timeout_ms: Option<u64>,

    #[arg(long, value_name = "N", help = "Replay at most N messages to a joining member")]
    history_limit: Option<usize>,

    #[arg(long = "user", value_name = "NAME=TOKEN", help = "Register a user (repeatable)")]
    users: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();

    let args = Args::parse();
    let addr = args
        .addr
        .unwrap_or_else(|| format!("{}:{}", args.host, args.port));
    let db_path = args.db;

    init_db(&db_path).await?;
    for entry in &args.users {
        let Some((name, token)) = entry.split_once('=') else {
            warn!(%entry, "ignoring --user without NAME=TOKEN");
            continue;
        };
        let (db, name, token) = (db_path.clone(), name.to_string(), token.to_string());
        tokio::task::spawn_blocking(move || upsert_user(&db, &name, &token))
            .await
            .map_err(|e| format!("task join error: {e}"))??;
    }

    let db_for_auth = db_path.clone();
    let authenticate = Arc::new(move |token: String| {
        let db_path = db_for_auth.clone();
        let fut = async move {
            tokio::task::spawn_blocking(move || find_user_by_token(&db_path, &token))
                .await
                .map_err(|e| format!("task join error: {e}"))?
        };
        let fut: chat_websocket_server::AuthFuture = Box::pin(fut);
        fut
    });

    let cfg = ServerConfig {
        authenticate: Some(authenticate),
        store: Arc::new(SqliteStore { path: db_path.clone() }),
        path: args.path,
        handshake_timeout_ms: args.handshake_timeout_ms,
        history_limit: args.history_limit,
        ..Default::default()
    };

    info!(%addr, db=%db_path.display().to_string(), "starting chat-websocket-server");
    info!("Press Ctrl-C to stop.");

    let listener = TcpListener::bind(&addr).await?;
    serve_incoming_with_config(listener, cfg).await
}

async fn init_db(path: &std::path::Path) -> Result<(), Box<dyn Error + Send + Sync>> {
    let p = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), Box<dyn Error + Send + Sync>> {
        let conn = rusqlite::Connection::open(p)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                token TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                channel_id INTEGER NOT NULL,
                sender_id INTEGER NOT NULL,
                sender_username TEXT NOT NULL,
                created_at TEXT NOT NULL,
                content TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS messages_by_channel ON messages (channel_id, created_at);
            CREATE TABLE IF NOT EXISTS mutes (
                target_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                issuer_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                reason TEXT NOT NULL,
                PRIMARY KEY (target_id, channel_id)
            );
            "#,
        )?;
        Ok(())
    })
    .await
    .map_err(|e| format!("task join error: {e}"))??;
    Ok(())
}

fn upsert_user(path: &PathBuf, username: &str, token: &str) -> Result<(), String> {
    let conn = rusqlite::Connection::open(path).map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO users (username, token) VALUES (?1, ?2)
         ON CONFLICT(username) DO UPDATE SET token=excluded.token",
        rusqlite::params![username, token],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

fn find_user_by_token(path: &PathBuf, token: &str) -> Result<Identity, String> {
    let conn = rusqlite::Connection::open(path).map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare("SELECT id, username FROM users WHERE token=?1")
        .map_err(|e| e.to_string())?;
    let mut rows = stmt.query(rusqlite::params![token]).map_err(|e| e.to_string())?;
    match rows.next().map_err(|e| e.to_string())? {
        Some(row) => {
            let id: UserId = row.get(0).map_err(|e| e.to_string())?;
            let username: String = row.get(1).map_err(|e| e.to_string())?;
            Ok(Identity::registered(id, username))
        }
        None => Err("unknown token".to_string()),
    }
}

/// `ChatStore` backed by a SQLite file. Each call opens its own connection on
/// the blocking pool.
struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(path)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join error: {e}")))?
        .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

// fixed precision keeps lexicographic order equal to time order
fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_id(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let m = message.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, channel_id, sender_id, sender_username, created_at, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    m.id.to_string(),
                    m.channel_id as i64,
                    m.sender_id,
                    m.sender_username,
                    fmt_time(&m.timestamp),
                    m.content
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_channel_messages(
        &self,
        channel_id: ChannelId,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        // -1 means no limit in SQLite
        let limit = limit.map_or(-1, |n| n as i64);
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, sender_username, created_at, content FROM (
                     SELECT * FROM messages WHERE channel_id=?1 ORDER BY created_at DESC LIMIT ?2
                 ) ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![channel_id as i64, limit], |row| {
                let id: String = row.get(0)?;
                let created_at: String = row.get(3)?;
                Ok(StoredMessage {
                    id: parse_id(&id)?,
                    channel_id,
                    sender_id: row.get(1)?,
                    sender_username: row.get(2)?,
                    timestamp: parse_time(&created_at)?,
                    content: row.get(4)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn get_mute(
        &self,
        target_id: UserId,
        channel_id: ChannelId,
    ) -> Result<Option<MuteRecord>, StoreError> {
        let record = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT issuer_id, created_at, expires_at, reason FROM mutes
                     WHERE target_id=?1 AND channel_id=?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![target_id, channel_id as i64])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };
                let created_at: String = row.get(1)?;
                let expires_at: Option<String> = row.get(2)?;
                Ok(Some(MuteRecord {
                    target_id,
                    issuer_id: row.get(0)?,
                    channel_id,
                    created_at: parse_time(&created_at)?,
                    expires_at: expires_at.as_deref().map(parse_time).transpose()?,
                    reason: row.get(3)?,
                }))
            })
            .await?;
        let now = Utc::now();
        Ok(record.filter(|m| m.is_active_at(now)))
    }

    async fn mute(&self, record: &MuteRecord) -> Result<(), StoreError> {
        let r = record.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO mutes (target_id, channel_id, issuer_id, created_at, expires_at, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(target_id, channel_id) DO UPDATE SET
                     issuer_id=excluded.issuer_id, created_at=excluded.created_at,
                     expires_at=excluded.expires_at, reason=excluded.reason",
                rusqlite::params![
                    r.target_id,
                    r.channel_id as i64,
                    r.issuer_id,
                    fmt_time(&r.created_at),
                    r.expires_at.as_ref().map(fmt_time),
                    r.reason
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn unmute(&self, target_id: UserId, channel_id: ChannelId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM mutes WHERE target_id=?1 AND channel_id=?2",
                rusqlite::params![target_id, channel_id as i64],
            )
            .map(|n| n > 0)
        })
        .await
    }
}
