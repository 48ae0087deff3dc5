use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use crate::models::{AssetId, Fill, Position};
use crate::session::Session;
use crate::Result;

/// Version of the persisted document shape. Older documents are migrated
/// field-by-field on load, never read raw.
pub const SCHEMA_VERSION: u32 = 2;

const STATE_KEY: &str = "paperbot:state";
const DEBOUNCE_MS: u64 = 500;

/// The single serializable document owned by this core.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateDocument {
    pub schema_version: u32,
    pub positions: HashMap<AssetId, Position>,
    pub trades: HashMap<Uuid, Fill>,
    pub session: Session,
    #[serde(default)]
    pub session_history: Vec<Session>,
}

impl StateDocument {
    pub fn new(session: Session) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            positions: HashMap::new(),
            trades: HashMap::new(),
            session,
            session_history: Vec::new(),
        }
    }
}

/// Bring a raw persisted document up to the current schema.
///
/// v1 differences: session carried `realized` (now `realized_sol`) and had
/// no `discipline_score`, `equity_history`, `events`; the document had no
/// `session_history`.
pub fn migrate_document(mut raw: Value) -> Result<StateDocument> {
    let version = raw
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    if version > SCHEMA_VERSION {
        return Err(format!(
            "persisted document version {} is newer than supported {}",
            version, SCHEMA_VERSION
        )
        .into());
    }

    if version < 2 {
        migrate_v1_to_v2(&mut raw)?;
    }

    Ok(serde_json::from_value(raw)?)
}

fn migrate_v1_to_v2(raw: &mut Value) -> Result<()> {
    let doc = raw
        .as_object_mut()
        .ok_or("persisted document is not an object")?;

    doc.entry("positions").or_insert_with(|| Value::Object(Default::default()));
    doc.entry("trades").or_insert_with(|| Value::Object(Default::default()));
    doc.entry("session_history").or_insert_with(|| Value::Array(Vec::new()));

    let session = doc
        .entry("session")
        .or_insert_with(|| serde_json::json!({}))
        .as_object_mut()
        .ok_or("persisted session is not an object")?;

    if let Some(realized) = session.remove("realized") {
        session.insert("realized_sol".to_string(), realized);
    }
    session.entry("realized_sol").or_insert_with(|| Value::from(0.0));
    session.entry("balance").or_insert_with(|| Value::from(0.0));
    session.entry("win_streak").or_insert_with(|| Value::from(0));
    session.entry("loss_streak").or_insert_with(|| Value::from(0));
    session.entry("discipline_score").or_insert_with(|| Value::from(100.0));
    session.entry("fill_ids").or_insert_with(|| Value::Array(Vec::new()));
    session.entry("equity_history").or_insert_with(|| Value::Array(Vec::new()));
    session.entry("events").or_insert_with(|| Value::Array(Vec::new()));
    session
        .entry("started_at")
        .or_insert_with(|| Value::from(chrono::Utc::now().to_rfc3339()));

    doc.insert("schema_version".to_string(), Value::from(2));
    tracing::info!("migrated persisted document v1 -> v2");
    Ok(())
}

/// Redis persistence for the state document.
pub struct RedisPersistence {
    conn: ConnectionManager,
}

impl RedisPersistence {
    /// Connect to Redis with a bounded connection attempt.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Load and migrate the persisted document, if any.
    pub async fn load(&mut self) -> Result<Option<StateDocument>> {
        let raw: Option<String> = self.conn.get(STATE_KEY).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let value: Value = serde_json::from_str(&raw)?;
        let doc = migrate_document(value)?;
        tracing::info!(
            positions = doc.positions.len(),
            trades = doc.trades.len(),
            "Loaded state document from Redis"
        );
        Ok(Some(doc))
    }

    pub async fn save(&mut self, doc: &StateDocument) -> Result<()> {
        let json = serde_json::to_string(doc)?;
        self.conn.set::<_, _, ()>(STATE_KEY, json).await?;
        Ok(())
    }
}

/// Write urgency. Fill-producing operations persist immediately; everything
/// else batches into one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistRequest {
    Debounced,
    Immediate,
}

/// Cheap, cloneable handle for requesting writes. Send failures mean the
/// writer is gone; they are logged and swallowed, matching the rule that
/// in-memory state stays the source of truth.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistRequest>,
}

impl PersistHandle {
    pub fn debounced(&self) {
        if self.tx.send(PersistRequest::Debounced).is_err() {
            tracing::warn!("persistence writer gone, dropping debounced write");
        }
    }

    pub fn immediate(&self) {
        if self.tx.send(PersistRequest::Immediate).is_err() {
            tracing::warn!("persistence writer gone, dropping immediate write");
        }
    }

    /// A handle wired to nothing, for tests.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Spawn the writer task. `snapshot_fn` captures the live state and is
/// called at flush time so batched mutations collapse into one document.
pub fn spawn_writer<F>(
    mut persistence: Option<RedisPersistence>,
    snapshot_fn: F,
) -> (PersistHandle, tokio::task::JoinHandle<()>)
where
    F: Fn() -> StateDocument + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistRequest>();
    let handle = PersistHandle { tx };

    let task = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            if request == PersistRequest::Debounced {
                // Coalesce rapid mutations into one write; an immediate
                // request cuts the window short.
                let window = sleep(Duration::from_millis(DEBOUNCE_MS));
                tokio::pin!(window);
                loop {
                    tokio::select! {
                        _ = &mut window => break,
                        more = rx.recv() => match more {
                            None | Some(PersistRequest::Immediate) => break,
                            Some(PersistRequest::Debounced) => continue,
                        },
                    }
                }
            }

            let doc = snapshot_fn();
            match persistence.as_mut() {
                Some(store) => {
                    if let Err(e) = store.save(&doc).await {
                        tracing::warn!(error = %e, "state write failed, keeping in-memory state");
                    }
                }
                None => tracing::debug!("no persistence configured, skipping write"),
            }
        }
    });

    (handle, task)
}
