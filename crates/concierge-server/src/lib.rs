use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use concierge_config::{Config, Directory};
use concierge_contracts::{
    ConversationTurn, ErrorBody, ErrorResponse, EventKind, InboundEvent, Role, WebhookPayload,
};
use concierge_kernel::{
    classify_event, find_directory_row, greeting_text, normalize_user_id, preferred_name,
    reply_thread_token, shape_reply_text, tabular_records, AdmissionState, AdmissionVerdict,
    BoundedCache, ThreadGate,
};
use reqwest::Client;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tokio::sync::Mutex;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/slack/events", post(events))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    bot_user_id: String,
    admission: Arc<Mutex<AdmissionState>>,
    gate: Arc<Mutex<ThreadGate>>,
    store: Arc<Mutex<StoreBackend>>,
    slack: Arc<SlackClient>,
    generator: Arc<GeminiClient>,
    resolver: Arc<NameResolver>,
    /// One async mutex per canonical user id, serializing the history
    /// load-append-persist sequence for that user.
    history_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };

        let slack = Arc::new(SlackClient::new(
            cfg.slack.api_base.clone(),
            cfg.slack.bot_token.clone(),
            Duration::from_millis(cfg.slack.timeout_ms),
        )?);

        let bot_user_id = match cfg
            .slack
            .bot_user_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            Some(configured) => normalize_user_id(configured),
            None => slack
                .auth_test()
                .await
                .map_err(|e| format!("resolving bot user id via auth.test failed: {e}"))?,
        };

        let directory = match &cfg.directory {
            Some(directory_cfg) => Some(DirectoryClient::new(directory_cfg)?),
            None => None,
        };

        Ok(Self {
            bot_user_id,
            admission: Arc::new(Mutex::new(AdmissionState::new(cfg.limits.dedup_capacity))),
            gate: Arc::new(Mutex::new(ThreadGate::new(cfg.limits.gate_capacity))),
            store: Arc::new(Mutex::new(store)),
            generator: Arc::new(GeminiClient::new(&cfg)?),
            resolver: Arc::new(NameResolver {
                cache: StdMutex::new(BoundedCache::new(cfg.limits.name_cache_capacity)),
                slack: slack.clone(),
                directory,
            }),
            slack,
            history_locks: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    async fn process_event(&self, event: InboundEvent) {
        let exchange_id = format!("xchg_{}", uuid::Uuid::new_v4().as_simple());

        let verdict = {
            let mut admission = self.admission.lock().await;
            admission.admit(&event, &self.bot_user_id)
        };
        if let AdmissionVerdict::Dropped { reason } = verdict {
            tracing::debug!(%exchange_id, reason, kind = ?event.kind, "event not admitted");
            return;
        }

        match event.kind {
            EventKind::ThreadStarted => self.handle_thread_started(&exchange_id, event).await,
            EventKind::Message | EventKind::Mention => {
                self.handle_conversation(&exchange_id, event).await
            }
        }
    }

    async fn handle_thread_started(&self, exchange_id: &str, event: InboundEvent) {
        let Some(thread_ts) = event.thread_ts.clone().filter(|v| !v.is_empty()) else {
            tracing::debug!(%exchange_id, "thread started without thread token, dropping");
            return;
        };
        let channel_id = match event.channel_id.clone().filter(|v| !v.is_empty()) {
            Some(channel) => channel,
            None => {
                // The event sometimes arrives without a channel; open a DM
                // with the user instead of giving up.
                let Some(user) = event.user_id.as_deref() else {
                    tracing::debug!(%exchange_id, "thread started without channel or user, dropping");
                    return;
                };
                match self
                    .slack
                    .open_direct_conversation(&normalize_user_id(user))
                    .await
                {
                    Ok(channel) => channel,
                    Err(error) => {
                        tracing::warn!(%exchange_id, %error, "opening direct conversation failed, abandoning greeting");
                        return;
                    }
                }
            }
        };

        if self.gate.lock().await.is_greeted(&channel_id, &thread_ts) {
            tracing::debug!(%exchange_id, %channel_id, %thread_ts, "thread already greeted");
            return;
        }

        let name = match event.user_id.as_deref() {
            Some(user) => self.resolver.resolve(user).await,
            None => None,
        };
        let greeting = greeting_text(name.as_deref());

        match self
            .slack
            .post_message(&channel_id, Some(&thread_ts), &greeting)
            .await
        {
            Ok(_) => {
                self.gate.lock().await.mark_greeted(&channel_id, &thread_ts);
                tracing::info!(%exchange_id, %channel_id, %thread_ts, "thread greeted");
            }
            Err(error) => {
                tracing::warn!(%exchange_id, %error, "greeting delivery failed, thread stays ungreeted");
            }
        }
    }

    async fn handle_conversation(&self, exchange_id: &str, event: InboundEvent) {
        if event.kind == EventKind::Message && event.subtype.is_some() {
            tracing::debug!(%exchange_id, subtype = ?event.subtype, "message with subtype, dropping");
            return;
        }
        let Some(channel_id) = event.channel_id.clone().filter(|v| !v.is_empty()) else {
            tracing::debug!(%exchange_id, "conversation event without channel, dropping");
            return;
        };
        let thread_ts = reply_thread_token(&event);

        if event.kind == EventKind::Message {
            let Some(thread) = thread_ts.as_deref() else {
                tracing::debug!(%exchange_id, "message without thread token, dropping");
                return;
            };
            if !self.gate.lock().await.is_greeted(&channel_id, thread) {
                tracing::debug!(%exchange_id, %channel_id, thread, "thread not activated, dropping message");
                return;
            }
        }

        let Some(user_raw) = event.user_id.clone() else {
            tracing::debug!(%exchange_id, "conversation event without user, dropping");
            return;
        };
        let user_id = normalize_user_id(&user_raw);
        if user_id.is_empty() {
            tracing::debug!(%exchange_id, "conversation event with unusable user id, dropping");
            return;
        }

        let history_lock = self.history_lock(&user_id);
        let _guard = history_lock.lock().await;

        let mut history = { self.store.lock().await.load_history(&user_id) };
        history.push(ConversationTurn::user(event.text.clone()));

        let raw_reply = match self.generator.generate(&history).await {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(%exchange_id, %error, "generation failed, abandoning exchange");
                return;
            }
        };
        let reply = shape_reply_text(&raw_reply);
        history.push(ConversationTurn::assistant(reply.clone()));

        if let Err(error) = { self.store.lock().await.save_history(&user_id, &history) } {
            tracing::warn!(%exchange_id, %error, "persisting history failed, abandoning exchange");
            return;
        }

        match self
            .slack
            .post_message(&channel_id, thread_ts.as_deref(), &reply)
            .await
        {
            Ok(delivered_ts) => {
                self.admission.lock().await.record_replied(&event);
                tracing::info!(
                    %exchange_id,
                    %channel_id,
                    %delivered_ts,
                    turns = history.len(),
                    "reply delivered"
                );
            }
            Err(error) => {
                tracing::warn!(%exchange_id, %error, "reply delivery failed, exchange dropped");
            }
        }
    }

    fn history_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.history_locks.lock().expect("history lock map poisoned");
        // Drop entries no task currently holds.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn events(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: ErrorBody {
                        code: "invalid_payload".to_string(),
                        message: e.to_string(),
                    },
                }),
            )
                .into_response();
        }
    };

    if let Some(challenge) = payload.challenge.clone() {
        return Json(json!({ "challenge": challenge })).into_response();
    }

    if let Some(event) = classify_event(&payload) {
        // Acknowledge the delivery immediately; the exchange continues in its
        // own task and never reports back to the transport.
        let state = state.clone();
        tokio::spawn(async move {
            state.process_event(event).await;
        });
    }

    StatusCode::OK.into_response()
}

#[derive(Default)]
struct MemoryStore {
    histories: HashMap<String, Vec<ConversationTurn>>,
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

struct SqliteStore {
    conn: Connection,
}

impl StoreBackend {
    /// Store unavailability is reported as an empty history, not an error.
    fn load_history(&self, user_id: &str) -> Vec<ConversationTurn> {
        match self {
            StoreBackend::Memory(store) => {
                store.histories.get(user_id).cloned().unwrap_or_default()
            }
            StoreBackend::Sqlite(store) => match store.load_history(user_id) {
                Ok(turns) => turns,
                Err(error) => {
                    tracing::warn!(%error, %user_id, "history load failed, treating as empty");
                    Vec::new()
                }
            },
        }
    }

    fn save_history(&mut self, user_id: &str, turns: &[ConversationTurn]) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.histories.insert(user_id.to_string(), turns.to_vec());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_history(user_id, turns),
        }
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                user_id TEXT PRIMARY KEY,
                history_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn load_history(&self, user_id: &str) -> Result<Vec<ConversationTurn>, String> {
        let history_json: Option<String> = self
            .conn
            .query_row(
                "SELECT history_json FROM conversations WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        match history_json {
            Some(v) => serde_json::from_str(&v).map_err(|e| e.to_string()),
            None => Ok(Vec::new()),
        }
    }

    fn save_history(&mut self, user_id: &str, turns: &[ConversationTurn]) -> Result<(), String> {
        let history_json = serde_json::to_string(turns).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "
                INSERT INTO conversations(user_id, history_json, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(user_id) DO UPDATE SET
                    history_json=excluded.history_json,
                    updated_at=excluded.updated_at
                ",
                params![user_id, history_json, Utc::now().to_rfc3339()],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

struct SlackClient {
    api_base: String,
    bot_token: String,
    client: Client,
}

struct UserProfile {
    display_name: String,
    real_name: String,
}

impl UserProfile {
    fn best_name(&self) -> Option<String> {
        for candidate in [&self.display_name, &self.real_name] {
            let trimmed = candidate.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        None
    }
}

impl SlackClient {
    fn new(api_base: String, bot_token: String, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            api_base,
            bot_token,
            client,
        })
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, String> {
        let response = self
            .client
            .post(format!("{}/{method}", self.api_base))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("{method} transport error: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("{method} returned HTTP {status}"));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| format!("{method} returned invalid JSON: {e}"))?;
        if payload["ok"].as_bool() != Some(true) {
            let error = payload["error"].as_str().unwrap_or("unknown");
            return Err(format!("{method} failed: {error}"));
        }
        Ok(payload)
    }

    async fn auth_test(&self) -> Result<String, String> {
        let payload = self.call("auth.test", json!({})).await?;
        payload["user_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "auth.test response missing user_id".to_string())
    }

    /// Returns the delivered timestamp token.
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, String> {
        let mut body = json!({
            "channel": channel,
            "text": text,
            "mrkdwn": true,
        });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = json!(ts);
        }
        let payload = self.call("chat.postMessage", body).await?;
        Ok(payload["ts"].as_str().unwrap_or_default().to_string())
    }

    async fn open_direct_conversation(&self, user_id: &str) -> Result<String, String> {
        let payload = self
            .call("conversations.open", json!({ "users": user_id }))
            .await?;
        payload["channel"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "conversations.open response missing channel id".to_string())
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<UserProfile>, String> {
        let payload = self.call("users.info", json!({ "user": user_id })).await?;
        let profile = &payload["user"]["profile"];
        if profile.is_null() {
            return Ok(None);
        }
        Ok(Some(UserProfile {
            display_name: profile["display_name"].as_str().unwrap_or_default().to_string(),
            real_name: profile["real_name"].as_str().unwrap_or_default().to_string(),
        }))
    }
}

struct GeminiClient {
    api_base: String,
    api_key: String,
    model: String,
    client: Client,
}

impl GeminiClient {
    fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.generation.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            api_base: cfg.generation.api_base.clone(),
            api_key: cfg.generation.api_key.clone(),
            model: cfg.generation.model.clone(),
            client,
        })
    }

    /// One stateless generation call over the full history. The API only
    /// accepts `user`/`model` roles.
    async fn generate(&self, turns: &[ConversationTurn]) -> Result<String, String> {
        let contents: Vec<Value> = turns
            .iter()
            .map(|turn| {
                json!({
                    "role": match turn.role {
                        Role::User => "user",
                        Role::Assistant => "model",
                    },
                    "parts": [{ "text": turn.text }],
                })
            })
            .collect();
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        );
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&json!({ "contents": contents }))
            .send()
            .await
            .map_err(|e| format!("generation transport error: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("generation API {status}: {body}"));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| format!("generation response invalid JSON: {e}"))?;
        if let Some(message) = payload["error"]["message"].as_str() {
            return Err(format!("generation error: {message}"));
        }
        let text = payload["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part["text"].as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();
        Ok(text)
    }
}

struct DirectoryClient {
    api_base: String,
    sheet_id: String,
    api_key: String,
    range: String,
    client: Client,
}

impl DirectoryClient {
    fn new(cfg: &Directory) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            api_base: cfg.api_base.clone(),
            sheet_id: cfg.sheet_id.clone(),
            api_key: cfg.api_key.clone(),
            range: cfg.range.clone(),
            client,
        })
    }

    /// The full sheet is fetched on every lookup; nothing is persisted
    /// locally. No-match and lookup failure both report absent.
    async fn find_record(&self, canonical_id: &str) -> Option<BTreeMap<String, String>> {
        let rows = match self.fetch_rows().await {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(%error, "directory fetch failed, reporting no match");
                return None;
            }
        };
        find_directory_row(&rows, canonical_id).cloned()
    }

    async fn fetch_rows(&self) -> Result<Vec<BTreeMap<String, String>>, String> {
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}?key={}",
            self.api_base, self.sheet_id, self.range, self.api_key
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("directory transport error: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("directory API returned HTTP {status}"));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| format!("directory response invalid JSON: {e}"))?;
        let values: Vec<Vec<String>> = payload["values"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        row.as_array()
                            .map(|cells| cells.iter().map(cell_text).collect())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(tabular_records(&values))
    }
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

struct NameResolver {
    cache: StdMutex<BoundedCache>,
    slack: Arc<SlackClient>,
    directory: Option<DirectoryClient>,
}

impl NameResolver {
    /// Best-effort display name for a raw identifier. The directory's
    /// preferred name overrides the platform profile; only resolved names
    /// are cached.
    async fn resolve(&self, raw_id: &str) -> Option<String> {
        let canonical = normalize_user_id(raw_id);
        if canonical.is_empty() {
            return None;
        }
        if let Some(cached) = self
            .cache
            .lock()
            .expect("name cache poisoned")
            .get(&canonical)
        {
            return Some(cached);
        }

        let mut name = match self.slack.fetch_profile(&canonical).await {
            Ok(profile) => profile.and_then(|p| p.best_name()),
            Err(error) => {
                tracing::warn!(%error, user_id = %canonical, "profile lookup failed");
                None
            }
        };
        if let Some(directory) = &self.directory {
            if let Some(row) = directory.find_record(&canonical).await {
                if let Some(preferred) = preferred_name(&row) {
                    name = Some(preferred);
                }
            }
        }

        if let Some(resolved) = &name {
            self.cache
                .lock()
                .expect("name cache poisoned")
                .insert(&canonical, resolved);
        }
        name
    }
}
