//! JSON-file-backed [`Store`] implementation.
//!
//! Three documents under the data dir (`servers.json`, `oauth_events.json`,
//! `tokens.json`). Every write rewrites one whole document through a temp
//! file + rename, serialized by a single writer lock, so readers in other
//! processes never observe a torn file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::record::{OAuthCompletionEvent, TokenRecord, UpstreamRecord};
use crate::{FailureLog, Store};

const SERVERS_FILE: &str = "servers.json";
const OAUTH_EVENTS_FILE: &str = "oauth_events.json";
const TOKENS_FILE: &str = "tokens.json";

pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating the directory if needed).
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data dir: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The failure log lives next to the JSON documents.
    pub fn failure_log(&self) -> FailureLog {
        FailureLog::new(&self.dir)
    }

    async fn read_document<T>(&self, file: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.dir.join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse store document: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read store document: {}", path.display()))
            }
        }
    }

    async fn write_document<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.dir.join(file);
        let rendered =
            serde_json::to_vec_pretty(value).context("Failed to serialize store document")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, rendered)
            .await
            .with_context(|| format!("Failed to write store document: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace store document: {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn save_upstream(&self, record: &UpstreamRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut servers: HashMap<String, UpstreamRecord> =
            self.read_document(SERVERS_FILE).await?;
        let mut record = record.clone();
        record.updated_at = Utc::now();
        if let Some(existing) = servers.get(&record.name) {
            record.created_at = existing.created_at;
        }
        servers.insert(record.name.clone(), record);
        self.write_document(SERVERS_FILE, &servers).await
    }

    async fn get_upstream(&self, name: &str) -> Result<Option<UpstreamRecord>> {
        let servers: HashMap<String, UpstreamRecord> = self.read_document(SERVERS_FILE).await?;
        Ok(servers.get(name).cloned())
    }

    async fn load_upstreams(&self) -> Result<Vec<UpstreamRecord>> {
        let servers: HashMap<String, UpstreamRecord> = self.read_document(SERVERS_FILE).await?;
        let mut records: Vec<UpstreamRecord> = servers.into_values().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn delete_upstream(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut servers: HashMap<String, UpstreamRecord> =
            self.read_document(SERVERS_FILE).await?;
        if servers.remove(name).is_some() {
            self.write_document(SERVERS_FILE, &servers).await?;
        }
        Ok(())
    }

    async fn record_oauth_completion(&self, event: &OAuthCompletionEvent) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut events: Vec<OAuthCompletionEvent> = self.read_document(OAUTH_EVENTS_FILE).await?;
        events.push(event.clone());
        self.write_document(OAUTH_EVENTS_FILE, &events).await
    }

    async fn unprocessed_oauth_completions(&self) -> Result<Vec<OAuthCompletionEvent>> {
        let events: Vec<OAuthCompletionEvent> = self.read_document(OAUTH_EVENTS_FILE).await?;
        Ok(events.into_iter().filter(|e| !e.processed).collect())
    }

    async fn mark_oauth_completion_processed(
        &self,
        server_name: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut events: Vec<OAuthCompletionEvent> = self.read_document(OAUTH_EVENTS_FILE).await?;
        let mut changed = false;
        for event in &mut events {
            if event.server_name == server_name && event.completed_at == completed_at {
                changed = !event.processed;
                event.processed = true;
            }
        }
        if changed {
            self.write_document(OAUTH_EVENTS_FILE, &events).await?;
        }
        Ok(())
    }

    async fn cleanup_old_oauth_completions(&self, max_age: Duration) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut events: Vec<OAuthCompletionEvent> = self.read_document(OAUTH_EVENTS_FILE).await?;
        let before = events.len();
        events.retain(|e| !(e.processed && e.completed_at < cutoff));
        let removed = before - events.len();
        if removed > 0 {
            self.write_document(OAUTH_EVENTS_FILE, &events).await?;
        }
        Ok(removed)
    }

    async fn save_token(&self, token: &TokenRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tokens: HashMap<String, TokenRecord> = self.read_document(TOKENS_FILE).await?;
        tokens.insert(token.server_name.clone(), token.clone());
        self.write_document(TOKENS_FILE, &tokens).await
    }

    async fn get_token(
        &self,
        server_name: &str,
        server_url: Option<&str>,
    ) -> Result<Option<TokenRecord>> {
        let tokens: HashMap<String, TokenRecord> = self.read_document(TOKENS_FILE).await?;
        Ok(tokens.get(server_name).cloned().filter(|token| {
            match (server_url, token.server_url.as_deref()) {
                (Some(wanted), Some(stored)) => wanted == stored,
                _ => true,
            }
        }))
    }

    async fn delete_token(&self, server_name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tokens: HashMap<String, TokenRecord> = self.read_document(TOKENS_FILE).await?;
        if tokens.remove(server_name).is_some() {
            self.write_document(TOKENS_FILE, &tokens).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_config::{UpstreamConfig, UpstreamTransport};
    use fleet_core::ServerState;

    fn record(name: &str) -> UpstreamRecord {
        UpstreamRecord::from_config(&UpstreamConfig::new(
            name,
            UpstreamTransport::Stdio {
                command: "uvx".to_string(),
                args: vec![],
                env: HashMap::new(),
                working_dir: None,
            },
        ))
    }

    #[tokio::test]
    async fn save_is_an_upsert_keyed_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let mut rec = record("git");
        store.save_upstream(&rec).await.unwrap();

        rec.tool_count = 9;
        rec.ever_connected = true;
        store.save_upstream(&rec).await.unwrap();

        let loaded = store.get_upstream("git").await.unwrap().unwrap();
        assert_eq!(loaded.tool_count, 9);
        assert!(loaded.ever_connected);
        assert_eq!(store.load_upstreams().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn save_preserves_created_at_across_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let rec = record("git");
        store.save_upstream(&rec).await.unwrap();
        let first = store.get_upstream("git").await.unwrap().unwrap();

        let mut updated = first.clone();
        updated.tool_count = 3;
        store.save_upstream(&updated).await.unwrap();
        let second = store.get_upstream("git").await.unwrap().unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn auto_disable_fields_survive_history_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let mut rec = record("flaky");
        rec.server_state = ServerState::AutoDisabled;
        rec.auto_disable_reason = Some("auto-disabled after 3 consecutive failures".into());
        rec.auto_disable_threshold = 3;
        store.save_upstream(&rec).await.unwrap();

        // An incidental history update carries the full record.
        rec.tool_count = 5;
        store.save_upstream(&rec).await.unwrap();

        let loaded = store.get_upstream("flaky").await.unwrap().unwrap();
        assert_eq!(loaded.server_state, ServerState::AutoDisabled);
        assert!(loaded.auto_disable_reason.is_some());
        assert_eq!(loaded.auto_disable_threshold, 3);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save_upstream(&record("git")).await.unwrap();
        store.delete_upstream("git").await.unwrap();
        assert!(store.get_upstream("git").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oauth_events_processed_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let event = OAuthCompletionEvent::new("github");
        store.record_oauth_completion(&event).await.unwrap();

        let pending = store.unprocessed_oauth_completions().await.unwrap();
        assert_eq!(pending.len(), 1);

        store
            .mark_oauth_completion_processed("github", event.completed_at)
            .await
            .unwrap();
        assert!(
            store
                .unprocessed_oauth_completions()
                .await
                .unwrap()
                .is_empty()
        );

        // Idempotent: marking again changes nothing.
        store
            .mark_oauth_completion_processed("github", event.completed_at)
            .await
            .unwrap();
        assert!(
            store
                .unprocessed_oauth_completions()
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn cleanup_drops_only_old_processed_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let mut old_processed = OAuthCompletionEvent::new("a");
        old_processed.completed_at = Utc::now() - chrono::Duration::hours(48);
        old_processed.processed = true;
        let mut old_pending = OAuthCompletionEvent::new("b");
        old_pending.completed_at = Utc::now() - chrono::Duration::hours(48);
        let fresh = OAuthCompletionEvent::new("c");

        for event in [&old_processed, &old_pending, &fresh] {
            store.record_oauth_completion(event).await.unwrap();
        }

        let removed = store
            .cleanup_old_oauth_completions(Duration::from_secs(60 * 60 * 24))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = store.unprocessed_oauth_completions().await.unwrap();
        let names: Vec<&str> = remaining.iter().map(|e| e.server_name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn token_lookup_respects_url_binding() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let token = TokenRecord {
            server_name: "github".into(),
            server_url: Some("https://mcp.github.example/mcp".into()),
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: None,
        };
        store.save_token(&token).await.unwrap();

        assert!(store.get_token("github", None).await.unwrap().is_some());
        assert!(
            store
                .get_token("github", Some("https://mcp.github.example/mcp"))
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .get_token("github", Some("https://other.example/mcp"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.get_token("absent", None).await.unwrap().is_none());

        store.delete_token("github").await.unwrap();
        assert!(store.get_token("github", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_documents_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.load_upstreams().await.unwrap().is_empty());
        assert!(
            store
                .unprocessed_oauth_completions()
                .await
                .unwrap()
                .is_empty()
        );
        assert!(store.get_token("x", None).await.unwrap().is_none());
    }
}
