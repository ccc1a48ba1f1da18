//! Persistent user records.
//!
//! One JSON file mapping user id to record. The auth subsystem owns this
//! file; the terminal core only ever sees the principal derived from it.
//! Port ranges are allocated at first login: ten ports per user, starting
//! at the configured base.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalTabs {
    pub tabs: Vec<String>,
    pub active_tab: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub email: String,
    pub first_login: String,
    pub last_login: String,
    pub ip_addresses: Vec<String>,
    pub login_count: u32,
    pub port_start: u16,
    pub port_end: u16,
    pub volume_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_tabs: Option<TerminalTabs>,
}

/// File-backed user store. Mutations serialize through one async mutex.
pub struct UserStore {
    path: PathBuf,
    port_base: u16,
    uploads_root: PathBuf,
    write_lock: Mutex<()>,
}

impl UserStore {
    pub fn new(
        path: impl Into<PathBuf>,
        port_base: u16,
        uploads_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            path: path.into(),
            port_base,
            uploads_root: uploads_root.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, UserRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(contents) => {
                serde_json::from_slice(&contents).context("parsing user records file")
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err).context("reading user records file"),
        }
    }

    async fn save(&self, users: &BTreeMap<String, UserRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("creating user records directory")?;
            }
        }
        let contents =
            serde_json::to_vec_pretty(users).context("serializing user records")?;
        tokio::fs::write(&self.path, contents)
            .await
            .context("writing user records file")?;
        Ok(())
    }

    /// Record a login, creating the user and allocating a port range on
    /// first contact. Returns the up-to-date record.
    pub async fn record_login(
        &self,
        user_id: &str,
        email: &str,
        client_ip: &str,
    ) -> Result<UserRecord> {
        let _guard = self.write_lock.lock().await;
        let mut users = self.load().await?;
        let now = Utc::now().to_rfc3339();

        let record = match users.get_mut(user_id) {
            Some(record) => {
                record.last_login = now;
                record.login_count += 1;
                record.email = email.to_string();
                if !record.ip_addresses.iter().any(|ip| ip == client_ip) {
                    record.ip_addresses.push(client_ip.to_string());
                }
                record.clone()
            }
            None => {
                let port_start = self.port_base + (users.len() as u16) * 10;
                let record = UserRecord {
                    email: email.to_string(),
                    first_login: now.clone(),
                    last_login: now,
                    ip_addresses: vec![client_ip.to_string()],
                    login_count: 1,
                    port_start,
                    port_end: port_start + 9,
                    volume_path: self.uploads_root.join(user_id).display().to_string(),
                    terminal_tabs: None,
                };
                users.insert(user_id.to_string(), record.clone());
                record
            }
        };

        self.save(&users).await?;
        Ok(record)
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.load().await?.remove(user_id))
    }

    pub async fn all(&self) -> Result<BTreeMap<String, UserRecord>> {
        self.load().await
    }

    /// Persist the user's terminal tab layout.
    pub async fn save_terminal_tabs(&self, user_id: &str, tabs: TerminalTabs) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut users = self.load().await?;
        let record = users
            .get_mut(user_id)
            .with_context(|| format!("user {user_id} not found"))?;
        record.terminal_tabs = Some(tabs);
        self.save(&users).await
    }
}
