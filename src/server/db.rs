use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the Minigram database.
///
/// Wraps `MinigramDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<MinigramDb>>,
}

impl DbHandle {
    pub fn new(db: MinigramDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MinigramDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct MinigramDb {
    conn: Connection,
}

/// Owned patch for task updates; absent fields keep their current value.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub assigned_user_id: Option<Option<String>>,
    pub due_date: Option<Option<String>>,
    pub due_time: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub not_urgent: Option<bool>,
}

/// Owned patch for account settings updates.
#[derive(Debug, Default, Clone)]
pub struct SettingsUpdate {
    pub display_name: Option<String>,
    pub theme: Option<String>,
    pub email_notifications: Option<bool>,
    pub push_notifications: Option<bool>,
}

impl MinigramDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS minigraphs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    purpose TEXT NOT NULL DEFAULT '',
                    url TEXT NOT NULL,
                    screenshot_url TEXT NOT NULL DEFAULT '',
                    facebook INTEGER NOT NULL DEFAULT 0,
                    instagram INTEGER NOT NULL DEFAULT 0,
                    twitter INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    team_id TEXT,
                    owner_id TEXT NOT NULL,
                    assigned_user_id TEXT,
                    due_date TEXT,
                    due_time TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    not_urgent INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS chats (
                    task_id INTEGER PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
                    channel_id TEXT NOT NULL,
                    participants TEXT NOT NULL DEFAULT '[]'
                );

                CREATE TABLE IF NOT EXISTS file_uploads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    file_name TEXT NOT NULL,
                    stored_path TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    message TEXT NOT NULL,
                    read INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS account_settings (
                    user_id TEXT PRIMARY KEY,
                    display_name TEXT,
                    theme TEXT NOT NULL DEFAULT 'system',
                    email_notifications INTEGER NOT NULL DEFAULT 1,
                    push_notifications INTEGER NOT NULL DEFAULT 1,
                    stripe_customer_id TEXT,
                    subscription_status TEXT
                );

                CREATE TABLE IF NOT EXISTS branding (
                    user_id TEXT PRIMARY KEY,
                    header TEXT,
                    footer TEXT,
                    font TEXT,
                    palette TEXT
                );

                CREATE TABLE IF NOT EXISTS rate_limits (
                    identity TEXT NOT NULL,
                    window_start INTEGER NOT NULL,
                    count INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (identity, window_start)
                );

                CREATE INDEX IF NOT EXISTS idx_minigraphs_user ON minigraphs(user_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assigned_user_id);
                CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);
                CREATE INDEX IF NOT EXISTS idx_uploads_task ON file_uploads(task_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Minigraphs ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_minigraph(
        &self,
        user_id: &str,
        name: &str,
        purpose: &str,
        url: &str,
        screenshot_url: &str,
        facebook: bool,
        instagram: bool,
        twitter: bool,
    ) -> Result<Minigraph> {
        self.conn.execute(
            "INSERT INTO minigraphs (user_id, name, purpose, url, screenshot_url, facebook, instagram, twitter)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![user_id, name, purpose, url, screenshot_url, facebook, instagram, twitter],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_minigraph(id)?
            .ok_or_else(|| anyhow::anyhow!("Minigraph {} missing after insert", id))
    }

    pub fn list_minigraphs(&self) -> Result<Vec<Minigraph>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, name, purpose, url, screenshot_url, facebook, instagram, twitter, created_at
             FROM minigraphs ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], row_to_minigraph)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_minigraph(&self, id: i64) -> Result<Option<Minigraph>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, name, purpose, url, screenshot_url, facebook, instagram, twitter, created_at
                 FROM minigraphs WHERE id = ?1",
                params![id],
                row_to_minigraph,
            )
            .optional()?;
        Ok(row)
    }

    /// Pure overwrite of every editable field. Re-applying identical values
    /// leaves the row unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn update_minigraph(
        &self,
        id: i64,
        name: &str,
        purpose: &str,
        url: &str,
        screenshot_url: &str,
        facebook: bool,
        instagram: bool,
        twitter: bool,
    ) -> Result<Option<Minigraph>> {
        let updated = self.conn.execute(
            "UPDATE minigraphs SET name = ?2, purpose = ?3, url = ?4, screenshot_url = ?5,
                    facebook = ?6, instagram = ?7, twitter = ?8
             WHERE id = ?1",
            params![id, name, purpose, url, screenshot_url, facebook, instagram, twitter],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_minigraph(id)
    }

    /// Hard row removal; no soft-delete.
    pub fn delete_minigraph(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM minigraphs WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_task(
        &self,
        title: &str,
        description: &str,
        team_id: Option<&str>,
        owner_id: &str,
        assigned_user_id: Option<&str>,
        due_date: Option<&str>,
        due_time: Option<&str>,
        not_urgent: bool,
    ) -> Result<Task> {
        self.conn.execute(
            "INSERT INTO tasks (title, description, team_id, owner_id, assigned_user_id, due_date, due_time, not_urgent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![title, description, team_id, owner_id, assigned_user_id, due_date, due_time, not_urgent],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?
            .ok_or_else(|| anyhow::anyhow!("Task {} missing after insert", id))
    }

    /// Tasks the user owns or is assigned to.
    pub fn list_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, team_id, owner_id, assigned_user_id, due_date, due_time, status, not_urgent, created_at
             FROM tasks WHERE owner_id = ?1 OR assigned_user_id = ?1
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, description, team_id, owner_id, assigned_user_id, due_date, due_time, status, not_urgent, created_at
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(row)
    }

    pub fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<Option<Task>> {
        let Some(current) = self.get_task(id)? else {
            return Ok(None);
        };

        let title = update.title.as_deref().unwrap_or(&current.title);
        let description = update
            .description
            .as_deref()
            .unwrap_or(&current.description);
        let assigned = match &update.assigned_user_id {
            Some(value) => value.clone(),
            None => current.assigned_user_id.clone(),
        };
        let due_date = match &update.due_date {
            Some(value) => value.clone(),
            None => current.due_date.clone(),
        };
        let due_time = match &update.due_time {
            Some(value) => value.clone(),
            None => current.due_time.clone(),
        };
        let status = update.status.unwrap_or(current.status);
        let not_urgent = update.not_urgent.unwrap_or(current.not_urgent);

        self.conn.execute(
            "UPDATE tasks SET title = ?2, description = ?3, assigned_user_id = ?4,
                    due_date = ?5, due_time = ?6, status = ?7, not_urgent = ?8
             WHERE id = ?1",
            params![id, title, description, assigned, due_date, due_time, status.as_str(), not_urgent],
        )?;
        self.get_task(id)
    }

    /// Removes only the task row; chats and file_uploads cascade via FK.
    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ── Chats ─────────────────────────────────────────────────────────

    pub fn create_chat(
        &self,
        task_id: i64,
        channel_id: &str,
        participants: &[String],
    ) -> Result<Chat> {
        let participants_json = serde_json::to_string(participants)?;
        self.conn.execute(
            "INSERT INTO chats (task_id, channel_id, participants) VALUES (?1, ?2, ?3)",
            params![task_id, channel_id, participants_json],
        )?;
        Ok(Chat {
            task_id,
            channel_id: channel_id.to_string(),
            participants: participants.to_vec(),
        })
    }

    pub fn get_chat_for_task(&self, task_id: i64) -> Result<Option<Chat>> {
        let row = self
            .conn
            .query_row(
                "SELECT task_id, channel_id, participants FROM chats WHERE task_id = ?1",
                params![task_id],
                |row| {
                    let participants_json: String = row.get(2)?;
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, participants_json))
                },
            )
            .optional()?;
        match row {
            Some((task_id, channel_id, participants_json)) => Ok(Some(Chat {
                task_id,
                channel_id,
                participants: serde_json::from_str(&participants_json)
                    .context("Corrupt participants JSON")?,
            })),
            None => Ok(None),
        }
    }

    // ── File uploads ──────────────────────────────────────────────────

    pub fn record_file_upload(
        &self,
        task_id: i64,
        file_name: &str,
        stored_path: &str,
    ) -> Result<FileUpload> {
        self.conn.execute(
            "INSERT INTO file_uploads (task_id, file_name, stored_path) VALUES (?1, ?2, ?3)",
            params![task_id, file_name, stored_path],
        )?;
        let id = self.conn.last_insert_rowid();
        let row = self.conn.query_row(
            "SELECT id, task_id, file_name, stored_path, created_at FROM file_uploads WHERE id = ?1",
            params![id],
            |row| {
                Ok(FileUpload {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    file_name: row.get(2)?,
                    stored_path: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )?;
        Ok(row)
    }

    // ── Notifications ─────────────────────────────────────────────────

    pub fn create_notification(&self, user_id: &str, message: &str) -> Result<Notification> {
        self.conn.execute(
            "INSERT INTO notifications (user_id, message) VALUES (?1, ?2)",
            params![user_id, message],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_notification(id)?
            .ok_or_else(|| anyhow::anyhow!("Notification {} missing after insert", id))
    }

    pub fn get_notification(&self, id: i64) -> Result<Option<Notification>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, message, read, created_at FROM notifications WHERE id = ?1",
                params![id],
                row_to_notification,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, message, read, created_at FROM notifications
             WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_notification)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Single-field toggle; scoped to the owning user.
    pub fn mark_notification_read(&self, id: i64, user_id: &str) -> Result<Option<Notification>> {
        let updated = self.conn.execute(
            "UPDATE notifications SET read = 1 WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_notification(id)
    }

    // ── Account settings ──────────────────────────────────────────────

    /// Lazily materialize the settings row on first read.
    pub fn get_or_create_settings(&self, user_id: &str) -> Result<AccountSettings> {
        self.conn.execute(
            "INSERT INTO account_settings (user_id) VALUES (?1) ON CONFLICT(user_id) DO NOTHING",
            params![user_id],
        )?;
        self.conn
            .query_row(
                "SELECT user_id, display_name, theme, email_notifications, push_notifications,
                        stripe_customer_id, subscription_status
                 FROM account_settings WHERE user_id = ?1",
                params![user_id],
                row_to_settings,
            )
            .map_err(Into::into)
    }

    pub fn update_settings(
        &self,
        user_id: &str,
        update: &SettingsUpdate,
    ) -> Result<AccountSettings> {
        let current = self.get_or_create_settings(user_id)?;
        let display_name = match &update.display_name {
            Some(value) => Some(value.clone()),
            None => current.display_name.clone(),
        };
        let theme = update.theme.as_deref().unwrap_or(&current.theme);
        let email = update
            .email_notifications
            .unwrap_or(current.email_notifications);
        let push = update
            .push_notifications
            .unwrap_or(current.push_notifications);
        self.conn.execute(
            "UPDATE account_settings SET display_name = ?2, theme = ?3,
                    email_notifications = ?4, push_notifications = ?5
             WHERE user_id = ?1",
            params![user_id, display_name, theme, email, push],
        )?;
        self.get_or_create_settings(user_id)
    }

    /// Write-once assignment of the billing customer id: the column is only
    /// set while it is still NULL, so a concurrent loser adopts the winner's
    /// id instead of overwriting it. Returns the id that actually stuck.
    pub fn set_stripe_customer_if_absent(&self, user_id: &str, customer_id: &str) -> Result<String> {
        self.get_or_create_settings(user_id)?;
        self.conn.execute(
            "UPDATE account_settings SET stripe_customer_id = ?2
             WHERE user_id = ?1 AND stripe_customer_id IS NULL",
            params![user_id, customer_id],
        )?;
        let stored: String = self.conn.query_row(
            "SELECT stripe_customer_id FROM account_settings WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(stored)
    }

    /// Last-write-wins status update keyed by billing customer id. Repeated
    /// delivery of the same webhook event reapplies the same value.
    pub fn update_subscription_by_customer(
        &self,
        customer_id: &str,
        status: &str,
    ) -> Result<usize> {
        let updated = self.conn.execute(
            "UPDATE account_settings SET subscription_status = ?2 WHERE stripe_customer_id = ?1",
            params![customer_id, status],
        )?;
        Ok(updated)
    }

    // ── Branding ──────────────────────────────────────────────────────

    pub fn get_branding(&self, user_id: &str) -> Result<Option<Branding>> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, header, footer, font, palette FROM branding WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(Branding {
                        user_id: row.get(0)?,
                        header: row.get(1)?,
                        footer: row.get(2)?,
                        font: row.get(3)?,
                        palette: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_branding(&self, branding: &Branding) -> Result<()> {
        self.conn.execute(
            "INSERT INTO branding (user_id, header, footer, font, palette)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                header = excluded.header, footer = excluded.footer,
                font = excluded.font, palette = excluded.palette",
            params![
                branding.user_id,
                branding.header,
                branding.footer,
                branding.font,
                branding.palette
            ],
        )?;
        Ok(())
    }

    // ── Rate limits ───────────────────────────────────────────────────

    /// Atomic increment-and-read of the fixed-window counter.
    pub fn increment_rate_counter(&self, identity: &str, window_start: i64) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "INSERT INTO rate_limits (identity, window_start, count) VALUES (?1, ?2, 1)
             ON CONFLICT(identity, window_start) DO UPDATE SET count = count + 1
             RETURNING count",
            params![identity, window_start],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ── Row mappers ───────────────────────────────────────────────────────

fn row_to_minigraph(row: &rusqlite::Row<'_>) -> rusqlite::Result<Minigraph> {
    Ok(Minigraph {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        purpose: row.get(3)?,
        url: row.get(4)?,
        screenshot_url: row.get(5)?,
        facebook: row.get(6)?,
        instagram: row.get(7)?,
        twitter: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(8)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        team_id: row.get(3)?,
        owner_id: row.get(4)?,
        assigned_user_id: row.get(5)?,
        due_date: row.get(6)?,
        due_time: row.get(7)?,
        status: TaskStatus::from_str(&status_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        not_urgent: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        message: row.get(2)?,
        read: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_settings(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountSettings> {
    Ok(AccountSettings {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        theme: row.get(2)?,
        email_notifications: row.get(3)?,
        push_notifications: row.get(4)?,
        stripe_customer_id: row.get(5)?,
        subscription_status: row.get(6)?,
    })
}
