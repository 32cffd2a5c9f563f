//! User accounts in SQLite
//!
//! Users are keyed by phone number. The online flag and last-seen time are
//! only a mirror of the presence tracker and are written best-effort.

use super::UserStore;
use crate::error::{Error, Result};
use crate::models::User;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

type UserRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    bool,
    String,
    String,
);

const USER_COLUMNS: &str = "phone, name, email, avatar_url, online, last_seen, created_at";

pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    /// Open `db_path`, creating the file and schema when missing.
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                phone TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT,
                avatar_url TEXT,
                online INTEGER NOT NULL DEFAULT 0,
                last_seen TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("[Users] Database ready at {:?}", db_path);
        Ok(Self { pool })
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::StoreUnavailable(format!("bad timestamp {:?}: {}", raw, e)))
}

fn user_from_row(row: UserRow) -> Result<User> {
    let (phone, name, email, avatar_url, online, last_seen, created_at) = row;
    Ok(User {
        phone,
        name,
        email,
        avatar_url,
        online,
        last_seen: parse_time(&last_seen)?,
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn find(&self, phone: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE phone = ?", USER_COLUMNS);
        let row: Option<UserRow> = sqlx::query_as(&sql)
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;
        row.map(user_from_row).transpose()
    }

    async fn find_many(&self, phones: &[String]) -> Result<Vec<User>> {
        if phones.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; phones.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM users WHERE phone IN ({}) ORDER BY name",
            USER_COLUMNS, placeholders
        );
        let mut query = sqlx::query_as::<_, UserRow>(&sql);
        for phone in phones {
            query = query.bind(phone);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(user_from_row).collect()
    }

    async fn create(&self, user: User) -> Result<User> {
        let result = sqlx::query(
            "INSERT INTO users (phone, name, email, avatar_url, online, last_seen, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.phone)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.avatar_url)
        .bind(user.online)
        .bind(user.last_seen.to_rfc3339())
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("[Users] Registered {} ({})", user.name, user.phone);
                Ok(user)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                Error::ValidationFailed(format!("phone {} is already registered", user.phone)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_presence(
        &self,
        phone: &str,
        online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE users SET online = ?, last_seen = ? WHERE phone = ?")
            .bind(online)
            .bind(last_seen.to_rfc3339())
            .bind(phone)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user {}", phone)));
        }
        Ok(())
    }

    async fn list_except(&self, phone: &str) -> Result<Vec<User>> {
        let sql = format!(
            "SELECT {} FROM users WHERE phone != ? ORDER BY name",
            USER_COLUMNS
        );
        let rows: Vec<UserRow> = sqlx::query_as(&sql)
            .bind(phone)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(user_from_row).collect()
    }
}
