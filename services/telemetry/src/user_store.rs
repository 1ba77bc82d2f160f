use crate::frame_store::StoreError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::{info, instrument};
use uuid::Uuid;

/// Authorization role of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// An account; each account is also one camera/sensor stream
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: Role,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub germination_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: i64,
    username: String,
    role: Role,
    api_key: String,
    germination_date: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            role: row.role,
            api_key: row.api_key,
            germination_date: row.germination_date.map(|d| d.and_utc()),
            created_at: row.created_at.and_utc(),
        }
    }
}

/// Fields an administrator may change on an account
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub role: Option<Role>,
    /// Issue a fresh API key, invalidating the current one
    #[serde(default)]
    pub rotate_api_key: bool,
}

/// Generate a new random API key
pub fn generate_api_key() -> String {
    Uuid::new_v4().simple().to_string()
}

const USER_COLUMNS: &str = "id, username, role, api_key, germination_date, created_at";

/// Account storage in SQLite
#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an account; a key is generated when none is given
    #[instrument(skip(self, api_key))]
    pub async fn create(&self, username: &str, role: Role, api_key: Option<String>) -> Result<User, StoreError> {
        let api_key = api_key.unwrap_or_else(generate_api_key);
        let created_at = Utc::now().naive_utc();

        let id = sqlx::query(
            "INSERT INTO users (username, role, api_key, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(role)
        .bind(&api_key)
        .bind(created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!(user_id = id, username = %username, role = ?role, "User created");

        Ok(User {
            id,
            username: username.to_string(),
            role,
            api_key,
            germination_date: None,
            created_at: created_at.and_utc(),
        })
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let row =
            sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?"))
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    /// Resolve the account owning an API key
    pub async fn get_by_api_key(&self, api_key: &str) -> Result<Option<User>, StoreError> {
        let row =
            sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE api_key = ?"))
                .bind(api_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Apply an administrative update
    #[instrument(skip(self, update))]
    pub async fn update(&self, id: i64, update: &UserUpdate) -> Result<User, StoreError> {
        let mut user = self.get(id).await?.ok_or(StoreError::NotFound)?;

        if let Some(ref username) = update.username {
            user.username = username.clone();
        }
        if let Some(role) = update.role {
            user.role = role;
        }
        if update.rotate_api_key {
            user.api_key = generate_api_key();
        }

        sqlx::query("UPDATE users SET username = ?, role = ?, api_key = ? WHERE id = ?")
            .bind(&user.username)
            .bind(user.role)
            .bind(&user.api_key)
            .bind(id)
            .execute(&self.pool)
            .await?;

        info!(user_id = id, rotated_key = update.rotate_api_key, "User updated");
        Ok(user)
    }

    /// Delete an account together with its frames and readings
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        info!(user_id = id, "User deleted");
        Ok(())
    }

    /// Set the date timelapses of this account start from by default
    pub async fn set_germination_date(&self, id: i64, date: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET germination_date = ? WHERE id = ?")
            .bind(date.map(|d| d.naive_utc()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Replace the API key of an account
    #[instrument(skip(self, api_key))]
    pub async fn set_api_key(&self, id: i64, api_key: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET api_key = ? WHERE id = ?")
            .bind(api_key)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Make sure the administrator account exists; runs once at startup
    ///
    /// A configured key replaces the stored one. The flag is set when a key
    /// had to be generated for a new account.
    pub async fn ensure_admin(&self, username: &str, api_key: Option<String>) -> Result<(User, bool), StoreError> {
        let Some(mut admin) = self.get_by_username(username).await? else {
            let generated = api_key.is_none();
            let admin = self.create(username, Role::Admin, api_key).await?;
            return Ok((admin, generated));
        };

        if admin.role != Role::Admin {
            admin = self
                .update(
                    admin.id,
                    &UserUpdate {
                        role: Some(Role::Admin),
                        ..Default::default()
                    },
                )
                .await?;
        }

        if let Some(key) = api_key {
            if key != admin.api_key {
                self.set_api_key(admin.id, &key).await?;
                info!(user_id = admin.id, "Administrator API key replaced by configured key");
                admin.api_key = key;
            }
        }

        Ok((admin, false))
    }
}
