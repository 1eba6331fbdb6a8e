//! Database layer — migrations plus the project and pledge store.

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::errors::{ReconcilerError, Result};
use crate::types::{Pledge, PledgeKey, Project, ProjectId};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let url = if url.contains('?') || url.contains(":memory:") {
        url
    } else {
        format!("{url}?mode=rwc")
    };
    connect(&url, 5).await
}

pub(crate) async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Projects
// ─────────────────────────────────────────────────────────

pub async fn save_project(pool: &SqlitePool, project: &Project) -> Result<()> {
    let body = serde_json::to_string(project)?;
    sqlx::query("INSERT OR REPLACE INTO projects (id, body) VALUES (?1, ?2)")
        .bind(project.id.as_str())
        .bind(body)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove a project together with its pledges.
pub async fn delete_project(pool: &SqlitePool, id: &ProjectId) -> Result<bool> {
    sqlx::query("DELETE FROM pledges WHERE project_id = ?1")
        .bind(id.as_str())
        .execute(pool)
        .await?;
    let rows = sqlx::query("DELETE FROM projects WHERE id = ?1")
        .bind(id.as_str())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

/// All stored projects, oldest first.
pub async fn load_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT body FROM projects ORDER BY created_at ASC, rowid ASC")
            .fetch_all(pool)
            .await?;
    rows.into_iter()
        .map(|(body,)| serde_json::from_str::<Project>(&body).map_err(ReconcilerError::from))
        .collect()
}

// ─────────────────────────────────────────────────────────
// Pledges
// ─────────────────────────────────────────────────────────

/// Insert or replace the pledge stored under `key`.
pub async fn save_pledge(pool: &SqlitePool, key: &PledgeKey, pledge: &Pledge) -> Result<()> {
    let body = serde_json::to_string(pledge)?;
    sqlx::query("INSERT OR REPLACE INTO pledges (pledge_key, project_id, body) VALUES (?1, ?2, ?3)")
        .bind(key.to_hex())
        .bind(pledge.project_id.as_str())
        .bind(body)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_pledge(pool: &SqlitePool, key: &PledgeKey) -> Result<bool> {
    let rows = sqlx::query("DELETE FROM pledges WHERE pledge_key = ?1")
        .bind(key.to_hex())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

/// All stored pledges, oldest first.
pub async fn load_pledges(pool: &SqlitePool) -> Result<Vec<Pledge>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT body FROM pledges ORDER BY created_at ASC, rowid ASC")
            .fetch_all(pool)
            .await?;
    rows.into_iter()
        .map(|(body,)| serde_json::from_str::<Pledge>(&body).map_err(ReconcilerError::from))
        .collect()
}
