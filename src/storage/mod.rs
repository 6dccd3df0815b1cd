//! Persistence layer.
//!
//! Durable Round/PotItem/Participant/TradeRecord rows in SQLite via sqlx.
//! One authoritative process writes; the pool is capped at a single
//! connection, which also makes `sqlite::memory:` behave as one database
//! in tests. Decimals and timestamps are stored as TEXT to keep values
//! exact and the schema portable.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{
    Participant, PotItem, Round, RoundStatus, TradeKind, TradeRecord, TradeStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rounds (
    id              INTEGER PRIMARY KEY,
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    start_time      TEXT,
    end_time        TEXT,
    total_value     TEXT NOT NULL,
    total_tickets   INTEGER NOT NULL,
    winner          TEXT,
    winning_ticket  INTEGER,
    server_seed     TEXT NOT NULL,
    server_seed_hash TEXT NOT NULL,
    client_seed     TEXT,
    provable_hash   TEXT,
    tax_value       TEXT NOT NULL,
    tax_asset_ids   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
    round_id    INTEGER NOT NULL,
    position    INTEGER NOT NULL,
    asset_id    TEXT NOT NULL,
    name        TEXT NOT NULL,
    image_url   TEXT NOT NULL,
    price       TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    PRIMARY KEY (round_id, asset_id)
);

CREATE TABLE IF NOT EXISTS participants (
    round_id    INTEGER NOT NULL,
    position    INTEGER NOT NULL,
    user_id     TEXT NOT NULL,
    name        TEXT NOT NULL,
    avatar      TEXT NOT NULL,
    trade_url   TEXT,
    value       TEXT NOT NULL,
    tickets     INTEGER NOT NULL,
    PRIMARY KEY (round_id, user_id)
);

CREATE TABLE IF NOT EXISTS trades (
    id          TEXT PRIMARY KEY,
    round_id    INTEGER NOT NULL,
    user_id     TEXT NOT NULL,
    kind        TEXT NOT NULL,
    asset_ids   TEXT NOT NULL,
    value       TEXT NOT NULL,
    status      TEXT NOT NULL,
    offer_id    TEXT,
    note        TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) and migrate the database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {database_url}"))?
            .create_if_missing(true);

        // Single authoritative writer.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {database_url}"))?;

        let store = Store { pool };
        store.migrate().await?;
        info!(database_url, "Storage ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to run schema migration")?;
        Ok(())
    }

    // -- Rounds -----------------------------------------------------------

    /// The next round sequence number. Monotonic across restarts because it
    /// derives from the persisted maximum.
    pub async fn next_round_id(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) + 1 AS next FROM rounds")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read next round id")?;
        Ok(row.try_get("next")?)
    }

    /// Write a round aggregate (header, items, participants) atomically.
    /// Items and participants are replaced wholesale so the rows always
    /// mirror the in-memory aggregate.
    pub async fn save_round(&self, round: &Round) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin tx")?;

        sqlx::query(
            r#"
            INSERT INTO rounds (
                id, status, created_at, start_time, end_time, total_value,
                total_tickets, winner, winning_ticket, server_seed,
                server_seed_hash, client_seed, provable_hash, tax_value,
                tax_asset_ids
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                total_value = excluded.total_value,
                total_tickets = excluded.total_tickets,
                winner = excluded.winner,
                winning_ticket = excluded.winning_ticket,
                client_seed = excluded.client_seed,
                provable_hash = excluded.provable_hash,
                tax_value = excluded.tax_value,
                tax_asset_ids = excluded.tax_asset_ids
            "#,
        )
        .bind(round.id)
        .bind(round.status.to_string())
        .bind(round.created_at.to_rfc3339())
        .bind(round.start_time.map(|t| t.to_rfc3339()))
        .bind(round.end_time.map(|t| t.to_rfc3339()))
        .bind(round.total_value.to_string())
        .bind(round.total_tickets as i64)
        .bind(round.winner.clone())
        .bind(round.winning_ticket.map(|t| t as i64))
        .bind(round.server_seed.clone())
        .bind(round.server_seed_hash.clone())
        .bind(round.client_seed.clone())
        .bind(round.provable_hash.clone())
        .bind(round.tax_value.to_string())
        .bind(serde_json::to_string(&round.tax_asset_ids)?)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert round")?;

        sqlx::query("DELETE FROM items WHERE round_id = ?1")
            .bind(round.id)
            .execute(&mut *tx)
            .await?;
        for (position, item) in round.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO items (round_id, position, asset_id, name, image_url, price, user_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(round.id)
            .bind(position as i64)
            .bind(item.asset_id.clone())
            .bind(item.name.clone())
            .bind(item.image_url.clone())
            .bind(item.price.to_string())
            .bind(item.user_id.clone())
            .execute(&mut *tx)
            .await
            .context("Failed to insert item")?;
        }

        sqlx::query("DELETE FROM participants WHERE round_id = ?1")
            .bind(round.id)
            .execute(&mut *tx)
            .await?;
        for (position, participant) in round.participants.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO participants (round_id, position, user_id, name, avatar, trade_url, value, tickets)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(round.id)
            .bind(position as i64)
            .bind(participant.user_id.clone())
            .bind(participant.name.clone())
            .bind(participant.avatar.clone())
            .bind(participant.trade_url.clone())
            .bind(participant.value.to_string())
            .bind(participant.tickets as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to insert participant")?;
        }

        tx.commit().await.context("Failed to commit round")?;
        debug!(round_id = round.id, "Round saved");
        Ok(())
    }

    /// Load a round aggregate by id.
    pub async fn load_round(&self, id: i64) -> Result<Option<Round>> {
        let header = sqlx::query("SELECT * FROM rounds WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load round header")?;

        let Some(row) = header else {
            return Ok(None);
        };

        let items = sqlx::query("SELECT * FROM items WHERE round_id = ?1 ORDER BY position")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| row_to_item(&r, id))
            .collect::<Result<Vec<_>>>()?;

        let participants =
            sqlx::query("SELECT * FROM participants WHERE round_id = ?1 ORDER BY position")
                .bind(id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| row_to_participant(&r))
                .collect::<Result<Vec<_>>>()?;

        Ok(Some(row_to_round(&row, items, participants)?))
    }

    /// The round the process should resume driving after a restart:
    /// the newest `active` or `rolling` one.
    pub async fn load_open_round(&self) -> Result<Option<Round>> {
        let row = sqlx::query(
            "SELECT id FROM rounds WHERE status IN ('active', 'rolling') ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query open round")?;

        match row {
            Some(r) => self.load_round(r.try_get("id")?).await,
            None => Ok(None),
        }
    }

    /// Authoritative item count for ceiling checks at proposal time.
    pub async fn count_round_items(&self, round_id: i64) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM items WHERE round_id = ?1")
            .bind(round_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }

    /// Authoritative participant count for ceiling checks at proposal time.
    pub async fn count_round_participants(&self, round_id: i64) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM participants WHERE round_id = ?1")
            .bind(round_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }

    // -- Trades -----------------------------------------------------------

    pub async fn insert_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, round_id, user_id, kind, asset_ids, value, status,
                offer_id, note, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(trade.id.to_string())
        .bind(trade.round_id)
        .bind(trade.user_id.clone())
        .bind(trade.kind.to_string())
        .bind(serde_json::to_string(&trade.asset_ids)?)
        .bind(trade.value.to_string())
        .bind(trade.status.to_string())
        .bind(trade.offer_id.clone())
        .bind(trade.note.clone())
        .bind(trade.created_at.to_rfc3339())
        .bind(trade.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert trade record")?;
        Ok(())
    }

    /// Advance a trade's status (and optionally attach the external offer id
    /// or a note). `updated_at` moves to now.
    pub async fn update_trade(
        &self,
        id: Uuid,
        status: TradeStatus,
        offer_id: Option<&str>,
        note: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET
                status = ?2,
                offer_id = COALESCE(?3, offer_id),
                note = COALESCE(?4, note),
                updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(status.to_string())
        .bind(offer_id)
        .bind(note)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to update trade record")?;
        Ok(())
    }

    pub async fn load_trade(&self, id: Uuid) -> Result<Option<TradeRecord>> {
        let row = sqlx::query("SELECT * FROM trades WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load trade record")?;

        row.map(|r| row_to_trade(&r)).transpose()
    }

    pub async fn trades_for_round(&self, round_id: i64) -> Result<Vec<TradeRecord>> {
        sqlx::query("SELECT * FROM trades WHERE round_id = ?1 ORDER BY created_at")
            .bind(round_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load round trades")?
            .iter()
            .map(row_to_trade)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_decimal(text: &str) -> Result<Decimal> {
    Decimal::from_str(text).with_context(|| format!("Bad decimal in store: {text}"))
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("Bad timestamp in store: {text}"))?
        .with_timezone(&Utc))
}

fn parse_opt_time(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.as_deref().map(parse_time).transpose()
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow, round_id: i64) -> Result<PotItem> {
    Ok(PotItem {
        asset_id: row.try_get("asset_id")?,
        name: row.try_get("name")?,
        image_url: row.try_get("image_url")?,
        price: parse_decimal(&row.try_get::<String, _>("price")?)?,
        user_id: row.try_get("user_id")?,
        round_id,
    })
}

fn row_to_participant(row: &sqlx::sqlite::SqliteRow) -> Result<Participant> {
    Ok(Participant {
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        avatar: row.try_get("avatar")?,
        trade_url: row.try_get("trade_url")?,
        value: parse_decimal(&row.try_get::<String, _>("value")?)?,
        tickets: row.try_get::<i64, _>("tickets")? as u64,
    })
}

fn row_to_round(
    row: &sqlx::sqlite::SqliteRow,
    items: Vec<PotItem>,
    participants: Vec<Participant>,
) -> Result<Round> {
    Ok(Round {
        id: row.try_get("id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        start_time: parse_opt_time(row.try_get("start_time")?)?,
        end_time: parse_opt_time(row.try_get("end_time")?)?,
        items,
        participants,
        total_value: parse_decimal(&row.try_get::<String, _>("total_value")?)?,
        total_tickets: row.try_get::<i64, _>("total_tickets")? as u64,
        winner: row.try_get("winner")?,
        winning_ticket: row
            .try_get::<Option<i64>, _>("winning_ticket")?
            .map(|t| t as u64),
        server_seed: row.try_get("server_seed")?,
        server_seed_hash: row.try_get("server_seed_hash")?,
        client_seed: row.try_get("client_seed")?,
        provable_hash: row.try_get("provable_hash")?,
        tax_value: parse_decimal(&row.try_get::<String, _>("tax_value")?)?,
        tax_asset_ids: serde_json::from_str(&row.try_get::<String, _>("tax_asset_ids")?)?,
    })
}

fn row_to_trade(row: &sqlx::sqlite::SqliteRow) -> Result<TradeRecord> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(TradeRecord {
        id: Uuid::parse_str(&id).context("Bad trade id in store")?,
        round_id: row.try_get("round_id")?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse::<TradeKind>()?,
        asset_ids: serde_json::from_str(&row.try_get::<String, _>("asset_ids")?)?,
        value: parse_decimal(&row.try_get::<String, _>("value")?)?,
        status: status.parse::<TradeStatus>()?,
        offer_id: row.try_get("offer_id")?,
        note: row.try_get("note")?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
