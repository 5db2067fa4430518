use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqliteConnection};
use std::collections::HashMap;

use super::schema::Database;
use super::types::{
    timestamp_to_utc, DatabaseError, ScoreTally, TallyPost, TallyPostRow, TallyRow, TallyUpdate,
};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of tallies returned by a range query (OOM protection)
const MAX_TALLIES: i64 = 1000;

/// Addresses per `IN (...)` clause, well under SQLite's 999 parameter limit
const ADDRESS_CHUNK: usize = 400;

/// Rows per multi-row insert (6 columns * 100 = 600 parameters)
const POST_BATCH_SIZE: usize = 100;

impl Database {
    // ========================================================================
    // Tally Queries
    // ========================================================================

    /// Get the stored tally for `(query, address)`, if one exists.
    pub async fn get_tally(
        &self,
        query: &str,
        address: &str,
    ) -> Result<Option<ScoreTally>, DatabaseError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        load_tally(&mut conn, query, address).await
    }

    /// Newest `last_active` across every tally for `query`.
    ///
    /// Everything at or before this instant has already been folded into a
    /// tally, so the next harvest only needs posts created after it.
    pub async fn watermark(&self, query: &str) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(last_active) FROM tallies WHERE query = ?")
                .bind(query)
                .fetch_one(&self.pool)
                .await?;

        row.0.map(timestamp_to_utc).transpose()
    }

    /// Tallies for `query` active at or after `since`, newest first.
    ///
    /// PERF-003: Hard cap at MAX_TALLIES regardless of the requested limit.
    pub async fn list_active_since(
        &self,
        query: &str,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<ScoreTally>, DatabaseError> {
        let active = self.list_active_with_posts(query, since, limit).await?;
        Ok(active.into_iter().map(|(tally, _)| tally).collect())
    }

    /// Like [`Database::list_active_since`], also returning each tally's
    /// contributing posts in fold order.
    pub async fn list_active_with_posts(
        &self,
        query: &str,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<(ScoreTally, Vec<TallyPost>)>, DatabaseError> {
        let limit = limit.unwrap_or(MAX_TALLIES).clamp(0, MAX_TALLIES);
        tracing::debug!(query = %query, since = %since, limit = limit, "list_active_with_posts");

        let rows: Vec<TallyRow> = sqlx::query_as(
            r#"
            SELECT query, address, score, last_active, title
            FROM tallies
            WHERE query = ? AND last_active >= ?
            ORDER BY last_active DESC, score DESC
            LIMIT ?
        "#,
        )
        .bind(query)
        .bind(since.timestamp())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let addresses: Vec<String> = rows.iter().map(|r| r.1.clone()).collect();
        let mut posts = self.tally_posts(query, &addresses).await?;

        rows.into_iter()
            .map(|(query, address, score, last_active, title)| -> Result<_, DatabaseError> {
                let posts = posts.remove(&address).unwrap_or_default();
                let tally = ScoreTally {
                    query,
                    address,
                    score,
                    last_active: timestamp_to_utc(last_active)?,
                    title,
                    contributing_post_ids: posts.iter().map(|p| p.post_id).collect(),
                };
                Ok((tally, posts))
            })
            .collect()
    }

    /// Contributing posts for each of `addresses`, in the order they were folded in.
    pub async fn tally_posts(
        &self,
        query: &str,
        addresses: &[String],
    ) -> Result<HashMap<String, Vec<TallyPost>>, DatabaseError> {
        let mut grouped: HashMap<String, Vec<TallyPost>> = HashMap::new();

        for chunk in addresses.chunks(ADDRESS_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT address, post_id, author, text, weight FROM tally_posts WHERE query = ",
            );
            builder.push_bind(query);
            builder.push(" AND address IN (");
            let mut separated = builder.separated(", ");
            for address in chunk {
                separated.push_bind(address);
            }
            separated.push_unseparated(") ORDER BY rowid");

            let rows: Vec<TallyPostRow> = builder.build_query_as().fetch_all(&self.pool).await?;
            for (address, post_id, author, text, weight) in rows {
                grouped.entry(address).or_default().push(TallyPost {
                    post_id,
                    author,
                    text,
                    weight,
                });
            }
        }

        Ok(grouped)
    }

    // ========================================================================
    // Tally Mutations
    // ========================================================================

    /// Merge `update` into the stored tally for its key and return the result.
    ///
    /// Read, merge and write happen inside one `BEGIN IMMEDIATE` transaction:
    /// the write lock is taken before the existing row is read, so two merges
    /// of the same key can never both start from the same old score.
    pub async fn upsert_tally(&self, update: &TallyUpdate) -> Result<ScoreTally, DatabaseError> {
        // Dropping the transaction before commit (cancelled future, error
        // below) rolls it back and returns a clean connection to the pool
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let tally = merge_tally(&mut tx, update).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(tally)
    }
}

async fn load_tally(
    conn: &mut SqliteConnection,
    query: &str,
    address: &str,
) -> Result<Option<ScoreTally>, DatabaseError> {
    let row: Option<TallyRow> = sqlx::query_as(
        r#"
        SELECT query, address, score, last_active, title
        FROM tallies
        WHERE query = ? AND address = ?
    "#,
    )
    .bind(query)
    .bind(address)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((query, address, score, last_active, title)) = row else {
        return Ok(None);
    };

    let ids: Vec<(i64,)> = sqlx::query_as(
        "SELECT post_id FROM tally_posts WHERE query = ? AND address = ? ORDER BY rowid",
    )
    .bind(&query)
    .bind(&address)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(ScoreTally {
        query,
        address,
        score,
        last_active: timestamp_to_utc(last_active)?,
        title,
        contributing_post_ids: ids.into_iter().map(|(id,)| id).collect(),
    }))
}

/// Body of the upsert transaction; the caller owns begin and commit.
async fn merge_tally(
    conn: &mut SqliteConnection,
    update: &TallyUpdate,
) -> Result<ScoreTally, DatabaseError> {
    let mut tally = load_tally(conn, &update.query, &update.address)
        .await?
        .unwrap_or_else(|| ScoreTally::new(&update.query, &update.address, update.last_active));
    let added = tally.absorb(update);

    sqlx::query(
        r#"
        INSERT INTO tallies (query, address, score, last_active, title)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(query, address) DO UPDATE SET
            score = excluded.score,
            last_active = excluded.last_active,
            title = excluded.title
    "#,
    )
    .bind(&tally.query)
    .bind(&tally.address)
    .bind(tally.score)
    .bind(tally.last_active.timestamp())
    .bind(&tally.title)
    .execute(&mut *conn)
    .await?;

    for chunk in added.chunks(POST_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO tally_posts (query, address, post_id, author, text, weight) ",
        );
        builder.push_values(chunk, |mut b, post| {
            b.push_bind(&tally.query)
                .push_bind(&tally.address)
                .push_bind(post.post_id)
                .push_bind(&post.author)
                .push_bind(&post.text)
                .push_bind(post.weight);
        });
        builder.build().execute(&mut *conn).await?;
    }

    Ok(tally)
}
