//! PostgreSQL / CockroachDB metabase
//!
//! Piece lists are stored as bincode in canonical order, so the
//! compare-and-swap on `pieces` is a plain byte comparison. Scans read from
//! a snapshot: `AS OF SYSTEM TIME` on CockroachDB, a read-only
//! repeatable-read transaction on PostgreSQL.

use crate::error::{MetabaseError, Result};
use crate::models::{
    decode_pieces, encode_pieces, DeletedCounts, Object, ObjectKey, ObjectStatus, ObjectStream,
    Piece, Segment,
};
use crate::store::{MetabaseStore, ScanFilter, ScanQuery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tessera_core::{
    ContentHash, RedundancyScheme, SegmentId, SegmentPosition, StreamId,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// SQL dialect of the backing database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    Cockroach,
}

impl std::str::FromStr for Dialect {
    type Err = MetabaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "cockroach" | "cockroachdb" => Ok(Self::Cockroach),
            other => Err(MetabaseError::Invalid(format!("unknown dialect '{}'", other))),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub url: String,
    pub dialect: Dialect,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/tessera".to_string(),
            dialect: Dialect::Postgres,
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 5,
            idle_timeout_secs: 300,
        }
    }
}

impl DbConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(sqlx::FromRow)]
struct ObjectRow {
    project_id: Uuid,
    bucket_name: Vec<u8>,
    object_key: Vec<u8>,
    version: i64,
    stream_id: Uuid,
    status: i16,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    zombie_deletion_deadline: Option<DateTime<Utc>>,
}

impl ObjectRow {
    fn key(&self) -> Result<ObjectKey> {
        let bucket_name = String::from_utf8(self.bucket_name.clone())
            .map_err(|e| MetabaseError::Invalid(format!("bucket name: {}", e)))?;
        Ok(ObjectKey::new(
            self.project_id,
            bucket_name,
            self.object_key.clone(),
            self.version,
        ))
    }

    fn into_object(self) -> Result<Object> {
        Ok(Object {
            key: self.key()?,
            stream_id: StreamId::from_uuid(self.stream_id),
            status: ObjectStatus::from_i16(self.status)?,
            created_at: self.created_at,
            expires_at: self.expires_at,
            zombie_deletion_deadline: self.zombie_deletion_deadline,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScanRow {
    project_id: Uuid,
    bucket_name: Vec<u8>,
    object_key: Vec<u8>,
    version: i64,
    stream_id: Uuid,
}

impl ScanRow {
    fn into_object_stream(self) -> Result<ObjectStream> {
        let bucket_name = String::from_utf8(self.bucket_name)
            .map_err(|e| MetabaseError::Invalid(format!("bucket name: {}", e)))?;
        Ok(ObjectStream {
            key: ObjectKey::new(self.project_id, bucket_name, self.object_key, self.version),
            stream_id: StreamId::from_uuid(self.stream_id),
        })
    }
}

#[derive(sqlx::FromRow)]
struct SegmentRow {
    stream_id: Uuid,
    position: i64,
    required_pieces: i16,
    repair_threshold: i16,
    optimal_threshold: i16,
    total_pieces: i16,
    encrypted_size: i32,
    pieces: Vec<u8>,
    piece_hashes: Vec<u8>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl SegmentRow {
    fn into_segment(self) -> Result<Segment> {
        let redundancy = RedundancyScheme::new(
            to_u16(self.required_pieces)?,
            to_u16(self.repair_threshold)?,
            to_u16(self.optimal_threshold)?,
            to_u16(self.total_pieces)?,
        )?;

        if self.piece_hashes.len() % 32 != 0 {
            return Err(MetabaseError::Invalid(format!(
                "piece hash column has {} bytes",
                self.piece_hashes.len()
            )));
        }
        let piece_hashes = self
            .piece_hashes
            .chunks_exact(32)
            .map(|chunk| {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(chunk);
                ContentHash::from_bytes(bytes)
            })
            .collect();

        Ok(Segment {
            id: SegmentId::new(
                StreamId::from_uuid(self.stream_id),
                SegmentPosition::decode(self.position as u64),
            ),
            redundancy,
            pieces: decode_pieces(&self.pieces)?,
            encrypted_size: u32::try_from(self.encrypted_size)
                .map_err(|_| MetabaseError::Invalid("negative encrypted size".to_string()))?,
            piece_hashes,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

fn to_u16(value: i16) -> Result<u16> {
    u16::try_from(value).map_err(|_| MetabaseError::Invalid(format!("negative count {}", value)))
}

fn encode_hashes(hashes: &[ContentHash]) -> Vec<u8> {
    hashes.iter().flat_map(|h| h.as_bytes().iter().copied()).collect()
}

/// Metabase backed by PostgreSQL or CockroachDB
#[derive(Clone)]
pub struct PostgresMetabase {
    pool: PgPool,
    dialect: Dialect,
}

impl PostgresMetabase {
    /// Create a new database connection pool
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(config.idle_timeout())
            .connect(&config.url)
            .await?;

        info!(dialect = ?config.dialect, "Connected to metabase database");
        Ok(Self {
            pool,
            dialect: config.dialect,
        })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Metabase migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Build the scan statement for a query
    ///
    /// Bind order: the filter instant, then the four cursor columns if present.
    fn scan_sql(&self, query: &ScanQuery) -> String {
        let mut sql = String::from(
            "SELECT project_id, bucket_name, object_key, version, stream_id FROM objects",
        );

        if let (Dialect::Cockroach, Some(as_of)) = (self.dialect, query.as_of) {
            sql.push_str(&format!(
                " AS OF SYSTEM TIME '{}'",
                as_of.format("%Y-%m-%d %H:%M:%S%.6f+00:00")
            ));
        }

        match query.filter {
            ScanFilter::ExpiredBefore(_) => {
                sql.push_str(&format!(
                    " WHERE status = {} AND expires_at < $1",
                    ObjectStatus::Committed.as_i16()
                ));
            }
            ScanFilter::ZombieBefore(_) => {
                sql.push_str(&format!(
                    " WHERE status = {} AND zombie_deletion_deadline < $1",
                    ObjectStatus::Pending.as_i16()
                ));
            }
        }

        if query.after.is_some() {
            sql.push_str(" AND (project_id, bucket_name, object_key, version) > ($2, $3, $4, $5)");
        }

        sql.push_str(&format!(
            " ORDER BY project_id, bucket_name, object_key, version LIMIT {}",
            query.limit
        ));
        sql
    }
}

#[async_trait]
impl MetabaseStore for PostgresMetabase {
    #[instrument(skip(self, object), fields(key = %object.key))]
    async fn insert_object(&self, object: &Object) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (project_id, bucket_name, object_key, version, stream_id, status,
                                 created_at, expires_at, zombie_deletion_deadline)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(object.key.project_id)
        .bind(object.key.bucket_name.as_bytes())
        .bind(&object.key.object_key)
        .bind(object.key.version)
        .bind(object.stream_id.as_uuid())
        .bind(object.status.as_i16())
        .bind(object.created_at)
        .bind(object.expires_at)
        .bind(object.zombie_deletion_deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, segment), fields(segment = %segment.id))]
    async fn insert_segment(&self, segment: &Segment) -> Result<()> {
        segment.redundancy.validate()?;
        segment.validate_pieces(&segment.pieces)?;

        sqlx::query(
            r#"
            INSERT INTO segments (stream_id, position, required_pieces, repair_threshold,
                                  optimal_threshold, total_pieces, encrypted_size, pieces,
                                  piece_hashes, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(segment.id.stream_id.as_uuid())
        .bind(segment.id.position.encode() as i64)
        .bind(segment.redundancy.required as i16)
        .bind(segment.redundancy.repair as i16)
        .bind(segment.redundancy.optimal as i16)
        .bind(segment.redundancy.total as i16)
        .bind(segment.encrypted_size as i32)
        .bind(encode_pieces(&segment.pieces)?)
        .bind(encode_hashes(&segment.piece_hashes))
        .bind(segment.created_at)
        .bind(segment.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Object>> {
        let row = sqlx::query_as::<_, ObjectRow>(
            r#"
            SELECT * FROM objects
            WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 AND version = $4
            "#,
        )
        .bind(key.project_id)
        .bind(key.bucket_name.as_bytes())
        .bind(&key.object_key)
        .bind(key.version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ObjectRow::into_object).transpose()
    }

    async fn get_segment(&self, id: &SegmentId) -> Result<Option<Segment>> {
        let row = sqlx::query_as::<_, SegmentRow>(
            "SELECT * FROM segments WHERE stream_id = $1 AND position = $2",
        )
        .bind(id.stream_id.as_uuid())
        .bind(id.position.encode() as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SegmentRow::into_segment).transpose()
    }

    async fn list_segments(&self, stream_id: &StreamId) -> Result<Vec<Segment>> {
        let rows = sqlx::query_as::<_, SegmentRow>(
            "SELECT * FROM segments WHERE stream_id = $1 ORDER BY position",
        )
        .bind(stream_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SegmentRow::into_segment).collect()
    }

    #[instrument(skip(self, expected, new_pieces), fields(segment = %id))]
    async fn update_segment_pieces(
        &self,
        id: &SegmentId,
        expected: &[Piece],
        new_pieces: &[Piece],
    ) -> Result<()> {
        let segment = self
            .get_segment(id)
            .await?
            .ok_or(MetabaseError::SegmentNotFound(*id))?;
        segment.validate_pieces(new_pieces)?;

        let result = sqlx::query(
            r#"
            UPDATE segments SET pieces = $3
            WHERE stream_id = $1 AND position = $2 AND pieces = $4
            "#,
        )
        .bind(id.stream_id.as_uuid())
        .bind(id.position.encode() as i64)
        .bind(encode_pieces(new_pieces)?)
        .bind(encode_pieces(expected)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Distinguish a lost race from a concurrent delete
        match self.get_segment(id).await? {
            Some(_) => Err(MetabaseError::Conflict(*id)),
            None => Err(MetabaseError::SegmentNotFound(*id)),
        }
    }

    #[instrument(skip(self, query), fields(limit = query.limit, cursor = query.after.is_some()))]
    async fn scan_objects(&self, query: &ScanQuery) -> Result<Vec<ObjectStream>> {
        let sql = self.scan_sql(query);
        let instant = match query.filter {
            ScanFilter::ExpiredBefore(at) | ScanFilter::ZombieBefore(at) => at,
        };

        let mut statement = sqlx::query_as::<_, ScanRow>(&sql).bind(instant);
        if let Some(after) = &query.after {
            statement = statement
                .bind(after.project_id)
                .bind(after.bucket_name.as_bytes().to_vec())
                .bind(after.object_key.clone())
                .bind(after.version);
        }

        let rows = match self.dialect {
            Dialect::Cockroach => statement.fetch_all(&self.pool).await?,
            Dialect::Postgres => {
                let mut tx = self.pool.begin().await?;
                sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
                    .execute(&mut *tx)
                    .await?;
                let rows = statement.fetch_all(&mut *tx).await?;
                tx.commit().await?;
                rows
            }
        };

        debug!(rows = rows.len(), "Scanned object page");
        rows.into_iter().map(ScanRow::into_object_stream).collect()
    }

    #[instrument(skip(self, object), fields(key = %object.key, stream_id = %object.stream_id))]
    async fn delete_object(&self, object: &ObjectStream) -> Result<DeletedCounts> {
        let mut tx = self.pool.begin().await?;

        let objects = sqlx::query(
            r#"
            DELETE FROM objects
            WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 AND version = $4
              AND stream_id = $5
            "#,
        )
        .bind(object.key.project_id)
        .bind(object.key.bucket_name.as_bytes())
        .bind(&object.key.object_key)
        .bind(object.key.version)
        .bind(object.stream_id.as_uuid())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let segments = sqlx::query("DELETE FROM segments WHERE stream_id = $1")
            .bind(object.stream_id.as_uuid())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(DeletedCounts { objects, segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dialect: Dialect) -> PostgresMetabase {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/tessera")
            .unwrap();
        PostgresMetabase::from_pool(pool, dialect)
    }

    fn query(after: Option<ObjectKey>, as_of: Option<DateTime<Utc>>) -> ScanQuery {
        ScanQuery {
            filter: ScanFilter::ExpiredBefore(Utc::now()),
            after,
            limit: 100,
            as_of,
        }
    }

    #[test]
    fn test_dialect_parse() {
        assert_eq!("cockroachdb".parse::<Dialect>().unwrap(), Dialect::Cockroach);
        assert_eq!("Postgres".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert!("mysql".parse::<Dialect>().is_err());
    }

    #[tokio::test]
    async fn test_first_page_has_no_cursor_predicate() {
        let sql = store(Dialect::Postgres).scan_sql(&query(None, None));
        assert!(!sql.contains("$2"));
        assert!(sql.ends_with("LIMIT 100"));
    }

    #[tokio::test]
    async fn test_cursor_uses_full_key_tuple() {
        let after = ObjectKey::new(Uuid::nil(), "b", b"k".to_vec(), 1);
        let sql = store(Dialect::Postgres).scan_sql(&query(Some(after), None));
        assert!(sql.contains("(project_id, bucket_name, object_key, version) > ($2, $3, $4, $5)"));
    }

    #[tokio::test]
    async fn test_as_of_only_on_cockroach() {
        let as_of = Some(Utc::now());
        let pg = store(Dialect::Postgres).scan_sql(&query(None, as_of));
        let crdb = store(Dialect::Cockroach).scan_sql(&query(None, as_of));
        assert!(!pg.contains("AS OF SYSTEM TIME"));
        assert!(crdb.contains("AS OF SYSTEM TIME"));
    }

    #[tokio::test]
    async fn test_zombie_filter_restricts_to_pending() {
        let mut q = query(None, None);
        q.filter = ScanFilter::ZombieBefore(Utc::now());
        let sql = store(Dialect::Postgres).scan_sql(&q);
        assert!(sql.contains("status = 1 AND zombie_deletion_deadline < $1"));
    }
}
