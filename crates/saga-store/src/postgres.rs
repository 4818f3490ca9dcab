use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    FailureDetail, InstanceQuery, Result, SagaContext, SagaId, SagaInstance, SagaSnapshot,
    SagaStepRecord, StoreError, Version,
    store::{SagaPersistence, validate_instance_for_save, validate_record_for_append},
};

const INSTANCE_COLUMNS: &str = "id, definition_name, status, current_step_index, context, \
     created_at, updated_at, version, deadline, failure";

const RECORD_COLUMNS: &str = "saga_id, sequence, step_index, step_name, phase, status, attempt, \
     skipped, started_at, finished_at, error_detail, output";

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_instance(row: PgRow) -> Result<SagaInstance> {
        let status: String = row.try_get("status")?;
        let context: serde_json::Value = row.try_get("context")?;
        let failure: Option<serde_json::Value> = row.try_get("failure")?;
        let failure = failure
            .map(serde_json::from_value::<FailureDetail>)
            .transpose()?;

        Ok(SagaInstance {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            definition_name: row.try_get("definition_name")?,
            status: status.parse().map_err(StoreError::Corrupt)?,
            current_step_index: to_usize(row.try_get("current_step_index")?)?,
            context: serde_json::from_value::<SagaContext>(context)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: Version::new(row.try_get("version")?),
            deadline: row.try_get("deadline")?,
            failure,
        })
    }

    fn row_to_record(row: PgRow) -> Result<SagaStepRecord> {
        let phase: String = row.try_get("phase")?;
        let status: String = row.try_get("status")?;
        let output: Option<serde_json::Value> = row.try_get("output")?;
        let attempt: i32 = row.try_get("attempt")?;
        let sequence: i64 = row.try_get("sequence")?;

        Ok(SagaStepRecord {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            sequence: u64::try_from(sequence)
                .map_err(|_| StoreError::Corrupt(format!("negative sequence {sequence}")))?,
            step_index: to_usize(row.try_get("step_index")?)?,
            step_name: row.try_get("step_name")?,
            phase: phase.parse().map_err(StoreError::Corrupt)?,
            status: status.parse().map_err(StoreError::Corrupt)?,
            attempt: u32::try_from(attempt)
                .map_err(|_| StoreError::Corrupt(format!("negative attempt {attempt}")))?,
            skipped: row.try_get("skipped")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            error_detail: row.try_get("error_detail")?,
            output: output
                .map(serde_json::from_value::<SagaContext>)
                .transpose()?,
        })
    }

    async fn stored_version(&self, saga_id: SagaId) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE id = $1")
                .bind(saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(Version::new(version.unwrap_or(0)))
    }
}

fn to_usize(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative index {value}")))
}

#[async_trait]
impl SagaPersistence for PostgresSagaStore {
    async fn save(&self, instance: &SagaInstance) -> Result<Version> {
        validate_instance_for_save(instance)?;

        let new_version = instance.version.next();
        let context = serde_json::to_value(&instance.context)?;
        let failure = instance
            .failure
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let result = if instance.version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO saga_instances (id, definition_name, status, current_step_index, context,
                                            created_at, updated_at, version, deadline, failure)
                VALUES ($1, $2, $3, $4, $5, $6, NOW(), $7, $8, $9)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(instance.id.as_uuid())
            .bind(&instance.definition_name)
            .bind(instance.status.as_str())
            .bind(instance.current_step_index as i64)
            .bind(&context)
            .bind(instance.created_at)
            .bind(new_version.as_i64())
            .bind(instance.deadline)
            .bind(&failure)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE saga_instances
                SET status = $3, current_step_index = $4, context = $5, updated_at = NOW(),
                    version = $6, deadline = $7, failure = $8
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(instance.id.as_uuid())
            .bind(instance.version.as_i64())
            .bind(instance.status.as_str())
            .bind(instance.current_step_index as i64)
            .bind(&context)
            .bind(new_version.as_i64())
            .bind(instance.deadline)
            .bind(&failure)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            let actual = self.stored_version(instance.id).await?;
            return Err(StoreError::Conflict {
                saga_id: instance.id,
                expected: instance.version,
                actual,
            });
        }

        Ok(new_version)
    }

    async fn append_step_record(&self, record: SagaStepRecord) -> Result<u64> {
        validate_record_for_append(&record)?;

        let output = record
            .output
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        // Lock the instance row so concurrent appends get distinct sequences
        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM saga_instances WHERE id = $1 FOR UPDATE")
                .bind(record.saga_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(record.saga_id));
        }

        let sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM saga_step_records WHERE saga_id = $1",
        )
        .bind(record.saga_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO saga_step_records (saga_id, sequence, step_index, step_name, phase, status,
                                           attempt, skipped, started_at, finished_at, error_detail, output)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.saga_id.as_uuid())
        .bind(sequence)
        .bind(record.step_index as i64)
        .bind(&record.step_name)
        .bind(record.phase.as_str())
        .bind(record.status.as_str())
        .bind(record.attempt as i32)
        .bind(record.skipped)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.error_detail)
        .bind(&output)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        u64::try_from(sequence)
            .map_err(|_| StoreError::Corrupt(format!("negative sequence {sequence}")))
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<(SagaInstance, Vec<SagaStepRecord>)>> {
        let Some(instance) = self.get_instance(saga_id).await? else {
            return Ok(None);
        };
        let records = self.records_after(saga_id, 0).await?;
        Ok(Some((instance, records)))
    }

    async fn get_instance(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM saga_instances WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn records_after(
        &self,
        saga_id: SagaId,
        after_sequence: u64,
    ) -> Result<Vec<SagaStepRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM saga_step_records \
             WHERE saga_id = $1 AND sequence > $2 ORDER BY sequence ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(saga_id.as_uuid())
            .bind(after_sequence as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn save_snapshot(&self, snapshot: SagaSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_snapshots (saga_id, version, last_sequence, taken_at, state)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (saga_id) DO UPDATE SET
                version = EXCLUDED.version,
                last_sequence = EXCLUDED.last_sequence,
                taken_at = EXCLUDED.taken_at,
                state = EXCLUDED.state
            WHERE saga_snapshots.last_sequence < EXCLUDED.last_sequence
            "#,
        )
        .bind(snapshot.saga_id.as_uuid())
        .bind(snapshot.version.as_i64())
        .bind(snapshot.last_sequence as i64)
        .bind(snapshot.taken_at)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshot(&self, saga_id: SagaId) -> Result<Option<SagaSnapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT saga_id, version, last_sequence, taken_at, state
            FROM saga_snapshots
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let last_sequence: i64 = row.try_get("last_sequence")?;
                Ok(Some(SagaSnapshot {
                    saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
                    version: Version::new(row.try_get("version")?),
                    last_sequence: u64::try_from(last_sequence).map_err(|_| {
                        StoreError::Corrupt(format!("negative sequence {last_sequence}"))
                    })?,
                    taken_at: row.try_get("taken_at")?,
                    state: row.try_get("state")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        let mut sql = format!("SELECT {INSTANCE_COLUMNS} FROM saga_instances WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.definition_name.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND definition_name = ${param_count}"));
        }
        if query.created_after.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at >= ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(statuses) = query.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(name) = query.definition_name {
            sqlx_query = sqlx_query.bind(name);
        }
        if let Some(after) = query.created_after {
            sqlx_query = sqlx_query.bind(after);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_instance).collect()
    }
}
