//! PostgreSQL store.
//!
//! Tables live in the `tsm` schema. Instance keys are protected by a unique
//! constraint and every multi-row write runs in one transaction. History
//! rows reference instances by id only, so they outlive deleted instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tsm_core::{
    HistoryEntry, Instance, InstanceId, MachineDefinition, MachineId, MachineRecord,
    NewHistoryEntry, NewInstance, StateDef, StateKind, Store, StoreError, StoreResult,
    TransitionDef,
};

const SCHEMA: [&str; 7] = [
    "CREATE SCHEMA IF NOT EXISTS tsm",
    r#"
    CREATE TABLE IF NOT EXISTS tsm.state_machines (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        CONSTRAINT state_machines_name_key UNIQUE (name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tsm.state_machine_states (
        id BIGSERIAL PRIMARY KEY,
        sm_id BIGINT NOT NULL REFERENCES tsm.state_machines (id),
        state TEXT NOT NULL,
        state_type CHAR(1) NOT NULL CHECK (state_type IN ('I', 'S', 'F')),
        description TEXT,
        UNIQUE (sm_id, state)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tsm.state_machine_state_transitions (
        id BIGSERIAL PRIMARY KEY,
        sm_id BIGINT NOT NULL REFERENCES tsm.state_machines (id),
        from_state TEXT NOT NULL,
        transition_name TEXT NOT NULL,
        to_state TEXT NOT NULL,
        pre_transition_task_name TEXT,
        post_transition_task_name TEXT,
        UNIQUE (sm_id, from_state, transition_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tsm.state_machine_instances (
        id BIGSERIAL PRIMARY KEY,
        sm_id BIGINT NOT NULL REFERENCES tsm.state_machines (id),
        external_name TEXT NOT NULL,
        external_id TEXT NOT NULL,
        sm_state TEXT NOT NULL,
        generated_by TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT state_machine_instances_key UNIQUE (external_name, external_id, sm_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tsm.state_machine_instance_history (
        id BIGSERIAL PRIMARY KEY,
        instance_id BIGINT NOT NULL,
        state TEXT NOT NULL,
        transition_name TEXT NOT NULL,
        made_by TEXT NOT NULL,
        comment TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS state_machine_instance_history_instance_idx
        ON tsm.state_machine_instance_history (instance_id, id)
    "#,
];

const INSTANCE_COLUMNS: &str =
    "id, sm_id, external_name, external_id, sm_state, generated_by, created_at";

const TRANSITION_COLUMNS: &str =
    "from_state, transition_name, to_state, pre_transition_task_name, post_transition_task_name";

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects with default pool settings and initializes the schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connects with explicit pool settings and initializes the schema.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool and initializes the schema.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn machines_named(&self, name: &str) -> StoreResult<Vec<MachineRecord>> {
        let rows = sqlx::query(
            "SELECT id, name, description FROM tsm.state_machines WHERE name = $1 ORDER BY id",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_machine).collect()
    }

    async fn list_machines(&self) -> StoreResult<Vec<MachineRecord>> {
        let rows =
            sqlx::query("SELECT id, name, description FROM tsm.state_machines ORDER BY name, id")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        rows.iter().map(row_to_machine).collect()
    }

    async fn insert_machine(&self, definition: &MachineDefinition) -> StoreResult<MachineId> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query(
            "INSERT INTO tsm.state_machines (name, description) VALUES ($1, $2) RETURNING id",
        )
        .bind(&definition.name)
        .bind(&definition.description)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;
        let id: i64 = row.try_get("id").map_err(backend)?;

        for state in &definition.states {
            sqlx::query(
                "INSERT INTO tsm.state_machine_states (sm_id, state, state_type, description) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(&state.name)
            .bind(state.kind.code())
            .bind(&state.description)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_conflict)?;
        }

        for t in &definition.transitions {
            sqlx::query(&format!(
                "INSERT INTO tsm.state_machine_state_transitions (sm_id, {TRANSITION_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6)"
            ))
            .bind(id)
            .bind(&t.from)
            .bind(&t.name)
            .bind(&t.to)
            .bind(&t.pre_task)
            .bind(&t.post_task)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_conflict)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(MachineId(id))
    }

    async fn states_of(&self, machine: MachineId) -> StoreResult<Vec<StateDef>> {
        let rows = sqlx::query(
            "SELECT state, state_type, description FROM tsm.state_machine_states \
             WHERE sm_id = $1 ORDER BY id",
        )
        .bind(machine.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_state).collect()
    }

    async fn transitions_of(&self, machine: MachineId) -> StoreResult<Vec<TransitionDef>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSITION_COLUMNS} FROM tsm.state_machine_state_transitions \
             WHERE sm_id = $1 ORDER BY id"
        ))
        .bind(machine.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_transition).collect()
    }

    async fn transitions_from(
        &self,
        machine: MachineId,
        from_state: &str,
    ) -> StoreResult<Vec<TransitionDef>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSITION_COLUMNS} FROM tsm.state_machine_state_transitions \
             WHERE sm_id = $1 AND from_state = $2 ORDER BY id"
        ))
        .bind(machine.0)
        .bind(from_state)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_transition).collect()
    }

    async fn find_instances(
        &self,
        machine: MachineId,
        external_name: &str,
        external_id: &str,
    ) -> StoreResult<Vec<Instance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM tsm.state_machine_instances \
             WHERE external_name = $1 AND external_id = $2 AND sm_id = $3 ORDER BY id"
        ))
        .bind(external_name)
        .bind(external_id)
        .bind(machine.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn create_instance(
        &self,
        instance: &NewInstance,
        initiation: &NewHistoryEntry,
    ) -> StoreResult<Instance> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query(&format!(
            "INSERT INTO tsm.state_machine_instances \
             (sm_id, external_name, external_id, sm_state, generated_by) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {INSTANCE_COLUMNS}"
        ))
        .bind(instance.machine_id.0)
        .bind(&instance.external_name)
        .bind(&instance.external_id)
        .bind(&instance.state)
        .bind(&instance.initiated_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;
        let created = row_to_instance(&row)?;

        insert_history(&mut tx, created.id, initiation).await?;

        tx.commit().await.map_err(backend)?;
        Ok(created)
    }

    async fn commit_transition(
        &self,
        instance: InstanceId,
        expected_state: &str,
        entry: &NewHistoryEntry,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let updated = sqlx::query(
            "UPDATE tsm.state_machine_instances SET sm_state = $1 \
             WHERE id = $2 AND sm_state = $3",
        )
        .bind(&entry.state)
        .bind(instance.0)
        .bind(expected_state)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM tsm.state_machine_instances WHERE id = $1")
                .bind(instance.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
            return Err(match exists {
                Some(_) => StoreError::Conflict(format!(
                    "instance {} is no longer in '{}'",
                    instance, expected_state
                )),
                None => StoreError::NotFound(format!("instance {}", instance)),
            });
        }

        insert_history(&mut tx, instance, entry).await?;

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn delete_instance(&self, instance: InstanceId) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM tsm.state_machine_instances WHERE id = $1")
            .bind(instance.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("instance {}", instance)));
        }
        Ok(())
    }

    async fn history_of(&self, instance: InstanceId) -> StoreResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, instance_id, state, transition_name, made_by, comment, created_at \
             FROM tsm.state_machine_instance_history WHERE instance_id = $1 ORDER BY id",
        )
        .bind(instance.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_history).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    instance: InstanceId,
    entry: &NewHistoryEntry,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO tsm.state_machine_instance_history \
         (instance_id, state, transition_name, made_by, comment) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(instance.0)
    .bind(&entry.state)
    .bind(&entry.transition)
    .bind(&entry.actor)
    .bind(&entry.comment)
    .execute(&mut **tx)
    .await
    .map_err(backend)?;
    Ok(())
}

fn row_to_machine(row: &PgRow) -> StoreResult<MachineRecord> {
    Ok(MachineRecord {
        id: MachineId(row.try_get("id").map_err(backend)?),
        name: row.try_get("name").map_err(backend)?,
        description: row.try_get("description").map_err(backend)?,
    })
}

fn row_to_state(row: &PgRow) -> StoreResult<StateDef> {
    let code: String = row.try_get("state_type").map_err(backend)?;
    let kind = StateKind::from_code(code.trim())
        .ok_or_else(|| StoreError::Backend(format!("unknown state type '{}'", code)))?;
    Ok(StateDef {
        name: row.try_get("state").map_err(backend)?,
        kind,
        description: row.try_get("description").map_err(backend)?,
    })
}

fn row_to_transition(row: &PgRow) -> StoreResult<TransitionDef> {
    Ok(TransitionDef {
        from: row.try_get("from_state").map_err(backend)?,
        name: row.try_get("transition_name").map_err(backend)?,
        to: row.try_get("to_state").map_err(backend)?,
        pre_task: row.try_get("pre_transition_task_name").map_err(backend)?,
        post_task: row.try_get("post_transition_task_name").map_err(backend)?,
    })
}

fn row_to_instance(row: &PgRow) -> StoreResult<Instance> {
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(backend)?;
    Ok(Instance {
        id: InstanceId(row.try_get("id").map_err(backend)?),
        machine_id: MachineId(row.try_get("sm_id").map_err(backend)?),
        external_name: row.try_get("external_name").map_err(backend)?,
        external_id: row.try_get("external_id").map_err(backend)?,
        state: row.try_get("sm_state").map_err(backend)?,
        initiated_by: row.try_get("generated_by").map_err(backend)?,
        created_at,
    })
}

fn row_to_history(row: &PgRow) -> StoreResult<HistoryEntry> {
    Ok(HistoryEntry {
        id: row.try_get("id").map_err(backend)?,
        instance_id: InstanceId(row.try_get("instance_id").map_err(backend)?),
        state: row.try_get("state").map_err(backend)?,
        transition: row.try_get("transition_name").map_err(backend)?,
        actor: row.try_get("made_by").map_err(backend)?,
        comment: row.try_get("comment").map_err(backend)?,
        recorded_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::UniqueViolation(db_err.message().to_string());
        }
    }
    backend(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tsm_core::{ErrorKind, InstanceKey, StateMachineService};

    async fn test_store() -> Option<PostgresStore> {
        let url = std::env::var("TSM_TEST_DATABASE_URL").ok()?;
        Some(PostgresStore::connect(&url).await.unwrap())
    }

    fn unique_name(prefix: &str) -> String {
        format!(
            "{}-{}",
            prefix,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )
    }

    fn approval(name: &str) -> MachineDefinition {
        MachineDefinition {
            name: name.to_string(),
            description: "Document approval".into(),
            states: vec![
                StateDef::new("Init", StateKind::Initial),
                StateDef::new("Submitted", StateKind::Stepping),
                StateDef::new("Approved", StateKind::Stepping),
                StateDef::new("Closed", StateKind::Final),
            ],
            transitions: vec![
                TransitionDef::new("Init", "Submit", "Submitted").with_pre_task("preSubmit"),
                TransitionDef::new("Submitted", "Approve", "Approved"),
                TransitionDef::new("Approved", "Close", "Closed"),
            ],
        }
    }

    #[tokio::test]
    async fn test_definition_round_trip() {
        let Some(store) = test_store().await else {
            return;
        };
        let name = unique_name("pg-def");
        let id = store.insert_machine(&approval(&name)).await.unwrap();

        assert_eq!(store.states_of(id).await.unwrap(), approval(&name).states);
        assert_eq!(
            store.transitions_of(id).await.unwrap(),
            approval(&name).transitions
        );
        let err = store.insert_machine(&approval(&name)).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let Some(store) = test_store().await else {
            return;
        };
        let name = unique_name("pg-life");
        let service = StateMachineService::new(Arc::new(store));
        service.put_machine(approval(&name)).await.unwrap();
        let key = InstanceKey::new("document", "1", &name);

        let instance = service.initiate(&key, "alice").await.unwrap();
        assert_eq!(instance.state, "Init");
        let err = service.initiate(&key, "bob").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExistingInstanceFound);

        service.transition(&key, "Submit", "alice", "ready").await.unwrap();
        let err = service.transition(&key, "Close", "alice", "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransitionNotAllowed);

        let history = service.get_history(&key).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].is_initiation());
        assert_eq!(history[1].comment, "ready");

        service.delete(&key).await.unwrap();
        assert_eq!(service.get(&key).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(service.store().history_of(instance.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_commit_conflicts() {
        let Some(store) = test_store().await else {
            return;
        };
        let name = unique_name("pg-cas");
        let machine = store.insert_machine(&approval(&name)).await.unwrap();
        let instance = store
            .create_instance(
                &NewInstance {
                    machine_id: machine,
                    external_name: "document".into(),
                    external_id: "1".into(),
                    state: "Init".into(),
                    initiated_by: "alice".into(),
                },
                &NewHistoryEntry::initiated("Init", "alice"),
            )
            .await
            .unwrap();

        let submit = NewHistoryEntry::transition("Submitted", "Submit", "alice", "");
        store
            .commit_transition(instance.id, "Init", &submit)
            .await
            .unwrap();
        let err = store
            .commit_transition(instance.id, "Init", &submit)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.history_of(instance.id).await.unwrap().len(), 2);
    }
}
