//! SQL-backed storage: one data-access layer, two substrates.
//!
//! `SqlBackend` speaks through sea-orm, so the same entity code serves
//! both the embedded single-file SQLite store and the pooled Postgres
//! store; the two constructors differ only in connection tuning. SQLite
//! provides single-writer serialization through its WAL locking (sqlx
//! defaults to WAL journaling with a 5 s busy timeout); Postgres
//! serializes ref advances through the conditional UPDATE in `cas_ref`.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, Statement,
};

use crate::{
    errors::VcsError,
    hash::ObjectHash,
    internal::{
        audit::AuditEntry,
        object::ObjectKind,
        storage::{
            StorageBackend,
            schema::{self, audit_log, objects, refs},
        },
    },
};

const OBJECT_PAGE: u64 = 256;

/// Relational storage over SQLite (embedded) or Postgres (pooled).
pub struct SqlBackend {
    db: DatabaseConnection,
    tenant: String,
}

impl SqlBackend {
    /// Open a single-file SQLite store. `:memory:` is accepted for
    /// tests. The database file is created when missing.
    pub async fn open_embedded(path: &Path, tenant: &str) -> Result<Self, VcsError> {
        let url = if path.as_os_str() == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path.display())
        };
        let mut options = ConnectOptions::new(url);
        // A single pooled connection keeps the tuning PRAGMAs pinned for
        // the life of the store; SQLite serializes writers regardless.
        options
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .sqlx_logging(false);
        let db = Database::connect(options).await?;
        for pragma in [
            "PRAGMA journal_mode=WAL",
            "PRAGMA synchronous=NORMAL",
            "PRAGMA cache_size=-65536",
            "PRAGMA busy_timeout=5000",
        ] {
            db.execute(Statement::from_string(DatabaseBackend::Sqlite, pragma))
                .await?;
        }
        Ok(Self {
            db,
            tenant: tenant.to_string(),
        })
    }

    /// Connect to Postgres with a bounded pool acquired per operation.
    pub async fn open_relational(url: &str, pool_max: u32, tenant: &str) -> Result<Self, VcsError> {
        let mut options = ConnectOptions::new(url.to_string());
        options
            .max_connections(pool_max)
            .min_connections(2.min(pool_max))
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .sqlx_logging(false);
        let db = Database::connect(options).await?;
        Ok(Self {
            db,
            tenant: tenant.to_string(),
        })
    }

    fn entry_to_model(&self, entry: &AuditEntry) -> Result<audit_log::ActiveModel, VcsError> {
        Ok(audit_log::ActiveModel {
            tenant_id: Set(self.tenant.clone()),
            seq: Set(i64::try_from(entry.seq)
                .map_err(|_| VcsError::BackendUnavailable("audit seq overflow".into()))?),
            prev_hash: Set(entry.prev_hash.to_hex()),
            timestamp: Set(entry.timestamp.to_rfc3339()),
            actor: Set(entry.actor.clone()),
            action: Set(entry.action.clone()),
            commit_hash: Set(entry.commit_hash.map(|h| h.to_hex())),
            details: Set(serde_json::to_string(&entry.details)?),
            self_hash: Set(entry.self_hash.to_hex()),
        })
    }

    fn model_to_entry(model: audit_log::Model) -> Result<AuditEntry, VcsError> {
        Ok(AuditEntry {
            seq: model.seq as u64,
            prev_hash: model.prev_hash.parse().map_err(VcsError::Corrupt)?,
            timestamp: model
                .timestamp
                .parse()
                .map_err(|e| VcsError::Corrupt(format!("audit timestamp: {e}")))?,
            actor: model.actor,
            action: model.action,
            commit_hash: model
                .commit_hash
                .map(|h| h.parse().map_err(VcsError::Corrupt))
                .transpose()?,
            details: serde_json::from_str(&model.details)?,
            self_hash: model.self_hash.parse().map_err(VcsError::Corrupt)?,
        })
    }
}

#[async_trait]
impl StorageBackend for SqlBackend {
    async fn initialize(&self) -> Result<(), VcsError> {
        schema::create_tables(&self.db).await
    }

    async fn close(&self) -> Result<(), VcsError> {
        self.db.clone().close().await.map_err(VcsError::from)
    }

    async fn healthcheck(&self) -> Result<(), VcsError> {
        self.db.ping().await.map_err(VcsError::from)
    }

    async fn put_object(
        &self,
        kind: ObjectKind,
        hash: &ObjectHash,
        bytes: &[u8],
    ) -> Result<(), VcsError> {
        let model = objects::ActiveModel {
            tenant_id: Set(self.tenant.clone()),
            kind: Set(kind.as_str().to_string()),
            hash: Set(hash.to_hex()),
            data: Set(bytes.to_vec()),
            created_at: Set(Utc::now()),
        };
        objects::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    objects::Column::TenantId,
                    objects::Column::Kind,
                    objects::Column::Hash,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn get_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<Vec<u8>, VcsError> {
        let row = objects::Entity::find_by_id((
            self.tenant.clone(),
            kind.as_str().to_string(),
            hash.to_hex(),
        ))
        .one(&self.db)
        .await?;
        match row {
            Some(model) => Ok(model.data),
            None => Err(VcsError::NotFound(format!("{kind} {hash}"))),
        }
    }

    async fn has_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<bool, VcsError> {
        let row = objects::Entity::find_by_id((
            self.tenant.clone(),
            kind.as_str().to_string(),
            hash.to_hex(),
        ))
        .one(&self.db)
        .await?;
        Ok(row.is_some())
    }

    async fn delete_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<(), VcsError> {
        objects::Entity::delete_by_id((
            self.tenant.clone(),
            kind.as_str().to_string(),
            hash.to_hex(),
        ))
        .exec(&self.db)
        .await?;
        Ok(())
    }

    fn iter_objects(
        &self,
        kind: ObjectKind,
    ) -> BoxStream<'_, Result<(ObjectHash, Vec<u8>), VcsError>> {
        let db = &self.db;
        let tenant = self.tenant.clone();
        let stream = futures::stream::try_unfold(
            (String::new(), VecDeque::new(), false),
            move |(mut cursor, mut buf, mut done): (String, VecDeque<_>, bool)| {
                let tenant = tenant.clone();
                async move {
                    loop {
                        if let Some(item) = buf.pop_front() {
                            return Ok(Some((item, (cursor, buf, done))));
                        }
                        if done {
                            return Ok(None);
                        }
                        let rows = objects::Entity::find()
                            .filter(objects::Column::TenantId.eq(tenant.clone()))
                            .filter(objects::Column::Kind.eq(kind.as_str()))
                            .filter(objects::Column::Hash.gt(cursor.clone()))
                            .order_by_asc(objects::Column::Hash)
                            .limit(OBJECT_PAGE)
                            .all(db)
                            .await?;
                        if rows.is_empty() {
                            return Ok(None);
                        }
                        done = (rows.len() as u64) < OBJECT_PAGE;
                        if let Some(last) = rows.last() {
                            cursor = last.hash.clone();
                        }
                        for row in rows {
                            let hash: ObjectHash =
                                row.hash.parse().map_err(VcsError::Corrupt)?;
                            buf.push_back((hash, row.data));
                        }
                    }
                }
            },
        );
        Box::pin(stream)
    }

    async fn get_ref(&self, name: &str) -> Result<Option<String>, VcsError> {
        let row = refs::Entity::find_by_id((self.tenant.clone(), name.to_string()))
            .one(&self.db)
            .await?;
        Ok(row.map(|model| model.value))
    }

    async fn set_ref(&self, name: &str, value: &str) -> Result<(), VcsError> {
        let model = refs::ActiveModel {
            tenant_id: Set(self.tenant.clone()),
            name: Set(name.to_string()),
            value: Set(value.to_string()),
            updated_at: Set(Utc::now()),
        };
        refs::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([refs::Column::TenantId, refs::Column::Name])
                    .update_columns([refs::Column::Value, refs::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_ref(&self, name: &str) -> Result<(), VcsError> {
        refs::Entity::delete_by_id((self.tenant.clone(), name.to_string()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list_refs(&self) -> Result<BTreeMap<String, String>, VcsError> {
        let rows = refs::Entity::find()
            .filter(refs::Column::TenantId.eq(self.tenant.clone()))
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|model| (model.name, model.value))
            .collect())
    }

    async fn cas_ref(
        &self,
        name: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<(), VcsError> {
        let outcome = match expected {
            // Create: succeeds only when no row exists yet.
            None => {
                let model = refs::ActiveModel {
                    tenant_id: Set(self.tenant.clone()),
                    name: Set(name.to_string()),
                    value: Set(new.to_string()),
                    updated_at: Set(Utc::now()),
                };
                refs::Entity::insert(model)
                    .on_conflict(
                        OnConflict::columns([refs::Column::TenantId, refs::Column::Name])
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await?
            }
            // Replace: conditional UPDATE in a short implicit transaction.
            Some(expected) => {
                refs::Entity::update_many()
                    .col_expr(refs::Column::Value, Expr::value(new.to_string()))
                    .col_expr(refs::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(refs::Column::TenantId.eq(self.tenant.clone()))
                    .filter(refs::Column::Name.eq(name.to_string()))
                    .filter(refs::Column::Value.eq(expected.to_string()))
                    .exec(&self.db)
                    .await?
                    .rows_affected
            }
        };
        if outcome == 1 {
            return Ok(());
        }
        let actual = self.get_ref(name).await?;
        Err(VcsError::Conflict {
            reference: name.to_string(),
            expected: expected.map(str::to_string),
            actual,
        })
    }

    async fn append_log(&self, entry: &AuditEntry) -> Result<(), VcsError> {
        let model = self.entry_to_model(entry)?;
        match audit_log::Entity::insert(model)
            .exec_without_returning(&self.db)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match err.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => Err(VcsError::Conflict {
                    reference: format!("audit seq {}", entry.seq),
                    expected: None,
                    actual: Some(entry.seq.to_string()),
                }),
                _ => Err(err.into()),
            },
        }
    }

    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>, VcsError> {
        let start = i64::try_from(start_seq).unwrap_or(i64::MAX);
        let rows = audit_log::Entity::find()
            .filter(audit_log::Column::TenantId.eq(self.tenant.clone()))
            .filter(audit_log::Column::Seq.gte(start))
            .order_by_asc(audit_log::Column::Seq)
            .limit(limit as u64)
            .all(&self.db)
            .await?;
        rows.into_iter().map(Self::model_to_entry).collect()
    }

    async fn last_log_entry(&self) -> Result<Option<AuditEntry>, VcsError> {
        let row = audit_log::Entity::find()
            .filter(audit_log::Column::TenantId.eq(self.tenant.clone()))
            .order_by_desc(audit_log::Column::Seq)
            .one(&self.db)
            .await?;
        row.map(Self::model_to_entry).transpose()
    }

    async fn purge_tenant(&self) -> Result<(), VcsError> {
        objects::Entity::delete_many()
            .filter(objects::Column::TenantId.eq(self.tenant.clone()))
            .exec(&self.db)
            .await?;
        refs::Entity::delete_many()
            .filter(refs::Column::TenantId.eq(self.tenant.clone()))
            .exec(&self.db)
            .await?;
        audit_log::Entity::delete_many()
            .filter(audit_log::Column::TenantId.eq(self.tenant.clone()))
            .exec(&self.db)
            .await?;
        tracing::info!(tenant = %self.tenant, "tenant purged");
        Ok(())
    }
}
