//! Relational schema shared by the embedded (SQLite) and pooled
//! (Postgres) backends.
//!
//! Three tables, each discriminated by `tenant_id` so one database can
//! host many isolated tenants. Object payloads are opaque canonical
//! bytes; audit timestamps are stored as RFC 3339 text so hash seals
//! survive round-trips through engines with differing native timestamp
//! precision.

use sea_orm::{ConnectionTrait, DatabaseConnection, Schema};

use crate::errors::VcsError;

pub mod objects {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "vcs_objects")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub kind: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub hash: String,
        pub data: Vec<u8>,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod refs {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "vcs_refs")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub name: String,
        /// Either a 64-char hex commit hash or a symbolic `ref: <branch>`.
        pub value: String,
        pub updated_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod audit_log {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "vcs_audit_log")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub tenant_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub seq: i64,
        pub prev_hash: String,
        /// RFC 3339 text; precision must survive storage exactly because
        /// the chained hash covers it.
        pub timestamp: String,
        pub actor: String,
        pub action: String,
        pub commit_hash: Option<String>,
        /// JSON-encoded details payload (possibly an encryption envelope).
        pub details: String,
        pub self_hash: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Idempotent table creation for whichever engine the connection speaks.
pub async fn create_tables(db: &DatabaseConnection) -> Result<(), VcsError> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let mut statements = [
        schema.create_table_from_entity(objects::Entity),
        schema.create_table_from_entity(refs::Entity),
        schema.create_table_from_entity(audit_log::Entity),
    ];
    for stmt in statements.iter_mut() {
        stmt.if_not_exists();
        db.execute(builder.build(&*stmt)).await?;
    }
    Ok(())
}
