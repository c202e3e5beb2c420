#![allow(dead_code)]

use rota::{StoreConfig, SyncOperator};
use rota_model::{
    Category, Classification, DynamicType, Entity, EntityBody, EntityId, Reference, Resource, User,
};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tempfile::TempDir;

/// A store file in its own temp directory, shared by every operator a test opens.
pub struct TestStore {
    dir: TempDir,
    url: String,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let url = format!("sqlite://{}", dir.path().join("rota.db").display());
        Self { dir, url }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Background tasks effectively disabled, fast lock polling.
    pub fn config(&self) -> StoreConfig {
        let mut config = StoreConfig::with_database_url(&self.url);
        config.refresh_interval_secs = 3600;
        config.cleanup_interval_secs = 3600;
        config.lock_poll_millis = 10;
        config.legacy_export_path = self.path("legacy-export.json");
        config
    }

    pub async fn connect(&self) -> SyncOperator {
        connect_with(self.config()).await
    }

    /// Direct access to the store file, bypassing any operator.
    pub async fn raw(&self) -> SqlitePool {
        let opts = SqliteConnectOptions::from_str(&self.url)
            .expect("valid sqlite url")
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .expect("open raw pool")
    }
}

pub async fn connect_with(config: StoreConfig) -> SyncOperator {
    let operator = SyncOperator::new(config).expect("build operator");
    operator.connect().await.expect("connect");
    operator
}

pub async fn lock_rows(pool: &SqlitePool) -> Vec<String> {
    sqlx::query_scalar("SELECT lock_id FROM rota_write_lock ORDER BY lock_id")
        .fetch_all(pool)
        .await
        .expect("read lock rows")
}

pub async fn marker(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT last_updated FROM rota_last_updated WHERE id = 1")
        .fetch_one(pool)
        .await
        .expect("read last-updated marker")
}

pub fn category(key: &str) -> Entity {
    Entity::create(EntityBody::Category(Category {
        key: key.into(),
        name: key.to_uppercase(),
        parent: None,
    }))
}

pub fn child_category(key: &str, parent: &EntityId) -> Entity {
    Entity::create(EntityBody::Category(Category {
        key: key.into(),
        name: key.to_uppercase(),
        parent: Some(Reference::to(parent).expect("category reference")),
    }))
}

pub fn user(username: &str) -> Entity {
    Entity::create(EntityBody::User(User {
        username: username.into(),
        name: username.to_uppercase(),
        email: None,
        admin: false,
        groups: Vec::new(),
    }))
}

pub fn resource_type(key: &str) -> Entity {
    Entity::create(EntityBody::DynamicType(DynamicType {
        key: key.into(),
        name: key.to_uppercase(),
        classification: Classification::Resource,
        attributes: Vec::new(),
    }))
}

pub fn resource(type_id: &EntityId, name: &str) -> Entity {
    Entity::create(EntityBody::Resource(Resource {
        type_ref: Reference::to(type_id).expect("type reference"),
        name: name.into(),
        owner: None,
        attributes: BTreeMap::new(),
        categories: Vec::new(),
    }))
}

pub fn renamed(entity: &Entity, name: &str) -> Entity {
    let mut edited = entity.edit();
    match &mut edited.body {
        EntityBody::Category(c) => c.name = name.into(),
        EntityBody::Resource(r) => r.name = name.into(),
        EntityBody::User(u) => u.name = name.into(),
        _ => panic!("renamed: unsupported kind {}", entity.kind()),
    }
    edited
}
