use tracing::info;

use crate::db::query::LocalDb;
use crate::db::schema::{AppMeta, APP_META_TABLE_DDL};
use crate::id::new_uuid_v7;
use crate::AppResult;

pub const CLIENT_ID_KEY: &str = "client_id";

/// Key/value settings local to this device.
#[derive(Clone)]
pub struct MetaStore {
    db: LocalDb,
}

impl MetaStore {
    /// Creates `app_meta` on first use so the store works before any
    /// migration has run.
    pub async fn open(db: &LocalDb) -> AppResult<Self> {
        db.run(APP_META_TABLE_DDL, &[]).await?;
        Ok(Self { db: db.clone() })
    }

    pub async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let row = self
            .db
            .select::<AppMeta>()
            .where_eq("key", key)
            .first()
            .await?;
        Ok(row.map(|r| r.value))
    }

    pub async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.db
            .delete::<AppMeta>()
            .where_eq("key", key)
            .execute()
            .await?;
        self.db
            .insert(&AppMeta {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Returns whether a value was removed.
    pub async fn remove(&self, key: &str) -> AppResult<bool> {
        let removed = self
            .db
            .delete::<AppMeta>()
            .where_eq("key", key)
            .execute()
            .await?;
        Ok(removed > 0)
    }

    pub async fn all(&self) -> AppResult<Vec<AppMeta>> {
        self.db
            .select::<AppMeta>()
            .order_by("key", crate::db::query::Order::Asc)
            .all()
            .await
    }

    /// Stable identifier for this installation, generated on first call.
    pub async fn client_id(&self) -> AppResult<String> {
        if let Some(id) = self.get(CLIENT_ID_KEY).await? {
            return Ok(id);
        }
        let id = new_uuid_v7();
        self.set(CLIENT_ID_KEY, &id).await?;
        info!(target: "waystone::app", event = "client_id_created", client_id = %id);
        Ok(id)
    }
}
