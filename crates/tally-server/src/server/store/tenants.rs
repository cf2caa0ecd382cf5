use super::SqliteStore;
use crate::common::{
    Error, Result,
    types::{ParentRef, Tenant, now_millis},
};

const TENANT_COLUMNS: &str = "id, external_token, display_name, cached_child_count, created_at";

impl SqliteStore {
    /// Creates a tenant. Tenants are created synchronously, outside the
    /// allocation pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if `external_token` is already taken.
    pub async fn create_tenant(&self, external_token: &str, display_name: &str) -> Result<Tenant> {
        let result = sqlx::query_as::<_, Tenant>(&format!(
            "INSERT INTO tenants (external_token, display_name, created_at) VALUES (?, ?, ?) \
             RETURNING {TENANT_COLUMNS}"
        ))
        .bind(external_token)
        .bind(display_name)
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(tenant) => Ok(tenant),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(Error::Conflict {
                    what: format!("tenant token {external_token}"),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn tenant(&self, id: i64) -> Result<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    pub async fn tenant_by_token(&self, external_token: &str) -> Result<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE external_token = ?"
        ))
        .bind(external_token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    /// Deletes a tenant and, through `ON DELETE CASCADE`, every thread and
    /// entry beneath it. Returns whether the tenant existed.
    pub async fn delete_tenant(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Ids of every thread owned by `tenant_id`.
    pub async fn thread_ids(&self, tenant_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT id FROM threads WHERE parent_id = ? ORDER BY id")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn parent_exists(&self, parent: ParentRef) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)",
            parent.kind.table()
        ))
        .bind(parent.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Current cached child count of `parent`, if it exists.
    ///
    /// The value is a projection; see the reconciler for its guarantees.
    pub async fn cached_count(&self, parent: ParentRef) -> Result<Option<i64>> {
        let count = sqlx::query_scalar(&format!(
            "SELECT cached_child_count FROM {} WHERE id = ?",
            parent.kind.table()
        ))
        .bind(parent.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count)
    }
}
