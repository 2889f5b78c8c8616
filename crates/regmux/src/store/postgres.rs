use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use regmux_types::{Catalog, ServerEntry, ServerVersion};

use crate::store::CatalogStore;

/// Postgres-backed snapshot store.
///
/// The snapshot for a registry is replaced inside a single transaction
/// scoped to its registry id, so readers see either the old rows or the
/// new rows, never a mix.
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn store(&self, registry: &str, catalog: &Catalog) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        let registry_id: Uuid = sqlx::query("SELECT id FROM registries WHERE name = $1")
            .bind(registry)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to look up registry")?
            .with_context(|| format!("registry {registry:?} is not persisted"))?
            .try_get("id")
            .context("failed to decode registry id")?;

        sqlx::query("DELETE FROM servers WHERE registry_id = $1")
            .bind(registry_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear previous snapshot")?;

        for (position, server) in catalog.servers.iter().enumerate() {
            let server_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO servers (id, registry_id, name, description, tags, position) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(server_id)
            .bind(registry_id)
            .bind(&server.name)
            .bind(&server.description)
            .bind(serde_json::to_value(&server.tags).context("failed to encode tags")?)
            .bind(position as i32)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert server {:?}", server.name))?;

            for (vposition, version) in server.versions.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO server_versions (id, server_id, version, detail, position) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(Uuid::new_v4())
                .bind(server_id)
                .bind(&version.version)
                .bind(serde_json::to_value(version).context("failed to encode version")?)
                .bind(vposition as i32)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!(
                        "failed to insert version {} of {:?}",
                        version.version, server.name
                    )
                })?;
            }
        }

        sqlx::query(
            "INSERT INTO catalogs (registry_id, hash, stored_at) VALUES ($1, $2, now()) \
             ON CONFLICT (registry_id) DO UPDATE SET hash = $2, stored_at = now()",
        )
        .bind(registry_id)
        .bind(&catalog.hash)
        .execute(&mut *tx)
        .await
        .context("failed to record snapshot hash")?;

        tx.commit().await.context("failed to commit snapshot")
    }

    async fn load(&self, registry: &str) -> Result<Option<Catalog>> {
        let header = sqlx::query(
            "SELECT r.id, c.hash FROM registries r \
             JOIN catalogs c ON c.registry_id = r.id \
             WHERE r.name = $1",
        )
        .bind(registry)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load snapshot header")?;

        let Some(header) = header else {
            return Ok(None);
        };
        let registry_id: Uuid = header.try_get("id").context("failed to decode id")?;
        let hash: String = header.try_get("hash").context("failed to decode hash")?;

        let server_rows = sqlx::query(
            "SELECT id, name, description, tags FROM servers \
             WHERE registry_id = $1 ORDER BY position",
        )
        .bind(registry_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load servers")?;

        let mut servers = Vec::with_capacity(server_rows.len());
        for row in server_rows {
            let server_id: Uuid = row.try_get("id").context("failed to decode server id")?;
            let tags: serde_json::Value =
                row.try_get("tags").context("failed to decode tags")?;

            let version_rows = sqlx::query(
                "SELECT detail FROM server_versions \
                 WHERE server_id = $1 ORDER BY position",
            )
            .bind(server_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to load versions")?;

            let versions = version_rows
                .into_iter()
                .map(|vrow| {
                    let detail: serde_json::Value = vrow.try_get("detail")?;
                    Ok(serde_json::from_value::<ServerVersion>(detail)
                        .context("failed to decode version detail")?)
                })
                .collect::<Result<Vec<_>>>()?;

            servers.push(ServerEntry {
                name: row.try_get("name").context("failed to decode name")?,
                description: row
                    .try_get("description")
                    .context("failed to decode description")?,
                tags: serde_json::from_value(tags).context("failed to decode tags")?,
                versions,
            });
        }

        Ok(Some(Catalog { servers, hash }))
    }

    async fn delete(&self, registry: &str) -> Result<()> {
        // Cascades into servers/server_versions/catalogs via FKs when the
        // registry row dies; here we only drop the snapshot rows.
        sqlx::query(
            "DELETE FROM servers WHERE registry_id = \
             (SELECT id FROM registries WHERE name = $1)",
        )
        .bind(registry)
        .execute(&self.pool)
        .await
        .context("failed to delete snapshot servers")?;
        sqlx::query(
            "DELETE FROM catalogs WHERE registry_id = \
             (SELECT id FROM registries WHERE name = $1)",
        )
        .bind(registry)
        .execute(&self.pool)
        .await
        .context("failed to delete snapshot header")?;
        Ok(())
    }
}
