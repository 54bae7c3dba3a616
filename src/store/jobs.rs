//! Job and field-map persistence.

use sqlx::Row;

use crate::extract::schema::{FieldMap, FieldMapping, SelectorSpec};
use crate::job::{BrowserProfileConfig, CrawlMode, EngineMode, Job, ListConfig};
use crate::utils::now_unix;

use super::{Store, StoreError, StoreResult};

impl Store {
    pub async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, name, target_url, fields, requires_auth, crawl_mode,
                 list_config, engine_mode, browser_profile, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                target_url = excluded.target_url,
                fields = excluded.fields,
                requires_auth = excluded.requires_auth,
                crawl_mode = excluded.crawl_mode,
                list_config = excluded.list_config,
                engine_mode = excluded.engine_mode,
                browser_profile = excluded.browser_profile
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.target_url)
        .bind(serde_json::to_string(&job.fields)?)
        .bind(job.requires_auth as i64)
        .bind(match job.crawl_mode {
            CrawlMode::Single => "single",
            CrawlMode::List => "list",
        })
        .bind(
            job.list_config
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(job.engine_mode.as_str())
        .bind(
            job.browser_profile
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_job(&self, id: &str) -> StoreResult<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, target_url, fields, requires_auth, crawl_mode,
                   list_config, engine_mode, browser_profile
            FROM jobs WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let fields: Vec<String> = serde_json::from_str(row.try_get::<String, _>("fields")?.as_str())?;
        let list_config: Option<ListConfig> = row
            .try_get::<Option<String>, _>("list_config")?
            .map(|s| serde_json::from_str(&s))
            .transpose()?;
        let browser_profile: Option<BrowserProfileConfig> = row
            .try_get::<Option<String>, _>("browser_profile")?
            .map(|s| serde_json::from_str(&s))
            .transpose()?;

        Ok(Some(Job {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            target_url: row.try_get("target_url")?,
            fields,
            requires_auth: row.try_get::<i64, _>("requires_auth")? != 0,
            crawl_mode: match row.try_get::<String, _>("crawl_mode")?.as_str() {
                "list" => CrawlMode::List,
                _ => CrawlMode::Single,
            },
            list_config,
            engine_mode: EngineMode::parse(row.try_get::<String, _>("engine_mode")?.as_str()),
            browser_profile,
        }))
    }

    /// Replace a job's field map wholesale, preserving mapping order.
    pub async fn save_field_map(&self, job_id: &str, field_map: &FieldMap) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM field_maps WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        for (position, mapping) in field_map.mappings.iter().enumerate() {
            sqlx::query(
                "INSERT INTO field_maps (job_id, field, spec, position) VALUES (?, ?, ?, ?)",
            )
            .bind(job_id)
            .bind(&mapping.field)
            .bind(serde_json::to_string(&mapping.spec)?)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn fetch_field_map(&self, job_id: &str) -> StoreResult<FieldMap> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT field, spec FROM field_maps WHERE job_id = ? ORDER BY position",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut mappings = Vec::with_capacity(rows.len());
        for (field, spec) in rows {
            let spec: SelectorSpec =
                serde_json::from_str(&spec).map_err(|e| StoreError::Corrupt {
                    table: "field_maps",
                    detail: format!("spec for field {field}: {e}"),
                })?;
            mappings.push(FieldMapping { field, spec });
        }

        Ok(FieldMap::new(mappings))
    }
}
