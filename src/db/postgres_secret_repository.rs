use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};

use super::conflict_on_unique;
use super::secret_repository::SecretRepository;
use crate::errors::SchedulerResult;
use crate::models::secret::Secret;

const SECRET_COLUMNS: &str = "id, secret_version, master_key_id, algorithm, encrypted_dek, dek_nonce, \
     encrypted_data, data_nonce, created_at";

pub struct PostgresSecretRepository {
    pub pool: PgPool,
}

pub(crate) async fn insert_secret(conn: &mut PgConnection, secret: &Secret) -> SchedulerResult<()> {
    let envelope = &secret.envelope;
    sqlx::query(
        r#"
        INSERT INTO secrets (
            id, secret_version, master_key_id, algorithm,
            encrypted_dek, dek_nonce, encrypted_data, data_nonce, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(&secret.id)
    .bind(secret.secret_version)
    .bind(envelope.master_key_id)
    .bind(&envelope.algorithm)
    .bind(&envelope.encrypted_dek)
    .bind(&envelope.dek_nonce)
    .bind(&envelope.encrypted_data)
    .bind(&envelope.data_nonce)
    .bind(secret.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| conflict_on_unique(e, "secret"))?;
    Ok(())
}

#[async_trait]
impl SecretRepository for PostgresSecretRepository {
    async fn find_secret(&self, secret_id: &str) -> SchedulerResult<Option<Secret>> {
        let sql = format!("SELECT {} FROM secrets WHERE id = $1", SECRET_COLUMNS);
        Ok(sqlx::query_as::<_, Secret>(&sql)
            .bind(secret_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn live_secrets_wrapped_before(&self, master_key_id: i32, limit: i64) -> SchedulerResult<Vec<Secret>> {
        let sql = format!(
            r#"
            SELECT {} FROM secrets s
            WHERE s.master_key_id < $1
              AND EXISTS (
                SELECT 1 FROM tenants t
                WHERE t.current_signing_key = s.id OR t.next_signing_key = s.id
              )
            ORDER BY s.id
            LIMIT $2
            "#,
            SECRET_COLUMNS
        );
        Ok(sqlx::query_as::<_, Secret>(&sql)
            .bind(master_key_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn supersede_secret(&self, old_secret_id: &str, replacement: &Secret) -> SchedulerResult<u64> {
        let mut tx = self.pool.begin().await?;
        let holders: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM tenants WHERE current_signing_key = $1 OR next_signing_key = $1 FOR UPDATE",
        )
        .bind(old_secret_id)
        .fetch_all(&mut *tx)
        .await?;
        if holders.is_empty() {
            return Ok(0);
        }

        insert_secret(&mut tx, replacement).await?;
        sqlx::query(
            r#"
            UPDATE tenants
            SET current_signing_key = CASE WHEN current_signing_key = $1 THEN $2 ELSE current_signing_key END,
                next_signing_key = CASE WHEN next_signing_key = $1 THEN $2 ELSE next_signing_key END
            WHERE id = ANY($3)
            "#,
        )
        .bind(old_secret_id)
        .bind(&replacement.id)
        .bind(&holders)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(holders.len() as u64)
    }
}
