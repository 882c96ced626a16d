use chrono::NaiveDateTime;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use super::{StoreClient, StoreError};

/// Identity of a provisioned device, joined with its owner.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceRef {
    pub id: i64,
    pub device_code: String,
    pub user_id: i64,
    pub username: String,
}

impl StoreClient {
    /// Look up a device by its owner's username and its device code.
    pub async fn resolve_device(
        &self,
        username: &str,
        device_code: &str,
    ) -> Result<Option<DeviceRef>, StoreError> {
        sqlx::query_as::<_, DeviceRef>(
            r#"
            SELECT d.id, d.device_code, d.user_id, u.username
            FROM devices d
            JOIN users u ON u.id = d.user_id
            WHERE u.username = ? AND d.device_code = ?
            "#,
        )
        .bind(username)
        .bind(device_code)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Record that a device reported at `dt`: refresh `last_online`, recompute
    /// `up_time` from `created_at`, and flag it active.
    pub async fn mark_device_online(
        &self,
        device_id: i64,
        dt: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE devices
            SET last_online = ?,
                up_time = TIMESTAMPDIFF(SECOND, created_at, ?),
                is_active = 1
            WHERE id = ?
            "#,
        )
        .bind(dt)
        .bind(dt)
        .bind(device_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Deactivate every active device that has not reported for 20 seconds
    /// (or has never reported). Returns the number of devices swept.
    pub async fn sweep_offline(&self) -> Result<u64, StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE devices
            SET is_active = 0
            WHERE (last_online < NOW() - INTERVAL 20 SECOND OR last_online IS NULL)
              AND is_active = 1
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Charge measured consumption against the prepaid balance, flooring at
    /// zero. The amount is bound as a decimal so the `DECIMAL` column's
    /// arithmetic stays exact.
    pub async fn decrement_token_balance(
        &self,
        device_id: i64,
        amount: f64,
    ) -> Result<(), StoreError> {
        let amount = Decimal::from_f64(amount)
            .ok_or_else(|| StoreError::Query(format!("non-finite balance delta: {amount}")))?;

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE devices
            SET token_balance = GREATEST(token_balance - ?, 0)
            WHERE id = ?
            "#,
        )
        .bind(amount)
        .bind(device_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}
