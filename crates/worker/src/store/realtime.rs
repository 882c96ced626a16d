use chrono::NaiveDateTime;

use siwatt_common::types::Sample;

use super::{StoreClient, StoreError};

impl StoreClient {
    /// Write the latest-sample snapshot for a device. Exactly one row per
    /// device: updates in place when the row exists, inserts otherwise.
    /// Repeating the same input converges to the same row, so buffer replays
    /// are harmless.
    pub async fn upsert_realtime(
        &self,
        device_id: i64,
        sample: &Sample,
        dt: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        // SELECT first rather than trusting UPDATE's affected-row count:
        // MySQL reports rows *changed*, so an identical replay would look
        // like a missing row and collide with the unique key on insert.
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM data_realtime WHERE device_id = ?")
                .bind(device_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;

        if existing.is_some() {
            sqlx::query(
                r#"
                UPDATE data_realtime
                SET voltage = ?,
                    current = ?,
                    power = ?,
                    energy = ?,
                    frequency = ?,
                    pf = ?,
                    updated_at = ?
                WHERE device_id = ?
                "#,
            )
            .bind(sample.voltage)
            .bind(sample.current)
            .bind(sample.power)
            .bind(sample.energy)
            .bind(sample.frequency)
            .bind(sample.pf)
            .bind(dt)
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO data_realtime
                    (device_id, voltage, current, power, energy, frequency, pf, updated_at)
                VALUES
                    (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(device_id)
            .bind(sample.voltage)
            .bind(sample.current)
            .bind(sample.power)
            .bind(sample.energy)
            .bind(sample.frequency)
            .bind(sample.pf)
            .bind(dt)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}
