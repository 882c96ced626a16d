use chrono::{Duration, NaiveDateTime};

use siwatt_common::types::{round_kwh, FieldAverages};

use super::{StoreClient, StoreError};

/// The most recent persisted minute row's timestamp and cumulative energy.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MinuteTail {
    pub datetime: NaiveDateTime,
    pub energy: f64,
}

/// Hour rollup computed from persisted minute rows.
#[derive(Debug, Clone)]
pub struct HourlyAggregate {
    pub averages: FieldAverages,
    /// Consumption attributed to the hour, measured from the previous hour's
    /// terminal cumulative energy to this hour's first reading.
    pub energy_delta: f64,
    /// Cumulative counter at this hour's first minute row.
    pub energy_after: f64,
}

/// Internal row type for AVG queries. MySQL returns NULL averages on an
/// empty window, so every field is optional and gated on the row count.
#[derive(sqlx::FromRow)]
struct AverageRow {
    voltage: Option<f64>,
    current: Option<f64>,
    power: Option<f64>,
    frequency: Option<f64>,
    pf: Option<f64>,
    samples: i64,
}

impl StoreClient {
    /// Write one minute rollup row keyed by `(device_id, minute_start)`.
    pub async fn upsert_minute(
        &self,
        device_id: i64,
        minute_start: NaiveDateTime,
        averages: &FieldAverages,
        energy_last: f64,
        energy_minute: f64,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM data_minutely WHERE device_id = ? AND datetime = ?")
                .bind(device_id)
                .bind(minute_start)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;

        if existing.is_some() {
            sqlx::query(
                r#"
                UPDATE data_minutely
                SET voltage = ?,
                    current = ?,
                    power = ?,
                    energy = ?,
                    frequency = ?,
                    pf = ?,
                    energy_minute = ?
                WHERE device_id = ? AND datetime = ?
                "#,
            )
            .bind(averages.voltage)
            .bind(averages.current)
            .bind(averages.power)
            .bind(energy_last)
            .bind(averages.frequency)
            .bind(averages.pf)
            .bind(energy_minute)
            .bind(device_id)
            .bind(minute_start)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO data_minutely
                    (device_id, datetime, voltage, current, power, energy, frequency, pf, energy_minute)
                VALUES
                    (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(device_id)
            .bind(minute_start)
            .bind(averages.voltage)
            .bind(averages.current)
            .bind(averages.power)
            .bind(energy_last)
            .bind(averages.frequency)
            .bind(averages.pf)
            .bind(energy_minute)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// The newest minute row for a device, used as the baseline for
    /// cross-minute energy deltas.
    pub async fn last_minute_row(&self, device_id: i64) -> Result<Option<MinuteTail>, StoreError> {
        sqlx::query_as::<_, MinuteTail>(
            r#"
            SELECT datetime, energy
            FROM data_minutely
            WHERE device_id = ?
            ORDER BY datetime DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Compute the completed hour's aggregate from persisted minute rows.
    ///
    /// Averages span `[hour_start, hour_start + 1h)`. The consumption delta is
    /// anchored on the previous hour's terminal counter — the hourly row at
    /// `hour_start - 1h` when present, else the earliest minute row of that
    /// hour — so the gap between the previous hour's last sample and this
    /// hour's first sample is not lost. Returns `None` when the window has no
    /// minute rows or no previous-hour reference exists.
    pub async fn hourly_from_minutes(
        &self,
        device_id: i64,
        hour_start: NaiveDateTime,
    ) -> Result<Option<HourlyAggregate>, StoreError> {
        let prev_hour = hour_start - Duration::hours(1);
        let hour_end = hour_start + Duration::hours(1);

        let averages = sqlx::query_as::<_, AverageRow>(
            r#"
            SELECT
                AVG(voltage) AS voltage,
                AVG(current) AS current,
                AVG(power) AS power,
                AVG(frequency) AS frequency,
                AVG(pf) AS pf,
                COUNT(*) AS samples
            FROM data_minutely
            WHERE device_id = ? AND datetime >= ? AND datetime < ?
            "#,
        )
        .bind(device_id)
        .bind(hour_start)
        .bind(hour_end)
        .fetch_one(self.pool())
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if averages.samples == 0 {
            return Ok(None);
        }

        let prev_energy: Option<(f64,)> = sqlx::query_as(
            r#"
            SELECT energy
            FROM data_hourly
            WHERE device_id = ? AND datetime = ?
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(prev_hour)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let prev_energy = match prev_energy {
            Some(row) => Some(row),
            None => sqlx::query_as(
                r#"
                SELECT energy
                FROM data_minutely
                WHERE device_id = ? AND datetime >= ? AND datetime < ?
                ORDER BY datetime ASC
                LIMIT 1
                "#,
            )
            .bind(device_id)
            .bind(prev_hour)
            .bind(hour_start)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?,
        };

        let Some((energy_before,)) = prev_energy else {
            return Ok(None);
        };

        let first_of_hour: Option<(f64,)> = sqlx::query_as(
            r#"
            SELECT energy
            FROM data_minutely
            WHERE device_id = ? AND datetime >= ? AND datetime < ?
            ORDER BY datetime ASC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(hour_start)
        .bind(hour_end)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let Some((energy_after,)) = first_of_hour else {
            return Ok(None);
        };

        Ok(Some(HourlyAggregate {
            averages: FieldAverages {
                voltage: averages.voltage.unwrap_or_default(),
                current: averages.current.unwrap_or_default(),
                power: averages.power.unwrap_or_default(),
                frequency: averages.frequency.unwrap_or_default(),
                pf: averages.pf.unwrap_or_default(),
            },
            energy_delta: round_kwh(energy_after - energy_before),
            energy_after,
        }))
    }

    /// Write one hourly rollup row keyed by `(device_id, dt)`, where `dt` is
    /// the hour the rollover was observed in.
    pub async fn upsert_hourly(
        &self,
        device_id: i64,
        dt: NaiveDateTime,
        averages: &FieldAverages,
        energy_last: f64,
        energy_hour: f64,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM data_hourly WHERE device_id = ? AND datetime = ?")
                .bind(device_id)
                .bind(dt)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;

        if existing.is_some() {
            sqlx::query(
                r#"
                UPDATE data_hourly
                SET voltage = ?,
                    current = ?,
                    power = ?,
                    energy = ?,
                    frequency = ?,
                    pf = ?,
                    energy_hour = ?
                WHERE device_id = ? AND datetime = ?
                "#,
            )
            .bind(averages.voltage)
            .bind(averages.current)
            .bind(averages.power)
            .bind(energy_last)
            .bind(averages.frequency)
            .bind(averages.pf)
            .bind(energy_hour)
            .bind(device_id)
            .bind(dt)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO data_hourly
                    (device_id, datetime, voltage, current, power, energy, frequency, pf, energy_hour)
                VALUES
                    (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(device_id)
            .bind(dt)
            .bind(averages.voltage)
            .bind(averages.current)
            .bind(averages.power)
            .bind(energy_last)
            .bind(averages.frequency)
            .bind(averages.pf)
            .bind(energy_hour)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}
