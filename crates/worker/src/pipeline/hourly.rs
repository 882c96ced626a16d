use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::store::{StoreClient, StoreError};

/// On hour rollover, computes the completed hour from persisted minute rows
/// and upserts the hourly rollup.
pub struct HourlyProcessor {
    store: Arc<StoreClient>,
}

impl HourlyProcessor {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Roll up the hour starting at `hour_start` into a row keyed by
    /// `insertion_mark` (the hour the rollover was observed in). Returns the
    /// hour's consumption delta, or `None` when the hour is not computable —
    /// that is not an error, the triggering minute still checkpoints.
    pub async fn handle(
        &self,
        device_id: i64,
        hour_start: NaiveDateTime,
        insertion_mark: NaiveDateTime,
        energy_last: f64,
    ) -> Result<Option<f64>, StoreError> {
        let Some(aggregate) = self.store.hourly_from_minutes(device_id, hour_start).await? else {
            tracing::warn!(
                device_id,
                hour_start = %hour_start,
                "no aggregate for completed hour, skipping rollup"
            );
            return Ok(None);
        };

        self.store
            .upsert_hourly(
                device_id,
                insertion_mark,
                &aggregate.averages,
                energy_last,
                aggregate.energy_delta,
            )
            .await?;

        metrics::counter!("worker.rollups.hourly").increment(1);
        Ok(Some(aggregate.energy_delta))
    }
}
