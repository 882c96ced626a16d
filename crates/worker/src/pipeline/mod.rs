mod hourly;
mod minute;
mod realtime;

pub use hourly::HourlyProcessor;
pub use minute::{MinuteAggregate, MinuteAggregator};
pub use realtime::RealtimeProcessor;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;

use siwatt_common::config::BalanceMode;
use siwatt_common::datetime::{floor_hour, parse_wire};
use siwatt_common::types::{round_kwh, BufferedRecord};

use crate::buffer::recovery::HandlerFactory;
use crate::buffer::{ProcessDecision, RecordHandler};
use crate::store::StoreClient;

/// Per-device state machine that turns buffered records into realtime
/// snapshots, minute rollups, hourly rollups and balance decrements.
///
/// Checkpoint discipline: only the sample that closes a minute — after its
/// minute upsert and any balance/hour work all succeeded — checkpoints the
/// buffer. Mid-minute samples report success without a checkpoint, so a crash
/// replays the open minute and rebuilds this in-memory state.
pub struct AggregationPipeline {
    store: Arc<StoreClient>,
    realtime: RealtimeProcessor,
    hourly: HourlyProcessor,
    minute_agg: MinuteAggregator,
    last_processed: Option<NaiveDateTime>,
    balance_mode: BalanceMode,
}

impl AggregationPipeline {
    pub fn new(store: Arc<StoreClient>, balance_mode: BalanceMode) -> Self {
        Self {
            realtime: RealtimeProcessor::new(Arc::clone(&store)),
            hourly: HourlyProcessor::new(Arc::clone(&store)),
            store,
            minute_agg: MinuteAggregator::new(),
            last_processed: None,
            balance_mode,
        }
    }

    /// Baseline for the minute's consumption delta. Defaults to the bucket's
    /// first reading; when an older minute row is already persisted, its
    /// terminal counter is used instead so the gap between minutes is
    /// attributed to the current one. A read failure only costs the gap.
    async fn energy_before(&self, device_id: i64, aggregate: &MinuteAggregate) -> f64 {
        match self.store.last_minute_row(device_id).await {
            Ok(Some(row)) if row.datetime < aggregate.minute_start => row.energy,
            Ok(_) => aggregate.energy_first,
            Err(err) => {
                tracing::warn!(
                    device_id,
                    error = %err,
                    "could not read previous minute row, using in-bucket baseline"
                );
                aggregate.energy_first
            }
        }
    }
}

impl RecordHandler for AggregationPipeline {
    async fn handle(&mut self, record: &BufferedRecord) -> ProcessDecision {
        let device_id = record.device_id;

        let dt = match parse_wire(&record.payload.datetime) {
            Ok(dt) => dt,
            Err(err) => {
                tracing::error!(
                    device_id,
                    datetime = %record.payload.datetime,
                    error = %err,
                    "record datetime failed to parse"
                );
                return ProcessDecision::failure();
            }
        };

        // Replay guard: anything at or before the last processed timestamp
        // has already taken effect. Reporting success lets the buffer move
        // past the line instead of wedging on it.
        if let Some(last) = self.last_processed {
            if dt <= last {
                metrics::counter!("worker.samples.stale_dropped").increment(1);
                return ProcessDecision::processed();
            }
        }

        if let Err(err) = self.realtime.handle(device_id, &record.payload, dt).await {
            tracing::error!(device_id, error = %err, "realtime update failed");
            return ProcessDecision::failure();
        }

        let aggregate = self.minute_agg.add(&record.payload, dt);
        self.last_processed = Some(dt);

        let Some(aggregate) = aggregate else {
            return ProcessDecision::processed();
        };

        let energy_before = self.energy_before(device_id, &aggregate).await;
        let energy_minute = round_kwh(aggregate.energy_last - energy_before);

        if let Err(err) = self
            .store
            .upsert_minute(
                device_id,
                aggregate.minute_start,
                &aggregate.averages,
                aggregate.energy_last,
                energy_minute,
            )
            .await
        {
            tracing::error!(device_id, error = %err, "minute rollup failed");
            return ProcessDecision::failure();
        }
        metrics::counter!("worker.rollups.minutely").increment(1);

        if self.balance_mode == BalanceMode::Minute {
            if let Err(err) = self
                .store
                .decrement_token_balance(device_id, energy_minute)
                .await
            {
                tracing::error!(device_id, error = %err, "minute balance decrement failed");
                return ProcessDecision::failure();
            }
        }

        let current_hour = floor_hour(dt);
        if current_hour != aggregate.bucket_hour {
            let delta = match self
                .hourly
                .handle(
                    device_id,
                    aggregate.bucket_hour,
                    current_hour,
                    aggregate.energy_last,
                )
                .await
            {
                Ok(delta) => delta,
                Err(err) => {
                    tracing::error!(device_id, error = %err, "hourly rollup failed");
                    return ProcessDecision::failure();
                }
            };

            if self.balance_mode == BalanceMode::Hour {
                if let Some(delta) = delta {
                    if let Err(err) = self.store.decrement_token_balance(device_id, delta).await {
                        tracing::error!(device_id, error = %err, "hourly balance decrement failed");
                        return ProcessDecision::failure();
                    }
                }
            }
        }

        ProcessDecision::checkpoint()
    }
}

/// Owns one `AggregationPipeline` per device, created lazily on first
/// message and kept for the worker's lifetime.
pub struct PipelineRegistry {
    store: Arc<StoreClient>,
    balance_mode: BalanceMode,
    pipelines: HashMap<String, AggregationPipeline>,
}

impl PipelineRegistry {
    pub fn new(store: Arc<StoreClient>, balance_mode: BalanceMode) -> Self {
        Self {
            store,
            balance_mode,
            pipelines: HashMap::new(),
        }
    }

    pub fn pipeline(&mut self, device_code: &str) -> &mut AggregationPipeline {
        self.pipelines
            .entry(device_code.to_string())
            .or_insert_with(|| AggregationPipeline::new(Arc::clone(&self.store), self.balance_mode))
    }
}

impl HandlerFactory for PipelineRegistry {
    type Handler = AggregationPipeline;

    fn handler_for(&mut self, device_code: &str) -> &mut AggregationPipeline {
        self.pipeline(device_code)
    }
}
