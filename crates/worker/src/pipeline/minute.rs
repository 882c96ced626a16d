use chrono::NaiveDateTime;

use siwatt_common::datetime::{floor_hour, floor_minute};
use siwatt_common::types::{FieldAverages, Sample};

/// A finalized minute bucket, emitted when a sample lands in a new minute.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteAggregate {
    pub minute_start: NaiveDateTime,
    /// Hour the bucket belongs to, used to detect hour rollovers.
    pub bucket_hour: NaiveDateTime,
    pub averages: FieldAverages,
    pub energy_first: f64,
    pub energy_last: f64,
}

/// In-memory running aggregate over one wall-clock minute for one device.
///
/// Samples accumulate into the open bucket; the first sample outside it
/// finalizes and returns the bucket, then opens a new one. State is never
/// persisted — after a crash it is rebuilt by replaying the buffer.
#[derive(Debug, Default)]
pub struct MinuteAggregator {
    bucket: Option<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    minute_start: NaiveDateTime,
    count: u32,
    sums: FieldAverages,
    energy_first: f64,
    energy_last: f64,
}

impl Bucket {
    fn open(minute_start: NaiveDateTime, sample: &Sample) -> Self {
        let mut bucket = Self {
            minute_start,
            count: 0,
            sums: FieldAverages::default(),
            energy_first: sample.energy,
            energy_last: sample.energy,
        };
        bucket.accumulate(sample);
        bucket
    }

    fn accumulate(&mut self, sample: &Sample) {
        self.count += 1;
        self.sums.voltage += sample.voltage;
        self.sums.current += sample.current;
        self.sums.power += sample.power;
        self.sums.frequency += sample.frequency;
        self.sums.pf += sample.pf;
        self.energy_last = sample.energy;
    }

    fn finalize(self) -> MinuteAggregate {
        let count = f64::from(self.count.max(1));
        MinuteAggregate {
            minute_start: self.minute_start,
            bucket_hour: floor_hour(self.minute_start),
            averages: FieldAverages {
                voltage: self.sums.voltage / count,
                current: self.sums.current / count,
                power: self.sums.power / count,
                frequency: self.sums.frequency / count,
                pf: self.sums.pf / count,
            },
            energy_first: self.energy_first,
            energy_last: self.energy_last,
        }
    }
}

impl MinuteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample in. Returns the finalized previous bucket when the
    /// sample opens a new minute, `None` otherwise.
    pub fn add(&mut self, sample: &Sample, dt: NaiveDateTime) -> Option<MinuteAggregate> {
        let minute_start = floor_minute(dt);

        if let Some(bucket) = &mut self.bucket {
            if bucket.minute_start == minute_start {
                bucket.accumulate(sample);
                return None;
            }
        }

        let finalized = self.bucket.take().map(Bucket::finalize);
        self.bucket = Some(Bucket::open(minute_start, sample));
        finalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siwatt_common::datetime::parse_wire;

    fn sample(energy: f64) -> Sample {
        Sample {
            datetime: String::new(),
            voltage: 220.0,
            current: 1.0,
            power: 220.0,
            energy,
            frequency: 50.0,
            pf: 1.0,
            device_id: None,
        }
    }

    #[test]
    fn first_sample_opens_bucket_without_aggregate() {
        let mut agg = MinuteAggregator::new();
        let dt = parse_wire("01-01-2024 10:00:10").unwrap();
        assert!(agg.add(&sample(100.0), dt).is_none());
    }

    #[test]
    fn samples_in_same_minute_accumulate() {
        let mut agg = MinuteAggregator::new();
        assert!(agg
            .add(&sample(100.000), parse_wire("01-01-2024 10:00:10").unwrap())
            .is_none());
        assert!(agg
            .add(&sample(100.002), parse_wire("01-01-2024 10:00:20").unwrap())
            .is_none());
        assert!(agg
            .add(&sample(100.005), parse_wire("01-01-2024 10:00:40").unwrap())
            .is_none());
    }

    #[test]
    fn minute_rollover_finalizes_previous_bucket() {
        let mut agg = MinuteAggregator::new();
        let mut first = sample(100.000);
        first.voltage = 230.0;
        agg.add(&first, parse_wire("01-01-2024 10:00:10").unwrap());
        agg.add(&sample(100.002), parse_wire("01-01-2024 10:00:20").unwrap());
        agg.add(&sample(100.005), parse_wire("01-01-2024 10:00:40").unwrap());

        let finalized = agg
            .add(&sample(100.012), parse_wire("01-01-2024 10:01:05").unwrap())
            .expect("crossing the minute boundary must finalize");

        assert_eq!(
            finalized.minute_start,
            parse_wire("01-01-2024 10:00:00").unwrap()
        );
        assert_eq!(
            finalized.bucket_hour,
            parse_wire("01-01-2024 10:00:00").unwrap()
        );
        assert!((finalized.averages.voltage - (230.0 + 220.0 + 220.0) / 3.0).abs() < 1e-9);
        assert!((finalized.averages.current - 1.0).abs() < 1e-9);
        assert_eq!(finalized.energy_first, 100.000);
        assert_eq!(finalized.energy_last, 100.005);
    }

    #[test]
    fn rollover_opens_new_bucket_with_incoming_sample() {
        let mut agg = MinuteAggregator::new();
        agg.add(&sample(100.000), parse_wire("01-01-2024 10:00:10").unwrap());
        agg.add(&sample(100.012), parse_wire("01-01-2024 10:01:05").unwrap());

        let finalized = agg
            .add(&sample(100.020), parse_wire("01-01-2024 10:02:00").unwrap())
            .expect("second rollover");
        assert_eq!(
            finalized.minute_start,
            parse_wire("01-01-2024 10:01:00").unwrap()
        );
        assert_eq!(finalized.energy_first, 100.012);
        assert_eq!(finalized.energy_last, 100.012);
    }

    #[test]
    fn hour_boundary_is_visible_on_the_finalized_bucket() {
        let mut agg = MinuteAggregator::new();
        agg.add(&sample(100.0), parse_wire("01-01-2024 10:59:50").unwrap());
        let finalized = agg
            .add(&sample(100.1), parse_wire("01-01-2024 11:00:05").unwrap())
            .unwrap();
        assert_eq!(
            finalized.bucket_hour,
            parse_wire("01-01-2024 10:00:00").unwrap()
        );
    }
}
