//! The row schema (spec §3) and the assembler that produces one row per
//! call by merging [`crate::sensor::cache::SensorCache`],
//! [`crate::metrics::SystemMetrics`] and [`crate::identity::HostIdentity`].

use crate::identity::HostIdentity;
use crate::metrics::SystemMetrics;
use crate::sensor::cache::SensorCache;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// One flat row, serialized as a single compact JSON object per NDJSON line.
///
/// Field order and names match the server table schema exactly (spec §3,
/// §6); numeric fields are unquoted JSON numbers, string fields are quoted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub uuid: String,
    pub rowid: String,
    pub hostname: String,
    pub host: String,
    pub ipaddress: String,
    pub macaddress: String,
    pub temperature: f64,
    pub humidity: f64,
    pub co2: f64,
    pub equivalentco2ppm: f64,
    pub totalvocppb: f64,
    pub pressure: f64,
    pub temperatureicp: f64,
    pub cputempf: i64,
    pub cpu: f64,
    pub memory: f64,
    pub diskusage: String,
    pub runtime: i64,
    pub ts: i64,
    pub systemtime: String,
    pub starttime: String,
    pub endtime: String,
    pub datetimestamp: String,
    pub te: String,
}

/// Merges the live caches into fully-populated [`Reading`]s.
pub struct ReadingAssembler<'a> {
    sensor_cache: &'a SensorCache,
    system_metrics: &'a mut SystemMetrics,
    identity: &'a HostIdentity,
    process_start: Instant,
}

impl<'a> ReadingAssembler<'a> {
    pub fn new(
        sensor_cache: &'a SensorCache,
        system_metrics: &'a mut SystemMetrics,
        identity: &'a HostIdentity,
        process_start: Instant,
    ) -> Self {
        ReadingAssembler {
            sensor_cache,
            system_metrics,
            identity,
            process_start,
        }
    }

    /// Produce one row. Never blocks on sensor I/O: `SensorCache::snapshot`
    /// is O(1), and `SystemMetrics::current` only refreshes a lightweight
    /// OS counter inline (spec §8 "Sensor non-blocking").
    pub fn assemble(&mut self) -> Reading {
        let start_sample = Instant::now();
        let sensor = self.sensor_cache.snapshot();
        let system = self.system_metrics.current();
        let end_sample = Instant::now();

        let now_local = Local::now();
        let uuid = Uuid::new_v4().to_string();
        let rowid = format!("{}_{}", now_local.format("%Y%m%d%H%M%S"), uuid);
        let runtime = self.process_start.elapsed().as_secs() as i64;
        let te = end_sample.duration_since(start_sample).as_secs_f64();

        Reading {
            uuid,
            rowid,
            hostname: self.identity.hostname().to_owned(),
            host: self.identity.hostname().to_owned(),
            ipaddress: self.identity.ipv4().to_owned(),
            macaddress: self.identity.mac().to_owned(),
            temperature: coerce_finite(sensor.values.temperature),
            humidity: coerce_finite(sensor.values.humidity),
            co2: coerce_finite(sensor.values.co2),
            equivalentco2ppm: coerce_finite(sensor.values.equivalent_co2_ppm),
            totalvocppb: coerce_finite(sensor.values.total_voc_ppb),
            pressure: coerce_finite(sensor.values.pressure),
            temperatureicp: coerce_finite(sensor.values.temperature_icp),
            cputempf: system.cpu_temp_f,
            cpu: coerce_finite(system.cpu_pct),
            memory: coerce_finite(system.mem_pct),
            diskusage: format!("{} MB", system.disk_free_mb),
            runtime,
            ts: now_local.timestamp(),
            systemtime: now_local.format("%m/%d/%Y %H:%M:%S").to_string(),
            starttime: now_local.format("%m/%d/%Y %H:%M:%S").to_string(),
            endtime: now_local.format("%m/%d/%Y %H:%M:%S").to_string(),
            datetimestamp: now_local.to_rfc3339(),
            te: format!("{te:.3}"),
        }
    }
}

fn coerce_finite(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Fixture builders shared by other modules' tests (ingest, scheduler).
#[cfg(test)]
pub mod test_support {
    use super::Reading;

    pub fn sample_reading() -> Reading {
        Reading {
            uuid: "00000000-0000-0000-0000-000000000001".to_owned(),
            rowid: "20260101000000_00000000-0000-0000-0000-000000000001".to_owned(),
            hostname: "test-host".to_owned(),
            host: "test-host".to_owned(),
            ipaddress: "127.0.0.1".to_owned(),
            macaddress: "00:00:00:00:00:00".to_owned(),
            temperature: 21.5,
            humidity: 40.0,
            co2: 450.0,
            equivalentco2ppm: 450.0,
            totalvocppb: 10.0,
            pressure: 101_325.0,
            temperatureicp: 21.5,
            cputempf: 100,
            cpu: 5.0,
            memory: 20.0,
            diskusage: "1000 MB".to_owned(),
            runtime: 1,
            ts: 1_767_225_600,
            systemtime: "01/01/2026 00:00:00".to_owned(),
            starttime: "01/01/2026 00:00:00".to_owned(),
            endtime: "01/01/2026 00:00:00".to_owned(),
            datetimestamp: "2026-01-01T00:00:00+00:00".to_owned(),
            te: "0.010".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::probe::test_support::FixedProbe;
    use crate::sensor::probe::{ProbeReading, SensorProbe};
    use std::time::Duration;

    #[test]
    fn assemble_fills_identity_and_defaults_missing_sensors_to_zero() {
        let probes: Vec<Box<dyn SensorProbe>> = vec![];
        let cache = SensorCache::start(probes, Duration::from_secs(5), Duration::from_secs(30));
        let mut metrics = SystemMetrics::new(Duration::from_secs(60));
        let identity = HostIdentity::resolve();
        let mut assembler = ReadingAssembler::new(&cache, &mut metrics, &identity, Instant::now());

        let reading = assembler.assemble();
        assert_eq!(reading.temperature, 0.0);
        assert_eq!(reading.hostname, identity.hostname());
        assert!(reading.ts > 0);
        assert!(!reading.uuid.is_empty());
        assert!(reading.rowid.ends_with(&reading.uuid));
        assert!(cache.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn each_call_produces_a_unique_uuid_and_rowid() {
        let probes: Vec<Box<dyn SensorProbe>> = vec![Box::new(FixedProbe::new(
            "temp",
            ProbeReading {
                temperature: Some(20.0),
                ..Default::default()
            },
        ))];
        let cache = SensorCache::start(probes, Duration::from_secs(5), Duration::from_secs(30));
        let mut metrics = SystemMetrics::new(Duration::from_secs(60));
        let identity = HostIdentity::resolve();
        let mut assembler = ReadingAssembler::new(&cache, &mut metrics, &identity, Instant::now());

        let a = assembler.assemble();
        let b = assembler.assemble();
        assert_ne!(a.uuid, b.uuid);
        assert_ne!(a.rowid, b.rowid);
        assert!(cache.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn sequential_assembles_do_not_block_on_slow_probe() {
        // Spec §8 "Sensor non-blocking": 1,000 sequential assemble() calls
        // complete in under 1s when the probe has a >=1s synthetic delay.
        let probes: Vec<Box<dyn SensorProbe>> = vec![Box::new(
            FixedProbe::new(
                "slow",
                ProbeReading {
                    temperature: Some(19.0),
                    ..Default::default()
                },
            )
            .with_delay(Duration::from_secs(2)),
        )];
        let cache = SensorCache::start(probes, Duration::from_secs(30), Duration::from_secs(60));
        let mut metrics = SystemMetrics::new(Duration::from_secs(60));
        let identity = HostIdentity::resolve();
        let mut assembler = ReadingAssembler::new(&cache, &mut metrics, &identity, Instant::now());

        let started = Instant::now();
        for _ in 0..1000 {
            let _ = assembler.assemble();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(cache.shutdown(Duration::from_secs(3)));
    }

    #[test]
    fn serializes_to_ndjson_line_with_expected_types() {
        let probes: Vec<Box<dyn SensorProbe>> = vec![];
        let cache = SensorCache::start(probes, Duration::from_secs(5), Duration::from_secs(30));
        let mut metrics = SystemMetrics::new(Duration::from_secs(60));
        let identity = HostIdentity::resolve();
        let mut assembler = ReadingAssembler::new(&cache, &mut metrics, &identity, Instant::now());
        let reading = assembler.assemble();

        let line = serde_json::to_string(&reading).unwrap();
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(value["temperature"].is_number());
        assert!(value["uuid"].is_string());
        assert!(cache.shutdown(Duration::from_secs(2)));
    }
}
