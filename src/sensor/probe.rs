//! The `SensorProbe` capability (spec §4.1).
//!
//! Implementations may block for seconds inside `sample()`. They must not
//! retain references to caller-owned buffers; each call returns an owned
//! [`ProbeReading`].

/// The subset of environmental fields a single probe measures. `None`
/// means this probe does not measure that field.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co2: Option<f64>,
    pub equivalent_co2_ppm: Option<f64>,
    pub total_voc_ppb: Option<f64>,
    pub pressure: Option<f64>,
    pub temperature_icp: Option<f64>,
}

/// A recoverable transient fault from a probe read.
#[derive(Debug, Clone, thiserror::Error)]
#[error("probe read failed: {0}")]
pub struct ProbeError(pub String);

/// An I2C environmental sensor. `sample()` is blocking and may take up to
/// several seconds on slow hardware; callers (the [`super::cache::SensorCache`]
/// worker) must call it off the async runtime.
pub trait SensorProbe: Send {
    /// Human-readable name for logging (e.g. "bme280", "scd30").
    fn name(&self) -> &str;

    /// Block until one reading is available, or a recoverable error occurs.
    fn sample(&mut self) -> Result<ProbeReading, ProbeError>;
}
