//! Power telemetry.
//!
//! Sweeps bracket their measured window with two power samples and charge
//! the window at the mean of the pair. On the ZCU104 the PS rail is read
//! through the PMBus hwmon node in microwatts; benches without telemetry
//! plug in a constant meter instead.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::{DriverError, Result};

/// hwmon attribute for the ZCU104's PS power rail, in microwatts.
pub const ZCU104_POWER_PATH: &str =
    "/sys/bus/i2c/drivers/pmbus/4-0043/hwmon/hwmon0/power1_input";

/// Constant added to measured rail power to account for the board's
/// secondary rails, which the PMBus node does not see.
pub const PLATFORM_RAIL_OFFSET_WATTS: f64 = 2.25;

/// One instantaneous power reading.
#[derive(Debug, Clone, Copy)]
pub struct PowerSample {
    /// When the reading was taken.
    pub instant: Instant,
    /// Rail power in microwatts.
    pub microwatts: u64,
}

/// Source of power samples.
pub trait PowerMeter {
    /// Take one reading.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Telemetry`] when the source cannot be read.
    fn sample(&mut self) -> Result<PowerSample>;

    /// Two-point estimate of mean power over the window `[a, b]`, in watts.
    #[allow(clippy::cast_precision_loss)]
    fn watts(&self, a: &PowerSample, b: &PowerSample) -> f64 {
        (a.microwatts + b.microwatts) as f64 / 2.0 / 1e6
    }

    /// Width of the window `[a, b]` in seconds.
    fn seconds(&self, a: &PowerSample, b: &PowerSample) -> f64 {
        b.instant.duration_since(a.instant).as_secs_f64()
    }

    /// Energy of the window `[a, b]` at the two-point mean power, in joules.
    fn joules(&self, a: &PowerSample, b: &PowerSample) -> f64 {
        self.watts(a, b) * self.seconds(a, b)
    }
}

/// Meter backed by a sysfs hwmon attribute reporting microwatts.
#[derive(Debug, Clone)]
pub struct HwmonMeter {
    path: PathBuf,
}

impl HwmonMeter {
    /// Meter over an arbitrary hwmon power attribute.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Meter over the ZCU104's PS rail.
    #[must_use]
    pub fn zcu104() -> Self {
        Self::new(ZCU104_POWER_PATH)
    }

    /// Attribute path this meter reads.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PowerMeter for HwmonMeter {
    fn sample(&mut self) -> Result<PowerSample> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            DriverError::telemetry(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let microwatts = text.trim().parse::<u64>().map_err(|e| {
            DriverError::telemetry(format!(
                "bad power reading {:?} from {}: {e}",
                text.trim(),
                self.path.display()
            ))
        })?;
        Ok(PowerSample {
            instant: Instant::now(),
            microwatts,
        })
    }
}

/// Fixed-power meter for hosts without telemetry.
#[derive(Debug, Clone, Copy)]
pub struct ConstantMeter {
    microwatts: u64,
}

impl ConstantMeter {
    /// Meter that always reads `microwatts`.
    #[must_use]
    pub const fn new(microwatts: u64) -> Self {
        Self { microwatts }
    }

    /// Meter that always reads `watts`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_watts(watts: f64) -> Self {
        Self::new((watts * 1e6) as u64)
    }
}

impl PowerMeter for ConstantMeter {
    fn sample(&mut self) -> Result<PowerSample> {
        Ok(PowerSample {
            instant: Instant::now(),
            microwatts: self.microwatts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn constant_meter_means_to_itself() {
        let mut meter = ConstantMeter::from_watts(4.5);
        let a = meter.sample().unwrap();
        let b = meter.sample().unwrap();
        let watts = meter.watts(&a, &b);
        assert!((watts - 4.5).abs() < 1e-9);
    }

    #[test]
    fn hwmon_meter_parses_microwatts() {
        let path = std::env::temp_dir().join(format!("seqmatch-hwmon-{}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "12500000").unwrap();

        let mut meter = HwmonMeter::new(&path);
        let sample = meter.sample().unwrap();
        assert_eq!(sample.microwatts, 12_500_000);

        let other = meter.sample().unwrap();
        assert!((meter.watts(&sample, &other) - 12.5).abs() < 1e-9);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn malformed_reading_is_a_telemetry_error() {
        let path = std::env::temp_dir().join(format!(
            "seqmatch-hwmon-bad-{}",
            std::process::id()
        ));
        std::fs::write(&path, "watts: lots\n").unwrap();

        let mut meter = HwmonMeter::new(&path);
        let err = meter.sample().unwrap_err();
        assert!(matches!(err, DriverError::Telemetry { .. }));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_node_is_a_telemetry_error() {
        let mut meter = HwmonMeter::new("/nonexistent/hwmon/power1_input");
        assert!(matches!(
            meter.sample().unwrap_err(),
            DriverError::Telemetry { .. }
        ));
    }
}
