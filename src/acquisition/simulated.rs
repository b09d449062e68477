//! Schedulers over the simulated devices.
//!
//! Both CLI nodes build their scheduler here from the `[acquisition]`
//! section, so every combination of sampling style and wavemeter readout is
//! reachable without hardware.
//!
//! The simulated laser sits at 384 THz at 0 V and tunes by 1 GHz per volt
//! with 5 MHz of noise. In wavelength readout the same laser is reported in
//! nm, linearised around the 0 V point.

use super::{
    AcquisitionScheduler, EventDrivenScheduler, FrequencyEvents, IntensityEvents,
    IntervalScheduler, ReadScalar, WavelengthEvents, WavelengthToFrequency, SPEED_OF_LIGHT,
};
use crate::config::{AcquisitionMode, ScanConfig, WavemeterReadout};
use crate::error::AppResult;
use crate::hardware::mock::{MockPhotodiode, MockVoltageSource, MockWavemeter};
use std::sync::Arc;

/// Laser frequency at 0 V.
pub const LASER_OFFSET_HZ: f64 = 384.0e12;
/// Tuning slope.
pub const LASER_SLOPE_HZ_PER_V: f64 = 1.0e9;
/// Wavemeter noise amplitude.
pub const LASER_NOISE_HZ: f64 = 5.0e6;
/// Photodiode level and noise, in volts.
pub const PHOTODIODE_LEVEL: (f64, f64) = (0.5, 0.01);

fn wavemeter(config: &ScanConfig, output: Arc<MockVoltageSource>) -> MockWavemeter {
    let meter = match config.acquisition.wavemeter_readout {
        WavemeterReadout::Frequency => {
            MockWavemeter::tracking(output, LASER_OFFSET_HZ, LASER_SLOPE_HZ_PER_V, LASER_NOISE_HZ)
        }
        WavemeterReadout::Wavelength => {
            let offset_nm = SPEED_OF_LIGHT / LASER_OFFSET_HZ * 1e9;
            let per_hz = offset_nm / LASER_OFFSET_HZ;
            MockWavemeter::tracking(
                output,
                offset_nm,
                -LASER_SLOPE_HZ_PER_V * per_hz,
                LASER_NOISE_HZ * per_hz,
            )
            .reporting_wavelength()
        }
    };
    match config.acquisition.controller_mode {
        AcquisitionMode::Interval => meter,
        AcquisitionMode::Event => meter.with_event_period(config.timing.poll_interval()),
    }
}

/// Controller-side frequency scheduler tracking `output`.
pub fn frequency_scheduler(
    config: &ScanConfig,
    output: Arc<MockVoltageSource>,
) -> AppResult<Box<dyn AcquisitionScheduler>> {
    let meter = Arc::new(wavemeter(config, output));
    let readout = config.acquisition.wavemeter_readout;
    let scheduler: Box<dyn AcquisitionScheduler> = match config.acquisition.controller_mode {
        AcquisitionMode::Interval => {
            let period = config.timing.poll_interval();
            match readout {
                WavemeterReadout::Frequency => Box::new(IntervalScheduler::new(
                    meter,
                    Arc::new(ReadScalar::new("wavemeter")),
                    period,
                )?),
                WavemeterReadout::Wavelength => Box::new(IntervalScheduler::new(
                    meter,
                    Arc::new(WavelengthToFrequency::new("wavemeter")),
                    period,
                )?),
            }
        }
        AcquisitionMode::Event => {
            let scheduler = match readout {
                WavemeterReadout::Frequency => EventDrivenScheduler::new(
                    meter,
                    Arc::new(FrequencyEvents::new(vec![1], "wavemeter")),
                )?,
                WavemeterReadout::Wavelength => EventDrivenScheduler::new(
                    meter,
                    Arc::new(WavelengthEvents::new(1, "wavemeter")),
                )?,
            };
            Box::new(scheduler.with_quiescence(config.timing.quiescence()))
        }
    };
    Ok(scheduler)
}

/// Analyzer-side intensity scheduler.
pub fn intensity_scheduler(config: &ScanConfig) -> AppResult<Box<dyn AcquisitionScheduler>> {
    let (level, noise) = PHOTODIODE_LEVEL;
    let period = config.timing.poll_interval();
    let scheduler: Box<dyn AcquisitionScheduler> = match config.acquisition.analyzer_mode {
        AcquisitionMode::Interval => Box::new(IntervalScheduler::new(
            Arc::new(MockPhotodiode::new(level, noise)),
            Arc::new(ReadScalar::new("photodiode")),
            period,
        )?),
        AcquisitionMode::Event => Box::new(
            EventDrivenScheduler::new(
                Arc::new(MockPhotodiode::new(level, noise).with_event_period(period)),
                Arc::new(IntensityEvents::new(1, "photodiode")),
            )?
            .with_quiescence(config.timing.quiescence()),
        ),
    };
    Ok(scheduler)
}
