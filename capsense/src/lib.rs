#![cfg_attr(not(test), no_std)]

//! Interrupt driven capacitive touch sensing.
//!
//! Each sensor pad is part of an RC relaxation oscillator. A comparator
//! watches the pad voltage and a timer, started and captured by the
//! comparator crossings through hardware event routing, measures the half
//! period. A touch adds capacitance and so lengthens the period.
//!
//! [`Capsense`] measures one channel at a time, because the comparator and
//! timer are a single shared resource. A [`Capsense::sample`] cycle ends in
//! the debounce filter, a [`Capsense::calibrate`] sweep learns a per channel
//! [`Baseline`]. Both are started from the main line and then driven entirely
//! by the two interrupt entry points, [`Capsense::on_measurement_complete`]
//! and [`Capsense::on_timeout`]. Results are delivered to an [`EventSink`].

#[macro_use]
mod fmt;

pub mod baseline;
#[cfg(feature = "stm32f0x1")]
pub mod comp;
pub mod debounce;
pub mod engine;
pub mod event;
pub mod sensor;
#[cfg(test)]
mod sim;

pub use baseline::{Baseline, Calibrator};
pub use debounce::Debouncer;
pub use engine::{Capsense, CycleState};
pub use event::{Event, EventSink};
pub use sensor::Sensor;

/// Upper bound on channels, one bit each in a [`ChannelMask`]
pub const MAX_CHANNELS: usize = 8;

/// Tuning for the sensing engine
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CapsenseConfig {
    /// A channel flips state once its confidence counter exceeds this value,
    /// i.e. after `debounce_threshold + 1` agreeing cycles.
    pub debounce_threshold: u32,
    /// Number of full sweeps over all channels in one calibration
    pub calibration_runs: u32,
    /// A raw period must exceed the baseline average by more than this to count as pressed
    pub calibration_margin: u32,
    /// Timer ticks allowed for one measurement before the cycle is abandoned
    pub timeout_ticks: u32,
    /// Recommended interval between `sample()` calls. The engine does not schedule itself.
    pub sample_interval_ms: u32,
    /// Times one channel is measured again after a lost capture before the
    /// cycle is dropped with a timeout
    pub capture_retries: u32,
    /// Keep the timer clock requested from `new()` on, instead of only while
    /// a cycle runs. Trades idle power for constant measurement latency.
    pub hold_clock_between_cycles: bool,
}

impl CapsenseConfig {
    const fn default() -> Self {
        Self {
            debounce_threshold: 5,
            calibration_runs: 25,
            calibration_margin: 3,
            timeout_ticks: 1000 * 16,
            sample_interval_ms: 10,
            capture_retries: 2,
            hold_clock_between_cycles: false,
        }
    }
}

pub const DEFAULT_CAPSENSE_CONFIG: CapsenseConfig = CapsenseConfig::default();

/// Set of channels, bit `i` for channel `i`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelMask(u8);

impl ChannelMask {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, channel: usize) -> bool {
        channel < MAX_CHANNELS && self.0 & (1 << channel) != 0
    }

    /// Channels past [`MAX_CHANNELS`] are ignored, as in [`contains`](Self::contains)
    #[must_use]
    pub const fn with(self, channel: usize) -> Self {
        if channel >= MAX_CHANNELS {
            return self;
        }
        Self(self.0 | (1 << channel))
    }

    #[must_use]
    pub const fn without(self, channel: usize) -> Self {
        if channel >= MAX_CHANNELS {
            return self;
        }
        Self(self.0 & !(1 << channel))
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Errors returned by the engine entry points
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A sampling cycle or calibration sweep is still in flight
    Busy,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Busy => f.write_str("capsense cycle in progress"),
        }
    }
}
