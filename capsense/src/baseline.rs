//! Learned "not pressed" period range per channel.

/// Range of untouched oscillator periods seen on one channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Baseline {
    pub min: u32,
    pub max: u32,
    pub average: u32,
}

impl Baseline {
    /// Starting point before any sample: an inverted range, so the first
    /// sample becomes both min and max.
    pub const EMPTY: Self = Self {
        min: u32::MAX,
        max: 0,
        average: 0,
    };

    /// Stretch the range to include `sample`.
    ///
    /// Returns true if min or max moved, in which case the average has been
    /// recomputed.
    pub fn widen(&mut self, sample: u32) -> bool {
        if sample <= self.max && sample >= self.min {
            return false;
        }
        if sample > self.max {
            self.max = sample;
        }
        if sample < self.min {
            self.min = sample;
        }
        // min <= max here, so the midpoint cannot overflow
        self.average = self.min + (self.max - self.min) / 2;
        true
    }

    /// True if `sample` is longer than the average by more than `margin`
    pub fn is_pressed(&self, sample: u32, margin: u32) -> bool {
        sample > self.average.saturating_add(margin)
    }
}

impl Default for Baseline {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// One calibration sweep in progress.
///
/// Samples land in a scratch set. Callers swap the scratch set into use only
/// once every run has completed, so an aborted sweep changes nothing.
#[derive(Clone, Debug)]
pub struct Calibrator<const N: usize> {
    runs: u32,
    scratch: [Baseline; N],
}

impl<const N: usize> Calibrator<N> {
    pub const fn new(runs: u32) -> Self {
        Self {
            runs,
            scratch: [Baseline::EMPTY; N],
        }
    }

    /// Forget everything collected so far.
    pub fn restart(&mut self) {
        self.scratch = [Baseline::EMPTY; N];
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    /// True if `run` (zero based) is the final sweep
    pub fn is_last_run(&self, run: u32) -> bool {
        run + 1 >= self.runs
    }

    pub fn record(&mut self, channel: usize, sample: u32) {
        if self.scratch[channel].widen(sample) {
            let b = &self.scratch[channel];
            trace!("cal ch{} min {} max {} avg {}", channel, b.min, b.max, b.average);
        }
    }

    /// Baselines learned so far
    pub fn result(&self) -> &[Baseline; N] {
        &self.scratch
    }
}
