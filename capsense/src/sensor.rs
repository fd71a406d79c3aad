//! Hardware seam between the engine and the comparator, timer and event routing.

/// Period measurement hardware, one channel at a time.
///
/// An implementation owns a comparator, a timer and whatever routes the
/// comparator crossings to the timer. After [`arm_measurement`] the hardware
/// must run on its own: the rising and falling crossings are captured
/// against a running timer, and the falling crossing raises the completion
/// interrupt. If no falling crossing arrives within the
/// configured deadline, counted from [`arm_measurement`] whether or not a
/// rising crossing ever happens, the platform raises the timeout interrupt
/// instead.
///
/// [`arm_measurement`]: Sensor::arm_measurement
pub trait Sensor {
    /// Identifies the analog input wired to one channel
    type Pin: Copy;

    /// One-time setup of thresholds, timer mode, event routing and interrupts.
    fn configure(&mut self, timeout_ticks: u32);

    /// Connect the comparator to `pin`. The comparator stays disabled.
    fn select_channel(&mut self, pin: Self::Pin);

    /// Clear the timer, arm the deadline and enable the comparator.
    fn arm_measurement(&mut self);

    /// Timer ticks between the rising and falling crossing of the last
    /// measurement, or `None` if the hardware could not capture it cleanly
    /// (for example a later edge overwrote the capture before it was read).
    fn read_captured_period(&mut self) -> Option<u32>;

    /// Disable the comparator and halt the timer.
    fn stop(&mut self);

    /// Returns `true` and clears the flag if a completion event is pending.
    fn take_complete(&mut self) -> bool;

    /// Returns `true` and clears the flag if a deadline event is pending.
    fn take_timeout(&mut self) -> bool;

    /// Keep the timer clock running for the duration of a cycle.
    fn hold_clock(&mut self, _hold: bool) {}
}
