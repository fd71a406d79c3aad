use crate::ChannelMask;

/// Notification from the engine, delivered from interrupt context
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// The debounced pressed set changed
    Button(ChannelMask),
    /// A calibration sweep finished and the new baselines are in use
    Calibration,
    /// A channel produced no falling crossing in time. The cycle was dropped.
    Timeout,
}

/// Receiver for [`Event`]s.
///
/// Called synchronously from inside the interrupt entry points, so it should
/// be short: set a flag, push to a queue, toggle a pin.
pub trait EventSink {
    fn on_event(&mut self, event: Event);
}

impl<F> EventSink for F
where
    F: FnMut(Event),
{
    fn on_event(&mut self, event: Event) {
        self(event)
    }
}
