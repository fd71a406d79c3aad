//! Simulated measurement hardware for host tests.

use crate::engine::Capsense;
use crate::event::{Event, EventSink};
use crate::sensor::Sensor;
use crate::MAX_CHANNELS;

/// Pretend comparator and timer. Each pin oscillates with a fixed period
/// set by the test; the test decides when the crossing or the deadline
/// "happens".
#[derive(Debug)]
pub struct SimSensor {
    /// Half period produced by each pin, indexed by pin number
    pub periods: [u32; MAX_CHANNELS],
    pub timeout_ticks: u32,
    pub selected: Option<u8>,
    pub armed: bool,
    pub clock_held: bool,
    /// Every pin passed to `select_channel`, in order
    pub selections: Vec<u8>,
    captured: Option<u32>,
    complete_pending: bool,
    timeout_pending: bool,
}

impl SimSensor {
    pub fn new() -> Self {
        Self {
            periods: [0; MAX_CHANNELS],
            timeout_ticks: 0,
            selected: None,
            armed: false,
            clock_held: false,
            selections: Vec::new(),
            captured: None,
            complete_pending: false,
            timeout_pending: false,
        }
    }

    /// Falling crossing on the selected pin: latch its period and raise the
    /// completion event.
    pub fn fire_complete(&mut self) {
        let pin = self.selected.expect("no channel selected");
        self.captured = Some(self.periods[pin as usize]);
        self.armed = false;
        self.complete_pending = true;
    }

    /// Falling crossing whose capture is overwritten before it is read.
    pub fn fire_overrun(&mut self) {
        self.captured = None;
        self.armed = false;
        self.complete_pending = true;
    }

    /// The deadline expires before any falling crossing.
    pub fn fire_timeout(&mut self) {
        self.armed = false;
        self.timeout_pending = true;
    }
}

impl Sensor for SimSensor {
    type Pin = u8;

    fn configure(&mut self, timeout_ticks: u32) {
        self.timeout_ticks = timeout_ticks;
    }

    fn select_channel(&mut self, pin: u8) {
        assert!(!self.armed, "channel switched mid measurement");
        self.selected = Some(pin);
        self.selections.push(pin);
    }

    fn arm_measurement(&mut self) {
        self.armed = true;
    }

    fn read_captured_period(&mut self) -> Option<u32> {
        self.captured.take()
    }

    fn stop(&mut self) {
        self.armed = false;
    }

    fn take_complete(&mut self) -> bool {
        core::mem::take(&mut self.complete_pending)
    }

    fn take_timeout(&mut self) -> bool {
        core::mem::take(&mut self.timeout_pending)
    }

    fn hold_clock(&mut self, hold: bool) {
        self.clock_held = hold;
    }
}

/// Sink that keeps every event it is handed
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
}

impl EventSink for Recorder {
    fn on_event(&mut self, event: Event) {
        self.events.push(event);
    }
}

/// Let the armed measurement finish and run the completion handler.
pub fn complete<E: EventSink, const N: usize>(engine: &mut Capsense<'_, SimSensor, E, N>) {
    assert!(engine.sensor().armed, "no measurement armed");
    engine.sensor_mut().fire_complete();
    engine.on_measurement_complete();
}

/// Finish the armed measurement with a lost capture and run the completion handler.
pub fn overrun<E: EventSink, const N: usize>(engine: &mut Capsense<'_, SimSensor, E, N>) {
    assert!(engine.sensor().armed, "no measurement armed");
    engine.sensor_mut().fire_overrun();
    engine.on_measurement_complete();
}

/// Complete measurements until the engine goes idle. Returns how many it took.
pub fn run_to_idle<E: EventSink, const N: usize>(engine: &mut Capsense<'_, SimSensor, E, N>) -> usize {
    let mut count = 0;
    while engine.is_busy() {
        complete(engine);
        count += 1;
    }
    count
}
