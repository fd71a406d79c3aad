use crate::baseline::{Baseline, Calibrator};
use crate::debounce::Debouncer;
use crate::event::{Event, EventSink};
use crate::sensor::Sensor;
use crate::{CapsenseConfig, ChannelMask, Error, DEFAULT_CAPSENSE_CONFIG, MAX_CHANNELS};

/// Progress of the engine through a cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CycleState {
    Idle,
    /// Measuring the given channel of a sampling cycle
    Sampling(usize),
    /// Measuring `channel` during sweep `run` of a calibration
    Calibrating { run: u32, channel: usize },
}

/// Sampling, debounce and calibration engine for `N` channels.
///
/// The engine owns the measurement hardware and the event sink, and borrows
/// the pin assignment and tuning for its whole life. `sample()` and
/// `calibrate()` only start a cycle; the platform must route its two
/// interrupts to [`on_measurement_complete`](Self::on_measurement_complete)
/// and [`on_timeout`](Self::on_timeout), which carry the cycle through to the
/// end.
pub struct Capsense<'a, S: Sensor, E: EventSink, const N: usize> {
    sensor: S,
    pins: &'a [S::Pin; N],
    sink: E,
    config: &'a CapsenseConfig,
    state: CycleState,
    raw_pressed: ChannelMask,
    debouncer: Debouncer<N>,
    calibrator: Calibrator<N>,
    baselines: [Baseline; N],
    calibrated: bool,
    /// Lost captures of the channel being measured
    retries: u32,
}

impl<'a, S, E, const N: usize> Capsense<'a, S, E, N>
where
    S: Sensor,
    E: EventSink,
{
    const CHANNEL_COUNT_OK: () = assert!(N > 0 && N <= MAX_CHANNELS, "1 to 8 channels supported");

    /// Configure the hardware and create an idle engine.
    ///
    /// `pins[i]` is the analog input of channel `i`. Passing `None` for
    /// `config` uses [`DEFAULT_CAPSENSE_CONFIG`].
    pub fn new(mut sensor: S, pins: &'a [S::Pin; N], sink: E, config: Option<&'a CapsenseConfig>) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CHANNEL_COUNT_OK;

        let config = config.unwrap_or(&DEFAULT_CAPSENSE_CONFIG);
        sensor.configure(config.timeout_ticks);
        if config.hold_clock_between_cycles {
            sensor.hold_clock(true);
        }

        Self {
            sensor,
            pins,
            sink,
            config,
            state: CycleState::Idle,
            raw_pressed: ChannelMask::EMPTY,
            debouncer: Debouncer::new(config.debounce_threshold),
            calibrator: Calibrator::new(config.calibration_runs),
            baselines: [Baseline::EMPTY; N],
            calibrated: false,
            retries: 0,
        }
    }

    /// Start one sampling cycle over all channels.
    ///
    /// At most one [`Event::Button`] follows, from interrupt context, never
    /// from inside this call.
    pub fn sample(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;
        self.raw_pressed = ChannelMask::EMPTY;
        self.state = CycleState::Sampling(0);
        self.start_cycle();
        Ok(())
    }

    /// Start a calibration sweep. Sensors must not be touched until
    /// [`Event::Calibration`] arrives.
    pub fn calibrate(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;
        debug!("calibration start, {} runs", self.calibrator.runs());
        self.calibrator.restart();
        self.state = CycleState::Calibrating { run: 0, channel: 0 };
        self.start_cycle();
        Ok(())
    }

    /// Completion interrupt entry point. Call from the comparator interrupt handler.
    ///
    /// A reading the hardware could not capture cleanly is measured again,
    /// up to `capture_retries` times, before the cycle is dropped as if it
    /// had timed out.
    pub fn on_measurement_complete(&mut self) {
        if !self.sensor.take_complete() {
            return;
        }
        let reading = self.sensor.read_captured_period();
        self.sensor.stop();

        let period = match (self.state, reading) {
            (CycleState::Idle, _) => {
                warn!("measurement complete while idle");
                return;
            }
            (CycleState::Sampling(channel) | CycleState::Calibrating { channel, .. }, None) => {
                self.remeasure_or_abort(channel);
                return;
            }
            (_, Some(period)) => period,
        };
        self.retries = 0;

        match self.state {
            CycleState::Idle => {}
            CycleState::Sampling(channel) => self.sample_finalize(channel, period),
            CycleState::Calibrating { run, channel } => self.calibration_finalize(run, channel, period),
        }
    }

    /// Deadline interrupt entry point. Call from the timer interrupt handler.
    ///
    /// Drops the cycle in flight: nothing measured so far reaches the
    /// debouncer or the baselines.
    pub fn on_timeout(&mut self) {
        if !self.sensor.take_timeout() {
            return;
        }
        self.sensor.stop();

        match self.state {
            CycleState::Idle => {
                warn!("timeout while idle");
                return;
            }
            CycleState::Sampling(channel) | CycleState::Calibrating { channel, .. } => {
                warn!("timeout on channel {}", channel);
            }
        }

        self.abort_cycle();
    }

    pub fn is_busy(&self) -> bool {
        self.state != CycleState::Idle
    }

    /// True once a calibration sweep has run to completion
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Debounced pressed set as of the last completed sampling cycle
    pub fn debounced(&self) -> ChannelMask {
        self.debouncer.mask()
    }

    pub fn baseline(&self, channel: usize) -> Baseline {
        self.baselines[channel]
    }

    pub fn baselines(&self) -> &[Baseline; N] {
        &self.baselines
    }

    pub fn config(&self) -> &CapsenseConfig {
        self.config
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    pub fn sink(&self) -> &E {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut E {
        &mut self.sink
    }

    /// Tear down the engine, handing back the stopped hardware and the sink.
    pub fn release(mut self) -> (S, E) {
        self.sensor.stop();
        self.sensor.hold_clock(false);
        (self.sensor, self.sink)
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        if self.is_busy() {
            debug!("rejected, cycle in flight");
            return Err(Error::Busy);
        }
        Ok(())
    }

    fn start_cycle(&mut self) {
        self.retries = 0;
        self.sensor.hold_clock(true);
        self.begin_measurement(0);
    }

    fn finish_cycle(&mut self) {
        self.state = CycleState::Idle;
        if !self.config.hold_clock_between_cycles {
            self.sensor.hold_clock(false);
        }
    }

    /// Drop the cycle in flight without touching the debouncer or baselines
    fn abort_cycle(&mut self) {
        self.raw_pressed = ChannelMask::EMPTY;
        self.finish_cycle();
        self.sink.on_event(Event::Timeout);
    }

    fn remeasure_or_abort(&mut self, channel: usize) {
        if self.retries < self.config.capture_retries {
            self.retries += 1;
            debug!("ch{} capture lost, retry {}", channel, self.retries);
            self.begin_measurement(channel);
        } else {
            warn!("ch{} capture lost {} times", channel, self.retries + 1);
            self.abort_cycle();
        }
    }

    fn begin_measurement(&mut self, channel: usize) {
        self.sensor.select_channel(self.pins[channel]);
        self.sensor.arm_measurement();
    }

    fn sample_finalize(&mut self, channel: usize, period: u32) {
        let pressed = self.baselines[channel].is_pressed(period, self.config.calibration_margin);
        trace!("ch{} period {} pressed {}", channel, period, pressed);
        if pressed {
            self.raw_pressed = self.raw_pressed.with(channel);
        }

        if channel + 1 < N {
            self.state = CycleState::Sampling(channel + 1);
            self.begin_measurement(channel + 1);
            return;
        }

        // Last channel, the whole cycle is in
        self.finish_cycle();
        if let Some(mask) = self.debouncer.update(self.raw_pressed) {
            debug!("button mask {}", mask.bits());
            self.sink.on_event(Event::Button(mask));
        }
    }

    fn calibration_finalize(&mut self, run: u32, channel: usize, period: u32) {
        self.calibrator.record(channel, period);

        if channel + 1 < N {
            self.state = CycleState::Calibrating { run, channel: channel + 1 };
            self.begin_measurement(channel + 1);
        } else if !self.calibrator.is_last_run(run) {
            self.state = CycleState::Calibrating { run: run + 1, channel: 0 };
            self.begin_measurement(0);
        } else {
            self.baselines = *self.calibrator.result();
            self.calibrated = true;
            self.finish_cycle();
            info!("calibration done");
            self.sink.on_event(Event::Calibration);
        }
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::sim::{complete, overrun, run_to_idle, Recorder, SimSensor};

    const PINS: [u8; 2] = [2, 3];
    const IDLE: u32 = 100;

    fn engine<'a>(config: Option<&'a CapsenseConfig>) -> Capsense<'a, SimSensor, Recorder, 2> {
        let mut sensor = SimSensor::new();
        sensor.periods[2] = IDLE;
        sensor.periods[3] = IDLE;
        Capsense::new(sensor, &PINS, Recorder::default(), config)
    }

    fn calibrated<'a>(config: Option<&'a CapsenseConfig>) -> Capsense<'a, SimSensor, Recorder, 2> {
        let mut e = engine(config);
        e.calibrate().unwrap();
        run_to_idle(&mut e);
        e.sink_mut().events.clear();
        e
    }

    #[test]
    fn test_new_configures_sensor() {
        let e = engine(None);
        assert_eq!(e.sensor().timeout_ticks, DEFAULT_CAPSENSE_CONFIG.timeout_ticks);
        assert_eq!(e.state(), CycleState::Idle);
        assert!(!e.is_calibrated());
        assert_eq!(e.baseline(0), Baseline::EMPTY);
    }

    #[test]
    fn test_sample_measures_every_channel_in_order() {
        let mut e = calibrated(None);
        e.sensor_mut().selections.clear();

        e.sample().unwrap();
        assert_eq!(e.state(), CycleState::Sampling(0));
        assert!(e.sink().events.is_empty());

        let completions = run_to_idle(&mut e);
        assert_eq!(completions, 2);
        assert_eq!(e.sensor().selections, vec![2, 3]);
        assert!(e.sink().events.len() <= 1);
    }

    #[test]
    fn test_one_button_event_on_sixth_cycle() {
        let mut e = calibrated(None);
        e.sensor_mut().periods[2] = IDLE + 50;

        for _ in 0..5 {
            e.sample().unwrap();
            run_to_idle(&mut e);
            assert!(e.sink().events.is_empty());
        }

        e.sample().unwrap();
        run_to_idle(&mut e);
        assert_eq!(e.sink().events, vec![Event::Button(ChannelMask::from_bits(0b01))]);
        assert_eq!(e.debounced(), ChannelMask::from_bits(0b01));

        // Still held, nothing new to report
        for _ in 0..10 {
            e.sample().unwrap();
            run_to_idle(&mut e);
        }
        assert_eq!(e.sink().events.len(), 1);
    }

    #[test]
    fn test_release_after_press() {
        let mut e = calibrated(None);
        e.sensor_mut().periods[3] = IDLE + 50;
        for _ in 0..6 {
            e.sample().unwrap();
            run_to_idle(&mut e);
        }
        assert_eq!(e.debounced(), ChannelMask::from_bits(0b10));

        e.sensor_mut().periods[3] = IDLE;
        for _ in 0..6 {
            e.sample().unwrap();
            run_to_idle(&mut e);
        }
        assert_eq!(
            e.sink().events,
            vec![Event::Button(ChannelMask::from_bits(0b10)), Event::Button(ChannelMask::EMPTY)]
        );
    }

    #[test]
    fn test_margin_is_exclusive() {
        let mut e = calibrated(None);
        e.sensor_mut().periods[2] = IDLE + DEFAULT_CAPSENSE_CONFIG.calibration_margin;
        for _ in 0..10 {
            e.sample().unwrap();
            run_to_idle(&mut e);
        }
        assert!(e.sink().events.is_empty());
    }

    #[test]
    fn test_calibration_learns_constant_reading() {
        let mut e = engine(None);
        e.sensor_mut().periods[3] = 240;

        e.calibrate().unwrap();
        let completions = run_to_idle(&mut e);

        assert_eq!(completions, 2 * DEFAULT_CAPSENSE_CONFIG.calibration_runs as usize);
        assert_eq!(e.sink().events, vec![Event::Calibration]);
        assert!(e.is_calibrated());
        assert_eq!(e.baseline(0), Baseline { min: IDLE, max: IDLE, average: IDLE });
        assert_eq!(e.baseline(1), Baseline { min: 240, max: 240, average: 240 });
    }

    #[test]
    fn test_calibration_tracks_spread() {
        let config = CapsenseConfig {
            calibration_runs: 4,
            ..DEFAULT_CAPSENSE_CONFIG
        };
        let mut e = engine(Some(&config));

        e.calibrate().unwrap();
        for period in [100, 96, 108, 102] {
            e.sensor_mut().periods[2] = period;
            assert!(matches!(e.state(), CycleState::Calibrating { channel: 0, .. }));
            complete(&mut e);
            complete(&mut e);
        }

        assert_eq!(e.state(), CycleState::Idle);
        assert_eq!(e.baseline(0), Baseline { min: 96, max: 108, average: 102 });
    }

    #[test]
    fn test_recalibration_is_repeatable() {
        let mut e = calibrated(None);
        let first = *e.baselines();

        e.calibrate().unwrap();
        run_to_idle(&mut e);

        assert_eq!(e.baselines(), &first);
        assert_eq!(e.sink().events, vec![Event::Calibration]);
    }

    #[test]
    fn test_timeout_drops_cycle() {
        let config = CapsenseConfig {
            debounce_threshold: 0,
            ..DEFAULT_CAPSENSE_CONFIG
        };
        let mut e = calibrated(Some(&config));

        // Channel 0 reads pressed, then channel 1 never completes
        e.sensor_mut().periods[2] = IDLE + 50;
        e.sample().unwrap();
        complete(&mut e);
        assert_eq!(e.state(), CycleState::Sampling(1));
        e.sensor_mut().fire_timeout();
        e.on_timeout();

        assert_eq!(e.sink().events, vec![Event::Timeout]);
        assert_eq!(e.state(), CycleState::Idle);
        assert!(!e.sensor().clock_held);
        assert_eq!(e.debounced(), ChannelMask::EMPTY);

        // The aborted reading of channel 0 must not leak into the next cycle
        e.sensor_mut().periods[2] = IDLE;
        e.sensor_mut().selections.clear();
        e.sample().unwrap();
        assert_eq!(e.sensor().selections, vec![2]);
        run_to_idle(&mut e);
        assert_eq!(e.sink().events, vec![Event::Timeout]);
        assert_eq!(e.debounced(), ChannelMask::EMPTY);
    }

    #[test]
    fn test_timeout_during_calibration_keeps_baselines() {
        let mut e = calibrated(None);
        let before = *e.baselines();

        e.sensor_mut().periods[2] = 500;
        e.calibrate().unwrap();
        complete(&mut e);
        complete(&mut e);
        complete(&mut e);
        e.sensor_mut().fire_timeout();
        e.on_timeout();

        assert_eq!(e.sink().events, vec![Event::Timeout]);
        assert_eq!(e.baselines(), &before);
        assert!(e.is_calibrated());
        assert!(!e.is_busy());
    }

    #[test]
    fn test_busy_rejects_new_cycles() {
        let mut e = calibrated(None);

        e.sample().unwrap();
        complete(&mut e);
        assert_eq!(e.sample(), Err(Error::Busy));
        assert_eq!(e.calibrate(), Err(Error::Busy));
        assert_eq!(e.state(), CycleState::Sampling(1));

        assert_eq!(run_to_idle(&mut e), 1);
        assert!(e.sample().is_ok());
    }

    #[test]
    fn test_ignores_interrupts_without_pending_event() {
        let mut e = calibrated(None);
        e.sample().unwrap();

        e.on_measurement_complete();
        e.on_timeout();
        assert_eq!(e.state(), CycleState::Sampling(0));
        assert!(e.sink().events.is_empty());
    }

    #[test]
    fn test_late_completion_after_timeout_is_ignored() {
        let mut e = calibrated(None);
        e.sample().unwrap();
        e.sensor_mut().fire_timeout();
        e.on_timeout();

        e.sensor_mut().fire_complete();
        e.on_measurement_complete();
        assert_eq!(e.state(), CycleState::Idle);
        assert_eq!(e.sink().events, vec![Event::Timeout]);
    }

    #[test]
    fn test_clock_held_only_during_cycle() {
        let mut e = calibrated(None);
        assert!(!e.sensor().clock_held);

        e.sample().unwrap();
        assert!(e.sensor().clock_held);
        run_to_idle(&mut e);
        assert!(!e.sensor().clock_held);
    }

    #[test]
    fn test_stuck_pad_times_out_and_recovers() {
        let mut e = calibrated(None);

        // No crossing ever arrives, only the deadline
        e.sample().unwrap();
        assert_eq!(e.sample(), Err(Error::Busy));
        e.sensor_mut().fire_timeout();
        e.on_timeout();

        assert_eq!(e.sink().events, vec![Event::Timeout]);
        assert!(!e.is_busy());
        assert!(!e.sensor().armed);

        e.sample().unwrap();
        assert_eq!(run_to_idle(&mut e), 2);
        e.calibrate().unwrap();
        run_to_idle(&mut e);
        assert_eq!(e.sink().events, vec![Event::Timeout, Event::Calibration]);
    }

    #[test]
    fn test_lost_capture_remeasures_channel() {
        let config = CapsenseConfig {
            debounce_threshold: 0,
            ..DEFAULT_CAPSENSE_CONFIG
        };
        let mut e = calibrated(Some(&config));
        e.sensor_mut().periods[3] = IDLE + 50;
        e.sensor_mut().selections.clear();

        e.sample().unwrap();
        complete(&mut e);
        overrun(&mut e);
        assert_eq!(e.state(), CycleState::Sampling(1));
        assert!(e.sensor().armed);

        complete(&mut e);
        assert_eq!(e.state(), CycleState::Idle);
        assert_eq!(e.sensor().selections, vec![2, 3, 3]);
        assert_eq!(e.sink().events, vec![Event::Button(ChannelMask::from_bits(0b10))]);
    }

    #[test]
    fn test_retries_are_per_measurement() {
        let mut e = calibrated(None);
        let retries = DEFAULT_CAPSENSE_CONFIG.capture_retries;

        e.sample().unwrap();
        for _ in 0..retries {
            overrun(&mut e);
        }
        complete(&mut e);
        for _ in 0..retries {
            overrun(&mut e);
        }
        complete(&mut e);

        assert_eq!(e.state(), CycleState::Idle);
        assert!(e.sink().events.is_empty());
    }

    #[test]
    fn test_persistent_lost_capture_aborts_cycle() {
        let mut e = calibrated(None);
        let before = *e.baselines();

        e.sample().unwrap();
        for _ in 0..=DEFAULT_CAPSENSE_CONFIG.capture_retries {
            overrun(&mut e);
        }
        assert_eq!(e.sink().events, vec![Event::Timeout]);
        assert_eq!(e.state(), CycleState::Idle);
        assert!(!e.sensor().armed);

        // Same for a calibration sweep, which must leave the baselines alone
        e.sensor_mut().periods[2] = 500;
        e.calibrate().unwrap();
        complete(&mut e);
        for _ in 0..=DEFAULT_CAPSENSE_CONFIG.capture_retries {
            overrun(&mut e);
        }
        assert_eq!(e.sink().events, vec![Event::Timeout, Event::Timeout]);
        assert_eq!(e.baselines(), &before);
        assert!(e.sample().is_ok());
    }

    #[test]
    fn test_clock_held_between_cycles() {
        let config = CapsenseConfig {
            hold_clock_between_cycles: true,
            ..DEFAULT_CAPSENSE_CONFIG
        };
        let mut e = engine(Some(&config));
        assert!(e.sensor().clock_held);

        e.calibrate().unwrap();
        run_to_idle(&mut e);
        assert!(e.sensor().clock_held);

        e.sample().unwrap();
        e.sensor_mut().fire_timeout();
        e.on_timeout();
        assert!(e.sensor().clock_held);

        let (sensor, _) = e.release();
        assert!(!sensor.clock_held);
    }

    #[test]
    fn test_config_defaults_when_none() {
        let e = engine(None);
        assert_eq!(e.config().calibration_runs, DEFAULT_CAPSENSE_CONFIG.calibration_runs);

        let config = CapsenseConfig {
            calibration_margin: 9,
            ..DEFAULT_CAPSENSE_CONFIG
        };
        let e = engine(Some(&config));
        assert!(core::ptr::eq(e.config(), &config));
    }

    #[test]
    fn test_release_stops_hardware() {
        let mut e = calibrated(None);
        e.sample().unwrap();
        complete(&mut e);
        assert!(e.sensor().armed);

        let (sensor, sink) = e.release();
        assert!(!sensor.armed);
        assert!(!sensor.clock_held);
        assert_eq!(sensor.selections.last(), Some(&3));
        assert!(sink.events.is_empty());
    }

    #[test]
    fn test_closure_sink() {
        let mut count = 0;
        {
            let mut sensor = SimSensor::new();
            sensor.periods[7] = IDLE;
            let pins = [7u8];
            let mut e = Capsense::new(sensor, &pins, |_event: Event| count += 1, None);
            e.calibrate().unwrap();
            run_to_idle(&mut e);
        }
        assert_eq!(count, 1);
    }
}
