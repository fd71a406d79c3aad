#![no_main]
#![no_std]

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use cortex_m;
use cortex_m::interrupt::Mutex;
use cortex_m_rt::{entry, exception};
use heapless::spsc::{Producer, Queue};
use panic_halt as _;

use stm32f0xx_hal as hal;

use capsense::comp::{CompInput, CompSensor};
use capsense::{Capsense, CapsenseConfig, Event, EventSink, DEFAULT_CAPSENSE_CONFIG};

use crate::hal::pac;
use crate::hal::pac::interrupt;
use crate::hal::prelude::*;

mod serial;

const NUM_PADS: usize = 2;
const EVENT_Q_SIZE: usize = 8;

/// Pad wiring: channel 0 on COMP1 (PA1), channel 1 on COMP2 (PA3)
static PADS: [CompInput; NUM_PADS] = [CompInput::Comp1, CompInput::Comp2];

static CAPSENSE_CONFIG: CapsenseConfig = CapsenseConfig {
    // 1 ms at the 16 MHz measurement clock
    timeout_ticks: 1000 * 16,
    ..DEFAULT_CAPSENSE_CONFIG
};

/// Forwards engine events out of interrupt context to the main loop
struct EventQueue(Producer<'static, Event, EVENT_Q_SIZE>);

impl EventSink for EventQueue {
    fn on_event(&mut self, event: Event) {
        // If the main loop falls this far behind, losing a report is fine
        self.0.enqueue(event).ok();
    }
}

type Engine = Capsense<'static, CompSensor, EventQueue, NUM_PADS>;

static CAPSENSE: Mutex<RefCell<Option<Engine>>> = Mutex::new(RefCell::new(None));
static TIME: AtomicU32 = AtomicU32::new(0);
static SKIPPED_TICKS: AtomicU32 = AtomicU32::new(0);

/// Run `f` on the engine with interrupts masked
fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> Option<R> {
    cortex_m::interrupt::free(|cs| CAPSENSE.borrow(cs).borrow_mut().as_mut().map(f))
}

#[entry]
fn main() -> ! {
    let dp = pac::Peripherals::take().unwrap();
    let cp = cortex_m::Peripherals::take().unwrap();
    let mut nvic = cp.NVIC;

    let mut flash = dp.FLASH;
    let mut rcc = dp.RCC.configure().sysclk(48.mhz()).freeze(&mut flash);
    let gpioa = dp.GPIOA.split(&mut rcc);
    let gpiob = dp.GPIOB.split(&mut rcc);

    // A library requiring a critical section to set a gpio AF register is bad and I just won't.
    let fake_cs = unsafe { cortex_m::interrupt::CriticalSection::new() };

    // Pads on the comparator inputs, each fed back from its comparator output
    // through the oscillator resistor
    let _pad0 = gpioa.pa1.into_analog(&fake_cs);
    let _pad1 = gpioa.pa3.into_analog(&fake_cs);
    let _comp1_out = gpioa.pa6.into_alternate_af7(&fake_cs);
    let _comp2_out = gpioa.pa7.into_alternate_af7(&fake_cs);

    let tx_pin = gpiob.pb6.into_alternate_af0(&fake_cs);
    let rx_pin = gpiob.pb7.into_alternate_af0(&fake_cs);
    let uart = hal::serial::Serial::usart1(dp.USART1, (tx_pin, rx_pin), 115200.bps(), &mut rcc);
    // Priorities use the top 2 bits on Cortex-M0, lower value wins
    serial::uart1::init(uart, 0xc0);

    // If pclk is prescaled from hclk, the frequency fed into the timers is doubled
    let timer_clk = if rcc.clocks.hclk().0 == rcc.clocks.pclk().0 {
        rcc.clocks.pclk().0
    } else {
        rcc.clocks.pclk().0 * 2
    };

    static mut EVENT_Q: Queue<Event, EVENT_Q_SIZE> = Queue::new();
    let (event_producer, mut event_consumer) = unsafe { EVENT_Q.split() };

    let engine = Capsense::new(
        CompSensor::new(timer_clk),
        &PADS,
        EventQueue(event_producer),
        Some(&CAPSENSE_CONFIG),
    );
    cortex_m::interrupt::free(|cs| {
        CAPSENSE.borrow(cs).borrow_mut().replace(engine);
    });

    unsafe {
        // Completion must be read before the next falling edge lands in CCR2
        nvic.set_priority(pac::Interrupt::ADC_COMP, 0x00);
        nvic.set_priority(pac::Interrupt::TIM3, 0x40);
        cortex_m::peripheral::NVIC::unmask(pac::Interrupt::ADC_COMP);
        cortex_m::peripheral::NVIC::unmask(pac::Interrupt::TIM3);
    }

    // Pads must be left alone until the calibration report comes out
    with_engine(|engine| engine.calibrate().ok());

    // SysTick drives sampling from here on
    let sample_hz = 1000 / CAPSENSE_CONFIG.sample_interval_ms;
    let mut syst = hal::timers::Timer::syst(cp.SYST, sample_hz.hz(), &mut rcc);
    syst.listen(&hal::timers::Event::TimeOut);

    loop {
        while let Some(event) = event_consumer.dequeue() {
            report(event);
        }
        cortex_m::asm::wfi();
    }
}

fn report(event: Event) {
    let mut writer = serial::uart1::writer();
    let time = TIME.load(Ordering::Relaxed);

    match event {
        Event::Button(mask) => {
            core::fmt::write(&mut writer, format_args!("{} BUTTONS {:02b}\r\n", time, mask.bits())).ok();
        }
        Event::Calibration => {
            let baselines = with_engine(|engine| *engine.baselines());
            for (i, b) in baselines.iter().flatten().enumerate() {
                core::fmt::write(
                    &mut writer,
                    format_args!("{} CAL ch{} min {} max {} avg {}\r\n", time, i, b.min, b.max, b.average),
                )
                .ok();
            }
        }
        Event::Timeout => {
            let skipped = SKIPPED_TICKS.load(Ordering::Relaxed);
            core::fmt::write(&mut writer, format_args!("{} TIMEOUT (skipped ticks {})\r\n", time, skipped)).ok();
        }
    }
}

#[exception]
fn SysTick() {
    let time = TIME.load(Ordering::Relaxed);
    TIME.store(time + 1, Ordering::Relaxed);

    // Busy means a calibration is running or the last cycle overran the tick
    if let Some(Err(_)) = with_engine(|engine| engine.sample()) {
        let skipped = SKIPPED_TICKS.load(Ordering::Relaxed);
        SKIPPED_TICKS.store(skipped + 1, Ordering::Relaxed);
    }
}

#[interrupt]
fn ADC_COMP() {
    with_engine(|engine| engine.on_measurement_complete());
}

#[interrupt]
fn TIM3() {
    with_engine(|engine| engine.on_timeout());
}
