//! [`Sensor`] for the STM32F051 comparators and TIM3.
//!
//! Like the rest of this crate's register code, `CompSensor` reaches the COMP,
//! TIM3, EXTI and RCC registers through their raw pointers instead of taking
//! PAC singletons. Nothing else in the application may touch COMP or TIM3,
//! and EXTI lines 21/22 are reserved for the comparators.
//!
//! Each pad is an RC relaxation oscillator: the pad sits on the comparator's
//! non-inverting input (PA1 for COMP1, PA3 for COMP2) and is fed back through
//! a resistor from the comparator output pin (PA6 / PA7 in AF7). The output
//! polarity is inverted so the loop oscillates between the hysteresis
//! thresholds around 1/2 VREFINT.
//!
//! The comparator output is routed inside the chip to TIM3 input 1, which
//! is the event routing this driver relies on:
//!
//! - the counter is started by `arm_measurement`, so the CCR3 deadline
//!   counts from arming and fires even if the pad never crosses a threshold
//! - TI1 rising edge captures the count into CCR1 (IC1 on TI1)
//! - TI1 falling edge captures the count into CCR2 (IC2 mapped on TI1)
//! - the same falling edge raises EXTI line 21/22, the `ADC_COMP` interrupt,
//!   which is the completion interrupt
//! - CCR3 compare raises the `TIM3` interrupt
//!
//! The period is CCR2 - CCR1. The counter keeps running after the falling
//! edge, so a late `ADC_COMP` lets further edges land in CCR1/CCR2. The
//! timer flags those as overcaptures and the reading is then rejected.

use crate::sensor::Sensor;
use stm32f0::stm32f0x1 as pac;

/// Comparator, and so pad, used by one channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CompInput {
    /// COMP1, pad on PA1, output PA6
    Comp1,
    /// COMP2, pad on PA3, output PA7
    Comp2,
}

impl CompInput {
    /// COMP2 fields in COMP_CSR are the COMP1 fields shifted up by 16
    const fn csr_shift(self) -> u32 {
        match self {
            CompInput::Comp1 => 0,
            CompInput::Comp2 => 16,
        }
    }

    const fn exti_line(self) -> u32 {
        match self {
            CompInput::Comp1 => 1 << 21,
            CompInput::Comp2 => 1 << 22,
        }
    }
}

// COMP_CSR, COMP1 positions
const COMP_EN: u32 = 1 << 0;
/// Inverting input = 1/2 VREFINT
const COMP_INSEL_HALF_VREF: u32 = 0b001 << 4;
/// Output routed to TIM3 input capture 1
const COMP_OUTSEL_TIM3_IC1: u32 = 0b110 << 8;
const COMP_POL_INVERTED: u32 = 1 << 11;
const COMP_HYST_HIGH: u32 = 0b11 << 12;
const COMP_ENABLE_MASK: u32 = COMP_EN | (COMP_EN << 16);

// TIM3
const TIM_CR1_CEN: u32 = 1 << 0;
/// CC1S = TI1, CC2S = TI1, both captures
const TIM_CCMR1_BOTH_ON_TI1: u32 = 0b01 | (0b10 << 8);
/// CC1 captures the rising edge, CC2 the falling edge
const TIM_CCER_RISE_FALL: u32 = (1 << 0) | (1 << 4) | (1 << 5);
const TIM_DIER_CC3IE: u32 = 1 << 3;
const TIM_SR_CC1IF: u32 = 1 << 1;
const TIM_SR_CC3IF: u32 = 1 << 3;
const TIM_SR_CC1OF: u32 = 1 << 9;
const TIM_SR_CC2OF: u32 = 1 << 10;
const TIM_MAX_COUNT: u32 = 0xffff;

// RCC
const RCC_APB1ENR_TIM3EN: u32 = 1 << 1;
const RCC_APB2ENR_SYSCFGCOMPEN: u32 = 1 << 0;

/// Period measurement with TIM3 counting at this rate
pub const TIMER_TICK_HZ: u32 = 16_000_000;

const EXTI_COMP_LINES: u32 = (1 << 21) | (1 << 22);

pub struct CompSensor {
    timer_clk: u32,
    selected: CompInput,
}

impl CompSensor {
    /// `timer_clk` is the TIM3 kernel clock in Hz, and must be a multiple of
    /// [`TIMER_TICK_HZ`].
    pub fn new(timer_clk: u32) -> Self {
        Self {
            timer_clk,
            selected: CompInput::Comp1,
        }
    }

    fn csr_for(input: CompInput) -> u32 {
        (COMP_INSEL_HALF_VREF | COMP_OUTSEL_TIM3_IC1 | COMP_POL_INVERTED | COMP_HYST_HIGH) << input.csr_shift()
    }
}

impl Sensor for CompSensor {
    type Pin = CompInput;

    fn configure(&mut self, timeout_ticks: u32) {
        let rcc = unsafe { &*pac::RCC::ptr() };
        rcc.apb1enr.modify(|r, w| unsafe { w.bits(r.bits() | RCC_APB1ENR_TIM3EN) });
        rcc.apb2enr.modify(|r, w| unsafe { w.bits(r.bits() | RCC_APB2ENR_SYSCFGCOMPEN) });

        // Both comparators off until a channel is armed
        let comp = unsafe { &*pac::COMP::ptr() };
        comp.csr.write(|w| unsafe { w.bits(0) });

        let tim = unsafe { &*pac::TIM3::ptr() };
        tim.cr1.write(|w| unsafe { w.bits(0) });
        let psc = (self.timer_clk / TIMER_TICK_HZ).max(1) - 1;
        tim.psc.write(|w| unsafe { w.bits(psc) });
        tim.arr.write(|w| unsafe { w.bits(TIM_MAX_COUNT) });
        tim.ccmr1_input().write(|w| unsafe { w.bits(TIM_CCMR1_BOTH_ON_TI1) });
        tim.ccer.write(|w| unsafe { w.bits(TIM_CCER_RISE_FALL) });
        // Free running, no slave mode
        tim.smcr.write(|w| unsafe { w.bits(0) });
        tim.ccr3.write(|w| unsafe { w.bits(timeout_ticks.min(TIM_MAX_COUNT)) });
        tim.dier.write(|w| unsafe { w.bits(TIM_DIER_CC3IE) });
        // Load the prescaler now, then drop the update flag it leaves behind
        tim.egr.write(|w| unsafe { w.bits(1) });
        tim.sr.write(|w| unsafe { w.bits(0) });

        // Completion is the falling edge of the comparator output
        let exti = unsafe { &*pac::EXTI::ptr() };
        exti.rtsr.modify(|r, w| unsafe { w.bits(r.bits() & !EXTI_COMP_LINES) });
        exti.ftsr.modify(|r, w| unsafe { w.bits(r.bits() | EXTI_COMP_LINES) });
        exti.imr.modify(|r, w| unsafe { w.bits(r.bits() & !EXTI_COMP_LINES) });
    }

    fn select_channel(&mut self, pin: CompInput) {
        self.selected = pin;

        let comp = unsafe { &*pac::COMP::ptr() };
        comp.csr.write(|w| unsafe { w.bits(Self::csr_for(pin)) });

        let exti = unsafe { &*pac::EXTI::ptr() };
        exti.imr.modify(|r, w| unsafe { w.bits((r.bits() & !EXTI_COMP_LINES) | pin.exti_line()) });
    }

    fn arm_measurement(&mut self) {
        let tim = unsafe { &*pac::TIM3::ptr() };
        tim.cr1.write(|w| unsafe { w.bits(0) });
        tim.cnt.write(|w| unsafe { w.bits(0) });
        tim.sr.write(|w| unsafe { w.bits(0) });

        let exti = unsafe { &*pac::EXTI::ptr() };
        exti.pr.write(|w| unsafe { w.bits(self.selected.exti_line()) });

        // Deadline starts now, before the comparator can produce any edge
        tim.cr1.write(|w| unsafe { w.bits(TIM_CR1_CEN) });

        let comp = unsafe { &*pac::COMP::ptr() };
        let en = COMP_EN << self.selected.csr_shift();
        comp.csr.modify(|r, w| unsafe { w.bits(r.bits() | en) });
    }

    fn read_captured_period(&mut self) -> Option<u32> {
        let tim = unsafe { &*pac::TIM3::ptr() };
        // Flags first, reading CCRx clears CCxIF
        let sr = tim.sr.read().bits();
        let rise = tim.ccr1.read().bits();
        let fall = tim.ccr2.read().bits();
        capture_span(sr, rise, fall)
    }

    fn stop(&mut self) {
        let comp = unsafe { &*pac::COMP::ptr() };
        comp.csr.modify(|r, w| unsafe { w.bits(r.bits() & !COMP_ENABLE_MASK) });

        let tim = unsafe { &*pac::TIM3::ptr() };
        tim.cr1.modify(|r, w| unsafe { w.bits(r.bits() & !TIM_CR1_CEN) });
    }

    fn take_complete(&mut self) -> bool {
        let exti = unsafe { &*pac::EXTI::ptr() };
        let line = self.selected.exti_line();
        if exti.pr.read().bits() & line == 0 {
            return false;
        }
        // rc_w1
        exti.pr.write(|w| unsafe { w.bits(line) });
        true
    }

    fn take_timeout(&mut self) -> bool {
        let tim = unsafe { &*pac::TIM3::ptr() };
        if tim.sr.read().bits() & TIM_SR_CC3IF == 0 {
            return false;
        }
        // rc_w0
        tim.sr.write(|w| unsafe { w.bits(!TIM_SR_CC3IF) });
        true
    }
}

/// Half period from the two captures, or `None` if the rising edge is
/// missing or either capture was overwritten by a later edge.
fn capture_span(sr: u32, rise: u32, fall: u32) -> Option<u32> {
    if sr & TIM_SR_CC1IF == 0 || sr & (TIM_SR_CC1OF | TIM_SR_CC2OF) != 0 {
        return None;
    }
    Some(fall.wrapping_sub(rise) & TIM_MAX_COUNT)
}
