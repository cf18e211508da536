//! System control: peripheral power gating and clock bookkeeping

use core::cell::Cell;

use critical_section::Mutex;
use fugit::HertzU32 as Hertz;

/// Power Control for Peripherals register.
const PCONP: *mut u32 = 0x400F_C0C4 as *mut u32;

// Internal RC oscillator, the clock source out of reset
const IRC_FREQUENCY: Hertz = Hertz::from_raw(4_000_000);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Clocks {
    pub cclk: Hertz,
    /// Clock of the APB peripherals, fixed CCLK/4 divider
    pub pclk: Hertz,
}

// Power on default: IRC, PCLKSEL = CCLK/4
static CLOCKS: Mutex<Cell<Clocks>> = Mutex::new(Cell::new(Clocks {
    cclk: IRC_FREQUENCY,
    pclk: Hertz::from_raw(IRC_FREQUENCY.raw() / 4),
}));

#[inline]
pub fn clocks() -> Clocks {
    critical_section::with(|cs| CLOCKS.borrow(cs).get())
}

/// Record the core clock configured by board startup code.
///
/// The PLL itself is board business; drivers only need the resulting rates.
/// Peripheral clocks keep the reset-default CCLK/4 divider.
pub fn init_clocks(cclk: Hertz) -> Clocks {
    let clocks = Clocks { cclk, pclk: cclk / 4 };
    critical_section::with(|cs| CLOCKS.borrow(cs).set(clocks));
    clocks
}

/// Power up a peripheral by its PCONP bit index.
pub(crate) fn enable_power(bit: u8) {
    // PCONP is shared by every driver, keep the update atomic
    critical_section::with(|_| unsafe {
        let val = PCONP.read_volatile();
        PCONP.write_volatile(val | (1 << bit));
    });
}
