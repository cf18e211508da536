//! GPIO
//!
//! Fast GPIO (FIO) output driver, enough to run software chip-select lines
//! and status LEDs. Input modes, pull configuration and pin interrupts are
//! not covered here.

use core::convert::Infallible;

const FIO_BASE: usize = 0x2009_C000;
const PORT_STRIDE: usize = 0x20;

const FIODIR: usize = 0x00;
const FIOPIN: usize = 0x14;
const FIOSET: usize = 0x18;
const FIOCLR: usize = 0x1C;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(val: bool) -> Self {
        match val {
            true => Self::High,
            false => Self::Low,
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> bool {
        match level {
            Level::Low => false,
            Level::High => true,
        }
    }
}

/// GPIO output driver.
pub struct Output {
    port: u8,
    pin: u8,
}

impl Output {
    /// Put a pin into output mode.
    ///
    /// The output level is driven before the direction flips, so the line
    /// comes up at `initial_output` without passing through the other state.
    pub fn new(port: u8, pin: u8, initial_output: Level) -> Self {
        debug_assert!(port < 5 && pin < 32);

        let mut out = Self { port, pin };
        out.set_level(initial_output);
        // FIODIR is shared with the other pins of the port
        critical_section::with(|_| unsafe {
            let dir = out.reg(FIODIR);
            let val = dir.read_volatile();
            dir.write_volatile(val | out.mask());
        });
        out
    }

    #[inline]
    fn reg(&self, offset: usize) -> *mut u32 {
        (FIO_BASE + self.port as usize * PORT_STRIDE + offset) as *mut u32
    }

    #[inline]
    fn mask(&self) -> u32 {
        1 << self.pin
    }

    /// Set the output as high.
    #[inline]
    pub fn set_high(&mut self) {
        unsafe { self.reg(FIOSET).write_volatile(self.mask()) }
    }

    /// Set the output as low.
    #[inline]
    pub fn set_low(&mut self) {
        unsafe { self.reg(FIOCLR).write_volatile(self.mask()) }
    }

    /// Set the output level.
    #[inline]
    pub fn set_level(&mut self, level: Level) {
        match level {
            Level::Low => self.set_low(),
            Level::High => self.set_high(),
        }
    }

    /// Is the output pin set as high?
    #[inline]
    pub fn is_set_high(&self) -> bool {
        !self.is_set_low()
    }

    /// Is the output pin set as low?
    #[inline]
    pub fn is_set_low(&self) -> bool {
        unsafe { self.reg(FIOPIN).read_volatile() & self.mask() == 0 }
    }

    /// What level output is set to
    #[inline]
    pub fn get_output_level(&self) -> Level {
        self.is_set_high().into()
    }

    /// Toggle pin output
    #[inline]
    pub fn toggle(&mut self) {
        if self.is_set_low() {
            self.set_high()
        } else {
            self.set_low()
        }
    }
}

impl embedded_hal::digital::ErrorType for Output {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for Output {
    #[inline]
    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set_high();
        Ok(())
    }

    #[inline]
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_low();
        Ok(())
    }
}

impl embedded_hal::digital::StatefulOutputPin for Output {
    #[inline]
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(Output::is_set_high(self))
    }

    #[inline]
    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(Output::is_set_low(self))
    }
}
