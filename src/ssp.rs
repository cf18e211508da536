//! SSP, synchronous serial port (SPI master)
//!
//! - Blocking transfers only, polled through the FIFO status flags
//! - No interrupt or DMA completion; a stuck peripheral hangs the unbounded waits

/*
PL022-compatible synchronous serial controller
Motorola SPI, TI synchronous serial and National Microwire frame formats
Master and slave modes, multiple slave support
8-deep transmit and receive FIFOs
Programmable clock rate: PCLK / (CPSDVSR * (SCR + 1)), CPSDVSR even 2..=254
Programmable data size 4 to 16 bits
Loop back mode for diagnostics

This driver does master mode with Motorola SPI frames at 8 bits only.
*/

use core::cell::Cell;
use core::cmp::max;
use core::convert::Infallible;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;
use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_hal::spi::{Mode, Phase, Polarity, MODE_0};
use fugit::HertzU32 as Hertz;

use crate::syscon;

pub mod regs;

use regs::{Mmio, Reg, SspRegs};
use regs::{CR0_DSS_8BIT, CR0_FRF_SPI, CR0_SCR_SHIFT, CR0_SPH, CR0_SPO};
use regs::{CR1_LBM, CR1_SSE};
use regs::{SR_BSY, SR_RFF, SR_RNE, SR_TNF};

/// Frame clocked out when the transmit buffers are exhausted.
const DUMMY_FRAME: u8 = 0x00;

/// Depth of the hardware transmit and receive FIFOs.
const FIFO_DEPTH: usize = 8;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Slave role or a frame size other than 8 bits was requested.
    ///
    /// Raised before any register is touched; retry with a corrected config.
    UnsupportedConfig,
}

impl embedded_hal::spi::Error for Error {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        embedded_hal::spi::ErrorKind::Other
    }
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Master,
    Slave,
}

#[non_exhaustive]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    pub role: Role,
    pub mode: Mode,
    /// Internally connect MISO to MOSI, for diagnostics
    pub loopback: bool,
    /// Bits per frame; only 8 is supported
    pub word_size: u8,
    pub frequency: Hertz,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Master,
            mode: MODE_0,
            loopback: false,
            word_size: 8,
            frequency: Hertz::from_raw(1_000_000),
        }
    }
}

/// Chip-select line bracketing a transfer. Active low.
pub trait CsPin {
    fn assert(&mut self);
    fn deassert(&mut self);
}

impl<P> CsPin for P
where
    P: OutputPin + PinErrorType<Error = Infallible>,
{
    #[inline]
    fn assert(&mut self) {
        let _ = self.set_low();
    }

    #[inline]
    fn deassert(&mut self) {
        let _ = self.set_high();
    }
}

/// Smallest divider pair `(CPSDVSR, SCR)` whose output rate does not exceed
/// `target`.
///
/// Scans prescalers 2, 4, .., 254 and SCR 0..=255 in order and takes the
/// first pair that satisfies the bound. Targets below the slowest reachable
/// rate get the maximum dividers (254, 255).
fn clock_divisors(pclk: Hertz, target: Hertz) -> (u8, u8) {
    let pclk = pclk.to_Hz();
    let target = target.to_Hz();

    for cpsdvsr in (2..=254u32).step_by(2) {
        for scr in 0..=255u32 {
            if target >= pclk / (cpsdvsr * (scr + 1)) {
                return (cpsdvsr as u8, scr as u8);
            }
        }
    }
    (254, 255)
}

/// The three registers that fully determine transfer behavior.
///
/// Cached per controller so reapplying an unchanged configuration never
/// disturbs the peripheral. The run-enable bit is set outside the image, so
/// the live CR1 may differ from it in SSE alone.
#[derive(Copy, Clone, Eq, PartialEq)]
struct RegisterImage {
    cr0: u32,
    cr1: u32,
    cpsr: u32,
}

impl RegisterImage {
    const fn reset() -> Self {
        Self { cr0: 0, cr1: 0, cpsr: 0 }
    }

    fn build(config: &Config, pclk: Hertz) -> Result<Self, Error> {
        if config.role != Role::Master {
            // slave mode is not implemented
            return Err(Error::UnsupportedConfig);
        }
        if config.word_size != 8 {
            return Err(Error::UnsupportedConfig);
        }

        let mut cr0 = CR0_FRF_SPI | CR0_DSS_8BIT;
        if config.mode.polarity == Polarity::IdleHigh {
            cr0 |= CR0_SPO;
        }
        if config.mode.phase == Phase::CaptureOnSecondTransition {
            cr0 |= CR0_SPH;
        }

        let (cpsdvsr, scr) = clock_divisors(pclk, config.frequency);
        cr0 |= (scr as u32) << CR0_SCR_SHIFT;

        // master: MS clear; loopback on request
        let mut cr1 = 0;
        if config.loopback {
            cr1 |= CR1_LBM;
        }

        Ok(Self { cr0, cr1, cpsr: cpsdvsr as u32 })
    }
}

/// One transfer in flight per controller.
///
/// `acquire` spins until the holder releases; there is no scheduler to park
/// on in this environment. The guard unlocks on drop, which covers every
/// exit path of a transfer including configuration rejection.
struct TransferLock {
    held: AtomicBool,
}

impl TransferLock {
    const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    fn acquire(&self) -> LockGuard<'_> {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        LockGuard { lock: self }
    }

    fn force_release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

struct LockGuard<'a> {
    lock: &'a TransferLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.force_release();
    }
}

/// Walks the transmit buffer set, one frame per call.
struct TxCursor<'a> {
    bufs: &'a [&'a [u8]],
    buf: usize,
    offset: usize,
    pushed: usize,
    len: usize,
}

impl<'a> TxCursor<'a> {
    fn new(bufs: &'a [&'a [u8]], len: usize) -> Self {
        Self { bufs, buf: 0, offset: 0, pushed: 0, len }
    }

    fn done(&self) -> bool {
        self.pushed == self.len
    }

    /// Next outgoing frame; the dummy frame once the buffers are spent.
    fn next_frame(&mut self) -> u8 {
        let frame = loop {
            match self.bufs.get(self.buf) {
                Some(buf) if self.offset < buf.len() => {
                    let frame = buf[self.offset];
                    self.offset += 1;
                    break frame;
                }
                Some(_) => {
                    self.buf += 1;
                    self.offset = 0;
                }
                None => break DUMMY_FRAME,
            }
        };
        self.pushed += 1;
        frame
    }
}

/// Walks the receive buffer set; frames past its end are discarded.
struct RxCursor<'a, 'b> {
    bufs: &'a mut [&'b mut [u8]],
    buf: usize,
    offset: usize,
    popped: usize,
    len: usize,
}

impl<'a, 'b> RxCursor<'a, 'b> {
    fn new(bufs: &'a mut [&'b mut [u8]], len: usize) -> Self {
        Self { bufs, buf: 0, offset: 0, popped: 0, len }
    }

    fn done(&self) -> bool {
        self.popped == self.len
    }

    fn put_frame(&mut self, frame: u8) {
        loop {
            match self.bufs.get_mut(self.buf) {
                Some(buf) if self.offset < buf.len() => {
                    buf[self.offset] = frame;
                    self.offset += 1;
                    break;
                }
                Some(_) => {
                    self.buf += 1;
                    self.offset = 0;
                }
                // no destination left, discard
                None => break,
            }
        }
        self.popped += 1;
    }
}

/// SSP master controller driver.
///
/// Controllers are fixed instances (`SSP0`, `SSP1`) owning their cached
/// register image and transfer lock; `&'static Ssp` is the handle callers
/// pass around. All entry points serialize on the per-instance
/// lock, so concurrent callers observe strict mutual exclusion.
pub struct Ssp<R: SspRegs = Mmio> {
    regs: R,
    pconp_bit: u8,
    image: Mutex<Cell<RegisterImage>>,
    lock: TransferLock,
}

/// SSP0 controller.
pub static SSP0: Ssp = Ssp::new(Mmio::new(0x4008_8000), 21);

/// SSP1 controller.
pub static SSP1: Ssp = Ssp::new(Mmio::new(0x4003_0000), 10);

impl<R: SspRegs> Ssp<R> {
    const fn new(regs: R, pconp_bit: u8) -> Self {
        Self {
            regs,
            pconp_bit,
            image: Mutex::new(Cell::new(RegisterImage::reset())),
            lock: TransferLock::new(),
        }
    }

    /// Bring-up hook: power the controller and leave the lock released.
    pub fn init(&self) {
        syscon::enable_power(self.pconp_bit);
        self.lock.force_release();
    }

    /// Apply `config`, writing registers only when it differs from the last
    /// applied configuration.
    pub fn configure(&self, config: &Config) -> Result<(), Error> {
        let _guard = self.lock.acquire();
        self.apply_config(config)
    }

    /// Blocking full-duplex transfer.
    ///
    /// Either buffer set may be empty: missing transmit data is replaced by
    /// zero frames and received frames without a destination are discarded,
    /// so `max(tx, rx)` frames are clocked in total. `cs` (active low, if
    /// present) brackets the transfer.
    ///
    /// Blocks until a concurrent transfer on the same controller releases,
    /// then runs to completion; there is no partial-transfer outcome.
    pub fn transceive(
        &self,
        config: &Config,
        mut cs: Option<&mut dyn CsPin>,
        tx_bufs: &[&[u8]],
        rx_bufs: &mut [&mut [u8]],
    ) -> Result<(), Error> {
        let _guard = self.lock.acquire();

        // wait out a previous transfer, then drop its stale frames
        self.wait_idle();
        self.flush_rx();

        self.apply_config(config)?;

        let tx_len: usize = tx_bufs.iter().map(|buf| buf.len()).sum();
        let rx_len: usize = rx_bufs.iter().map(|buf| buf.len()).sum();
        let len = max(tx_len, rx_len);
        let mut tx = TxCursor::new(tx_bufs, len);
        let mut rx = RxCursor::new(rx_bufs, len);

        if let Some(cs) = cs.as_deref_mut() {
            cs.assert();
        }
        self.regs.set_bits(Reg::Cr1, CR1_SSE);

        self.pump(&mut tx, &mut rx);

        if let Some(cs) = cs.as_deref_mut() {
            cs.deassert();
        }
        Ok(())
    }

    /// Unconditionally reclaim the controller once the bus goes idle.
    ///
    /// Recovery entry point for an initiator that must take the controller
    /// back from a holder that will not finish.
    pub fn release(&self) -> Result<(), Error> {
        self.wait_idle();
        self.lock.force_release();
        Ok(())
    }

    /// Adapter implementing [`embedded_hal::spi::SpiBus`] with this
    /// configuration.
    pub fn bus(&self, config: Config) -> SspBus<'_, R> {
        SspBus { ssp: self, config }
    }

    fn apply_config(&self, config: &Config) -> Result<(), Error> {
        let candidate = RegisterImage::build(config, syscon::clocks().pclk)?;

        let cached = critical_section::with(|cs| self.image.borrow(cs).get());
        if candidate == cached {
            // nothing to do
            return Ok(());
        }

        self.regs.write(Reg::Cr0, candidate.cr0);
        self.regs.write(Reg::Cr1, candidate.cr1);
        self.regs.write(Reg::Cpsr, candidate.cpsr);
        critical_section::with(|cs| self.image.borrow(cs).set(candidate));
        Ok(())
    }

    /// Wait until the busy flag clears.
    fn wait_idle(&self) {
        while self.regs.test_bits(Reg::Sr, SR_BSY) {
            spin_loop();
        }
    }

    /// Read data until the receive FIFO is empty.
    fn flush_rx(&self) {
        while self.regs.test_bits(Reg::Sr, SR_RNE) {
            let _ = self.regs.read(Reg::Dr);
        }
    }

    /// Fill-then-drain until both cursors are spent.
    fn pump(&self, tx: &mut TxCursor<'_>, rx: &mut RxCursor<'_, '_>) {
        while !tx.done() || !rx.done() {
            let in_flight = tx.pushed - rx.popped;
            self.fill(tx, in_flight);
            self.drain(rx);
        }
    }

    /// Push one frame when the transmit FIFO has room.
    ///
    /// Holds off while the receive FIFO is full or `FIFO_DEPTH` frames are
    /// already in flight: the receive side must always have room for every
    /// frame the bus still owes us.
    fn fill(&self, tx: &mut TxCursor<'_>, in_flight: usize) {
        if tx.done() || in_flight >= FIFO_DEPTH {
            return;
        }
        if !self.regs.test_bits(Reg::Sr, SR_TNF) {
            return;
        }
        if self.regs.test_bits(Reg::Sr, SR_RFF) {
            return;
        }
        self.regs.write(Reg::Dr, tx.next_frame() as u32);
    }

    fn drain(&self, rx: &mut RxCursor<'_, '_>) {
        while !rx.done() && self.regs.test_bits(Reg::Sr, SR_RNE) {
            let frame = self.regs.read(Reg::Dr) as u8;
            rx.put_frame(frame);
        }
    }

    /// Pump variant reading and writing the same buffer.
    ///
    /// The store index trails the fetch index, so each frame is clocked out
    /// before its slot is overwritten by the frame coming back.
    fn transceive_in_place(&self, config: &Config, buf: &mut [u8]) -> Result<(), Error> {
        let _guard = self.lock.acquire();

        self.wait_idle();
        self.flush_rx();

        self.apply_config(config)?;
        self.regs.set_bits(Reg::Cr1, CR1_SSE);

        let len = buf.len();
        let mut pushed = 0;
        let mut popped = 0;
        while pushed < len || popped < len {
            if pushed < len
                && pushed - popped < FIFO_DEPTH
                && self.regs.test_bits(Reg::Sr, SR_TNF)
                && !self.regs.test_bits(Reg::Sr, SR_RFF)
            {
                self.regs.write(Reg::Dr, buf[pushed] as u32);
                pushed += 1;
            }
            while popped < len && self.regs.test_bits(Reg::Sr, SR_RNE) {
                buf[popped] = self.regs.read(Reg::Dr) as u8;
                popped += 1;
            }
        }
        Ok(())
    }
}

/// [`embedded_hal::spi::SpiBus`] adapter over an [`Ssp`] controller.
///
/// Chip select is out of scope for the bus trait; pair with an
/// `embedded-hal-bus` device wrapper to share the bus between devices.
pub struct SspBus<'d, R: SspRegs = Mmio> {
    ssp: &'d Ssp<R>,
    config: Config,
}

impl<R: SspRegs> embedded_hal::spi::ErrorType for SspBus<'_, R> {
    type Error = Error;
}

impl<R: SspRegs> embedded_hal::spi::SpiBus<u8> for SspBus<'_, R> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.ssp.transceive(&self.config, None, &[], &mut [words])
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.ssp.transceive(&self.config, None, &[words], &mut [])
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.ssp.transceive(&self.config, None, &[write], &mut [read])
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.ssp.transceive_in_place(&self.config, words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.ssp.wait_idle();
        Ok(())
    }
}
