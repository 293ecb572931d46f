//! PWM bus driver.
//!
//! All servo output goes through a single 16-channel PWM expander. The bus
//! is modeled as a trait so motion-profile tests run against a recording
//! mock instead of hardware; the real implementation talks PCA9685 register
//! protocol over Linux I2C.

use crate::error::{Result, ServoError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// PWM tick resolution of the expander (12 bit).
pub const PWM_TICKS: u16 = 4096;

/// Write attempts before a bus error is surfaced.
const WRITE_ATTEMPTS: u32 = 3;

/// Initial backoff between retried writes.
const WRITE_BACKOFF: Duration = Duration::from_millis(5);

/// A 16-channel PWM expander.
///
/// Writes are atomic per channel. Implementations surface I/O failures as
/// [`ServoError::Bus`]; callers decide whether to retry.
pub trait PwmBus: Send {
    /// Set raw on/off ticks (0..4096) for a channel.
    fn set_pwm(&mut self, channel: u8, on_ticks: u16, off_ticks: u16) -> Result<()>;

    /// Set the carrier frequency for all channels.
    fn set_freq(&mut self, freq_hz: f64) -> Result<()>;

    /// Set a pulse width in microseconds at the given carrier frequency.
    fn set_pulse_us(&mut self, channel: u8, pulse_us: f64, freq_hz: f64) -> Result<()> {
        let period_us = 1_000_000.0 / freq_hz;
        let duty = (pulse_us / period_us).clamp(0.0, 1.0);
        let off = (duty * f64::from(PWM_TICKS)).round() as u16;
        self.set_pwm(channel, 0, off.min(PWM_TICKS - 1))
    }

    /// Stop issuing pulses on a channel (servo goes limp).
    fn release_channel(&mut self, channel: u8) -> Result<()> {
        self.set_pwm(channel, 0, 0)
    }
}

/// Bus handle shared by every servo on the same expander.
///
/// The mutex serializes channel writes, which gives a total order per
/// update tick across servos.
pub type SharedBus = Arc<Mutex<dyn PwmBus>>;

/// Wrap a bus implementation into a shareable handle.
pub fn shared(bus: impl PwmBus + 'static) -> SharedBus {
    Arc::new(Mutex::new(bus))
}

/// Retry a bus write with exponential backoff before surfacing the error.
pub(crate) fn with_retry(mut write: impl FnMut() -> Result<()>) -> Result<()> {
    let mut backoff = WRITE_BACKOFF;
    let mut last = None;
    for attempt in 0..WRITE_ATTEMPTS {
        match write() {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt + 1 < WRITE_ATTEMPTS {
                    tracing::debug!(attempt = attempt + 1, error = %e, "PWM write failed, retrying");
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| ServoError::Bus("write failed".to_string())))
}

#[cfg(feature = "pca9685")]
pub mod pca9685 {
    //! PCA9685 register protocol over Linux I2C.

    use super::{with_retry, PwmBus, PWM_TICKS};
    use crate::error::{Result, ServoError};
    use rppal::i2c::I2c;
    use std::time::Duration;
    use tracing::info;

    const MODE1: u8 = 0x00;
    const PRESCALE: u8 = 0xFE;
    const LED0_ON_L: u8 = 0x06;

    const MODE1_SLEEP: u8 = 0x10;
    const MODE1_AUTO_INC: u8 = 0x20;
    const MODE1_RESTART: u8 = 0x80;

    /// Bit in LEDn_OFF_H that forces the channel fully off.
    const FULL_OFF: u8 = 0x10;

    /// Internal oscillator of the PCA9685.
    const OSC_HZ: f64 = 25_000_000.0;

    /// PCA9685 PWM expander on a Linux I2C bus.
    pub struct Pca9685 {
        i2c: I2c,
    }

    impl Pca9685 {
        /// Open the expander at `address` on the given I2C bus and program
        /// the carrier frequency.
        pub fn open(bus: u8, address: u16, freq_hz: f64) -> Result<Self> {
            let mut i2c = I2c::with_bus(bus)
                .map_err(|e| ServoError::Bus(format!("I2C bus {bus} open failed: {e}")))?;
            i2c.set_slave_address(address)
                .map_err(|e| ServoError::Bus(format!("I2C address 0x{address:02x}: {e}")))?;

            let mut driver = Self { i2c };
            driver.write_reg(MODE1, MODE1_AUTO_INC)?;
            driver.set_freq(freq_hz)?;
            info!(bus, address, freq_hz, "PCA9685 initialised");
            Ok(driver)
        }

        fn write_reg(&mut self, reg: u8, value: u8) -> Result<()> {
            with_retry(|| {
                self.i2c
                    .smbus_write_byte(reg, value)
                    .map_err(|e| ServoError::Bus(format!("reg 0x{reg:02x}: {e}")))
            })
        }
    }

    impl PwmBus for Pca9685 {
        fn set_pwm(&mut self, channel: u8, on_ticks: u16, off_ticks: u16) -> Result<()> {
            if channel > 15 {
                return Err(ServoError::Bus(format!("channel {channel} out of range")));
            }
            let base = LED0_ON_L + 4 * channel;
            // Zero off-ticks means "stop pulsing": assert the full-off bit.
            let off_h = if off_ticks == 0 {
                FULL_OFF
            } else {
                ((off_ticks.min(PWM_TICKS - 1)) >> 8) as u8
            };
            let frame = [
                (on_ticks & 0xFF) as u8,
                (on_ticks >> 8) as u8,
                (off_ticks & 0xFF) as u8,
                off_h,
            ];
            with_retry(|| {
                self.i2c
                    .block_write(base, &frame)
                    .map_err(|e| ServoError::Bus(format!("channel {channel}: {e}")))
            })
        }

        fn set_freq(&mut self, freq_hz: f64) -> Result<()> {
            let prescale = (OSC_HZ / (f64::from(PWM_TICKS) * freq_hz)).round() - 1.0;
            let prescale = prescale.clamp(3.0, 255.0) as u8;
            // The prescaler is only writable while the oscillator sleeps.
            self.write_reg(MODE1, MODE1_AUTO_INC | MODE1_SLEEP)?;
            self.write_reg(PRESCALE, prescale)?;
            self.write_reg(MODE1, MODE1_AUTO_INC)?;
            std::thread::sleep(Duration::from_micros(500));
            self.write_reg(MODE1, MODE1_AUTO_INC | MODE1_RESTART)?;
            Ok(())
        }
    }
}

/// Recording bus for tests and hardware-less bench runs.
///
/// Stores the pulse-width history per channel so tests can assert on the
/// exact output sequence.
#[derive(Default)]
pub struct MockBus {
    /// `(channel, pulse_us)` in write order; released channels log 0.0.
    pub writes: Vec<(u8, f64)>,
    /// Channels currently released (no pulses issued).
    pub released: Vec<u8>,
    /// Error injected into the next `fail_writes` writes.
    pub fail_writes: u32,
    freq_hz: f64,
}

impl MockBus {
    /// Create a mock bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            freq_hz: 50.0,
            ..Self::default()
        }
    }

    /// Last pulse written to a channel, if any.
    #[must_use]
    pub fn last_pulse(&self, channel: u8) -> Option<f64> {
        self.writes
            .iter()
            .rev()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, us)| *us)
    }
}

impl PwmBus for MockBus {
    fn set_pwm(&mut self, channel: u8, _on_ticks: u16, off_ticks: u16) -> Result<()> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(ServoError::Bus("injected failure".to_string()));
        }
        if off_ticks == 0 {
            if !self.released.contains(&channel) {
                self.released.push(channel);
            }
            self.writes.push((channel, 0.0));
        } else {
            self.released.retain(|ch| *ch != channel);
            let period_us = 1_000_000.0 / self.freq_hz;
            let pulse = f64::from(off_ticks) / f64::from(PWM_TICKS) * period_us;
            self.writes.push((channel, pulse));
        }
        Ok(())
    }

    fn set_freq(&mut self, freq_hz: f64) -> Result<()> {
        self.freq_hz = freq_hz;
        Ok(())
    }
}
