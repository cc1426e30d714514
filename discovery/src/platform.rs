//! Technology LEDs over `embedded-hal` output pins.

use embedded_hal::digital::{self, OutputPin};

use crate::error::PlatformError;
use crate::tech::Technology;

/// One LED per technology, lit while a device of that technology is
/// active.
pub struct TechIndicator<P> {
    /// Indexed A, B, F, V.
    leds: [P; 4],
}

impl<P: OutputPin> TechIndicator<P> {
    pub fn new(a: P, b: P, f: P, v: P) -> Self {
        Self { leds: [a, b, f, v] }
    }

    /// Lights the LED of `tech` only; `None` switches all off.
    pub fn show(&mut self, tech: Option<Technology>) -> Result<(), PlatformError> {
        for (led, led_tech) in self.leds.iter_mut().zip(Technology::ALL) {
            let result = if Some(led_tech) == tech {
                led.set_high()
            } else {
                led.set_low()
            };
            result.map_err(|e| PlatformError::Gpio(digital::Error::kind(&e)))?;
        }
        Ok(())
    }
}
