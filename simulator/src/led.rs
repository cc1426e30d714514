use std::convert::Infallible;

use embedded_hal::digital::{ErrorType, OutputPin};
use tracing::debug;

/// Technology LED that reports to the log instead of a GPIO.
pub struct ConsoleLed {
    name: &'static str,
    lit: bool,
}

impl ConsoleLed {
    pub fn new(name: &'static str) -> Self {
        Self { name, lit: false }
    }
}

impl ErrorType for ConsoleLed {
    type Error = Infallible;
}

impl OutputPin for ConsoleLed {
    fn set_low(&mut self) -> Result<(), Infallible> {
        if self.lit {
            debug!(led = self.name, "LED off");
        }
        self.lit = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        if !self.lit {
            debug!(led = self.name, "LED on");
        }
        self.lit = true;
        Ok(())
    }
}
