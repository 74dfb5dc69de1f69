//! Autofocus service
//!
//! Only used by workflows; there are no autofocus commands.

use parking_lot::Mutex;

use crate::hardware::{DeviceResult, FocusDevice};

/// Thread-safe wrapper around a focus measurement device
pub struct AutofocusService {
    device: Mutex<Box<dyn FocusDevice>>,
    max_correction_um: f64,
}

impl AutofocusService {
    /// Wrap a focus device; corrections larger than `max_correction_um` are
    /// treated as a failed measurement
    pub fn new(device: impl FocusDevice + 'static, max_correction_um: f64) -> Self {
        Self {
            device: Mutex::new(Box::new(device)),
            max_correction_um: max_correction_um.abs(),
        }
    }

    /// Measure focus at `z_mm` and return the z correction in micrometers
    pub fn measure(&self, z_mm: f64) -> DeviceResult<Option<f64>> {
        let correction = self.device.lock().find_focus(z_mm)?;
        Ok(correction.filter(|c| {
            let plausible = c.is_finite() && c.abs() <= self.max_correction_um;
            if !plausible {
                tracing::warn!("Discarding implausible focus correction {} um", c);
            }
            plausible
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedFocus;

    #[test]
    fn test_implausible_corrections_are_dropped() {
        let focus = SimulatedFocus::new(Some(4.0));
        let service = AutofocusService::new(focus.clone(), 50.0);
        assert_eq!(service.measure(1.0).unwrap(), Some(4.0));

        focus.set_correction(Some(500.0));
        assert_eq!(service.measure(1.0).unwrap(), None);
        assert_eq!(focus.measurements(), vec![1.0, 1.0]);
    }
}
