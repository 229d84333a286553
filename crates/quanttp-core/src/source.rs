//! Device backend trait and the serialized, fault-tolerant source wrapper.
//!
//! A backend implements [`EntropyDevice`]: a thin, unsynchronized view of one
//! physical generator. Every backend is wrapped in exactly one
//! [`EntropySource`], which owns the only handle to it. All draws against a
//! device go through that wrapper's mutex, so two draws on the same device
//! never overlap while draws on different devices never contend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::{DeviceError, Error, Result};

/// Length of a device serial. Vendor-defined, fixed.
pub const DEVICE_ID_LEN: usize = 8;

/// Operational status of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceStatus {
    /// Device is responding normally.
    Online,
    /// Device reported an error state it could not classify.
    Degraded,
    /// Device failed and could not be recovered.
    Offline,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "ONLINE"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// One physical or logical generator, as exposed by its driver.
///
/// Methods take `&mut self`: hardware generators are not thread-safe and
/// the wrapper guarantees exclusive access. Implementations report failures
/// as [`DeviceError`] and must not retry internally.
pub trait EntropyDevice: Send {
    /// Vendor serial, [`DEVICE_ID_LEN`] characters.
    fn serial(&self) -> &str;

    /// Short human-readable backend description.
    fn description(&self) -> &str;

    /// One device-native 32-bit integer.
    fn rand_int32(&mut self) -> std::result::Result<i32, DeviceError>;

    /// One uniform draw, device semantics preserved.
    fn rand_uniform(&mut self) -> std::result::Result<f64, DeviceError>;

    /// One normal draw, device semantics preserved.
    fn rand_normal(&mut self) -> std::result::Result<f64, DeviceError>;

    /// Fill `buf` completely with raw device entropy.
    fn fill_bytes(&mut self, buf: &mut [u8]) -> std::result::Result<(), DeviceError>;

    /// Discard any buffered entropy.
    fn clear(&mut self) -> std::result::Result<(), DeviceError>;

    /// Reinitialize device state without releasing the handle.
    fn reset(&mut self) -> std::result::Result<(), DeviceError>;

    /// Device-reported status. Unknown error states map to `Degraded`.
    fn status(&self) -> SourceStatus;
}

/// Shared, serialized handle to one device.
pub struct EntropySource {
    id: String,
    description: String,
    device: Mutex<Box<dyn EntropyDevice>>,
    faulted: AtomicBool,
}

impl EntropySource {
    /// Take ownership of a backend. Fails if its serial is malformed.
    pub fn new(device: Box<dyn EntropyDevice>) -> Result<Self> {
        let id = device.serial().to_string();
        if id.chars().count() != DEVICE_ID_LEN {
            return Err(Error::invalid(format!(
                "device serial '{id}' must be {DEVICE_ID_LEN} characters"
            )));
        }
        Ok(Self {
            id,
            description: device.description().to_string(),
            device: Mutex::new(device),
            faulted: AtomicBool::new(false),
        })
    }

    /// Stable device identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn draw_int32(&self) -> Result<i32> {
        self.draw("int32", |d| d.rand_int32())
    }

    pub fn draw_uniform(&self) -> Result<f64> {
        self.draw("uniform", |d| d.rand_uniform())
    }

    pub fn draw_normal(&self) -> Result<f64> {
        self.draw("normal", |d| d.rand_normal())
    }

    /// Exactly `n` raw bytes. `n == 0` is rejected before the device is touched.
    pub fn draw_bytes(&self, n: usize) -> Result<Vec<u8>> {
        if n < 1 {
            return Err(Error::invalid("length must be greater than 0"));
        }
        // Each attempt fills a fresh buffer so a failed read never leaks
        // partial output into the retried result.
        self.draw("bytes", |d| {
            let mut buf = vec![0u8; n];
            d.fill_bytes(&mut buf)?;
            Ok(buf)
        })
    }

    /// Best-effort flush of buffered entropy. Failures are logged only.
    pub fn clear(&self) {
        let mut device = self.lock();
        if let Err(e) = device.clear() {
            log::warn!("unable to clear {}: {e}", self.id);
        }
    }

    /// Reinitialize the device. A failure leaves the source `Offline`.
    pub fn reset(&self) -> Result<()> {
        let mut device = self.lock();
        match device.reset() {
            Ok(()) => {
                self.faulted.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                log::error!("reset of {} failed: {e}", self.id);
                Err(self.fault(e))
            }
        }
    }

    pub fn status(&self) -> SourceStatus {
        if self.faulted.load(Ordering::Acquire) {
            return SourceStatus::Offline;
        }
        self.lock().status()
    }

    /// Run one draw under the device lock with the single reset-and-retry
    /// policy: attempt, reset, attempt again, then give up.
    fn draw<T>(
        &self,
        op: &'static str,
        f: impl Fn(&mut dyn EntropyDevice) -> std::result::Result<T, DeviceError>,
    ) -> Result<T> {
        let mut device = self.lock();

        let first = match f(device.as_mut()) {
            Ok(v) => return Ok(self.recovered(v)),
            Err(e) => e,
        };
        log::warn!("{op} draw on {} failed ({first}), resetting and retrying", self.id);

        if let Err(e) = device.reset() {
            log::error!("reset of {} failed: {e}", self.id);
            return Err(self.fault(e));
        }

        match f(device.as_mut()) {
            Ok(v) => Ok(self.recovered(v)),
            Err(e) => {
                log::warn!("{op} draw on {} failed again after reset: {e}", self.id);
                Err(self.fault(e))
            }
        }
    }

    fn recovered<T>(&self, value: T) -> T {
        self.faulted.store(false, Ordering::Release);
        value
    }

    fn fault(&self, e: DeviceError) -> Error {
        self.faulted.store(true, Ordering::Release);
        Error::DeviceFault {
            device: self.id.clone(),
            reason: e.0,
        }
    }

    // A poisoned lock only means a previous holder panicked mid-draw; the
    // device itself is re-established by the next reset.
    fn lock(&self) -> MutexGuard<'_, Box<dyn EntropyDevice>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EntropySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntropySource")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("faulted", &self.faulted.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::simulated::SimulatedDevice;

    fn source_with(device: SimulatedDevice) -> EntropySource {
        EntropySource::new(Box::new(device)).unwrap()
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[test]
    fn test_new_rejects_bad_serial() {
        let err = EntropySource::new(Box::new(SimulatedDevice::new("SHORT", 1))).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_new_keeps_serial_as_id() {
        let src = source_with(SimulatedDevice::new("SIM00001", 1));
        assert_eq!(src.id(), "SIM00001");
        assert_eq!(src.status(), SourceStatus::Online);
    }

    // -----------------------------------------------------------------------
    // Draws
    // -----------------------------------------------------------------------

    #[test]
    fn test_draw_bytes_exact_length() {
        let src = source_with(SimulatedDevice::new("SIM00001", 7));
        for n in [1, 2, 31, 1024] {
            assert_eq!(src.draw_bytes(n).unwrap().len(), n);
        }
    }

    #[test]
    fn test_draw_bytes_zero_never_touches_device() {
        let device = SimulatedDevice::new("SIM00001", 7);
        let plan = device.fault_plan();
        let src = source_with(device);
        let err = src.draw_bytes(0).unwrap_err();
        assert_eq!(err, Error::InvalidArgument("length must be greater than 0".into()));
        assert_eq!(plan.draw_attempts(), 0);
    }

    #[test]
    fn test_uniform_in_unit_interval() {
        let src = source_with(SimulatedDevice::new("SIM00001", 3));
        for _ in 0..1000 {
            let v = src.draw_uniform().unwrap();
            assert!((0.0..1.0).contains(&v));
        }
    }

    // -----------------------------------------------------------------------
    // Retry policy
    // -----------------------------------------------------------------------

    #[test]
    fn test_single_failure_is_invisible() {
        let device = SimulatedDevice::new("SIM00001", 11);
        let plan = device.fault_plan();
        let src = source_with(device);

        plan.fail_draws(1);
        let v = src.draw_int32();
        assert!(v.is_ok());
        assert_eq!(plan.draw_attempts(), 2);
        assert_eq!(plan.resets(), 1);
        assert_eq!(src.status(), SourceStatus::Online);
    }

    #[test]
    fn test_retry_value_matches_fresh_device() {
        // A retried draw after reset must return what a clean first try would.
        let reference = source_with(SimulatedDevice::new("SIM00001", 5));
        let expected = {
            reference.reset().unwrap();
            reference.draw_bytes(16).unwrap()
        };

        let device = SimulatedDevice::new("SIM00001", 5);
        let plan = device.fault_plan();
        let src = source_with(device);
        plan.fail_draws(1);
        assert_eq!(src.draw_bytes(16).unwrap(), expected);
    }

    #[test]
    fn test_two_failures_fault_without_third_attempt() {
        let device = SimulatedDevice::new("SIM00001", 11);
        let plan = device.fault_plan();
        let src = source_with(device);

        plan.fail_draws(5);
        let err = src.draw_normal().unwrap_err();
        assert!(matches!(err, Error::DeviceFault { ref device, .. } if device == "SIM00001"));
        assert_eq!(plan.draw_attempts(), 2);
        assert_eq!(plan.resets(), 1);
        assert_eq!(src.status(), SourceStatus::Offline);
    }

    #[test]
    fn test_reset_failure_during_retry_faults() {
        let device = SimulatedDevice::new("SIM00001", 11);
        let plan = device.fault_plan();
        let src = source_with(device);

        plan.fail_draws(1);
        plan.fail_resets(1);
        assert!(matches!(src.draw_uniform(), Err(Error::DeviceFault { .. })));
        assert_eq!(plan.draw_attempts(), 1);
    }

    #[test]
    fn test_fault_cleared_by_next_success() {
        let device = SimulatedDevice::new("SIM00001", 11);
        let plan = device.fault_plan();
        let src = source_with(device);

        plan.fail_draws(2);
        assert!(src.draw_int32().is_err());
        assert_eq!(src.status(), SourceStatus::Offline);
        assert!(src.draw_int32().is_ok());
        assert_eq!(src.status(), SourceStatus::Online);
    }

    // -----------------------------------------------------------------------
    // Clear / reset
    // -----------------------------------------------------------------------

    #[test]
    fn test_clear_failure_is_swallowed() {
        let device = SimulatedDevice::new("SIM00001", 11);
        let plan = device.fault_plan();
        let src = source_with(device);
        plan.fail_clears(1);
        src.clear();
        assert_eq!(src.status(), SourceStatus::Online);
    }

    #[test]
    fn test_reset_failure_surfaces_fault() {
        let device = SimulatedDevice::new("SIM00001", 11);
        let plan = device.fault_plan();
        let src = source_with(device);
        plan.fail_resets(1);
        assert!(matches!(src.reset(), Err(Error::DeviceFault { .. })));
        assert_eq!(src.status(), SourceStatus::Offline);
        assert!(src.reset().is_ok());
        assert_eq!(src.status(), SourceStatus::Online);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SourceStatus::Online.to_string(), "ONLINE");
        assert_eq!(SourceStatus::Degraded.to_string(), "DEGRADED");
        assert_eq!(SourceStatus::Offline.to_string(), "OFFLINE");
    }
}
