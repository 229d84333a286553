//! SimulatedDevice — deterministic software generator with fault injection.
//!
//! Seeded `StdRng`, so every run with the same seed produces the same
//! stream. A [`FaultPlan`] handle, cloned out before the device is moved
//! into its source, lets tests make upcoming draws, clears or resets fail
//! and counts how often the device was actually touched.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::error::DeviceError;
use crate::source::{EntropyDevice, SourceStatus};

use super::box_muller;

#[derive(Debug, Default)]
struct FaultState {
    fail_draws: AtomicUsize,
    fail_clears: AtomicUsize,
    fail_resets: AtomicUsize,
    draw_attempts: AtomicUsize,
    resets: AtomicUsize,
}

/// Shared control handle for a [`SimulatedDevice`].
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    state: Arc<FaultState>,
}

impl FaultPlan {
    /// Make the next `n` draws fail.
    pub fn fail_draws(&self, n: usize) {
        self.state.fail_draws.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` clears fail.
    pub fn fail_clears(&self, n: usize) {
        self.state.fail_clears.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` resets fail.
    pub fn fail_resets(&self, n: usize) {
        self.state.fail_resets.store(n, Ordering::SeqCst);
    }

    /// Draw calls that reached the device, failed or not.
    pub fn draw_attempts(&self) -> usize {
        self.state.draw_attempts.load(Ordering::SeqCst)
    }

    /// Successful resets so far.
    pub fn resets(&self) -> usize {
        self.state.resets.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Software generator that behaves like a TRNG from the caller's side.
pub struct SimulatedDevice {
    serial: String,
    seed: u64,
    rng: StdRng,
    spare_normal: Option<f64>,
    plan: FaultPlan,
}

impl SimulatedDevice {
    pub fn new(serial: impl Into<String>, seed: u64) -> Self {
        Self {
            serial: serial.into(),
            seed,
            rng: StdRng::seed_from_u64(seed),
            spare_normal: None,
            plan: FaultPlan::default(),
        }
    }

    /// Handle for injecting faults after the device has been registered.
    pub fn fault_plan(&self) -> FaultPlan {
        self.plan.clone()
    }

    fn begin_draw(&self) -> Result<(), DeviceError> {
        self.plan.state.draw_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.plan.state.fail_draws) {
            return Err(DeviceError::new("simulated transfer failure"));
        }
        Ok(())
    }
}

impl EntropyDevice for SimulatedDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn description(&self) -> &str {
        "simulated generator (seeded StdRng)"
    }

    fn rand_int32(&mut self) -> Result<i32, DeviceError> {
        self.begin_draw()?;
        Ok(self.rng.next_u32() as i32)
    }

    fn rand_uniform(&mut self) -> Result<f64, DeviceError> {
        self.begin_draw()?;
        Ok(self.rng.random::<f64>())
    }

    fn rand_normal(&mut self) -> Result<f64, DeviceError> {
        self.begin_draw()?;
        if let Some(z) = self.spare_normal.take() {
            return Ok(z);
        }
        let (z0, z1) = box_muller(self.rng.random::<f64>(), self.rng.random::<f64>());
        self.spare_normal = Some(z1);
        Ok(z0)
    }

    fn fill_bytes(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.begin_draw()?;
        self.rng.fill_bytes(buf);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DeviceError> {
        if take_one(&self.plan.state.fail_clears) {
            return Err(DeviceError::new("simulated clear failure"));
        }
        self.spare_normal = None;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        if take_one(&self.plan.state.fail_resets) {
            return Err(DeviceError::new("simulated reset failure"));
        }
        let n = self.plan.state.resets.fetch_add(1, Ordering::SeqCst) + 1;
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(n as u64));
        self.spare_normal = None;
        Ok(())
    }

    fn status(&self) -> SourceStatus {
        SourceStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = SimulatedDevice::new("SIM00001", 42);
        let mut b = SimulatedDevice::new("SIM00002", 42);
        let mut buf_a = [0u8; 32];
        let mut buf_b = [0u8; 32];
        a.fill_bytes(&mut buf_a).unwrap();
        b.fill_bytes(&mut buf_b).unwrap();
        assert_eq!(buf_a, buf_b);
    }

    #[test]
    fn test_fault_plan_counts_down() {
        let mut dev = SimulatedDevice::new("SIM00001", 1);
        let plan = dev.fault_plan();
        plan.fail_draws(2);
        assert!(dev.rand_int32().is_err());
        assert!(dev.rand_int32().is_err());
        assert!(dev.rand_int32().is_ok());
        assert_eq!(plan.draw_attempts(), 3);
    }

    #[test]
    fn test_reset_counts_and_reseeds() {
        let mut dev = SimulatedDevice::new("SIM00001", 1);
        let plan = dev.fault_plan();
        dev.rand_int32().unwrap();
        dev.reset().unwrap();
        assert_eq!(plan.resets(), 1);
        // First reset reseeds with seed + 1.
        let mut fresh = SimulatedDevice::new("SIM00001", 2);
        assert_eq!(dev.rand_int32().unwrap(), fresh.rand_int32().unwrap());
    }

    #[test]
    fn test_normal_pairs_are_finite() {
        let mut dev = SimulatedDevice::new("SIM00001", 9);
        for _ in 0..1000 {
            assert!(dev.rand_normal().unwrap().is_finite());
        }
    }
}
