//! SystemDevice — the operating system's entropy source via `getrandom`.
//!
//! Stands in for a dedicated TRNG on hosts without one. Integers come from
//! 4 raw bytes, uniforms from the top 53 bits of 8 raw bytes, normals from
//! Box–Muller over two uniforms. No conditioning beyond what the kernel does.

use crate::error::DeviceError;
use crate::source::{EntropyDevice, SourceStatus};

use super::{box_muller, uniform_from_bits};

/// Entropy device backed by `getrandom::fill`.
pub struct SystemDevice {
    serial: String,
    spare_normal: Option<f64>,
}

impl SystemDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            spare_normal: None,
        }
    }

    fn uniform(&mut self) -> Result<f64, DeviceError> {
        let mut raw = [0u8; 8];
        os_fill(&mut raw)?;
        Ok(uniform_from_bits(u64::from_le_bytes(raw)))
    }
}

fn os_fill(buf: &mut [u8]) -> Result<(), DeviceError> {
    getrandom::fill(buf).map_err(|e| DeviceError::new(format!("getrandom: {e}")))
}

impl EntropyDevice for SystemDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn description(&self) -> &str {
        "operating system entropy (getrandom)"
    }

    fn rand_int32(&mut self) -> Result<i32, DeviceError> {
        let mut raw = [0u8; 4];
        os_fill(&mut raw)?;
        Ok(i32::from_le_bytes(raw))
    }

    fn rand_uniform(&mut self) -> Result<f64, DeviceError> {
        self.uniform()
    }

    fn rand_normal(&mut self) -> Result<f64, DeviceError> {
        if let Some(z) = self.spare_normal.take() {
            return Ok(z);
        }
        let (z0, z1) = box_muller(self.uniform()?, self.uniform()?);
        self.spare_normal = Some(z1);
        Ok(z0)
    }

    fn fill_bytes(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        os_fill(buf)
    }

    fn clear(&mut self) -> Result<(), DeviceError> {
        self.spare_normal = None;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.spare_normal = None;
        Ok(())
    }

    fn status(&self) -> SourceStatus {
        SourceStatus::Online
    }
}
