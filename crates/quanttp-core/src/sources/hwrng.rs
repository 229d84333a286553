//! HwRngDevice — kernel hardware RNG character device (`/dev/hwrng`).
//!
//! Reads go through a `BufReader`, which is the device's only internal
//! buffer: `clear` drops whatever is buffered, `reset` reopens the node.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::DeviceError;
use crate::source::{EntropyDevice, SourceStatus};

use super::{box_muller, uniform_from_bits};

/// Default device node exposed by the Linux hw_random framework.
pub const DEFAULT_HWRNG_PATH: &str = "/dev/hwrng";

const READ_BUFFER: usize = 4096;

/// Entropy device reading from a hw_random character device.
pub struct HwRngDevice {
    serial: String,
    path: PathBuf,
    reader: Option<BufReader<File>>,
    spare_normal: Option<f64>,
}

impl HwRngDevice {
    /// Open `path`. Fails if the node does not exist or is not readable.
    pub fn open(serial: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();
        let reader = Some(open_reader(&path)?);
        Ok(Self {
            serial: serial.into(),
            path,
            reader,
            spare_normal: None,
        })
    }

    /// Whether the node at `path` can be opened for reading.
    pub fn is_available(path: impl AsRef<Path>) -> bool {
        File::open(path).is_ok()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| DeviceError::new(format!("{} is not open", self.path.display())))?;
        reader.read_exact(buf)?;
        Ok(())
    }

    fn uniform(&mut self) -> Result<f64, DeviceError> {
        let mut raw = [0u8; 8];
        self.read_exact(&mut raw)?;
        Ok(uniform_from_bits(u64::from_le_bytes(raw)))
    }
}

fn open_reader(path: &Path) -> Result<BufReader<File>, DeviceError> {
    let file = File::open(path)
        .map_err(|e| DeviceError::new(format!("{} not available: {e}", path.display())))?;
    Ok(BufReader::with_capacity(READ_BUFFER, file))
}

impl EntropyDevice for HwRngDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn description(&self) -> &str {
        "kernel hw_random device"
    }

    fn rand_int32(&mut self) -> Result<i32, DeviceError> {
        let mut raw = [0u8; 4];
        self.read_exact(&mut raw)?;
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
        self.read_exact(buf)
    }

    fn clear(&mut self) -> Result<(), DeviceError> {
        self.spare_normal = None;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| DeviceError::new(format!("{} is not open", self.path.display())))?;
        let buffered = reader.buffer().len();
        reader.consume(buffered);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.spare_normal = None;
        self.reader = None;
        self.reader = Some(open_reader(&self.path)?);
        Ok(())
    }

    fn status(&self) -> SourceStatus {
        if self.reader.is_some() {
            SourceStatus::Online
        } else {
            SourceStatus::Degraded
        }
    }
}
