//! Device backends and startup discovery.

pub mod hwrng;
pub mod simulated;
pub mod system;

use std::path::PathBuf;

pub use hwrng::{DEFAULT_HWRNG_PATH, HwRngDevice};
pub use simulated::{FaultPlan, SimulatedDevice};
pub use system::SystemDevice;

use crate::source::EntropyDevice;

/// Backend family tried during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Operating system entropy via `getrandom`.
    System,
    /// Kernel hw_random character device.
    HwRng,
    /// Seeded software generators, for demos and tests.
    Simulated,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::HwRng => write!(f, "hwrng"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" | "os" => Ok(Self::System),
            "hwrng" => Ok(Self::HwRng),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Which backends to try and how to configure them.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub backends: Vec<Backend>,
    pub hwrng_path: PathBuf,
    /// Number of simulated devices to create.
    pub simulated_devices: usize,
    /// Base seed; device `i` is seeded with `seed + i`.
    pub seed: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backends: vec![Backend::System],
            hwrng_path: PathBuf::from(DEFAULT_HWRNG_PATH),
            simulated_devices: 1,
            seed: 0,
        }
    }
}

/// Serial assigned to the OS entropy device.
pub const SYSTEM_SERIAL: &str = "SYSRNG00";

/// Serial assigned to the hw_random device.
pub const HWRNG_SERIAL: &str = "HWRNG000";

/// Serial for the `index`-th simulated device, e.g. `SIM00001`.
pub fn simulated_serial(index: usize) -> String {
    format!("SIM{:05}", index + 1)
}

/// Try every configured backend and return the devices that are usable
/// on this machine, in configuration order. Unavailable backends are
/// logged and skipped.
pub fn discover(config: &DiscoveryConfig) -> Vec<Box<dyn EntropyDevice>> {
    let mut devices: Vec<Box<dyn EntropyDevice>> = Vec::new();
    for backend in &config.backends {
        match backend {
            Backend::System => devices.push(Box::new(SystemDevice::new(SYSTEM_SERIAL))),
            Backend::HwRng => match HwRngDevice::open(HWRNG_SERIAL, &config.hwrng_path) {
                Ok(dev) => devices.push(Box::new(dev)),
                Err(e) => log::warn!("skipping hwrng backend: {e}"),
            },
            Backend::Simulated => {
                for i in 0..config.simulated_devices {
                    let seed = config.seed.wrapping_add(i as u64);
                    devices.push(Box::new(SimulatedDevice::new(simulated_serial(i), seed)));
                }
            }
        }
    }
    devices
}

/// Map 64 random bits to a double in `[0, 1)` using the top 53 bits.
pub(crate) fn uniform_from_bits(bits: u64) -> f64 {
    (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
}

/// Box–Muller transform: two uniforms in `[0, 1)` to two standard normals.
pub(crate) fn box_muller(u1: f64, u2: f64) -> (f64, f64) {
    // ln(0) is undefined; shift u1 into (0, 1].
    let r = (-2.0 * (1.0 - u1).ln()).sqrt();
    let theta = std::f64::consts::TAU * u2;
    (r * theta.cos(), r * theta.sin())
}
