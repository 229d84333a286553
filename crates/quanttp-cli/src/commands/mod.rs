pub mod devices;
pub mod serve;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use quanttp_core::SourceRegistry;
use quanttp_core::sources::{Backend, DEFAULT_HWRNG_PATH, DiscoveryConfig, discover};

/// Device discovery flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Backend to try: system, hwrng or simulated (repeatable)
    #[arg(long = "backend", default_value = "system")]
    pub backends: Vec<Backend>,

    /// Character device read by the hwrng backend
    #[arg(long, default_value = DEFAULT_HWRNG_PATH)]
    pub hwrng_path: PathBuf,

    /// Number of devices created by the simulated backend
    #[arg(long, default_value = "1")]
    pub simulated_devices: usize,

    /// Base seed for simulated devices (device i uses seed + i)
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

impl DeviceArgs {
    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            backends: self.backends.clone(),
            hwrng_path: self.hwrng_path.clone(),
            simulated_devices: self.simulated_devices,
            seed: self.seed,
        }
    }
}

/// Discover devices and build the registry. Fails when nothing usable was
/// found, since a server without devices can only return errors.
pub fn make_registry(args: &DeviceArgs) -> Result<Arc<SourceRegistry>, String> {
    let registry = SourceRegistry::new(discover(&args.discovery())).map_err(|e| e.to_string())?;
    if registry.is_empty() {
        return Err("no entropy devices found".to_string());
    }
    log::info!("discovered devices: {}", registry.list_ids().join(", "));
    Ok(Arc::new(registry))
}
