//! Device-id → source mapping, fixed after startup discovery.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::source::{DEVICE_ID_LEN, EntropyDevice, EntropySource, SourceStatus};

/// Registry of every source discovered at startup.
///
/// Lookups never fall back to a different device: an id either resolves to
/// its own source or fails.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<EntropySource>>,
    by_id: HashMap<String, usize>,
}

impl SourceRegistry {
    /// Build a registry from discovered backends, in discovery order.
    /// Rejects malformed and duplicate serials.
    pub fn new(devices: Vec<Box<dyn EntropyDevice>>) -> Result<Self> {
        let mut registry = Self::default();
        for device in devices {
            registry.add(EntropySource::new(device)?)?;
        }
        Ok(registry)
    }

    fn add(&mut self, source: EntropySource) -> Result<()> {
        if self.by_id.contains_key(source.id()) {
            return Err(Error::invalid(format!("duplicate device id '{}'", source.id())));
        }
        self.by_id.insert(source.id().to_string(), self.sources.len());
        self.sources.push(Arc::new(source));
        Ok(())
    }

    /// Device ids in discovery order.
    pub fn list_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> impl Iterator<Item = &Arc<EntropySource>> {
        self.sources.iter()
    }

    /// Resolve a request's device id.
    ///
    /// An absent or empty id resolves only when exactly one device is
    /// registered. A present id must be [`DEVICE_ID_LEN`] characters; the
    /// length check runs before the lookup.
    pub fn resolve(&self, id: Option<&str>) -> Result<Arc<EntropySource>> {
        let id = match id.map(str::trim) {
            None | Some("") => {
                return match self.sources.as_slice() {
                    [only] => Ok(Arc::clone(only)),
                    _ => Err(Error::invalid("deviceId is required")),
                };
            }
            Some(id) => id,
        };
        validate_device_id(id)?;
        self.by_id
            .get(id)
            .map(|&i| Arc::clone(&self.sources[i]))
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))
    }

    /// `(id, status)` for every registered source.
    pub fn statuses(&self) -> Vec<(String, SourceStatus)> {
        self.sources
            .iter()
            .map(|s| (s.id().to_string(), s.status()))
            .collect()
    }
}

/// Reject ids that cannot be a vendor serial.
pub fn validate_device_id(id: &str) -> Result<()> {
    if id.chars().count() != DEVICE_ID_LEN {
        return Err(Error::invalid(format!(
            "deviceId must be {DEVICE_ID_LEN} characters"
        )));
    }
    Ok(())
}
