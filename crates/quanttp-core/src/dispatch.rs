//! Synchronous one-shot and batch request execution.
//!
//! Every call validates its parameters, resolves the target device and only
//! then touches hardware. Batches are all-or-nothing: the first failed draw
//! aborts the batch and nothing partial is returned.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::format::{self, Format, Limits, parse_count};
use crate::registry::SourceRegistry;
use crate::source::{EntropySource, SourceStatus};

/// Scalar draw kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawKind {
    Int32,
    Uniform,
    Normal,
}

impl DrawKind {
    pub fn format(self) -> Format {
        match self {
            Self::Int32 => Format::Int32,
            Self::Uniform => Format::Uniform,
            Self::Normal => Format::Normal,
        }
    }
}

/// One scalar draw result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int32(i32),
    Float(f64),
}

impl Value {
    /// Wire text of the value.
    pub fn to_text(self) -> String {
        match self {
            Self::Int32(v) => format::int32_text(v),
            Self::Float(v) => format::float_text(v),
        }
    }
}

/// Perform one scalar draw on `source`.
pub fn draw_value(source: &EntropySource, kind: DrawKind) -> Result<Value> {
    match kind {
        DrawKind::Int32 => source.draw_int32().map(Value::Int32),
        DrawKind::Uniform => source.draw_uniform().map(Value::Float),
        DrawKind::Normal => source.draw_normal().map(Value::Float),
    }
}

/// Ordered batch payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchData {
    Int32(Vec<i32>),
    Float(Vec<f64>),
    Text(Vec<String>),
}

impl BatchData {
    pub fn len(&self) -> usize {
        match self {
            Self::Int32(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A completed batch together with the metadata envelopes report.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub device: String,
    pub status: SourceStatus,
    pub format: Format,
    pub length: usize,
    pub size: Option<usize>,
    pub data: BatchData,
}

/// Raw, unvalidated batch parameters as they arrive from a transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchRequest<'a> {
    pub device_id: Option<&'a str>,
    pub length: Option<&'a str>,
    pub size: Option<&'a str>,
}

/// Executes synchronous requests against the registry.
///
/// All methods block on device I/O; async callers run them on a blocking
/// thread.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<SourceRegistry>,
    limits: Limits,
}

impl Dispatcher {
    pub fn new(registry: Arc<SourceRegistry>, limits: Limits) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// One scalar draw on the addressed device.
    pub fn one_shot(&self, device_id: Option<&str>, kind: DrawKind) -> Result<Value> {
        let source = self.registry.resolve(device_id)?;
        draw_value(&source, kind)
    }

    /// One validated raw byte draw of `length` bytes.
    pub fn bytes(&self, device_id: Option<&str>, length: Option<&str>) -> Result<Vec<u8>> {
        let n = parse_count("length", length, self.limits.max_length)?;
        let source = self.registry.resolve(device_id)?;
        source.draw_bytes(n)
    }

    /// `length` independent draws in request order. Hex and base64 also
    /// take `size`, the byte count of each element.
    pub fn batch(&self, format: Format, req: BatchRequest<'_>) -> Result<Batch> {
        if format == Format::Bytes {
            return Err(Error::invalid("bytes format is not available as a batch"));
        }
        let length = parse_count("length", req.length, self.limits.max_length)?;
        let size = if format.takes_size() {
            Some(parse_count("size", req.size, self.limits.max_size)?)
        } else {
            None
        };
        if let Some(size) = size {
            let max = self.limits.max_batch_bytes;
            if length.checked_mul(size).is_none_or(|total| total > max) {
                return Err(Error::invalid(format!("length * size must be at most {max}")));
            }
        }
        let source = self.registry.resolve(req.device_id)?;

        let data = match (format, size) {
            (Format::Int32, _) => {
                BatchData::Int32((0..length).map(|_| source.draw_int32()).collect::<Result<_>>()?)
            }
            (Format::Uniform, _) => {
                BatchData::Float((0..length).map(|_| source.draw_uniform()).collect::<Result<_>>()?)
            }
            (Format::Normal, _) => {
                BatchData::Float((0..length).map(|_| source.draw_normal()).collect::<Result<_>>()?)
            }
            (Format::Hex, Some(size)) => BatchData::Text(
                (0..length)
                    .map(|_| source.draw_bytes(size).map(|b| format::hex(&b)))
                    .collect::<Result<_>>()?,
            ),
            (Format::Base64, Some(size)) => BatchData::Text(
                (0..length)
                    .map(|_| source.draw_bytes(size).map(|b| format::base64(&b)))
                    .collect::<Result<_>>()?,
            ),
            (Format::Hex | Format::Base64 | Format::Bytes, _) => {
                return Err(Error::invalid("size is required"));
            }
        };

        Ok(Batch {
            device: source.id().to_string(),
            status: source.status(),
            format,
            length,
            size,
            data,
        })
    }

    /// Best-effort clear of the addressed device. Returns its id.
    pub fn clear(&self, device_id: Option<&str>) -> Result<String> {
        let source = self.registry.resolve(device_id)?;
        source.clear();
        Ok(source.id().to_string())
    }

    pub fn reset(&self, device_id: Option<&str>) -> Result<()> {
        self.registry.resolve(device_id)?.reset()
    }

    /// Status of the addressed device, or of every device when no id is
    /// given.
    pub fn status(&self, device_id: Option<&str>) -> Result<Vec<(String, SourceStatus)>> {
        match device_id.map(str::trim) {
            None | Some("") => Ok(self.registry.statuses()),
            Some(id) => {
                let source = self.registry.resolve(Some(id))?;
                Ok(vec![(source.id().to_string(), source.status())])
            }
        }
    }
}
