use thiserror::Error;
use tracing::{debug, info, trace};

use crate::{
    app_config::ProtocolBackend,
    device::Device,
    protocol::{
        Attribute, ControlProtocol, ErrorCollector, TargetKind, ValidRange,
        nvml_protocol::NvmlProtocol, simulated::SimulatedProtocol,
    },
};

// Diagnostic used when a request fails without reporting anything
const SILENT_FAILURE: &str = "request returned a failure status";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to open the GPU control session: {0}")]
    Connection(String),
    #[error("the GPU control interface is not available: {0}")]
    ExtensionMissing(String),
    #[error("failed to enumerate GPUs: {0}")]
    Enumeration(String),
    #[error("no NVIDIA GPUs found")]
    NoDevice,

    #[error("query of attribute {attribute} failed: {diagnostic}")]
    Query {
        attribute: Attribute,
        diagnostic: String,
    },
    #[error("setting attribute {attribute} to {value} failed: {diagnostic}")]
    Set {
        attribute: Attribute,
        value: i32,
        diagnostic: String,
    },

    #[error("{what} {value} is outside the supported range [{min}, {max}]")]
    OutOfRange {
        what: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },
}

impl ControlError {
    // Startup errors leave the process without a usable session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ControlError::Connection(_)
                | ControlError::ExtensionMissing(_)
                | ControlError::Enumeration(_)
                | ControlError::NoDevice
        )
    }
}

// Every request runs under its own ErrorCollector, empty when the request
// is issued and drained before the call returns
pub struct AttributeClient {
    protocol: Box<dyn ControlProtocol>,
}

impl AttributeClient {
    // Open a session on the given backend
    pub fn open(backend: ProtocolBackend) -> Result<Self, ControlError> {
        let protocol: Box<dyn ControlProtocol> = match backend {
            ProtocolBackend::Nvml => Box::new(NvmlProtocol::connect()?),
            ProtocolBackend::Simulated { gpu_count } => {
                Box::new(SimulatedProtocol::with_gpu_count(gpu_count))
            }
        };

        info!("Control session open on the {} backend", protocol.backend_name());

        Ok(Self::new(protocol))
    }

    pub fn new(protocol: Box<dyn ControlProtocol>) -> Self {
        Self { protocol }
    }

    // Build the list of GPUs on the system, fail if there are none
    pub fn enumerate_devices(&self) -> Result<Vec<Device>, ControlError> {
        let count = self
            .request(|protocol, errors| {
                protocol.target_count(TargetKind::Gpu, errors)
            })
            .map_err(ControlError::Enumeration)?;

        let mut devices = Vec::with_capacity(count as usize);

        for id in 0..count {
            let device = Device {
                id,
                product_name: self.query_string(id, Attribute::ProductName)?,
                vbios_version: self.query_string(id, Attribute::VbiosVersion)?,
                driver_version: self
                    .query_string(id, Attribute::DriverVersion)?,
                uuid: self.query_string(id, Attribute::GpuUuid)?,
            };

            debug!("Found GPU: {}", device.summary());

            devices.push(device);
        }

        if devices.is_empty() {
            return Err(ControlError::NoDevice);
        }

        Ok(devices)
    }

    pub fn get_int(
        &self,
        device: &Device,
        kind: TargetKind,
        attribute: Attribute,
    ) -> Result<i32, ControlError> {
        let value = self
            .request(|protocol, errors| {
                protocol.query_int(device.id, kind, attribute, errors)
            })
            .map_err(|diagnostic| ControlError::Query {
                attribute,
                diagnostic,
            })?;

        trace!("get {kind}:{} {attribute} = {value}", device.id);

        Ok(value)
    }

    pub fn get_string(
        &self,
        device: &Device,
        kind: TargetKind,
        attribute: Attribute,
    ) -> Result<String, ControlError> {
        let value = self
            .request(|protocol, errors| {
                protocol.query_string(device.id, kind, attribute, errors)
            })
            .map_err(|diagnostic| ControlError::Query {
                attribute,
                diagnostic,
            })?;

        trace!("get {kind}:{} {attribute} = {value:?}", device.id);

        Ok(value)
    }

    // Return the valid values of an attribute as an inclusive range
    pub fn get_range(
        &self,
        device: &Device,
        kind: TargetKind,
        attribute: Attribute,
    ) -> Result<ValidRange, ControlError> {
        let range = self
            .request(|protocol, errors| {
                protocol.query_valid_range(device.id, kind, attribute, errors)
            })
            .map_err(|diagnostic| ControlError::Query {
                attribute,
                diagnostic,
            })?;

        trace!(
            "range {kind}:{} {attribute} = [{}, {}]",
            device.id, range.min, range.max
        );

        Ok(range)
    }

    pub fn set_int(
        &self,
        device: &Device,
        kind: TargetKind,
        attribute: Attribute,
        value: i32,
    ) -> Result<(), ControlError> {
        trace!("set {kind}:{} {attribute} <- {value}", device.id);

        self.request(|protocol, errors| {
            protocol
                .set_int(device.id, kind, attribute, value, errors)
                .then_some(())
        })
        .map_err(|diagnostic| ControlError::Set {
            attribute,
            value,
            diagnostic,
        })
    }

    fn query_string(
        &self,
        ordinal: u32,
        attribute: Attribute,
    ) -> Result<String, ControlError> {
        let value = self
            .request(|protocol, errors| {
                protocol.query_string(ordinal, TargetKind::Gpu, attribute, errors)
            })
            .map_err(|diagnostic| ControlError::Query {
                attribute,
                diagnostic,
            })?;

        trace!("get {}:{ordinal} {attribute} = {value:?}", TargetKind::Gpu);

        Ok(value)
    }

    // Issue one request under a fresh collector. The request fails if
    // the backend reported a failure status or any diagnostic
    fn request<T>(
        &self,
        f: impl FnOnce(&dyn ControlProtocol, &mut ErrorCollector) -> Option<T>,
    ) -> Result<T, String> {
        let mut errors = ErrorCollector::new();

        let status = f(self.protocol.as_ref(), &mut errors);
        let diagnostic = errors.take();

        match (status, diagnostic) {
            (Some(value), None) => Ok(value),
            (_, Some(diagnostic)) => Err(diagnostic),
            (None, None) => Err(SILENT_FAILURE.to_string()),
        }
    }
}
