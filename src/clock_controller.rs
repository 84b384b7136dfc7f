use thiserror::Error;
use tracing::debug;

use crate::{
    attribute_client::{AttributeClient, ControlError},
    device::Device,
    gpu_data::{ClockFreqRanges, ClockFreqs},
    protocol::{Attribute, TargetKind},
};

// Clock offsets are written one attribute at a time, core first.
// A failure on the memory write leaves the core offset applied
#[derive(Debug, Error)]
pub enum ClockApplyError {
    #[error("failed to apply the core clock offset, no offset changed")]
    Core(#[source] ControlError),
    #[error("core clock offset applied but the memory clock offset failed")]
    Mem(#[source] ControlError),
}

impl ClockApplyError {
    // Return the attribute whose write failed
    pub fn failed_attribute(&self) -> Attribute {
        match self {
            ClockApplyError::Core(_) => Attribute::ClockOffset,
            ClockApplyError::Mem(_) => Attribute::MemTransferRateOffset,
        }
    }

    pub fn core_applied(&self) -> bool {
        matches!(self, ClockApplyError::Mem(_))
    }
}

// Split the packed current clock word into core and memory MHz
pub fn decode_current_clocks(packed: i32) -> ClockFreqs {
    let packed = packed as u32;

    ClockFreqs {
        core: ((packed >> 16) & 0xFFFF) as i32,
        mem: (packed & 0xFFFF) as i32,
    }
}

pub struct ClockController<'a> {
    client: &'a AttributeClient,
}

impl<'a> ClockController<'a> {
    pub fn new(client: &'a AttributeClient) -> Self {
        Self { client }
    }

    pub fn get_clock_range(
        &self,
        device: &Device,
    ) -> Result<ClockFreqRanges, ControlError> {
        let core = self.client.get_range(
            device,
            TargetKind::Gpu,
            Attribute::ClockOffset,
        )?;
        let mem = self.client.get_range(
            device,
            TargetKind::Gpu,
            Attribute::MemTransferRateOffset,
        )?;

        Ok(ClockFreqRanges {
            core_min: core.min,
            core_max: core.max,
            mem_min: mem.min,
            mem_max: mem.max,
        })
    }

    pub fn get_clock_offsets(
        &self,
        device: &Device,
    ) -> Result<ClockFreqs, ControlError> {
        Ok(ClockFreqs {
            core: self.client.get_int(
                device,
                TargetKind::Gpu,
                Attribute::ClockOffset,
            )?,
            mem: self.client.get_int(
                device,
                TargetKind::Gpu,
                Attribute::MemTransferRateOffset,
            )?,
        })
    }

    pub fn set_clock_offsets(
        &self,
        device: &Device,
        core: i32,
        mem: i32,
    ) -> Result<(), ClockApplyError> {
        self.client
            .set_int(device, TargetKind::Gpu, Attribute::ClockOffset, core)
            .map_err(ClockApplyError::Core)?;

        self.client
            .set_int(
                device,
                TargetKind::Gpu,
                Attribute::MemTransferRateOffset,
                mem,
            )
            .map_err(ClockApplyError::Mem)?;

        debug!("GPU {}: clock offsets set to core {core}, mem {mem}", device.id);

        Ok(())
    }

    // Return the absolute core and memory clocks in MHz
    pub fn get_current_clocks(
        &self,
        device: &Device,
    ) -> Result<ClockFreqs, ControlError> {
        let packed = self.client.get_int(
            device,
            TargetKind::Gpu,
            Attribute::CurrentClockFreqs,
        )?;

        Ok(decode_current_clocks(packed))
    }

    // Core temperature in degrees Celsius
    pub fn get_core_temperature(
        &self,
        device: &Device,
    ) -> Result<i32, ControlError> {
        self.client
            .get_int(device, TargetKind::Gpu, Attribute::CoreTemperature)
    }
}
