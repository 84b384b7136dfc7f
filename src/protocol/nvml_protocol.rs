use std::{cell::RefCell, collections::HashMap, os::raw::c_int};

use nvml_wrapper::{
    Device, Nvml,
    enum_wrappers::device::{Clock, ClockId, TemperatureSensor},
    enums::device::FanControlPolicy,
    error::{NvmlError, nvml_sym, nvml_try},
};
use nvml_wrapper_sys::bindings::NvmlLib;
use tracing::{debug, info, warn};

use crate::{
    attribute_client::ControlError,
    protocol::{
        Attribute, COOLER_MANUAL_CONTROL_FALSE, COOLER_MANUAL_CONTROL_TRUE,
        ControlProtocol, ErrorCollector, TargetKind, ValidRange,
        pack_current_clocks,
    },
};

const NVML_LIBRARY: &str = "libnvidia-ml.so.1";

// Every GPU exposes one cooler target with the same ordinal, cooler
// writes go to all of its fans
pub struct NvmlProtocol {
    nvml: Nvml,

    // Second handle on the library for the offset range entry points
    // that the safe wrapper does not expose
    raw_lib: Option<NvmlLib>,

    // Last level written to each cooler, keyed by GPU ordinal.
    // NVML only reports the live speed, which follows the driver
    // curve while the fan is in automatic mode
    cooler_levels: RefCell<HashMap<u32, i32>>,
}

impl NvmlProtocol {
    // Initialize NVML and load the raw entry points
    pub fn connect() -> Result<Self, ControlError> {
        let nvml = Nvml::init().map_err(classify_init_error)?;

        // SAFETY: the library is the one NVML was just initialized from,
        // loading it again only bumps its reference count
        let raw_lib = match unsafe { NvmlLib::new(NVML_LIBRARY) } {
            Ok(lib) => Some(lib),
            Err(err) => {
                warn!(
                    "Clock offset ranges unavailable, failed to load \
                     {NVML_LIBRARY}: {err}"
                );
                None
            }
        };

        info!("NVML successfully initialized");

        Ok(Self {
            nvml,
            raw_lib,
            cooler_levels: RefCell::new(HashMap::new()),
        })
    }

    // Return a NVML device handle for the given ordinal
    fn device(
        &self,
        ordinal: u32,
        errors: &mut ErrorCollector,
    ) -> Option<Device<'_>> {
        capture(self.nvml.device_by_index(ordinal), errors)
    }

    fn offset_range(
        &self,
        device: &Device,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<ValidRange> {
        let Some(lib) = self.raw_lib.as_ref() else {
            errors.report("NVML offset range entry points are not loaded");
            return None;
        };

        let sym = match attribute {
            Attribute::ClockOffset => {
                nvml_sym(lib.nvmlDeviceGetGpcClkMinMaxVfOffset.as_ref())
            }
            _ => nvml_sym(lib.nvmlDeviceGetMemClkMinMaxVfOffset.as_ref()),
        };
        let sym = capture(sym, errors)?;

        let mut min: c_int = 0;
        let mut max: c_int = 0;

        // SAFETY: the handle belongs to a live device of this NVML session
        let code = unsafe { sym(device.handle(), &mut min, &mut max) };
        capture(nvml_try(code), errors)?;

        Some(ValidRange { min, max })
    }

    fn manual_control(
        &self,
        device: &Device,
        errors: &mut ErrorCollector,
    ) -> Option<i32> {
        let policy = capture(device.fan_control_policy(0), errors)?;

        Some(match policy {
            FanControlPolicy::Manual => COOLER_MANUAL_CONTROL_TRUE,
            FanControlPolicy::TemperatureContinousSw => {
                COOLER_MANUAL_CONTROL_FALSE
            }
        })
    }

    fn set_manual_control(
        &self,
        device: &mut Device,
        value: i32,
        errors: &mut ErrorCollector,
    ) -> bool {
        let policy = match value {
            COOLER_MANUAL_CONTROL_TRUE => FanControlPolicy::Manual,
            COOLER_MANUAL_CONTROL_FALSE => {
                FanControlPolicy::TemperatureContinousSw
            }
            _ => {
                errors.report(format!("invalid manual control value {value}"));
                return false;
            }
        };

        for_each_fan(device, errors, |dev, i| {
            dev.set_fan_control_policy(i, policy)
        })
    }

    fn set_cooler_level(
        &self,
        ordinal: u32,
        device: &mut Device,
        value: i32,
        errors: &mut ErrorCollector,
    ) -> bool {
        let Ok(speed) = u32::try_from(value) else {
            errors.report(format!("invalid cooler level {value}"));
            return false;
        };

        let ok = for_each_fan(device, errors, |dev, i| dev.set_fan_speed(i, speed));
        if ok {
            self.cooler_levels.borrow_mut().insert(ordinal, value);
        }

        ok
    }
}

impl ControlProtocol for NvmlProtocol {
    fn backend_name(&self) -> &'static str {
        "nvml"
    }

    fn target_count(
        &self,
        _kind: TargetKind,
        errors: &mut ErrorCollector,
    ) -> Option<u32> {
        capture(self.nvml.device_count(), errors)
    }

    fn query_int(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<i32> {
        let device = self.device(ordinal, errors)?;

        match (kind, attribute) {
            (TargetKind::Gpu, Attribute::ClockOffset) => {
                capture(device.gpc_clock_vf_offset(), errors)
            }
            (TargetKind::Gpu, Attribute::MemTransferRateOffset) => {
                capture(device.mem_clock_vf_offset(), errors)
            }
            (TargetKind::Gpu, Attribute::CoreTemperature) => {
                let temp = capture(
                    device.temperature(TemperatureSensor::Gpu),
                    errors,
                )?;
                to_int(temp, errors)
            }
            (TargetKind::Gpu, Attribute::CurrentClockFreqs) => {
                let core = capture(
                    device.clock(Clock::Graphics, ClockId::Current),
                    errors,
                )?;
                let mem = capture(
                    device.clock(Clock::Memory, ClockId::Current),
                    errors,
                )?;
                Some(pack_current_clocks(core, mem))
            }
            (TargetKind::Gpu, Attribute::CoolerManualControl) => {
                self.manual_control(&device, errors)
            }
            (TargetKind::Cooler, Attribute::CoolerLevel) => {
                if let Some(level) = self.cooler_levels.borrow().get(&ordinal) {
                    return Some(*level);
                }

                let speed = capture(device.fan_speed(0), errors)?;
                to_int(speed, errors)
            }
            (TargetKind::Cooler, Attribute::CoolerCurrentLevel) => {
                let speed = capture(device.fan_speed(0), errors)?;
                to_int(speed, errors)
            }
            _ => {
                errors.report(format!(
                    "attribute {attribute} is not readable on a {kind} target"
                ));
                None
            }
        }
    }

    fn query_string(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<String> {
        if kind != TargetKind::Gpu {
            errors.report(format!(
                "string attribute {attribute} is not available on a {kind} target"
            ));
            return None;
        }

        let device = self.device(ordinal, errors)?;

        match attribute {
            Attribute::ProductName => capture(device.name(), errors),
            Attribute::VbiosVersion => capture(device.vbios_version(), errors),
            Attribute::DriverVersion => {
                capture(self.nvml.sys_driver_version(), errors)
            }
            Attribute::GpuUuid => capture(device.uuid(), errors),
            _ => {
                errors.report(format!("attribute {attribute} is not a string"));
                None
            }
        }
    }

    fn query_valid_range(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<ValidRange> {
        let device = self.device(ordinal, errors)?;

        match (kind, attribute) {
            (
                TargetKind::Gpu,
                Attribute::ClockOffset | Attribute::MemTransferRateOffset,
            ) => self.offset_range(&device, attribute, errors),
            (TargetKind::Gpu, Attribute::CoolerManualControl) => {
                Some(ValidRange {
                    min: COOLER_MANUAL_CONTROL_FALSE,
                    max: COOLER_MANUAL_CONTROL_TRUE,
                })
            }
            (TargetKind::Cooler, Attribute::CoolerLevel) => {
                let (min, max) =
                    capture(device.min_max_fan_speed(), errors)?;
                Some(ValidRange {
                    min: to_int(min, errors)?,
                    max: to_int(max, errors)?,
                })
            }
            _ => {
                errors.report(format!(
                    "attribute {attribute} has no valid range on a {kind} target"
                ));
                None
            }
        }
    }

    fn set_int(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        value: i32,
        errors: &mut ErrorCollector,
    ) -> bool {
        let Some(mut device) = self.device(ordinal, errors) else {
            return false;
        };

        match (kind, attribute) {
            (TargetKind::Gpu, Attribute::ClockOffset) => {
                capture(device.set_gpc_clock_vf_offset(value), errors).is_some()
            }
            (TargetKind::Gpu, Attribute::MemTransferRateOffset) => {
                capture(device.set_mem_clock_vf_offset(value), errors).is_some()
            }
            (TargetKind::Gpu, Attribute::CoolerManualControl) => {
                self.set_manual_control(&mut device, value, errors)
            }
            (TargetKind::Cooler, Attribute::CoolerLevel) => {
                self.set_cooler_level(ordinal, &mut device, value, errors)
            }
            _ => {
                errors.report(format!(
                    "attribute {attribute} is not writable on a {kind} target"
                ));
                false
            }
        }
    }
}

// Map a NVML initialization failure to the session error taxonomy.
// A missing library or driver means the session cannot be reached,
// a library without the control entry points means the control
// interface itself is missing
fn classify_init_error(err: NvmlError) -> ControlError {
    match &err {
        NvmlError::FailedToLoadSymbol(_)
        | NvmlError::FunctionNotFound
        | NvmlError::LibRmVersionMismatch => {
            ControlError::ExtensionMissing(err.to_string())
        }
        _ => ControlError::Connection(err.to_string()),
    }
}

// Move a NVML error into the collector of the current request
fn capture<T>(
    result: Result<T, NvmlError>,
    errors: &mut ErrorCollector,
) -> Option<T> {
    result
        .map_err(|err| {
            debug!("NVML error: {err}");
            errors.report(err.to_string());
        })
        .ok()
}

fn to_int(value: u32, errors: &mut ErrorCollector) -> Option<i32> {
    i32::try_from(value)
        .map_err(|_| errors.report(format!("value {value} overflows the attribute")))
        .ok()
}

// Utility to execute a write for all fans on a GPU
fn for_each_fan(
    device: &mut Device<'_>,
    errors: &mut ErrorCollector,
    mut f: impl FnMut(&mut Device<'_>, u32) -> Result<(), NvmlError>,
) -> bool {
    let Some(fan_count) = capture(device.num_fans(), errors) else {
        return false;
    };

    if fan_count == 0 {
        errors.report("the GPU has no fans");
        return false;
    }

    for i in 0..fan_count {
        if let Err(err) = f(device, i) {
            errors.report(format!("fan {i}: {err}"));
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entry_points_map_to_extension_missing() {
        let err = classify_init_error(NvmlError::FunctionNotFound);
        assert!(matches!(err, ControlError::ExtensionMissing(_)));

        let err = classify_init_error(NvmlError::FailedToLoadSymbol(
            "nvmlInit_v2".to_string(),
        ));
        assert!(matches!(err, ControlError::ExtensionMissing(_)));
    }

    #[test]
    fn unreachable_driver_maps_to_connection() {
        let err = classify_init_error(NvmlError::DriverNotLoaded);
        assert!(matches!(err, ControlError::Connection(_)));

        let err = classify_init_error(NvmlError::LibraryNotFound);
        assert!(matches!(err, ControlError::Connection(_)));
    }

    #[test]
    fn captured_errors_land_in_the_collector() {
        let mut errors = ErrorCollector::new();

        let value: Option<u32> = capture(Err(NvmlError::NotSupported), &mut errors);
        assert_eq!(value, None);
        assert!(!errors.is_empty());

        let value = capture(Ok(7u32), &mut errors);
        assert_eq!(value, Some(7));
    }

    #[test]
    fn oversized_values_are_reported() {
        let mut errors = ErrorCollector::new();

        assert_eq!(to_int(u32::MAX, &mut errors), None);
        assert!(errors.take().is_some());
        assert_eq!(to_int(75, &mut errors), Some(75));
        assert!(errors.is_empty());
    }
}
