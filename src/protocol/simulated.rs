use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
};

use tracing::trace;

use crate::protocol::{
    Attribute, COOLER_MANUAL_CONTROL_FALSE, COOLER_MANUAL_CONTROL_TRUE,
    ControlProtocol, ErrorCollector, TargetKind, ValidRange,
    pack_current_clocks,
};

// In-memory model of one GPU and its cooler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedGpu {
    pub product_name: String,
    pub vbios_version: String,
    pub driver_version: String,
    pub uuid: String,

    pub core_offset: i32,
    pub mem_offset: i32,
    pub core_offset_range: ValidRange,
    pub mem_offset_range: ValidRange,

    pub temperature: i32,
    pub core_clock: u32,
    pub mem_clock: u32,

    pub manual_control: bool,
    // Level requested by the user, kept while the driver owns the fan
    pub cooler_level: i32,
    // Level the driver runs the fan at in automatic mode
    pub auto_level: i32,
}

impl SimulatedGpu {
    pub fn new(index: u32) -> Self {
        Self {
            product_name: "NVIDIA GeForce GTX 1080 (simulated)".to_string(),
            vbios_version: "86.04.17.00.80".to_string(),
            driver_version: "550.78".to_string(),
            uuid: format!("GPU-5a1e0000-0000-4000-8000-{index:012x}"),

            core_offset: 0,
            mem_offset: 0,
            core_offset_range: ValidRange { min: -200, max: 1200 },
            mem_offset_range: ValidRange { min: -2000, max: 6000 },

            temperature: 45,
            core_clock: 1607,
            mem_clock: 5005,

            manual_control: false,
            cooler_level: 40,
            auto_level: 33,
        }
    }

    fn current_level(&self) -> i32 {
        if self.manual_control {
            self.cooler_level
        } else {
            self.auto_level
        }
    }
}

// In-memory device model used by `--simulate` and the tests. Failures
// are injected per attribute, either as a failed request or as a stray
// diagnostic next to a successful status
#[derive(Debug, Default)]
pub struct SimulatedProtocol {
    gpus: RefCell<Vec<SimulatedGpu>>,

    failing: RefCell<HashSet<Attribute>>,
    read_only: RefCell<HashSet<Attribute>>,
    stray: RefCell<HashMap<Attribute, String>>,

    // Ordered log of the writes the device accepted
    writes: RefCell<Vec<(u32, TargetKind, Attribute, i32)>>,
}

impl SimulatedProtocol {
    pub fn new(gpus: Vec<SimulatedGpu>) -> Self {
        Self {
            gpus: RefCell::new(gpus),
            ..Default::default()
        }
    }

    // Simulate the given number of identical GPUs
    pub fn with_gpu_count(count: u32) -> Self {
        Self::new((0..count).map(SimulatedGpu::new).collect())
    }

    // Make every request on the attribute fail until restored
    pub fn fail_attribute(&self, attribute: Attribute) {
        self.failing.borrow_mut().insert(attribute);
    }

    // Make writes to the attribute fail while reads keep working
    pub fn reject_writes(&self, attribute: Attribute) {
        self.read_only.borrow_mut().insert(attribute);
    }

    pub fn restore_attribute(&self, attribute: Attribute) {
        self.failing.borrow_mut().remove(&attribute);
        self.read_only.borrow_mut().remove(&attribute);
    }

    // Report a diagnostic on the next request touching the attribute,
    // while still returning a successful status
    pub fn inject_diagnostic(&self, attribute: Attribute, message: &str) {
        self.stray
            .borrow_mut()
            .insert(attribute, message.to_string());
    }

    // Return a snapshot of the simulated GPU state
    pub fn gpu(&self, ordinal: u32) -> Option<SimulatedGpu> {
        self.gpus.borrow().get(ordinal as usize).cloned()
    }

    // Replace the state of a simulated GPU
    pub fn update_gpu(&self, ordinal: u32, f: impl FnOnce(&mut SimulatedGpu)) {
        if let Some(gpu) = self.gpus.borrow_mut().get_mut(ordinal as usize) {
            f(gpu);
        }
    }

    pub fn writes(&self) -> Vec<(u32, TargetKind, Attribute, i32)> {
        self.writes.borrow().clone()
    }

    // Run the fault injection for a request, return false if it must fail
    fn admit(&self, attribute: Attribute, errors: &mut ErrorCollector) -> bool {
        if let Some(message) = self.stray.borrow_mut().remove(&attribute) {
            errors.report(message);
        }

        if self.failing.borrow().contains(&attribute) {
            errors.report(format!("BadValue (attribute {})", attribute.id()));
            return false;
        }

        true
    }

    fn with_gpu<T>(
        &self,
        ordinal: u32,
        errors: &mut ErrorCollector,
        f: impl FnOnce(&mut SimulatedGpu, &mut ErrorCollector) -> Option<T>,
    ) -> Option<T> {
        let mut gpus = self.gpus.borrow_mut();

        match gpus.get_mut(ordinal as usize) {
            Some(gpu) => f(gpu, errors),
            None => {
                errors.report(format!("BadMatch (no target with id {ordinal})"));
                None
            }
        }
    }
}

impl ControlProtocol for SimulatedProtocol {
    fn backend_name(&self) -> &'static str {
        "simulated"
    }

    fn target_count(
        &self,
        _kind: TargetKind,
        _errors: &mut ErrorCollector,
    ) -> Option<u32> {
        u32::try_from(self.gpus.borrow().len()).ok()
    }

    fn query_int(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<i32> {
        if !self.admit(attribute, errors) {
            return None;
        }

        self.with_gpu(ordinal, errors, |gpu, errors| match (kind, attribute) {
            (TargetKind::Gpu, Attribute::ClockOffset) => Some(gpu.core_offset),
            (TargetKind::Gpu, Attribute::MemTransferRateOffset) => {
                Some(gpu.mem_offset)
            }
            (TargetKind::Gpu, Attribute::CoreTemperature) => {
                Some(gpu.temperature)
            }
            (TargetKind::Gpu, Attribute::CurrentClockFreqs) => {
                Some(pack_current_clocks(gpu.core_clock, gpu.mem_clock))
            }
            (TargetKind::Gpu, Attribute::CoolerManualControl) => {
                Some(if gpu.manual_control {
                    COOLER_MANUAL_CONTROL_TRUE
                } else {
                    COOLER_MANUAL_CONTROL_FALSE
                })
            }
            (TargetKind::Cooler, Attribute::CoolerLevel) => {
                Some(gpu.cooler_level)
            }
            (TargetKind::Cooler, Attribute::CoolerCurrentLevel) => {
                Some(gpu.current_level())
            }
            _ => {
                errors.report(format!(
                    "BadMatch (attribute {} on target kind {})",
                    attribute.id(),
                    kind.id()
                ));
                None
            }
        })
    }

    fn query_string(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<String> {
        if !self.admit(attribute, errors) {
            return None;
        }

        self.with_gpu(ordinal, errors, |gpu, errors| match (kind, attribute) {
            (TargetKind::Gpu, Attribute::ProductName) => {
                Some(gpu.product_name.clone())
            }
            (TargetKind::Gpu, Attribute::VbiosVersion) => {
                Some(gpu.vbios_version.clone())
            }
            (TargetKind::Gpu, Attribute::DriverVersion) => {
                Some(gpu.driver_version.clone())
            }
            (TargetKind::Gpu, Attribute::GpuUuid) => Some(gpu.uuid.clone()),
            _ => {
                errors.report(format!(
                    "BadMatch (string attribute {} on target kind {})",
                    attribute.id(),
                    kind.id()
                ));
                None
            }
        })
    }

    fn query_valid_range(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<ValidRange> {
        if !self.admit(attribute, errors) {
            return None;
        }

        self.with_gpu(ordinal, errors, |gpu, errors| match (kind, attribute) {
            (TargetKind::Gpu, Attribute::ClockOffset) => {
                Some(gpu.core_offset_range)
            }
            (TargetKind::Gpu, Attribute::MemTransferRateOffset) => {
                Some(gpu.mem_offset_range)
            }
            (TargetKind::Gpu, Attribute::CoolerManualControl) => {
                Some(ValidRange {
                    min: COOLER_MANUAL_CONTROL_FALSE,
                    max: COOLER_MANUAL_CONTROL_TRUE,
                })
            }
            (TargetKind::Cooler, Attribute::CoolerLevel) => {
                Some(ValidRange { min: 0, max: 100 })
            }
            _ => {
                errors.report(format!(
                    "BadMatch (no valid values for attribute {})",
                    attribute.id()
                ));
                None
            }
        })
    }

    fn set_int(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        value: i32,
        errors: &mut ErrorCollector,
    ) -> bool {
        if !self.admit(attribute, errors) {
            return false;
        }

        if self.read_only.borrow().contains(&attribute) {
            errors.report(format!("BadAccess (attribute {})", attribute.id()));
            return false;
        }

        let accepted = self.with_gpu(ordinal, errors, |gpu, errors| {
            let in_range = |range: ValidRange, errors: &mut ErrorCollector| {
                if range.contains(value) {
                    Some(())
                } else {
                    errors.report(format!(
                        "BadValue ({value} for attribute {})",
                        attribute.id()
                    ));
                    None
                }
            };

            match (kind, attribute) {
                (TargetKind::Gpu, Attribute::ClockOffset) => {
                    in_range(gpu.core_offset_range, errors)?;
                    gpu.core_offset = value;
                }
                (TargetKind::Gpu, Attribute::MemTransferRateOffset) => {
                    in_range(gpu.mem_offset_range, errors)?;
                    gpu.mem_offset = value;
                }
                (TargetKind::Gpu, Attribute::CoolerManualControl) => {
                    in_range(
                        ValidRange {
                            min: COOLER_MANUAL_CONTROL_FALSE,
                            max: COOLER_MANUAL_CONTROL_TRUE,
                        },
                        errors,
                    )?;
                    gpu.manual_control = value == COOLER_MANUAL_CONTROL_TRUE;
                }
                (TargetKind::Cooler, Attribute::CoolerLevel) => {
                    in_range(ValidRange { min: 0, max: 100 }, errors)?;

                    // The driver ignores level writes while it owns the fan
                    if gpu.manual_control {
                        gpu.cooler_level = value;
                    } else {
                        trace!("Cooler {ordinal} in auto mode, level write ignored");
                    }
                }
                _ => {
                    errors.report(format!(
                        "BadMatch (attribute {} is read-only on target kind {})",
                        attribute.id(),
                        kind.id()
                    ));
                    return None;
                }
            }

            Some(())
        });

        if accepted.is_some() {
            self.writes
                .borrow_mut()
                .push((ordinal, kind, attribute, value));
        }

        accepted.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_writes_are_ignored_in_auto_mode() {
        let protocol = SimulatedProtocol::with_gpu_count(1);
        let mut errors = ErrorCollector::new();

        assert!(protocol.set_int(
            0,
            TargetKind::Cooler,
            Attribute::CoolerLevel,
            80,
            &mut errors
        ));
        assert_eq!(protocol.gpu(0).map(|g| g.cooler_level), Some(40));

        assert!(protocol.set_int(
            0,
            TargetKind::Gpu,
            Attribute::CoolerManualControl,
            COOLER_MANUAL_CONTROL_TRUE,
            &mut errors
        ));
        assert!(protocol.set_int(
            0,
            TargetKind::Cooler,
            Attribute::CoolerLevel,
            80,
            &mut errors
        ));
        assert_eq!(protocol.gpu(0).map(|g| g.cooler_level), Some(80));
        assert!(errors.is_empty());
    }

    #[test]
    fn unknown_ordinal_is_reported() {
        let protocol = SimulatedProtocol::with_gpu_count(1);
        let mut errors = ErrorCollector::new();

        let value = protocol.query_int(
            3,
            TargetKind::Gpu,
            Attribute::CoreTemperature,
            &mut errors,
        );

        assert_eq!(value, None);
        assert!(errors.take().is_some_and(|msg| msg.contains("BadMatch")));
    }

    #[test]
    fn rejected_writes_keep_reads_working() {
        let protocol = SimulatedProtocol::with_gpu_count(1);
        protocol.reject_writes(Attribute::ClockOffset);
        let mut errors = ErrorCollector::new();

        assert!(!protocol.set_int(
            0,
            TargetKind::Gpu,
            Attribute::ClockOffset,
            100,
            &mut errors
        ));
        assert!(errors.take().is_some_and(|msg| msg.contains("BadAccess")));

        let value =
            protocol.query_int(0, TargetKind::Gpu, Attribute::ClockOffset, &mut errors);
        assert_eq!(value, Some(0));
        assert!(errors.is_empty());
        assert!(protocol.writes().is_empty());
    }

    #[test]
    fn stray_diagnostic_is_reported_once() {
        let protocol = SimulatedProtocol::with_gpu_count(1);
        protocol.inject_diagnostic(Attribute::CoreTemperature, "BadAccess");

        let mut errors = ErrorCollector::new();
        let value = protocol.query_int(
            0,
            TargetKind::Gpu,
            Attribute::CoreTemperature,
            &mut errors,
        );
        assert_eq!(value, Some(45));
        assert_eq!(errors.take().as_deref(), Some("BadAccess"));

        let value = protocol.query_int(
            0,
            TargetKind::Gpu,
            Attribute::CoreTemperature,
            &mut errors,
        );
        assert_eq!(value, Some(45));
        assert!(errors.is_empty());
    }
}
