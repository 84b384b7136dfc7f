use core::fmt;
use std::rc::Rc;

pub mod nvml_protocol;
pub mod simulated;

// Value of the cooler manual control flag when the driver owns the fan
pub const COOLER_MANUAL_CONTROL_FALSE: i32 = 0;
// Value of the cooler manual control flag when the user owns the fan
pub const COOLER_MANUAL_CONTROL_TRUE: i32 = 1;

// Select which sub-component of a device an attribute call addresses.
// A GPU and its cooler share the same ordinal but are distinct targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Gpu,
    Cooler,
}

impl TargetKind {
    // Return the protocol discriminant of the target kind
    pub const fn id(self) -> u32 {
        match self {
            TargetKind::Gpu => 1,
            TargetKind::Cooler => 5,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Gpu => write!(f, "gpu"),
            TargetKind::Cooler => write!(f, "cooler"),
        }
    }
}

// Hardware attributes used by the controllers, each with a fixed integer
// identifier that every backend maps onto its own interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    ProductName,
    VbiosVersion,
    DriverVersion,
    GpuUuid,

    // Signed MHz offset applied to every performance level
    ClockOffset,
    MemTransferRateOffset,

    CoreTemperature,
    // Current core clock in the high 16 bits, memory clock in the low 16 bits
    CurrentClockFreqs,

    CoolerManualControl,
    CoolerLevel,
    CoolerCurrentLevel,
}

impl Attribute {
    // Return the fixed integer identifier of the attribute
    pub const fn id(self) -> u32 {
        match self {
            Attribute::ProductName => 0,
            Attribute::VbiosVersion => 1,
            Attribute::DriverVersion => 3,
            Attribute::GpuUuid => 52,
            Attribute::CoreTemperature => 60,
            Attribute::CurrentClockFreqs => 67,
            Attribute::CoolerManualControl => 319,
            Attribute::CoolerLevel => 320,
            Attribute::CoolerCurrentLevel => 417,
            Attribute::ClockOffset => 424,
            Attribute::MemTransferRateOffset => 425,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Attribute::ProductName => "product name",
            Attribute::VbiosVersion => "vbios version",
            Attribute::DriverVersion => "driver version",
            Attribute::GpuUuid => "gpu uuid",
            Attribute::ClockOffset => "clock offset",
            Attribute::MemTransferRateOffset => "memory transfer rate offset",
            Attribute::CoreTemperature => "core temperature",
            Attribute::CurrentClockFreqs => "current clock frequencies",
            Attribute::CoolerManualControl => "cooler manual control",
            Attribute::CoolerLevel => "cooler level",
            Attribute::CoolerCurrentLevel => "cooler current level",
        }
    }

}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id())
    }
}

// Build the packed current clock word: core MHz in the high 16 bits,
// memory MHz in the low 16 bits
pub fn pack_current_clocks(core: u32, mem: u32) -> i32 {
    (((core & 0xFFFF) << 16) | (mem & 0xFFFF)) as i32
}

// Inclusive bounds reported by the hardware for an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidRange {
    pub min: i32,
    pub max: i32,
}

impl ValidRange {
    pub fn contains(&self, value: i32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

// Diagnostics reported out of band during a single request. A collector
// lives for exactly one protocol call
#[derive(Debug, Default)]
pub struct ErrorCollector {
    messages: Vec<String>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // Record a diagnostic for the request currently in flight
    pub fn report(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    // Drain the captured diagnostics, joined into a single message
    pub fn take(&mut self) -> Option<String> {
        if self.messages.is_empty() {
            return None;
        }

        let joined = self.messages.join("; ");
        self.messages.clear();

        Some(joined)
    }
}

// A request has failed when its return value says so or when it left a
// diagnostic in the collector
pub trait ControlProtocol {
    // Short name of the backend, used in logs
    fn backend_name(&self) -> &'static str;

    // Return the number of targets of the given kind
    fn target_count(
        &self,
        kind: TargetKind,
        errors: &mut ErrorCollector,
    ) -> Option<u32>;

    fn query_int(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<i32>;

    fn query_string(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<String>;

    fn query_valid_range(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<ValidRange>;

    // Return true if the hardware acknowledged the write
    fn set_int(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        value: i32,
        errors: &mut ErrorCollector,
    ) -> bool;
}

// A shared handle on a backend is a backend too
impl<P: ControlProtocol + ?Sized> ControlProtocol for Rc<P> {
    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }

    fn target_count(
        &self,
        kind: TargetKind,
        errors: &mut ErrorCollector,
    ) -> Option<u32> {
        (**self).target_count(kind, errors)
    }

    fn query_int(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<i32> {
        (**self).query_int(ordinal, kind, attribute, errors)
    }

    fn query_string(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<String> {
        (**self).query_string(ordinal, kind, attribute, errors)
    }

    fn query_valid_range(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        errors: &mut ErrorCollector,
    ) -> Option<ValidRange> {
        (**self).query_valid_range(ordinal, kind, attribute, errors)
    }

    fn set_int(
        &self,
        ordinal: u32,
        kind: TargetKind,
        attribute: Attribute,
        value: i32,
        errors: &mut ErrorCollector,
    ) -> bool {
        (**self).set_int(ordinal, kind, attribute, value, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_word_keeps_both_clocks() {
        let packed = pack_current_clocks(1000, 200);
        assert_eq!(packed, 0x03E8_00C8);
    }

    #[test]
    fn collector_take_drains_messages() {
        let mut errors = ErrorCollector::new();
        assert!(errors.is_empty());
        assert_eq!(errors.take(), None);

        errors.report("BadValue");
        errors.report("BadMatch");
        assert!(!errors.is_empty());
        assert_eq!(errors.take().as_deref(), Some("BadValue; BadMatch"));

        assert!(errors.is_empty());
        assert_eq!(errors.take(), None);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let range = ValidRange { min: -200, max: 1000 };

        assert!(range.contains(-200));
        assert!(range.contains(1000));
        assert!(!range.contains(1001));
        assert!(!range.contains(-201));
    }

    #[test]
    fn registry_identifiers_are_distinct() {
        let attributes = [
            Attribute::ProductName,
            Attribute::VbiosVersion,
            Attribute::DriverVersion,
            Attribute::GpuUuid,
            Attribute::ClockOffset,
            Attribute::MemTransferRateOffset,
            Attribute::CoreTemperature,
            Attribute::CurrentClockFreqs,
            Attribute::CoolerManualControl,
            Attribute::CoolerLevel,
            Attribute::CoolerCurrentLevel,
        ];

        let mut ids: Vec<u32> = attributes.iter().map(|a| a.id()).collect();
        ids.sort_unstable();
        ids.dedup();

        assert_eq!(ids.len(), attributes.len());
        assert_ne!(TargetKind::Gpu.id(), TargetKind::Cooler.id());
    }
}
