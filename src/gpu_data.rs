// GPU data is decoded from the hardware attributes on every request

// Core and memory clocks in MHz. Holds signed offsets from the base
// clocks when read from the offset attributes, absolute frequencies
// when decoded from the current clock word
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClockFreqs {
    pub core: i32,
    pub mem: i32,
}

// Valid clock offset bounds reported by the hardware, in MHz
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClockFreqRanges {
    pub core_min: i32,
    pub core_max: i32,
    pub mem_min: i32,
    pub mem_max: i32,
}

impl ClockFreqRanges {
    pub fn contains_core(&self, offset: i32) -> bool {
        (self.core_min..=self.core_max).contains(&offset)
    }

    pub fn contains_mem(&self, offset: i32) -> bool {
        (self.mem_min..=self.mem_max).contains(&offset)
    }
}

// Fan state of a GPU cooler, levels are percentages
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoolerState {
    pub is_manual: bool,
    pub target_level: i32,
    pub current_level: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_check_each_clock_separately() {
        let ranges = ClockFreqRanges {
            core_min: -100,
            core_max: 200,
            mem_min: -500,
            mem_max: 1500,
        };

        assert!(ranges.contains_core(200));
        assert!(!ranges.contains_core(201));
        assert!(ranges.contains_mem(1500));
        assert!(!ranges.contains_mem(-501));
    }
}
