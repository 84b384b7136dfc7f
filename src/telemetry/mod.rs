use core::fmt;

pub mod poller;
pub mod ring_series;

// A metric plotted by the front end
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricChannel {
    Temperature,
    CoreClock,
    MemClock,
    FanSpeed,
}

impl MetricChannel {
    pub const ALL: [MetricChannel; 4] = [
        MetricChannel::Temperature,
        MetricChannel::CoreClock,
        MetricChannel::MemClock,
        MetricChannel::FanSpeed,
    ];

    pub const fn title(self) -> &'static str {
        match self {
            MetricChannel::Temperature => "Temperature (°C)",
            MetricChannel::CoreClock => "Core clock (MHz)",
            MetricChannel::MemClock => "Memory clock (MHz)",
            MetricChannel::FanSpeed => "Fan speed (%)",
        }
    }

    // Fixed upper bound of the plot y axis
    pub const fn y_axis_max(self) -> i32 {
        match self {
            MetricChannel::Temperature => 100,
            MetricChannel::CoreClock => 3000,
            MetricChannel::MemClock => 6000,
            MetricChannel::FanSpeed => 100,
        }
    }

    // Core and memory clocks are decoded from the same attribute read
    pub const fn needs_clock_read(self) -> bool {
        matches!(self, MetricChannel::CoreClock | MetricChannel::MemClock)
    }
}

impl fmt::Display for MetricChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_bounds() {
        let bounds: Vec<i32> =
            MetricChannel::ALL.iter().map(|c| c.y_axis_max()).collect();

        assert_eq!(bounds, vec![100, 3000, 6000, 100]);
    }
}
