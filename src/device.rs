// Device information is static, it is queried once at session start

// Store a GPU found on the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    // Ordinal used to address the device during this session only,
    // it can change across restarts
    pub id: u32,

    pub product_name: String,
    pub vbios_version: String,
    pub driver_version: String,

    // Stable identity, the only key used for persisted data
    pub uuid: String,
}

impl Device {
    // Return a one line human readable description of the device
    pub fn summary(&self) -> String {
        format!(
            "[{}] {} (VBIOS {}, driver {}) {}",
            self.id,
            self.product_name,
            self.vbios_version,
            self.driver_version,
            self.uuid
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_names_the_device() {
        let device = Device {
            id: 1,
            product_name: "NVIDIA GeForce RTX 3080".to_string(),
            vbios_version: "94.02.42.00.A9".to_string(),
            driver_version: "550.78".to_string(),
            uuid: "GPU-1b2c".to_string(),
        };

        assert_eq!(
            device.summary(),
            "[1] NVIDIA GeForce RTX 3080 (VBIOS 94.02.42.00.A9, driver 550.78) GPU-1b2c"
        );
    }
}
