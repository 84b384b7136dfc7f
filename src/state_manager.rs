use tracing::{error, info, trace};

use crate::{
    attribute_client::{AttributeClient, ControlError},
    clock_controller::ClockController,
    cooler_controller::CoolerController,
    device::Device,
    errors::OverdriveError,
    profile_store::{Profile, ProfileError, ProfileStore},
};

pub struct StateManager<'a> {
    client: &'a AttributeClient,
    devices: Vec<Device>,
}

impl<'a> StateManager<'a> {
    pub fn new(client: &'a AttributeClient, devices: Vec<Device>) -> Self {
        trace!(
            "GPUs on current system: {:?}",
            devices.iter().map(|d| d.uuid.as_str()).collect::<Vec<_>>()
        );

        Self { client, devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, ordinal: u32) -> Option<&Device> {
        self.devices.iter().find(|device| device.id == ordinal)
    }

    // Write the clock offsets then the fan settings of the profile.
    // Offsets outside the device range are rejected before any write.
    // The power limit is not applied
    pub fn apply_profile(
        &self,
        device: &Device,
        profile: &Profile,
    ) -> Result<(), OverdriveError> {
        let clocks = ClockController::new(self.client);
        let cooler = CoolerController::new(self.client);

        let ranges = clocks.get_clock_range(device)?;

        if !ranges.contains_core(profile.core_clock_offset) {
            return Err(ControlError::OutOfRange {
                what: "core clock offset",
                value: profile.core_clock_offset,
                min: ranges.core_min,
                max: ranges.core_max,
            }
            .into());
        }
        if !ranges.contains_mem(profile.mem_clock_offset) {
            return Err(ControlError::OutOfRange {
                what: "memory clock offset",
                value: profile.mem_clock_offset,
                min: ranges.mem_min,
                max: ranges.mem_max,
            }
            .into());
        }

        clocks.set_clock_offsets(device, profile.core_clock_offset, profile.mem_clock_offset)?;

        if profile.manual_fan_control {
            cooler.set_manual_fan_speed(device, profile.fan_speed)?;
        } else {
            cooler.set_fan_speed_auto(device)?;
        }

        Ok(())
    }

    pub fn apply_named_profile(
        &self,
        store: &ProfileStore,
        device: &Device,
        name: &str,
    ) -> Result<(), OverdriveError> {
        let profile = store.get_profile(&device.uuid, name).ok_or_else(|| {
            ProfileError::UnknownProfile {
                uuid: device.uuid.clone(),
                name: name.to_string(),
            }
        })?;

        self.apply_profile(device, &profile)?;

        info!("GPU {}: applied profile \"{name}\"", device.id);

        Ok(())
    }

    // Read the live settings of a device into a profile
    pub fn capture_profile(
        &self,
        device: &Device,
        power_limit: i32,
    ) -> Result<Profile, OverdriveError> {
        let offsets = ClockController::new(self.client).get_clock_offsets(device)?;
        let cooler = CoolerController::new(self.client).get_cooler_info(device)?;

        Ok(Profile::capture(power_limit, offsets, cooler))
    }

    // Load the profiles of every device and apply the ones marked to be
    // applied on start. Failures are logged and the next device is
    // processed. Return the number of profiles applied
    pub fn apply_on_start(&self, store: &mut ProfileStore) -> usize {
        let mut applied = 0;

        for device in &self.devices {
            if let Err(err) = store.get_profiles(&device.uuid) {
                log_error_chain(&err);
                continue;
            }

            let Some(name) = store.get_apply_on_start(&device.uuid) else {
                trace!("GPU {}: no profile to apply on start", device.id);
                continue;
            };
            let name = name.to_string();

            match self.apply_named_profile(store, device, &name) {
                Ok(()) => applied += 1,
                Err(err) => log_error_chain(&err),
            }
        }

        applied
    }
}

// Log an error and every error it wraps
pub fn log_error_chain(err: &dyn std::error::Error) {
    error!("{err}");

    let mut source = err.source();
    while let Some(err) = source {
        error!("{err}");
        source = err.source();
    }
}
