use core::fmt;

use tracing::debug;

use crate::{
    attribute_client::{AttributeClient, ControlError},
    device::Device,
    gpu_data::CoolerState,
    protocol::{
        Attribute, COOLER_MANUAL_CONTROL_FALSE, COOLER_MANUAL_CONTROL_TRUE,
        TargetKind,
    },
};

const MAX_FAN_SPEED: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    // The driver owns the fan
    Auto,
    // The fan runs at the level requested by the user
    Manual,
}

impl From<bool> for FanMode {
    fn from(is_manual: bool) -> Self {
        if is_manual {
            FanMode::Manual
        } else {
            FanMode::Auto
        }
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanMode::Auto => write!(f, "auto"),
            FanMode::Manual => write!(f, "manual"),
        }
    }
}

/// Proof that the cooler of a device is in manual mode, only handed out
/// by [`CoolerController::enter_manual`]
#[derive(Debug)]
pub struct ManualFan<'d> {
    device: &'d Device,
}

impl ManualFan<'_> {
    pub fn device(&self) -> &Device {
        self.device
    }
}

pub struct CoolerController<'a> {
    client: &'a AttributeClient,
}

impl<'a> CoolerController<'a> {
    pub fn new(client: &'a AttributeClient) -> Self {
        Self { client }
    }

    // The manual flag lives on the GPU target, the levels on the cooler
    pub fn get_cooler_info(
        &self,
        device: &Device,
    ) -> Result<CoolerState, ControlError> {
        let is_manual = self.fan_mode(device)? == FanMode::Manual;

        let target_level = self.client.get_int(
            device,
            TargetKind::Cooler,
            Attribute::CoolerLevel,
        )?;
        let current_level = self.client.get_int(
            device,
            TargetKind::Cooler,
            Attribute::CoolerCurrentLevel,
        )?;

        Ok(CoolerState {
            is_manual,
            target_level,
            current_level,
        })
    }

    pub fn fan_mode(&self, device: &Device) -> Result<FanMode, ControlError> {
        let flag = self.client.get_int(
            device,
            TargetKind::Gpu,
            Attribute::CoolerManualControl,
        )?;

        Ok(FanMode::from(flag == COOLER_MANUAL_CONTROL_TRUE))
    }

    // Switch the cooler to manual mode, the flag is only written when the
    // cooler is still in auto mode
    pub fn enter_manual<'d>(
        &self,
        device: &'d Device,
    ) -> Result<ManualFan<'d>, ControlError> {
        if self.fan_mode(device)? == FanMode::Auto {
            self.client.set_int(
                device,
                TargetKind::Gpu,
                Attribute::CoolerManualControl,
                COOLER_MANUAL_CONTROL_TRUE,
            )?;

            debug!("GPU {}: fan mode set to manual", device.id);
        }

        Ok(ManualFan { device })
    }

    pub fn set_level(
        &self,
        fan: &ManualFan<'_>,
        percent: i32,
    ) -> Result<(), ControlError> {
        if !(0..=MAX_FAN_SPEED).contains(&percent) {
            return Err(ControlError::OutOfRange {
                what: "fan speed",
                value: percent,
                min: 0,
                max: MAX_FAN_SPEED,
            });
        }

        self.client.set_int(
            fan.device,
            TargetKind::Cooler,
            Attribute::CoolerLevel,
            percent,
        )?;

        debug!("GPU {}: fan speed set to {percent}%", fan.device.id);

        Ok(())
    }

    pub fn set_manual_fan_speed(
        &self,
        device: &Device,
        percent: i32,
    ) -> Result<(), ControlError> {
        let fan = self.enter_manual(device)?;
        self.set_level(&fan, percent)
    }

    // Hand the fan back to the driver, the stored level is left untouched
    pub fn set_fan_speed_auto(&self, device: &Device) -> Result<(), ControlError> {
        self.client.set_int(
            device,
            TargetKind::Gpu,
            Attribute::CoolerManualControl,
            COOLER_MANUAL_CONTROL_FALSE,
        )?;

        debug!("GPU {}: fan mode set to auto", device.id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::protocol::simulated::SimulatedProtocol;

    fn setup() -> (AttributeClient, Rc<SimulatedProtocol>, Device) {
        let protocol = Rc::new(SimulatedProtocol::with_gpu_count(1));
        let client = AttributeClient::new(Box::new(protocol.clone()));
        let device = client.enumerate_devices().unwrap().remove(0);

        (client, protocol, device)
    }

    #[test]
    fn manual_speed_switches_mode_first() {
        let (client, protocol, device) = setup();
        let cooler = CoolerController::new(&client);

        cooler.set_manual_fan_speed(&device, 70).unwrap();

        let info = cooler.get_cooler_info(&device).unwrap();
        assert!(info.is_manual);
        assert_eq!(info.target_level, 70);
        assert_eq!(info.current_level, 70);

        assert_eq!(
            protocol.writes(),
            vec![
                (
                    0,
                    TargetKind::Gpu,
                    Attribute::CoolerManualControl,
                    COOLER_MANUAL_CONTROL_TRUE
                ),
                (0, TargetKind::Cooler, Attribute::CoolerLevel, 70),
            ]
        );
    }

    #[test]
    fn manual_flag_is_not_rewritten_in_manual_mode() {
        let (client, protocol, device) = setup();
        protocol.update_gpu(0, |gpu| gpu.manual_control = true);

        CoolerController::new(&client)
            .set_manual_fan_speed(&device, 55)
            .unwrap();

        assert_eq!(
            protocol.writes(),
            vec![(0, TargetKind::Cooler, Attribute::CoolerLevel, 55)]
        );
    }

    #[test]
    fn auto_mode_keeps_the_target_level() {
        let (client, _, device) = setup();
        let cooler = CoolerController::new(&client);

        cooler.set_manual_fan_speed(&device, 85).unwrap();
        cooler.set_fan_speed_auto(&device).unwrap();

        let info = cooler.get_cooler_info(&device).unwrap();
        assert!(!info.is_manual);
        assert_eq!(info.target_level, 85);
        // The driver runs the fan at its own level
        assert_eq!(info.current_level, 33);
    }

    #[test]
    fn level_outside_percent_range_is_rejected() {
        let (client, protocol, device) = setup();
        let cooler = CoolerController::new(&client);

        let fan = cooler.enter_manual(&device).unwrap();
        let err = cooler.set_level(&fan, 120).unwrap_err();

        assert!(matches!(err, ControlError::OutOfRange { value: 120, .. }));
        assert_eq!(fan.device().id, 0);
        assert_eq!(protocol.gpu(0).map(|g| g.cooler_level), Some(40));
    }

    #[test]
    fn failed_mode_switch_writes_no_level() {
        let (client, protocol, device) = setup();
        protocol.fail_attribute(Attribute::CoolerManualControl);

        let err = CoolerController::new(&client)
            .set_manual_fan_speed(&device, 60)
            .unwrap_err();

        assert!(matches!(
            err,
            ControlError::Query {
                attribute: Attribute::CoolerManualControl,
                ..
            }
        ));
        assert!(protocol.writes().is_empty());
    }
}
