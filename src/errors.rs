use thiserror::Error;

use crate::{
    attribute_client::ControlError, clock_controller::ClockApplyError,
    profile_store::ProfileError,
};

// Error of the user level actions
#[derive(Debug, Error)]
pub enum OverdriveError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    ClockApply(#[from] ClockApplyError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}
