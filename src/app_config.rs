use std::{path::PathBuf, time::Duration};

use crate::arg_parser::ArgsOptions;

// Location of the profiles document under the user configuration root
pub const CONFIG_DIR_NAME: &str = "nvOverdrive";
pub const CONFIG_FILE_NAME: &str = "nvOverdrive.config";

// One sample per second, 300 samples make five minutes of history
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const HISTORY_CAPACITY: usize = 300;

// Which implementation of the control protocol drives the GPUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolBackend {
    Nvml,
    Simulated { gpu_count: u32 },
}

// Built once at start-up and passed to the constructors that need it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    // None when no configuration root can be determined
    pub config_path: Option<PathBuf>,

    pub poll_interval: Duration,
    pub history_capacity: usize,

    // Ordinal of the GPU whose telemetry is monitored
    pub gpu: u32,
    pub backend: ProtocolBackend,

    pub list_only: bool,
    pub apply_profile: Option<String>,
}

impl AppConfig {
    pub fn from_args(args: ArgsOptions) -> Self {
        let backend = if args.simulate {
            ProtocolBackend::Simulated {
                gpu_count: args.simulated_gpus,
            }
        } else {
            ProtocolBackend::Nvml
        };

        Self {
            config_path: args.config_file_path.or_else(default_config_path),
            gpu: args.gpu,
            backend,
            list_only: args.list,
            apply_profile: args.apply_profile,
            ..Self::default()
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),

            poll_interval: POLL_INTERVAL,
            history_capacity: HISTORY_CAPACITY,

            gpu: 0,
            backend: ProtocolBackend::Nvml,

            list_only: false,
            apply_profile: None,
        }
    }
}

// Return the profiles document path under the user configuration root
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}
