pub mod app_config;
pub mod arg_parser;
pub mod attribute_client;
pub mod clock_controller;
pub mod cooler_controller;
pub mod device;
pub mod errors;
pub mod gpu_data;
pub mod logger;
pub mod profile_store;
pub mod protocol;
pub mod state_manager;
pub mod telemetry;
