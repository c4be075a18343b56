pub mod arg_parser;
pub mod backend;
pub mod capability;
pub mod config;
pub mod device_manager;
pub mod errors;
pub mod identity;
pub mod logger;
pub mod native;
pub mod operating_point;
pub mod telemetry;
pub mod vendor;
