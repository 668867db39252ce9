pub mod device_cmd;
pub mod serve_cmd;
