pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_ID: &str = env!("CARGO_PKG_NAME");

pub const CONFIG_FILE_NAME: &str = "supervisor.json";
