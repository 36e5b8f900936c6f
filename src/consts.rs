pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_HOME_DIR_NAME: &str = ".synthd";
