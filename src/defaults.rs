use synthd_core::Result;

/// Creates a default synthd.toml configuration file
pub fn create_default_config_file(config_dir: &str) -> Result<()> {
    use std::fs;
    use std::path::Path;

    let config_path = Path::new(config_dir).join("synthd.toml");

    // If config file already exists, nothing to do
    if config_path.exists() {
        return Ok(());
    }

    // Create directory if it doesn't exist
    if !Path::new(config_dir).exists() {
        fs::create_dir_all(config_dir)?;
        log::info!("Created config directory: {config_dir}");
    }

    // Create default config file content
    let default_config = r#"[runtime]

[runtime.host]
workers = 1
cache_capacity = 8
"#;

    fs::write(&config_path, default_config)?;
    log::info!("Created default config file at: {}", config_path.display());

    Ok(())
}
