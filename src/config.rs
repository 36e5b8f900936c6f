use crate::cliargs::CliArgs;
use crate::consts;
use crate::defaults::create_default_config_file;

pub fn load_config(cli_args: &CliArgs) -> anyhow::Result<config::Config> {
    // Collect config file paths for logging
    let mut config_files = Vec::new();

    let home_dir = dirs_next::home_dir()
        .map(|x| x.join(consts::DEFAULT_HOME_DIR_NAME).to_string_lossy().to_string())
        .ok_or_else(|| anyhow::anyhow!("Cannot get the `~/home` directory"))?;

    // Priority order: --home > SYNTHD_HOME env var > default ~/.synthd
    let synthd_home_dir = cli_args.home.clone().or(std::env::var("SYNTHD_HOME").ok()).unwrap_or(home_dir);

    let run_env = cli_args.env.clone().or(std::env::var("SYNTHD_RUN_ENV").ok()).unwrap_or("dev".to_owned());

    let mut builder = config::Config::builder();
    builder = builder.set_override("home_dir", synthd_home_dir.clone())?;

    let main_cfg = std::path::Path::new(&synthd_home_dir).join("synthd.toml");
    let env_cfg = std::path::Path::new(&synthd_home_dir).join(format!("synthd.{run_env}.toml"));
    config_files.push(main_cfg.display().to_string());
    config_files.push(env_cfg.display().to_string());
    builder = builder
        .add_source(config::File::with_name(&main_cfg.to_string_lossy()).required(false))
        .add_source(config::File::with_name(&env_cfg.to_string_lossy()).required(false));

    // CLI switches sit above the config files.
    builder = cli_args.merge_into_config_builder(builder)?;

    if cli_args.verbose > 0 {
        eprintln!("$SYNTHD_HOME={synthd_home_dir}");
        eprintln!("Loading config files:");
        for f in &config_files {
            eprintln!("\t- `{f}`");
        }
    }

    // Ensure the config directory exists and has a default config
    create_default_config_file(&synthd_home_dir)?;

    builder = builder.set_override("run_env", run_env)?;

    let config = builder.build()?;
    Ok(config)
}
