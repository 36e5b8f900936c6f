use clap::{Parser, Subcommand};

const LONG_ABOUT: &str = r#"
Synthd Daemon Program

Synthd dispatches privacy-preserving data-synthesis jobs to a pool of
isolated worker execution contexts and streams their progress back.
"#;

#[derive(Parser, Debug, Clone)]
#[command(version = crate::consts::APP_VERSION, about, author, long_about = LONG_ABOUT, color = clap::ColorChoice::Always)]
pub struct CliArgs {
    /// Use verbose output, '0' means quiet, no output printed to stdout.
    #[arg(short, long, default_value_t = 2, global = true)]
    pub verbose: usize,

    /// Home directory of Synthd, default is `~/.synthd`
    #[arg(long, global = true)]
    pub home: Option<String>,

    /// Path of the log configuration file.
    #[arg(short, long, global = true)]
    pub log_path: Option<String>,

    /// Set the running environment in 'dev' or 'prod', default is `dev`
    #[arg(long, global = true)]
    pub env: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a batch of synthesis jobs
    Run {
        /// Path of a JSON file with the jobs to run; omit it to run the
        /// built-in demonstration job.
        #[arg()]
        jobs_path: Option<String>,

        /// Number of worker execution contexts to spawn.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Engine contexts each worker may keep cached.
        #[arg(short, long)]
        cache_capacity: Option<usize>,
    },
    /// List the supported job kinds
    List,
}

impl CliArgs {
    /// Push the CLI switches into the configuration builder, above the
    /// config-file sources.
    pub fn merge_into_config_builder(
        &self,
        mut builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> anyhow::Result<config::ConfigBuilder<config::builder::DefaultState>> {
        builder = builder.set_override("verbose", self.verbose as i64)?;

        if let Some(Commands::Run { jobs_path, workers, cache_capacity }) = &self.command {
            if let Some(jobs_path) = jobs_path {
                builder = builder.set_override("jobs_path", jobs_path.clone())?;
            }
            if let Some(workers) = workers {
                builder = builder.set_override("runtime.host.workers", *workers as i64)?;
            }
            if let Some(cache_capacity) = cache_capacity {
                builder = builder.set_override("runtime.host.cache_capacity", *cache_capacity as i64)?;
            }
        }

        Ok(builder)
    }
}
