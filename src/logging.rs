use crate::CliArgs;

pub(crate) fn log_init(args: &CliArgs) -> anyhow::Result<()> {
    if let Some(ref log_path) = args.log_path {
        log4rs::init_file(log_path, Default::default())?;
    } else {
        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new("[{h({l})}]\t{m}{n}")))
            .build();

        let level = match args.verbose {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };

        let config = log4rs::Config::builder()
            .appender(log4rs::config::Appender::builder().build("stderr", Box::new(stderr)))
            .build(log4rs::config::Root::builder().appender("stderr").build(level))?;

        log4rs::init_config(config)?;
    }
    Ok(())
}
