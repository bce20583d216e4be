use std::fs;
use std::io;

use clap::CommandFactory;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chromprober::{ChromProber, ChromProberError};

#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy()
}

fn main() -> Result<(), ChromProberError> {
    let matches = ChromProber::command().get_matches();
    let args = ChromProber::from_matches(&matches)?;

    let subscriber = tracing_subscriber::registry().with(
        fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_filter(env_filter()),
    );

    if let Some(log_path) = args.log_file.as_ref() {
        let (log_writer, _guard) = tracing_appender::non_blocking(fs::File::create(log_path)?);
        subscriber
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_writer)
                    .with_filter(env_filter()),
            )
            .init();
        args.main()
    } else {
        subscriber.init();
        args.main()
    }
}
