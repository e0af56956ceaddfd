use super::*;
use bounded_executor::config::{Builder, Config};
use std::num::NonZeroUsize;
use std::path::PathBuf;

mod cancel;
mod exec;

/// Log levels accepted by `--verbose`, most verbose first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
pub struct Command {
    /// Output additional information, default 'info'.
    #[arg(short, long, num_args = 0..=1, require_equals = true, default_missing_value = "info")]
    verbose: Option<LogLevel>,

    /// A TOML file holding the pool configuration; POOL_BENCH_* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Admission permits beyond the maximum worker count
    #[arg(long)]
    capacity: Option<usize>,

    /// Workers kept alive while idle
    #[arg(long)]
    minimum: Option<usize>,

    /// The most workers that may be live at once
    #[arg(long)]
    maximum: Option<usize>,

    /// How long a worker above the minimum may idle before it retires
    #[arg(short, long = "keep-alive")]
    keep_alive: Option<humantime::Duration>,

    /// The number of tasks to submit
    #[arg(short('n'), long, default_value_t = 1000)]
    tasks: usize,

    /// The number of concurrent submitters, default is the number of CPUs
    #[arg(short, long)]
    submitters: Option<NonZeroUsize>,

    /// How long each task runs for
    #[arg(short, long, default_value = "1ms")]
    duration: humantime::Duration,

    /// The optional upper bound of a random extra run time added to each task
    #[arg(short, long)]
    jitter: Option<humantime::Duration>,

    /// Make every Nth task panic
    #[arg(short, long = "panic-every")]
    panic_every: Option<NonZeroUsize>,

    /// Stop the pool immediately if the run takes longer than this
    #[arg(long)]
    deadline: Option<humantime::Duration>,
}

impl Command {
    /// Layers the configuration file, the environment and the command line,
    /// in increasing order of precedence.
    fn pool_config(&self) -> anyhow::Result<Config> {
        let mut b = ::config::Config::builder();
        if let Some(path) = &self.config {
            b = b.add_source(::config::File::from(path.as_path()));
        }
        b = b.add_source(::config::Environment::with_prefix("POOL_BENCH"));

        let mut builder: Builder = b
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to read configuration: {e}"))?
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Failed to parse configuration: {e}"))?;

        if let Some(capacity) = self.capacity {
            builder.capacity(capacity)?;
        }
        if let Some(minimum) = self.minimum {
            builder.minimum(minimum)?;
        }
        if let Some(maximum) = self.maximum {
            builder.maximum(maximum)?;
        }
        if let Some(keep_alive) = self.keep_alive {
            let keep_alive: std::time::Duration = keep_alive.into();
            builder.keep_alive(
                keep_alive
                    .try_into()
                    .map_err(|e| anyhow::anyhow!("Invalid keep-alive: {e}"))?,
            )?;
        }

        Ok(builder.build()?)
    }

    fn submitters(&self) -> usize {
        self.submitters
            .unwrap_or_else(bounded_executor::available_parallelism)
            .get()
    }

    fn panics(&self, seq_no: usize) -> bool {
        self.panic_every
            .is_some_and(|every| (seq_no + 1) % every.get() == 0)
    }

    pub fn exec(self) -> anyhow::Result<()> {
        if let Some(level) = self.verbose.map(tracing::Level::from) {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_target(level > tracing::Level::INFO)
                .with_thread_names(level > tracing::Level::INFO)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {e}"))?;
        }

        let config = self.pool_config()?;
        exec::exec(self, config)
    }
}
