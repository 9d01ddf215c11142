use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};

use relay::config::{self, APP_NAME, AppConfig};
use relay::orchestrator::relative_paths;
use relay::{DeliveryHandle, DeliverySink, Orchestrator, TaskOutcome, TaskRequest};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Run(cmd) => async_run(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Relay - run a coding agent per chat channel and stream its output.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one agent task for a channel
    Run(RunCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Channel key the task belongs to
    #[arg(long, default_value = "cli")]
    channel: String,
    /// Start a new agent session instead of resuming
    #[arg(long)]
    new_session: bool,
    /// Card title
    #[arg(long)]
    title: Option<String>,
    /// Prompt sent to the agent
    #[arg(required = true)]
    prompt: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match &common.config {
            Some(path) => config::expand_str_path(&path.to_string_lossy())?,
            None => config::default_config_file()?,
        };
        let config = config::load_or_init(&config_file, common.dry_run)
            .with_context(|| format!("loading config from {}", config_file.display()))?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("relay={level}")));

        let file_layer = self.config.logging.open_log_file()?.map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Library code logs through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            let configured = self
                .config
                .logging
                .level
                .parse::<LevelFilter>()
                .unwrap_or(LevelFilter::Info);
            match self.common.verbose {
                0 => configured,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Renders the card on the terminal: updates go to stderr, the final text to stdout.
struct ConsoleSink {
    cards: AtomicUsize,
}

#[async_trait]
impl DeliverySink for ConsoleSink {
    async fn create(&self, initial_text: &str, title: &str) -> anyhow::Result<DeliveryHandle> {
        let id = self.cards.fetch_add(1, Ordering::SeqCst) + 1;
        eprintln!("[{title}] {initial_text}");
        Ok(DeliveryHandle(format!("console-{id}")))
    }

    async fn update(&self, _handle: &DeliveryHandle, text: &str, title: &str) -> anyhow::Result<()> {
        let preview = text.lines().last().unwrap_or("");
        let preview: String = preview.chars().take(120).collect();
        eprintln!("[{title}] {preview}");
        Ok(())
    }
}

#[tokio::main]
async fn async_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<()> {
    let sink = Arc::new(ConsoleSink {
        cards: AtomicUsize::new(0),
    });
    let orchestrator = Arc::new(Orchestrator::from_config(&ctx.config, sink)?);
    let sweeper = orchestrator.start_sweeper();

    if cmd.new_session && orchestrator.reset_session(&cmd.channel) {
        info!("Starting a new session for channel {}", cmd.channel);
    }

    let mut request = TaskRequest::new(cmd.channel.clone(), cmd.prompt.join(" "));
    if let Some(title) = cmd.title {
        request = request.with_title(title);
    }

    let ctrl_c = {
        let orchestrator = Arc::clone(&orchestrator);
        let channel = cmd.channel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, cancelling");
                orchestrator.cancel(&channel);
            }
        })
    };

    let result = orchestrator.run(request).await;
    ctrl_c.abort();
    sweeper.abort();

    match result {
        Ok(TaskOutcome::Completed(report)) => {
            println!("{}", report.text);
            if let Some(session_id) = &report.session_id {
                info!("Session {} saved for channel {}", session_id, cmd.channel);
            }
            let root = orchestrator.work_dir();
            for (file, rel) in report.files.iter().zip(relative_paths(&report.files, root)) {
                match file.ensure_deliverable(orchestrator.max_file_bytes()) {
                    Ok(_) => eprintln!("produced: {} ({} bytes)", rel.display(), file.size),
                    Err(e) => warn!("Not delivering {}: {}", rel.display(), e),
                }
            }
            Ok(())
        }
        Ok(TaskOutcome::Cancelled { elapsed }) => {
            eprintln!("cancelled after {:.1}s", elapsed.as_secs_f64());
            Ok(())
        }
        Err(err) => Err(anyhow::Error::new(err).context(format!("task for channel {}", cmd.channel))),
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.config_file.display()
                );
                return Ok(());
            }
            config::write_default_config(&ctx.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
