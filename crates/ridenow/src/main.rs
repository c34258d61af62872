use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{debug, error, info, warn};
use tokio::net::TcpListener;

use ridenow::auth::{AuthConfig, AuthState};
use ridenow::db::Database;
use ridenow::rides::{NewUser, RideRepository, RideStore};
use ridenow::{App, AppConfig, Role};
use ridenow_protocol::UserId;

const APP_NAME: &str = "ridenow";
const ENV_PREFIX: &str = "RIDENOW";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
        return Ok(());
    }

    let paths = AppPaths::discover(cli.common.config.clone())?;
    let config = load_config(&paths)?;
    init_logging(&cli.common, &config);
    debug!(
        "config: {}, data: {}",
        paths.config_file.display(),
        paths.data_dir.display()
    );

    let ctx = Runtime {
        common: cli.common,
        paths,
        config,
    };
    match cli.command {
        Command::Serve(cmd) => serve(&ctx, cmd).await,
        Command::Worker(cmd) => worker(&ctx, cmd).await,
        Command::Init { force } => init(&ctx, force),
        Command::Config { command } => show_config(&ctx, command),
        Command::Users { command } => users(&ctx, command).await,
        Command::Token(cmd) => token(&ctx, cmd).await,
        Command::Completions { .. } => Ok(()),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "RideNow - real-time ride dispatch relay.",
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
    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Log as JSON lines and print command output as JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Print command output as YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in log output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the gateway and REST API
    Serve(ServeCommand),
    /// Run assignment workers without the gateway
    Worker(WorkerCommand),
    /// Write a default config file with a fresh signing secret
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage riders and drivers
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    /// Mint an access token for a user
    Token(TokenCommand),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
    /// Do not run assignment workers in this process
    #[arg(long)]
    no_worker: bool,
}

#[derive(Debug, Clone, Args)]
struct WorkerCommand {
    /// Number of concurrent assignment loops (overrides worker.instances)
    #[arg(short = 'n', long)]
    instances: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    /// Create or update a user
    Add(UsersAddCommand),
    /// List all users
    List,
}

#[derive(Debug, Clone, Args)]
struct UsersAddCommand {
    /// User ID (the token subject)
    id: String,
    /// Display name
    #[arg(long)]
    name: Option<String>,
    /// Email address
    #[arg(long)]
    email: Option<String>,
    /// Register the user as a driver
    #[arg(long)]
    driver: bool,
}

#[derive(Debug, Clone, Args)]
struct TokenCommand {
    /// User ID to put in the `sub` claim
    user_id: String,
    /// Display name to put in the `name` claim
    #[arg(long)]
    name: Option<String>,
}

/// Resolved options, paths and config shared by every command.
struct Runtime {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl Runtime {
    async fn open_database(&self) -> Result<Database> {
        let db_path = match &self.config.database.path {
            Some(path) => expand_path(path)?,
            None => {
                fs::create_dir_all(&self.paths.data_dir).with_context(|| {
                    format!("creating data directory {}", self.paths.data_dir.display())
                })?;
                self.paths.data_dir.join("ridenow.db")
            }
        };
        info!("Database path: {}", db_path.display());
        Database::new(&db_path).await
    }
}

/// Install the tracing subscriber. `log` records from the gateway and relay
/// are bridged into it.
fn init_logging(common: &CommonOpts, config: &AppConfig) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_directives(common, config)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if common.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
            .ok();
    } else {
        let ansi =
            !common.no_color && env::var_os("NO_COLOR").is_none() && io::stderr().is_terminal();
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .try_init()
            .ok();
    }
}

/// Filter directives when `RUST_LOG` is unset. `--quiet` still lets errors
/// through, including `ridenow::telemetry`.
fn log_directives(common: &CommonOpts, config: &AppConfig) -> String {
    let level = if common.quiet {
        "error"
    } else {
        match common.verbose {
            0 => config.logging.level.as_str(),
            1 => "debug",
            _ => "trace",
        }
    };
    format!("ridenow={level},tower_http={level}")
}

struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(&path.to_string_lossy())?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => xdg_dir("XDG_CONFIG_HOME", dirs::config_dir(), ".config")?.join("config.toml"),
        };

        Ok(Self {
            config_file,
            data_dir: xdg_dir("XDG_DATA_HOME", dirs::data_dir(), ".local/share")?,
        })
    }
}

/// `$VAR/ridenow`, else the platform directory, else `~/<fallback>/ridenow`.
fn xdg_dir(var: &str, platform: Option<PathBuf>, fallback: &str) -> Result<PathBuf> {
    if let Some(dir) = env::var_os(var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }
    if let Some(dir) = platform {
        return Ok(dir.join(APP_NAME));
    }
    dirs::home_dir()
        .map(|home| home.join(fallback).join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine home directory"))
}

fn expand_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Defaults, then the TOML file if present, then `RIDENOW__SECTION__KEY`.
fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", paths.config_file.display()))?;

    Ok(built.try_deserialize()?)
}

async fn serve(ctx: &Runtime, cmd: ServeCommand) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(host) = cmd.host {
        config.server.host = host;
    }
    if let Some(port) = cmd.port {
        config.server.port = port;
    }
    if cmd.no_worker {
        config.worker.embedded = false;
    }
    if config.auth.dev_mode {
        warn!("Auth dev mode is on: `dev:<user_id>` tokens are accepted");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parsing bind address")?;
    let database = ctx.open_database().await?;

    let mut app = App::build(config, &database, Role::Server).await?;
    info!("Relay mode: {}", app.relay_mode());
    app.start_background();

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("Listening on {}", addr);

    let trigger = app.shutdown_trigger();
    axum::serve(listener, app.router())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing sessions...");
            trigger.fire();
        })
        .await
        .context("running server")?;

    app.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn worker(ctx: &Runtime, cmd: WorkerCommand) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(instances) = cmd.instances {
        config.worker.instances = instances;
    }

    let database = ctx.open_database().await?;
    let mut app = App::build(config, &database, Role::Worker).await?;
    info!("Assignment worker starting ({} relay)", app.relay_mode());
    app.start_background();

    shutdown_signal().await;
    info!("Shutdown signal received, stopping workers...");
    let stats = app.worker_stats().clone();
    app.shutdown().await;
    let stats = stats.snapshot();
    info!(
        "Workers stopped: {} processed, {} assigned, {} exhausted",
        stats.processed, stats.assigned, stats.exhausted
    );
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn users(ctx: &Runtime, command: UsersCommand) -> Result<()> {
    let database = ctx.open_database().await?;
    let repo = RideRepository::new(database.pool().clone());

    let users = match command {
        UsersCommand::Add(cmd) => {
            let user = NewUser {
                name: cmd.name.unwrap_or_else(|| cmd.id.clone()),
                id: UserId::new(cmd.id),
                email: cmd.email,
                is_driver: cmd.driver,
            };
            vec![repo.upsert_user(&user).await?]
        }
        UsersCommand::List => repo.list_users().await?,
    };

    if ctx.common.json {
        println!("{}", serde_json::to_string_pretty(&users)?);
    } else if ctx.common.yaml {
        print!("{}", serde_yaml::to_string(&users)?);
    } else {
        for user in users {
            let role = if user.is_driver { "driver" } else { "rider" };
            println!("{:<7} {:<24} {}", role, user.id, user.name);
        }
    }
    Ok(())
}

async fn token(ctx: &Runtime, cmd: TokenCommand) -> Result<()> {
    ctx.config
        .auth
        .validate()
        .context("Invalid auth configuration")?;
    let user_id = UserId::new(cmd.user_id);

    let database = ctx.open_database().await?;
    let repo = RideRepository::new(database.pool().clone());
    if repo.get_user(&user_id).await?.is_none() {
        warn!(
            "User {} does not exist yet; the gateway will reject this token until it does",
            user_id
        );
    }

    let auth = AuthState::new(ctx.config.auth.clone());
    println!("{}", auth.generate_token(&user_id, cmd.name.as_deref())?);
    Ok(())
}

fn init(ctx: &Runtime, force: bool) -> Result<()> {
    let path = &ctx.paths.config_file;
    if path.exists() && !force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        ));
    }
    write_default_config(path)?;
    println!("{}", path.display());
    Ok(())
}

fn show_config(ctx: &Runtime, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.yaml {
                print!("{}", serde_yaml::to_string(&ctx.config)?);
            } else if ctx.common.json {
                println!("{}", serde_json::to_string_pretty(&ctx.config)?);
            } else {
                print!("{}", toml::to_string_pretty(&ctx.config)?);
            }
        }
        ConfigCommand::Path => println!("{}", ctx.paths.config_file.display()),
    }
    Ok(())
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let mut config = AppConfig::default();
    config.auth.jwt_secret = Some(AuthConfig::generate_jwt_secret());
    let body = format!(
        "# RideNow configuration\n# Environment overrides: {ENV_PREFIX}__<SECTION>__<KEY>\n\n{}",
        toml::to_string_pretty(&config).context("serializing default config")?
    );
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(args: &[&str]) -> CommonOpts {
        let mut argv = vec!["ridenow"];
        argv.extend_from_slice(args);
        argv.extend_from_slice(&["config", "path"]);
        Cli::parse_from(argv).common
    }

    #[test]
    fn test_quiet_keeps_errors() {
        let directives = log_directives(&opts(&["--quiet"]), &AppConfig::default());
        assert_eq!(directives, "ridenow=error,tower_http=error");
        assert!(
            tracing_subscriber::EnvFilter::try_new(&directives).is_ok(),
            "{directives}"
        );
    }

    #[test]
    fn test_verbosity_overrides_configured_level() {
        let mut config = AppConfig::default();
        config.logging.level = "warn".to_string();
        assert_eq!(
            log_directives(&opts(&[]), &config),
            "ridenow=warn,tower_http=warn"
        );
        assert_eq!(
            log_directives(&opts(&["-v"]), &config),
            "ridenow=debug,tower_http=debug"
        );
        assert_eq!(
            log_directives(&opts(&["-vv"]), &config),
            "ridenow=trace,tower_http=trace"
        );
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let argv = ["ridenow", "-q", "-v", "config", "path"];
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
