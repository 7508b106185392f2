use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use taiga_cache::app::{App, AppSettings, FetchOptions, FormatRequest};
use taiga_cache::config::{ConfigLoader, ResolvedConfig};
use taiga_cache::domain::{LocalFormat, VersionSpec};
use taiga_cache::error::TaigaError;
use taiga_cache::output::JsonOutput;
use taiga_cache::reference::StructuredReference;
use taiga_cache::store::Store;
use taiga_cache::taiga_http::TaigaHttpClient;

#[derive(Parser)]
#[command(name = "taiga-cache")]
#[command(about = "Local cache for Taiga datafiles")]
#[command(version, author)]
struct Cli {
    /// Path to a taiga-cache.json config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch a datafile into the cache and print its local path")]
    Fetch(FetchArgs),
    #[command(about = "Print the canonical id a reference resolves to")]
    CanonicalId(ReferenceArgs),
    #[command(about = "List the local formats a datafile can be provided in")]
    Formats(ReferenceArgs),
    #[command(about = "Remove a datafile from the cache")]
    Invalidate(ReferenceArgs),
    #[command(about = "List cached datafiles")]
    List,
    #[command(about = "Fetch every file of a dataset version")]
    FetchVersion(FetchVersionArgs),
}

#[derive(Args, Clone)]
struct ReferenceArgs {
    /// Datafile id (`permaname.version/file`, `permaname.version` or an opaque id)
    id: Option<String>,

    #[arg(long)]
    name: Option<String>,

    /// Version number or `latest`
    #[arg(long)]
    version: Option<VersionSpec>,

    #[arg(long)]
    file: Option<String>,

    /// Serve from the cache when Taiga is unreachable
    #[arg(long)]
    offline: bool,
}

#[derive(Args, Clone)]
struct FetchArgs {
    #[command(flatten)]
    reference: ReferenceArgs,

    #[arg(long)]
    format: Option<LocalFormat>,

    #[arg(long)]
    force: bool,
}

#[derive(Args, Clone)]
struct FetchVersionArgs {
    permaname: String,

    #[arg(long, default_value = "latest")]
    version: VersionSpec,

    #[arg(long)]
    format: Option<LocalFormat>,

    #[arg(long)]
    force: bool,

    #[arg(long)]
    offline: bool,
}

impl ReferenceArgs {
    fn parse(&self) -> Result<StructuredReference, TaigaError> {
        StructuredReference::parse(
            self.id.as_deref(),
            self.name.as_deref(),
            self.version,
            self.file.as_deref(),
        )
    }

    fn options(&self, config: &ResolvedConfig) -> FetchOptions {
        FetchOptions {
            allow_offline: self.offline || config.allow_offline,
            force: false,
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(taiga) = report.downcast_ref::<TaigaError>() {
            return ExitCode::from(map_exit_code(taiga));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &TaigaError) -> u8 {
    match error {
        TaigaError::NotFound(_)
        | TaigaError::DeletedVersion { .. }
        | TaigaError::InvalidReference(_) => 2,
        TaigaError::Connectivity(_)
        | TaigaError::HttpStatus { .. }
        | TaigaError::TaskFailed { .. }
        | TaigaError::UnexpectedResponse(_)
        | TaigaError::OfflineUnavailable(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let client = Arc::new(TaigaHttpClient::new(&config.api)?);
    let store = Store::new_with_root(config.cache_dir.clone());
    let app = App::open(
        store,
        client.clone(),
        client,
        AppSettings::from(&config),
    )?;

    let result = run_command(cli.command, &app, &config);
    app.close()?;
    result
}

fn run_command(
    command: Commands,
    app: &App<Arc<TaigaHttpClient>, Arc<TaigaHttpClient>>,
    config: &ResolvedConfig,
) -> miette::Result<()> {
    match command {
        Commands::Fetch(args) => {
            let reference = args.reference.parse()?;
            let options = FetchOptions {
                force: args.force,
                ..args.reference.options(config)
            };
            let file = app.download_to_cache(&reference, FormatRequest::from(args.format), options)?;
            JsonOutput::print_cached(&file).into_diagnostic()
        }
        Commands::CanonicalId(args) => {
            let key = app.get_canonical_id(&args.parse()?, args.options(config))?;
            JsonOutput::print_canonical_id(&key).into_diagnostic()
        }
        Commands::Formats(args) => {
            let reference = args.parse()?;
            let formats = app.allowed_formats(&reference, args.options(config))?;
            JsonOutput::print_formats(&reference.to_string(), &formats).into_diagnostic()
        }
        Commands::Invalidate(args) => {
            let key = app.invalidate(&args.parse()?, args.options(config))?;
            JsonOutput::print_invalidated(&key).into_diagnostic()
        }
        Commands::List => {
            let result = app.list()?;
            JsonOutput::print_list(&result).into_diagnostic()
        }
        Commands::FetchVersion(args) => {
            let options = FetchOptions {
                allow_offline: args.offline || config.allow_offline,
                force: args.force,
            };
            let result = app.fetch_version(
                &args.permaname,
                args.version,
                FormatRequest::from(args.format),
                options,
            )?;
            JsonOutput::print_version(&result).into_diagnostic()
        }
    }
}
