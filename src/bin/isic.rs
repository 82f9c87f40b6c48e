use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::OnceLock;

use clap::{Args, Parser, Subcommand};
use crossterm::style::Stylize;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use isic_cli::api::{ArchiveApi, ArchiveHttpClient};
use isic_cli::app::{
    App, Confirm, Decline, DiskShortfall, FsDiskSpace, ImageDownloadOutcome,
    ImageDownloadRequest, Precondition, SNAPSHOT_URL, prepare_output_file, read_input_text,
    write_metadata_output,
};
use isic_cli::auth::{AuthProvider, TokenStore};
use isic_cli::config::{ConfigLoader, Environment};
use isic_cli::coordinator;
use isic_cli::domain::{BulkOperation, CollectionFilter, SearchQuery};
use isic_cli::download::Downloader;
use isic_cli::error::ArchiveError;
use isic_cli::output::{
    JsonOutput, OutputMode, batch_problems_table, bulk_summary_table, collections_table, intcomma,
    row_problems_table, unrecognized_columns_table,
};
use isic_cli::progress::sink_for;
use isic_cli::store::DownloadStore;
use isic_cli::version::{self, CratesIoIndex, Version, VersionStatus};

const ISSUES_URL: &str = "https://github.com/ImageMarkup/isic-cli/issues";

/// Environment and user shown in the crash banner.
static CRASH_CONTEXT: OnceLock<(String, String)> = OnceLock::new();

#[derive(Parser)]
#[command(name = "isic")]
#[command(about = "Command line client for the ISIC Archive")]
#[command(version)]
struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose mode")]
    verbose: bool,

    #[arg(long, global = true, hide = true, help = "Simulate a non logged in user")]
    guest: bool,

    #[arg(long, global = true, hide = true, env = "ISIC_SANDBOX")]
    sandbox: bool,

    #[arg(long, global = true, hide = true, env = "ISIC_DEV")]
    dev: bool,

    #[arg(long, global = true, hide = true, help = "Disable the version upgrade check")]
    no_version_check: bool,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true, help = "Path to an isic-cli.json config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(subcommand, about = "Manage images")]
    Image(ImageCommand),
    #[command(subcommand, about = "Manage metadata")]
    Metadata(MetadataCommand),
    #[command(subcommand, about = "Manage collections")]
    Collection(CollectionCommand),
    #[command(subcommand, about = "Manage accessions")]
    Accession(AccessionCommand),
    #[command(subcommand, about = "Manage authentication with the ISIC Archive")]
    User(UserCommand),
}

#[derive(Args, Clone)]
struct FilterArgs {
    #[arg(
        short,
        long,
        default_value = "",
        help = "e.g. 'diagnosis_3:\"Melanoma Invasive\" AND age_approx:50'"
    )]
    search: String,

    #[arg(
        short,
        long,
        default_value = "",
        help = "Comma separated collection ids, e.g. 2,17,42 (see isic collection list)"
    )]
    collections: CollectionFilter,

    #[arg(short, long, default_value_t = 0, help = "Download at most LIMIT records, 0 for all")]
    limit: u64,
}

impl FilterArgs {
    fn query(&self) -> SearchQuery {
        SearchQuery::new(self.search.clone(), self.collections.clone())
    }

    fn limit(&self) -> Option<u64> {
        (self.limit > 0).then_some(self.limit)
    }
}

#[derive(Subcommand)]
enum ImageCommand {
    #[command(about = "Download a set of images and metadata, optionally filtering results")]
    Download {
        #[command(flatten)]
        filter: FilterArgs,
        outdir: PathBuf,
    },
}

#[derive(Subcommand)]
enum MetadataCommand {
    #[command(about = "Download metadata from the ISIC Archive")]
    Download {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(short, long, help = "A filepath to write the output CSV to, - for stdout")]
        outfile: Option<PathBuf>,
    },
    #[command(about = "Validate metadata from a local csv")]
    Validate { csv_file: PathBuf },
}

#[derive(Args)]
struct MembershipArgs {
    collection_id: u64,
    #[arg(long, help = "A file of newline separated ISIC IDs, - for stdin")]
    from_isic_ids: PathBuf,
}

#[derive(Subcommand)]
enum CollectionCommand {
    #[command(about = "List collections")]
    List,
    #[command(about = "Add images to a collection")]
    AddImages(MembershipArgs),
    #[command(about = "Remove images from a collection")]
    RemoveImages(MembershipArgs),
}

#[derive(Subcommand)]
enum AccessionCommand {
    #[command(about = "Upload an accession to a cohort")]
    Upload {
        cohort_id: u64,
        accession: PathBuf,
        #[arg(long, help = "Format output as JSON")]
        json: bool,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    #[command(about = "Login to the ISIC Archive")]
    Login,
    #[command(about = "Logout of the ISIC Archive")]
    Logout,
    #[command(hide = true)]
    PrintToken,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        let archive = report.downcast_ref::<ArchiveError>();
        if archive.map(ArchiveError::is_expected).unwrap_or(false) {
            eprintln!("{report:?}");
        } else {
            print_crash_banner(&report);
        }
        return ExitCode::from(archive.map(ArchiveError::exit_code).unwrap_or(1));
    }
    ExitCode::SUCCESS
}

fn print_crash_banner(report: &miette::Report) {
    let (env, user) = CRASH_CONTEXT
        .get()
        .cloned()
        .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
    let command: Vec<String> = std::env::args().collect();
    eprintln!(
        "{}",
        "The following unexpected error occurred while attempting your operation:\n".red()
    );
    eprintln!("{report:?}");
    eprintln!("isic-cli: {}", env!("CARGO_PKG_VERSION"));
    eprintln!("os: {}/{}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("time: {}", chrono::Utc::now().to_rfc3339());
    eprintln!("env: {env}");
    eprintln!("user: {user}");
    eprintln!("command: {}", command.join(" "));
    eprintln!();
    eprintln!("Please report this at {ISSUES_URL}");
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug,reqwest=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let environment = Environment::from_flags(cli.sandbox, cli.dev)?;
    let config = ConfigLoader::resolve(environment, cli.config.as_deref())?;
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    if cli.no_version_check {
        tracing::warn!("Disabling the version check could cause errors.");
    } else if !cfg!(debug_assertions) {
        check_version()?;
    }

    let tokens = TokenStore::for_environment(environment)?;
    if let Commands::User(UserCommand::Logout) = cli.command {
        tokens.logout()?;
        return Ok(());
    }

    let auth_headers = if cli.guest { None } else { tokens.auth_headers() };
    let client = ArchiveHttpClient::new(&config, auth_headers)?;
    let had_token = client.is_authenticated();
    let app = App::connect(client, config, cli.guest)?;
    if had_token && app.user().is_none() {
        tracing::warn!("Something went wrong with restoring a login, you may need to log back in.");
        tokens.logout()?;
    }
    let _ = CRASH_CONTEXT.set((
        environment.name().to_string(),
        app.user()
            .map(|user| user.id.to_string())
            .unwrap_or_else(|| "-".to_string()),
    ));

    match cli.command {
        Commands::Image(ImageCommand::Download { filter, outdir }) => {
            run_image_download(&app, filter, outdir, output_mode)
        }
        Commands::Metadata(MetadataCommand::Download { filter, outfile }) => {
            run_metadata_download(&app, filter, outfile, output_mode)
        }
        Commands::Metadata(MetadataCommand::Validate { csv_file }) => {
            run_validate(&app, csv_file, output_mode)
        }
        Commands::Collection(command) => run_collection(&app, command, output_mode),
        Commands::Accession(AccessionCommand::Upload {
            cohort_id,
            accession,
            json,
        }) => run_accession_upload(&app, cohort_id, accession, json, output_mode),
        Commands::User(command) => run_user(&app, &tokens, command),
    }
}

fn check_version() -> miette::Result<()> {
    let Some(current) = Version::current() else {
        return Ok(());
    };
    let index = CratesIoIndex::new()?;
    if let VersionStatus::UpgradeSuggested { newest } =
        version::check_for_newer_version(current, &index)?
    {
        eprintln!(
            "{}",
            format!("Psst, isic-cli {newest} is available (you have {current}). Upgrade!\n")
                .yellow()
        );
    }
    Ok(())
}

fn print_hints(hints: &[&str]) {
    for hint in hints {
        eprintln!("{hint}\n");
    }
}

fn run_image_download<A: ArchiveApi>(
    app: &App<A>,
    filter: FilterArgs,
    outdir: PathBuf,
    output_mode: OutputMode,
) -> miette::Result<()> {
    print_hints(&app.check(&[Precondition::SuggestGuestLogin])?);
    let request = ImageDownloadRequest {
        query: filter.query(),
        limit: filter.limit(),
        outdir,
    };
    if request.is_full_archive() {
        println!();
        println!(
            "{}",
            "Note: You're downloading the entire ISIC Archive without filters."
                .yellow()
                .bold()
        );
        println!("A prebuilt snapshot of all public data is available for faster bulk access at:");
        println!("{SNAPSHOT_URL}");
        println!();
    }

    coordinator::install_interrupt_cleanup(DownloadStore::from_path(&request.outdir)?)?;
    let downloader = Downloader::new(app.config())?;
    let progress = sink_for(output_mode.is_interactive());
    let outcome = if output_mode.is_interactive() {
        app.download_images(&request, &downloader, &PromptConfirm, &FsDiskSpace, progress.as_ref())?
    } else {
        app.download_images(&request, &downloader, &Decline, &FsDiskSpace, progress.as_ref())?
    };

    match outcome {
        ImageDownloadOutcome::Cancelled => println!("Download cancelled."),
        ImageDownloadOutcome::Completed(summary) => {
            if !output_mode.is_interactive() {
                JsonOutput::print_json(&summary).into_diagnostic()?;
                return Ok(());
            }
            let count = intcomma(summary.images);
            println!();
            println!(
                "{}",
                format!("Successfully downloaded {count} images to {}/.", summary.outdir).green()
            );
            println!(
                "{}",
                format!(
                    "Successfully wrote {} metadata records to {}.",
                    intcomma(summary.metadata_records),
                    summary.metadata_path
                )
                .green()
            );
            println!(
                "{}",
                format!("Successfully wrote attributions to {}.", summary.attribution_path).green()
            );
            println!(
                "{}",
                format!(
                    "Successfully wrote {} license(s) to {}.",
                    summary.licenses.len(),
                    summary.licenses_dir
                )
                .green()
            );
        }
    }
    Ok(())
}

fn run_metadata_download<A: ArchiveApi>(
    app: &App<A>,
    filter: FilterArgs,
    outfile: Option<PathBuf>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    print_hints(&app.check(&[Precondition::SuggestGuestLogin])?);
    let outfile = outfile.filter(|path| path.as_os_str() != "-");
    if let Some(path) = &outfile {
        prepare_output_file(path)?;
    }
    let progress = sink_for(output_mode.is_interactive());
    let table = app.download_metadata(&filter.query(), filter.limit(), progress.as_ref())?;
    if !table.is_empty() {
        write_metadata_output(&table, outfile.as_deref())?;
    }
    Ok(())
}

fn run_validate<A: ArchiveApi>(
    app: &App<A>,
    csv_file: PathBuf,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let progress = sink_for(output_mode.is_interactive());
    let report = app.validate_metadata(&csv_file, progress.as_ref())?;

    if let Some(table) = batch_problems_table(&report) {
        println!("{}", table.render());
    }
    if let Some(table) = row_problems_table(&report) {
        println!("{}", table.render());
    }
    let report = report.into_result()?;

    println!("{}", "No structural errors found!".green());
    if let Some(table) = unrecognized_columns_table(&report) {
        println!("{}", table.render());
    }
    Ok(())
}

fn run_collection<A: ArchiveApi>(
    app: &App<A>,
    command: CollectionCommand,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let (args, operation) = match command {
        CollectionCommand::List => {
            print_hints(&app.check(&[Precondition::SuggestGuestLogin])?);
            let collections = app.list_collections()?;
            if output_mode.is_interactive() {
                print!("{}", collections_table(&collections).render());
            } else {
                JsonOutput::print_json(&collections).into_diagnostic()?;
            }
            return Ok(());
        }
        CollectionCommand::AddImages(args) => (args, BulkOperation::AddImages),
        CollectionCommand::RemoveImages(args) => (args, BulkOperation::RemoveImages),
    };

    app.check(&[Precondition::RequireLogin])?;
    let ids = read_input_text(&args.from_isic_ids)?;
    let progress = sink_for(output_mode.is_interactive());
    let summary = app.modify_collection(args.collection_id, operation, &ids, progress.as_ref())?;
    if output_mode.is_interactive() {
        print!("{}", bulk_summary_table(&summary, operation).render());
    } else {
        JsonOutput::print_json(&summary).into_diagnostic()?;
    }
    Ok(())
}

fn run_accession_upload<A: ArchiveApi>(
    app: &App<A>,
    cohort_id: u64,
    accession: PathBuf,
    json: bool,
    output_mode: OutputMode,
) -> miette::Result<()> {
    app.check(&[Precondition::RequireLogin])?;
    let progress = sink_for(output_mode.is_interactive());
    let result = app.upload_accession(cohort_id, &accession, progress.as_ref())?;
    if json {
        JsonOutput::print_json(&result).into_diagnostic()?;
        return Ok(());
    }
    let id = result
        .get("id")
        .map(|id| id.to_string())
        .unwrap_or_else(|| "?".to_string());
    println!("{}", format!("Accession uploaded, id={id}.").green());
    println!(
        "{}",
        format!(
            "Browse accessions: {}/upload/{cohort_id}/browser/",
            app.config().domain
        )
        .green()
    );
    Ok(())
}

fn run_user<A: ArchiveApi>(
    app: &App<A>,
    tokens: &TokenStore,
    command: UserCommand,
) -> miette::Result<()> {
    match command {
        UserCommand::Login => {
            if let Some(user) = app.user() {
                println!("Hello {}!", user.email);
                return Ok(());
            }
            let token = prompt(&format!(
                "Paste a personal access token from {}/: ",
                app.config().domain
            ))
            .into_diagnostic()?;
            tokens.login(&token)?;
            let client = ArchiveHttpClient::new(app.config(), tokens.auth_headers())?;
            match client.current_user()? {
                Some(user) => {
                    println!("{}", format!("Success! Logged in as {}.", user.email).green())
                }
                None => {
                    tokens.logout()?;
                    let rejected = "the access token was rejected".to_string();
                    return Err(ArchiveError::Auth(rejected).into());
                }
            }
        }
        UserCommand::Logout => tokens.logout()?,
        UserCommand::PrintToken => match tokens.token() {
            Some(token) => JsonOutput::print_json(&token).into_diagnostic()?,
            None => return Err(ArchiveError::LoginRequired.into()),
        },
    }
    Ok(())
}

fn prompt(message: &str) -> io::Result<String> {
    let mut stderr = io::stderr();
    stderr.write_all(message.as_bytes())?;
    stderr.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

struct PromptConfirm;

impl Confirm for PromptConfirm {
    fn proceed_without_space(&self, shortfall: &DiskShortfall) -> bool {
        println!();
        println!("{}", "Warning: Insufficient disk space for download.".yellow());
        println!("Required: {}", shortfall.required_human());
        println!("Available: {}", shortfall.available_human());
        println!();
        prompt("Continue with download anyway? [y/N]: ")
            .map(|answer| matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
            .unwrap_or(false)
    }
}
