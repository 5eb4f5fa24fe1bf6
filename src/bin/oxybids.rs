use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use oxygen_bids::bids::{BidsConversion, write_mapping_report};
use oxygen_bids::command::{SystemRunner, find_in_path};
use oxygen_bids::config::{ConversionSettings, FilterLoader, QcSettings};
use oxygen_bids::domain::ConversionTool;
use oxygen_bids::error::BidsError;
use oxygen_bids::executor::Workers;
use oxygen_bids::fs_util::{self, ListingOrder};
use oxygen_bids::logger::SharedLog;
use oxygen_bids::qc::{FdParams, PipelineVariant, QcRun};
use oxygen_bids::series::DicomInspector;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const DIAGNOSTICS_FILE: &str = "oxybids.log";

#[derive(Parser)]
#[command(name = "oxybids")]
#[command(about = "Convert oxygen DICOM archives to BIDS and run fMRI quality control")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Convert oxygen archives into a BIDS tree")]
    Convert(ConvertArgs),
    #[command(about = "Compute tSNR, FWHM and motion statistics for a BIDS tree")]
    Qc(QcArgs),
}

#[derive(Args)]
struct ConvertArgs {
    /// Destination BIDS directory.
    bids_dir: PathBuf,
    /// Directory holding the oxygen .tgz archives.
    oxygen_dir: PathBuf,
    /// Reuse identifiers from a previously written mapping file.
    #[arg(long)]
    mapping_guide: Option<PathBuf>,
    #[arg(long, default_value = "./mappings")]
    mapping_dir: PathBuf,
    /// Worker count; 0 runs everything sequentially.
    #[arg(long)]
    nthreads: Option<Workers>,
    /// Empty a non-empty BIDS directory instead of aborting.
    #[arg(long)]
    overwrite: bool,
    /// JSON filter file, e.g. {"sequences": ["ep2d_bold"]}.
    #[arg(long)]
    filters: Option<PathBuf>,
    #[arg(long, default_value = "./logs")]
    logs: PathBuf,
    /// Store README-Series.txt contents with each scan.
    #[arg(long)]
    scanner_meta: bool,
    /// dcm2niix or dimon.
    #[arg(long, default_value = "dcm2niix")]
    tool: String,
    /// Number directories in raw listing order instead of sorted order.
    #[arg(long)]
    listing_order: bool,
}

#[derive(Args)]
struct QcArgs {
    bids_dir: PathBuf,
    output_dir: PathBuf,
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,
    #[arg(long)]
    nthreads: Option<Workers>,
    #[arg(long, value_enum, default_value_t = PipelineVariant::Full)]
    variant: PipelineVariant,
    /// Framewise displacement threshold in mm.
    #[arg(long, default_value_t = 0.2)]
    fd_cutoff: f64,
    /// Head radius in mm used for rotational displacement.
    #[arg(long, default_value_t = 80.0)]
    fd_radius: f64,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<BidsError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BidsError) -> u8 {
    if error.is_preflight() { 2 } else { 1 }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();

    match cli.command {
        Commands::Convert(args) => {
            let _guard = init_tracing(&args.logs)?;
            run_convert(args, &timestamp)
        }
        Commands::Qc(args) => {
            let _guard = init_tracing(&args.log_dir)?;
            run_qc(args, &timestamp)
        }
    }
}

fn init_tracing(log_dir: &Path) -> miette::Result<WorkerGuard> {
    fs_util::create_path(log_dir)?;
    let file_appender = tracing_appender::rolling::never(log_dir, DIAGNOSTICS_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .with(EnvFilter::from_default_env())
        .init();
    Ok(guard)
}

fn run_convert(args: ConvertArgs, timestamp: &str) -> miette::Result<()> {
    let tool: ConversionTool = args.tool.parse()?;
    let program = match tool {
        ConversionTool::Dcm2niix => "dcm2niix",
        ConversionTool::Dimon => "Dimon",
    };
    if find_in_path(program).is_none() {
        tracing::warn!("{program} was not found on PATH; every conversion will fail");
    }

    let mut settings = ConversionSettings::new(&args.bids_dir, &args.oxygen_dir);
    settings.tool = tool;
    settings.mapping_guide = args.mapping_guide;
    settings.overwrite = args.overwrite;
    settings.scanner_meta = args.scanner_meta;
    if let Some(workers) = args.nthreads {
        settings.workers = workers;
    }
    if let Some(path) = &args.filters {
        settings.filters = Some(FilterLoader::load(path)?);
    }
    if args.listing_order {
        settings.order = ListingOrder::Filesystem;
    }

    let log = SharedLog::create_in(&args.logs, "bids_conversion", timestamp)?;
    let runner = SystemRunner;
    let inspector = DicomInspector;
    let mapping = BidsConversion::new(&runner, &inspector, &log).run(&settings)?;

    fs_util::create_path(&args.mapping_dir)?;
    let report = write_mapping_report(&mapping, &args.mapping_dir, timestamp)?;

    println!(
        "Converted {} of {} scans for {} subjects.",
        mapping.converted_count(),
        mapping.scan_count(),
        mapping.subjects.len()
    );
    println!("Mapping: {}", report.display());
    if let Some(path) = log.path() {
        println!("Log: {}", path.display());
    }
    Ok(())
}

fn run_qc(args: QcArgs, timestamp: &str) -> miette::Result<()> {
    let mut settings = QcSettings::new(&args.bids_dir, &args.output_dir);
    settings.variant = args.variant;
    settings.fd = FdParams {
        cutoff: args.fd_cutoff,
        radius: args.fd_radius,
    };
    if let Some(workers) = args.nthreads {
        settings.workers = workers;
    }

    let log = SharedLog::create_in(&args.log_dir, "qc", timestamp)?;
    let runner = SystemRunner;
    let report = QcRun::new(&runner, &log).run(&settings)?;
    let summary = report.write_csv(&settings.output_dir)?;

    println!(
        "QC finished for {} images ({} failed).",
        report.rows.len(),
        report.failed()
    );
    println!("Summary: {}", summary.display());
    Ok(())
}
