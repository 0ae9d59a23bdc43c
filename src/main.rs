use std::path::{Path, PathBuf};

use clap::{AppSettings, Parser};
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::{debug, error, info};

use ssins_stream::{
    pipeline::{run, RunConfig},
    read::{UvfitsReader, VisRead},
    selection::{Pol, SpectrumType, VisSelection},
    VisInputType,
};

#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// The visibility data to compute noise-spectrum statistics from.
    data: PathBuf,

    /// The directory to write TSV output to. Defaults to the input's
    /// directory.
    #[clap(short, long)]
    outdir: Option<PathBuf>,

    /// Write each statistic as {obsname}.{stat}{suffix}.{pol}.tsv.
    #[clap(long)]
    export_tsv: bool,

    /// Extra suffix appended to the derived output suffix.
    #[clap(long)]
    suffix: Option<String>,

    /// Timesteps per chunk. If neither this nor --memory-budget-mb is given,
    /// a default budget picks the chunk size.
    #[clap(short, long)]
    chunk_size: Option<usize>,

    /// Cap on the raw sample data resident at once, in MiB.
    #[clap(short, long)]
    memory_budget_mb: Option<usize>,

    /// Process only the first N timesteps.
    #[clap(long)]
    time_limit: Option<usize>,

    /// Don't difference visibilities in time (no sky subtraction).
    #[clap(long)]
    no_diff: bool,

    /// Which baselines contribute: cross, auto or all.
    #[clap(long, default_value = "cross")]
    spectrum_type: String,

    /// Shorthand for --spectrum-type=auto.
    #[clap(long, conflicts_with_all = &["spectrum_type", "all"])]
    autos: bool,

    /// Shorthand for --spectrum-type=all.
    #[clap(long, conflicts_with("spectrum_type"))]
    all: bool,

    /// Shorthand for --spectrum-type=cross.
    #[clap(long, conflicts_with_all = &["spectrum_type", "autos", "all"])]
    crosses: bool,

    /// Polarisations to keep (e.g. --sel-pols xx yy). The default is
    /// everything in the data.
    #[clap(short = 'p', long, multiple_values(true))]
    sel_pols: Option<Vec<String>>,

    /// Antennas to keep, by name. Mutually exclusive with --skip-ants.
    #[clap(long, multiple_values(true))]
    sel_ants: Option<Vec<String>>,

    /// Antennas to drop, by name.
    #[clap(long, multiple_values(true))]
    skip_ants: Option<Vec<String>>,

    /// The |z-score| beyond which a time sample counts towards occupancy.
    #[clap(short, long, default_value = "5.0")]
    threshold: f64,

    /// Abort if any (freq, pol) cell has no unflagged samples, instead of
    /// NaN-masking it.
    #[clap(long)]
    strict: bool,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Disable progress bars.
    #[clap(long)]
    no_progress_bars: bool,
}

fn main() {
    let args = Args::parse();
    setup_logging(args.verbosity);

    let input_type = match args.data.extension().and_then(|os_str| os_str.to_str()) {
        Some("uvfits" | "uvf") => VisInputType::Uvfits,
        _ => {
            error!("Unrecognised input extension on {}", args.data.display());
            std::process::exit(1);
        }
    };
    info!("Input type: {input_type:?}");

    let reader = match UvfitsReader::new(&args.data) {
        Ok(r) => r,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let obs_context = reader.get_obs_context();
    info!(
        "{} timesteps, {} baseline rows, {} channels, {} pols",
        obs_context.timestamps.len(),
        obs_context.num_baselines(),
        obs_context.num_freqs(),
        obs_context.num_pols()
    );

    let vis_selection = match parse_selection(&args) {
        Ok(s) => s,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let selection = match vis_selection.resolve(obs_context) {
        Ok(s) => s,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    debug!(
        "Selection: {} baseline rows, pols {}",
        selection.num_baselines(),
        selection.pols.iter().join(", ")
    );

    let config = RunConfig {
        chunk_size: args.chunk_size,
        memory_budget_bytes: args.memory_budget_mb.map(|mb| mb * 1024 * 1024),
        window: if args.no_diff { 0 } else { 1 },
        time_limit: args.time_limit,
        zscore_threshold: args.threshold,
        strict: args.strict,
    };

    let multi_progress = MultiProgress::with_draw_target(if args.no_progress_bars {
        ProgressDrawTarget::hidden()
    } else {
        ProgressDrawTarget::stdout()
    });
    let bar_style = ProgressStyle::default_bar()
        .template("{msg:17}: [{wide_bar:.blue}] {pos:2}/{len:2} chunks ({elapsed_precise}<{eta_precise})")
        .unwrap()
        .progress_chars("=> ");
    let read_progress = multi_progress.add(
        ProgressBar::new(0)
            .with_style(bar_style.clone())
            .with_position(0)
            .with_message("Reading"),
    );
    let fold_progress = multi_progress.add(
        ProgressBar::new(0)
            .with_style(bar_style)
            .with_position(0)
            .with_message("Folding"),
    );
    read_progress.tick();
    fold_progress.tick();

    let cancel = AtomicCell::new(false);
    let results = match run(
        &reader,
        &selection,
        &config,
        &cancel,
        Some(read_progress),
        Some(fold_progress),
    ) {
        Ok(results) => results,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    if args.export_tsv {
        let outdir = args
            .outdir
            .clone()
            .or_else(|| args.data.parent().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        let suffix = derive_suffix(&args, &vis_selection);
        match results.write_tsv_set(&outdir, &obsname(&args.data), &suffix) {
            Ok(written) => {
                for path in written {
                    info!("Wrote {}", path.display());
                }
            }
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        }
    }

    info!(
        "Max occupancy (|z| > {}): {:.3}",
        args.threshold,
        results.max_occupancy()
    );
}

fn parse_selection(args: &Args) -> Result<VisSelection, ssins_stream::selection::SelectionError> {
    let spectrum_type = if args.autos {
        SpectrumType::Auto
    } else if args.all {
        SpectrumType::All
    } else if args.crosses {
        SpectrumType::Cross
    } else {
        args.spectrum_type.parse()?
    };
    let pols = args
        .sel_pols
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|p| p.parse::<Pol>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(VisSelection {
        pols,
        sel_ants: args.sel_ants.clone().unwrap_or_default(),
        skip_ants: args.skip_ants.clone().unwrap_or_default(),
        spectrum_type,
    })
}

/// "path/to/obs.uvfits" -> "obs".
fn obsname(input: &Path) -> String {
    input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("ssins")
        .to_string()
}

/// Encode the run's main knobs in the output suffix, so runs with different
/// selections don't overwrite each other.
fn derive_suffix(args: &Args, selection: &VisSelection) -> String {
    let mut suffix = args.suffix.clone().unwrap_or_default();
    match selection.spectrum_type {
        SpectrumType::All => (),
        SpectrumType::Cross => suffix = format!(".cross{suffix}"),
        SpectrumType::Auto => suffix = format!(".auto{suffix}"),
    }
    if !args.no_diff {
        suffix = format!(".diff{suffix}");
    }
    if let Some(ant) = selection.sel_ants.first() {
        suffix.push_str(&format!(".{ant}"));
    }
    if let Some(ant) = selection.skip_ants.first() {
        suffix.push_str(&format!(".no{ant}"));
    }
    if let Some(pol) = selection.pols.first() {
        suffix.push_str(&format!(".{pol}"));
    }
    suffix
}

fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => {
            builder.filter_level(log::LevelFilter::Info);
        }
        1 => {
            builder.filter_level(log::LevelFilter::Debug);
        }
        2 => {
            builder.filter_level(log::LevelFilter::Trace);
        }
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            });
        }
    };
    builder.init();
}
