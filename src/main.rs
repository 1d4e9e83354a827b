//! virsurv - survival analysis of virulence assays from the command line

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, LevelFilter};
use virulence_survival::{
    analysis::{self, ModelKind},
    design, km, report, simulation,
    AnalysisConfig, AssayTable,
};

#[derive(Parser)]
#[command(name = "virsurv")]
#[command(about = "Survival analysis for virulence assays")]
#[command(version)]
struct Cli {
    /// Log verbosity (off, error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: LevelFilter,

    /// Analysis settings (JSON). Defaults apply to anything left out.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    format: Format,

    /// Output file. Defaults to stdout.
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Csv,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Kaplan-Meier curves per stratum, with a log-rank test
    Km {
        /// Assay CSV
        input: PathBuf,

        /// Factors to stratify by (default: every configured factor)
        #[arg(long, value_delimiter = ',')]
        by: Option<Vec<String>>,
    },

    /// Fit one model and print its terms
    Fit {
        /// Assay CSV
        input: PathBuf,

        /// coxph, coxph_robust, coxme, pwe or weibull_bayes
        #[arg(short, long, default_value = "coxph_robust")]
        model: ModelKind,
    },

    /// Fit several models to the same assay
    Compare {
        /// Assay CSV
        input: PathBuf,

        #[arg(short, long, value_delimiter = ',', default_value = "coxph,coxph_robust,coxme,pwe")]
        models: Vec<ModelKind>,

        /// Also write the fit metrics as CSV here
        #[arg(long)]
        metrics: Option<PathBuf>,
    },

    /// Simulation study of bias and coverage
    Simulate {
        #[arg(long)]
        replicates: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Worker threads (0 = all cores)
        #[arg(long)]
        threads: Option<usize>,

        #[arg(short, long, value_delimiter = ',')]
        models: Option<Vec<ModelKind>>,

        /// Also write every replicate estimate as CSV here
        #[arg(long)]
        estimates: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new().filter_level(cli.log_level).init();

    let config = match &cli.config {
        Some(path) => AnalysisConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AnalysisConfig::default(),
    };
    let mut out = open_output(cli.output.as_ref())?;

    match cli.command {
        Commands::Km { input, by } => {
            let table = load_assay(&input, &config)?;
            let by = by.unwrap_or_else(|| config.columns.factors.clone());
            let curves = km::survfit(&table, &by, config.conf_level)?;
            match cli.format {
                Format::Text => write!(out, "{}", report::render_curves(&curves))?,
                Format::Csv => report::write_csv(&curves.points(), &mut out)?,
                Format::Json => serde_json::to_writer_pretty(
                    &mut out,
                    &serde_json::json!({ "curves": curves.points(), "log_rank": curves.log_rank }),
                )?,
            }
        }

        Commands::Fit { input, model } => {
            let table = load_assay(&input, &config)?;
            let data = design::model_frame(&table, &config.design)?;
            let fitted = analysis::fit(model, &data, &config.model_settings())
                .with_context(|| format!("fitting {}", model))?;
            let rows = fitted.tidy();
            match cli.format {
                Format::Text => write!(out, "{}", report::render_estimates(&rows))?,
                Format::Csv => report::write_csv(&rows, &mut out)?,
                Format::Json => serde_json::to_writer_pretty(
                    &mut out,
                    &serde_json::json!({ "estimates": rows, "fit": fitted.fit_statistics() }),
                )?,
            }
        }

        Commands::Compare { input, models, metrics } => {
            let table = load_assay(&input, &config)?;
            let data = design::model_frame(&table, &config.design)?;
            let comparison = analysis::compare(&data, &models, &config.model_settings())?;
            match cli.format {
                Format::Text => {
                    write!(out, "{}", report::render_estimates(&comparison.estimates))?;
                    writeln!(out)?;
                    write!(out, "{}", report::render_metrics(&comparison.metrics))?;
                }
                Format::Csv => report::write_csv(&comparison.estimates, &mut out)?,
                Format::Json => serde_json::to_writer_pretty(
                    &mut out,
                    &serde_json::json!({
                        "estimates": comparison.estimates,
                        "metrics": comparison.metrics,
                    }),
                )?,
            }
            if let Some(path) = metrics {
                report::write_csv(&comparison.metrics, File::create(&path)?)?;
                info!("wrote metrics to {}", path.display());
            }
        }

        Commands::Simulate { replicates, seed, threads, models, estimates } => {
            let mut sim = config.simulation.clone();
            if let Some(r) = replicates {
                sim.replicates = r;
            }
            if let Some(s) = seed {
                sim.seed = s;
            }
            if let Some(t) = threads {
                sim.threads = t;
            }
            if let Some(m) = models {
                sim.models = m;
            }

            let results = simulation::run(&sim, &config.model_settings())?;
            let summaries = simulation::summarize(&results, sim.effect);
            match cli.format {
                Format::Text => write!(out, "{}", report::render_summaries(&summaries))?,
                Format::Csv => report::write_csv(&summaries, &mut out)?,
                Format::Json => serde_json::to_writer_pretty(
                    &mut out,
                    &serde_json::json!({
                        "config": sim,
                        "summaries": summaries,
                        "failures": results.failures,
                    }),
                )?,
            }
            if let Some(path) = estimates {
                report::write_csv(&results.estimates, File::create(&path)?)?;
                info!("wrote {} replicate estimates to {}", results.estimates.len(), path.display());
            }
        }
    }

    out.flush()?;
    Ok(())
}

fn load_assay(path: &PathBuf, config: &AnalysisConfig) -> Result<AssayTable> {
    AssayTable::from_path(path, &config.columns)
        .with_context(|| format!("reading assay {}", path.display()))
}

fn open_output(path: Option<&PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(BufWriter::new(
            File::create(p).with_context(|| format!("creating {}", p.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    })
}
