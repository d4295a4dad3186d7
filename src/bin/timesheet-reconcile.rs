use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use timesheet_reconciler::{ReconcilerConfig, RunPaths, TimesheetReconciler};
use tracing_subscriber::EnvFilter;

/// Reconcile a timesheet export against the operations cost matrix.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Source timesheet (.xlsx, .xls, .ods or .csv)
    #[arg(long, required_unless_present = "print_schema")]
    source: Option<PathBuf>,

    /// Sheet of the source workbook to read (defaults to the first one)
    #[arg(long)]
    source_sheet: Option<String>,

    /// Target cost matrix workbook
    #[arg(long, required_unless_present = "print_schema")]
    target: Option<PathBuf>,

    /// Where to write the updated workbook (defaults to <target>_updated.xlsx)
    #[arg(long)]
    updated_target: Option<PathBuf>,

    /// Directory for the processed table, audit log and chunk files
    #[arg(long, default_value = "out")]
    output_dir: PathBuf,

    /// JSON configuration; built-in tables are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    print_schema: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.print_schema {
        println!("{}", ReconcilerConfig::schema_as_json()?);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => ReconcilerConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ReconcilerConfig::default(),
    };

    let reconciler = TimesheetReconciler::new(config).context("invalid configuration")?;
    let (Some(source), Some(target)) = (args.source, args.target) else {
        anyhow::bail!("--source and --target are required");
    };
    let paths = RunPaths {
        source,
        source_sheet: args.source_sheet,
        target,
        output_dir: args.output_dir,
        updated_target: args.updated_target,
    };

    let summary = reconciler.run(&paths).context("reconciliation run failed")?;

    println!("\nProcess completed successfully!");
    println!("  Source entries:        {}", summary.source_entries);
    println!("  Unmapped work package: {}", summary.unmapped_entries);
    println!("  Fee records:           {}", summary.fee_records);
    println!("  Cells mapped:          {}", summary.cell_mappings);
    println!("  Cells updated:         {}", summary.updated_cells);
    println!("  Cells without match:   {}", summary.missing_cells);
    println!("  Formulas overwritten:  {}", summary.overwritten_formulas);
    println!("  Updated workbook:      {}", summary.updated_target.display());
    println!("  Audit log:             {}", summary.audit_log.display());
    Ok(())
}
