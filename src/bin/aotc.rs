//! Ahead-of-time image builder driven by a manifest.
//!
//! Compiles the manifest roots into a native session and writes the
//! requested outputs, embedding the offset tables unless `--no-persist`.

use aot_image::emit::{EmitOptions, OutputStatus};
use aot_image::manifest::Manifest;
use aot_image::target::{OptLevel, TargetConfig};
use aot_image::{AotConfig, AotContext};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use target_lexicon::Triple;

#[derive(Parser, Debug)]
#[command(name = "aotc")]
#[command(about = "Build a native image from a specialization manifest", long_about = None)]
struct Args {
    /// Manifest describing revisions, globals, instances and roots
    #[arg(value_name = "MANIFEST")]
    manifest: PathBuf,

    /// Write the native object file
    #[arg(long, value_name = "FILE")]
    output_o: Option<PathBuf>,

    /// Write the optimized intermediate form
    #[arg(long, value_name = "FILE")]
    output_bc: Option<PathBuf>,

    /// Write the unoptimized intermediate form
    #[arg(long, value_name = "FILE")]
    output_unopt_bc: Option<PathBuf>,

    /// Serialized runtime image to embed
    #[arg(long, value_name = "FILE")]
    sysimg_data: Option<PathBuf>,

    /// Target triple (defaults to the host)
    #[arg(long, value_name = "TRIPLE")]
    target: Option<String>,

    /// Target CPU name
    #[arg(long, default_value = "generic")]
    cpu: String,

    /// Optimization level
    #[arg(short = 'O', default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=3))]
    opt_level: u8,

    /// Do not embed offset tables
    #[arg(long)]
    no_persist: bool,

    /// Print driver statistics
    #[arg(long)]
    stats: bool,

    /// Print the offset tables and per-root table entries
    #[arg(long)]
    print_tables: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = Manifest::from_path(&args.manifest)?;

    let mut target = match &args.target {
        Some(triple) => TargetConfig::new(
            Triple::from_str(triple).map_err(|e| format!("invalid target `{triple}`: {e}"))?,
        ),
        None => TargetConfig::host(),
    };
    target.cpu = args.cpu.clone();
    target.opt_level = OptLevel::from_level(args.opt_level);

    let config = AotConfig::default()
        .with_target(target)
        .with_persistence(!args.no_persist);
    let ctx = AotContext::new(config)?;

    let mut runtime = manifest.into_runtime();
    runtime.register_globals(&ctx)?;
    let roots = runtime.roots().to_vec();
    let revisions = runtime.revisions();

    let session = ctx.create_session(&roots, revisions, &mut runtime)?;
    if args.stats {
        print!("{}", session.stats());
    }
    if args.print_tables {
        for (i, name) in session.global_table().iter().enumerate() {
            println!("gvar {:4} {}", i + 1, name);
        }
        for (i, name) in session.function_table().iter().enumerate() {
            println!("fvar {:4} {}", i + 1, name);
        }
        for root in &roots {
            match session.table_indices_of(*root) {
                Some(entry) => println!(
                    "root {} api={} specialized={} generic={}",
                    root, entry.api.0, entry.specialized, entry.generic
                ),
                None => println!("root {} omitted", root),
            }
        }
    }

    let mut options = EmitOptions::new();
    options.unoptimized_ir = args.output_unopt_bc;
    options.optimized_ir = args.output_bc;
    options.object = args.output_o;
    if let Some(path) = &args.sysimg_data {
        options.payload = Some(std::fs::read(path)?);
    }

    let report = ctx.emit_artifact(session, &options)?;
    for output in &report.outputs {
        match &output.status {
            OutputStatus::Written => info!("wrote {} to {}", output.kind, output.path.display()),
            OutputStatus::Skipped(diag) => eprintln!("ERROR: {}", diag),
        }
    }
    info!("offset tables: {:?}", report.persistence);
    Ok(())
}
