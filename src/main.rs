//! slotcopy CLI - Pipelined Asynchronous File Copy
//!
//! Copies one file with a ring of concurrent read/write slots, or sweeps
//! block sizes and slot counts to find a good configuration.

use clap::Parser;
use console::style;
use slotcopy::config::{CliArgs, Commands, CopyJobConfig, LogFormat, OutputFormat, PipelineSettings};
use slotcopy::core::PipelinedCopier;
use slotcopy::error::{PipelineError, Result};
use slotcopy::fs::print_io_uring_status;
use slotcopy::progress::ProgressReporter;
use slotcopy::sweep::{run_sweep, SweepConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    let args = CliArgs::parse();

    init_logging(args.verbose, args.quiet, args.log_format);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8, quiet: bool, format: LogFormat) {
    let default_level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(args: CliArgs) -> Result<()> {
    if let Some(command) = &args.command {
        return handle_command(command, &args);
    }

    if args.source.is_none() || args.destination.is_none() {
        eprintln!("Usage: slotcopy <SOURCE> <DESTINATION> [OPTIONS]");
        eprintln!("       slotcopy --help for more information");
        eprintln!("       slotcopy bench     - Sweep block sizes and slot counts");
        eprintln!("       slotcopy backends  - Show asynchronous I/O support");
        std::process::exit(1);
    }

    let config = CopyJobConfig::from_cli(&args)?;
    let text = args.output_format == OutputFormat::Text && !args.quiet;

    if text {
        print_banner();
        if args.verbose > 0 {
            print_config(&config);
        }
    }

    let progress = if args.progress && !args.quiet {
        ProgressReporter::new()
    } else {
        ProgressReporter::disabled()
    };

    let report = PipelinedCopier::new(config).with_progress(progress).execute()?;

    match args.output_format {
        OutputFormat::Json => println!("{}", report.to_json()?),
        OutputFormat::Text if !args.quiet => report.print_summary(),
        OutputFormat::Text => {}
    }

    Ok(())
}

fn handle_command(command: &Commands, args: &CliArgs) -> Result<()> {
    match command {
        Commands::Bench {
            source,
            destination,
            block_size_kb,
            ops,
            multiples,
            csv,
        } => {
            let config = SweepConfig {
                source: source.clone(),
                destination: destination.clone(),
                base_block_kb: *block_size_kb,
                multiples: *multiples,
                op_counts: ops.clone(),
                settings: PipelineSettings::from_cli(args)?,
            };
            cmd_bench(&config, csv, args)
        }
        Commands::Backends => {
            print_io_uring_status();
            println!("POSIX AIO: available");
            Ok(())
        }
    }
}

fn cmd_bench(config: &SweepConfig, csv: &std::path::Path, args: &CliArgs) -> Result<()> {
    let text = args.output_format == OutputFormat::Text && !args.quiet;
    if text {
        print_banner();
        println!(
            "Measuring {} block sizes x {} operation counts...",
            config.multiples,
            config.op_counts.len()
        );
    }

    let result = run_sweep(config)?;
    result.save_csv(csv)?;

    match args.output_format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&result).map_err(PipelineError::from)?
        ),
        OutputFormat::Text if !args.quiet => {
            println!("\nExecution times for different numbers of operations and block sizes:");
            result.print_table();
            println!("\nResults written to {}", style(csv.display()).green());
        }
        OutputFormat::Text => {}
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        style("Pipelined Asynchronous File Copy").yellow().bold()
    );
}

fn print_config(config: &CopyJobConfig) {
    println!("\n=== Configuration ===");
    println!("Source:       {}", config.source.display());
    println!("Destination:  {}", config.destination.display());
    println!(
        "Block size:   {}",
        humansize::format_size(config.block_size as u64, humansize::BINARY)
    );
    println!("Operations:   {}", config.slots);
    println!("Backend:      {:?}", config.settings.backend);
    println!("Polling:      {}", config.settings.poll.name());
    println!(
        "Poll timeout: {}",
        humantime::format_duration(config.settings.poll_timeout)
    );
    println!("Size aware:   {}", config.settings.size_aware);
    println!("Fsync:        {}", config.settings.fsync);
    println!();
}
