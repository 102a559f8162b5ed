use anyhow::{bail, Result};
use bcachefs_conformance::cases::{self, Harness, TestCase};
use bcachefs_conformance::config::{HarnessArgs, HarnessConfig};
use bcachefs_conformance::fixture;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "bcachefs conformance harness", long_about = None)]
struct Cli {
    #[command(flatten)]
    harness: HarnessArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the conformance suite (default)
    Tests {
        /// Only run tests whose name contains this filter
        #[arg(short, long)]
        filter: Option<String>,
        /// Log every command line and its outcome
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },
    /// Print the names of all registered cases
    ListCases,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Tests {
        filter: None,
        verbose: false,
    });

    let verbose = matches!(command, Commands::Tests { verbose: true, .. });
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "warn" }),
    )
    .init();

    match command {
        Commands::Tests { filter, verbose } => {
            run_tests(&HarnessConfig::from(cli.harness), filter, verbose)
        }
        Commands::ListCases => {
            for (name, _) in cases::all() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

fn run_tests(config: &HarnessConfig, filter: Option<String>, verbose: bool) -> Result<()> {
    let harness = Harness::new(config)?;
    println!(
        "[info] {} against {}{}",
        harness.session_dir().display(),
        harness.runner.binary().display(),
        if harness.instrument { " (valgrind)" } else { "" }
    );

    let mut cases: Vec<TestCase> = cases::all();
    let total = cases.len();
    let mut selected = 0usize;
    let mut passed = 0usize;
    for (name, case) in cases.drain(..) {
        if let Some(f) = &filter {
            if !name.contains(f) {
                continue;
            }
        }
        selected += 1;
        if verbose {
            println!("[RUN ] {name}");
        }
        match case(&harness) {
            Ok(_) => {
                passed += 1;
                println!("[PASS] {name}");
            }
            Err(e) => {
                println!("[FAIL] {name}: {e:#}");
            }
        }
    }
    println!(
        "\n{passed}/{selected} tests executed{}.",
        if filter.is_some() {
            format!(" ({total} registered, filtered)")
        } else {
            String::new()
        }
    );

    let leftovers = harness.leftovers();
    let lingering = fixture::lingering_count();
    if lingering > 0 || !leftovers.is_empty() {
        println!("[warn] {lingering} fixture(s) failed to release");
        for path in &leftovers {
            println!("[warn] left behind: {}", path.display());
        }
    }

    if passed == selected {
        return Ok(());
    }
    bail!("failures encountered");
}
