//! Command-line front end: check one object file and print the findings.

use anyhow::Context;
use structopt::StructOpt;

use debuglint::{Categories, CheckOptions, Linter, MessageTerm, Messages};

#[derive(Debug, StructOpt)]
struct DebugLint {
    /// Object file to check.
    filename: std::path::PathBuf,

    /// Also check which allocated sections the .debug_ranges payloads cover.
    #[structopt(long)]
    range_coverage: bool,

    /// Suppress findings of a category (e.g. "bloat", "reloc"); may be
    /// repeated.
    #[structopt(long, number_of_values = 1)]
    suppress: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = DebugLint::from_args();

    let buffer = std::fs::read(&args.filename)
        .with_context(|| format!("failed to read {}", args.filename.display()))?;
    let object = object::File::parse(&*buffer).context("failed to parse object file")?;

    let mut messages = Messages::new();
    for name in &args.suppress {
        let cat = Categories::by_name(name)
            .with_context(|| format!("unknown category {:?}", name))?;
        messages
            .warning_criteria_mut()
            .and_not(MessageTerm::new(cat, Categories::NONE));
    }

    let mut linter =
        Linter::with_messages(CheckOptions { range_coverage: args.range_coverage }, messages);
    linter.check_object(&object)?;

    let messages = linter.into_messages();
    for diagnostic in messages.diagnostics() {
        println!("{}", diagnostic);
    }

    let errors = messages.error_count();
    if errors > 0 {
        std::process::exit(errors.min(255) as i32);
    }
    Ok(())
}
