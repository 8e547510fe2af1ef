use anyhow::{Context, Result, anyhow, bail};
use covseq_pool::{
    about,
    config::PoolingParameters,
    ledger::{Ledger, format_plate_id},
    pcr_import::{discover_pcr_exports, import_pcr_exports},
    pipeline::{CommitReport, PoolingRun, RunSummary},
};
use serde::Serialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Serialize)]
struct PlateFill {
    plate_id: String,
    filled: usize,
    capacity: u32,
    complete: bool,
}

#[derive(Serialize)]
struct LedgerSummary {
    entries: usize,
    plates: Vec<PlateFill>,
    open_plate: Option<String>,
    next_plate_id: String,
}

#[derive(Serialize)]
struct RunOutput {
    summary: RunSummary,
    commit: CommitReport,
    removed_inputs: Vec<String>,
}

struct GlobalArgs {
    params: PoolingParameters,
    verbose: bool,
    rest: Vec<String>,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  covseq_cli --version\n  \
  covseq_cli [GLOBAL] parameters\n  \
  covseq_cli [GLOBAL] ledger-summary LEDGER.csv\n  \
  covseq_cli [GLOBAL] run --ledger LEDGER.csv --input DIR --output DIR [--date YYYY-MM-DD] [--keep-inputs]\n\n  \
  GLOBAL:\n    \
    --params FILE.json     load pooling parameters\n    \
    --set NAME=JSON        override one parameter (repeatable)\n    \
    -v, --verbose          log run progress to stderr"
    );
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn parse_global_args(args: &[String]) -> Result<GlobalArgs> {
    let mut params_path: Option<String> = None;
    let mut overrides: Vec<(String, String)> = vec![];
    let mut verbose = false;
    let mut idx = 1;
    while idx < args.len() {
        match args[idx].as_str() {
            "--params" => {
                let path = args.get(idx + 1).ok_or_else(|| anyhow!("--params needs a file"))?;
                params_path = Some(path.clone());
                idx += 2;
            }
            "--set" => {
                let pair = args.get(idx + 1).ok_or_else(|| anyhow!("--set needs NAME=JSON"))?;
                let (name, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--set expects NAME=JSON, got '{pair}'"))?;
                overrides.push((name.trim().to_string(), value.to_string()));
                idx += 2;
            }
            "-v" | "--verbose" => {
                verbose = true;
                idx += 1;
            }
            _ => break,
        }
    }

    let mut params = match &params_path {
        Some(path) => PoolingParameters::load_from_path(path)?,
        None => PoolingParameters::default(),
    };
    for (name, raw) in overrides {
        // bare words are taken as JSON strings, e.g. --set plate_prefix=PLATE_
        let value = serde_json::from_str(&raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
        params.set_parameter(&name, &value)?;
    }

    Ok(GlobalArgs {
        params,
        verbose,
        rest: args[idx..].to_vec(),
    })
}

fn option_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|pos| args.get(pos + 1))
        .cloned()
}

fn summarize_ledger(ledger: &Ledger, params: &PoolingParameters) -> Result<LedgerSummary> {
    let cont = ledger.continuation(params)?;
    let capacity = params.capacity();
    let plates = ledger
        .plate_ids()
        .into_iter()
        .map(|plate_id| {
            let filled = ledger.entries_for_plate(&plate_id).len();
            PlateFill {
                complete: filled == capacity as usize,
                plate_id,
                filled,
                capacity,
            }
        })
        .collect();
    Ok(LedgerSummary {
        entries: ledger.len(),
        plates,
        open_plate: cont
            .last_plate_id
            .clone()
            .filter(|_| cont.is_open(capacity)),
        next_plate_id: format_plate_id(&params.plate_prefix, cont.next_plate_number),
    })
}

/// `--date YYYY-MM-DD` as used in output file names; today when absent.
fn run_date(args: &[String]) -> Result<String> {
    let Some(pos) = args.iter().position(|a| a == "--date") else {
        return Ok(chrono::Local::now().format("%Y-%m-%d").to_string());
    };
    let raw = args
        .get(pos + 1)
        .ok_or_else(|| anyhow!("--date needs a value in YYYY-MM-DD form"))?;
    let date = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("--date expects YYYY-MM-DD, got '{raw}'"))?;
    Ok(date.format("%Y-%m-%d").to_string())
}

fn run_pooling(args: &[String], params: &PoolingParameters) -> Result<()> {
    let ledger_path = PathBuf::from(
        option_value(args, "--ledger").ok_or_else(|| anyhow!("run requires --ledger LEDGER.csv"))?,
    );
    let input_dir = PathBuf::from(
        option_value(args, "--input").ok_or_else(|| anyhow!("run requires --input DIR"))?,
    );
    let output_dir = PathBuf::from(
        option_value(args, "--output").ok_or_else(|| anyhow!("run requires --output DIR"))?,
    );
    let date = run_date(args)?;
    let keep_inputs = args.iter().any(|a| a == "--keep-inputs");

    let prior = Ledger::load_from_path(&ledger_path)?;
    let exports = discover_pcr_exports(&input_dir, params)?;
    if exports.is_empty() {
        bail!(
            "No PCR exports starting with '{}' in '{}'",
            params.pcr_file_prefix,
            input_dir.display()
        );
    }
    let batches = import_pcr_exports(&exports, params)?;
    info!(batches = batches.len(), prior_entries = prior.len(), "starting run");

    let report = PoolingRun::new(params).execute(prior, &batches)?;
    let commit = report.commit(&output_dir, &ledger_path, &date)?;

    let mut removed_inputs = vec![];
    if !keep_inputs {
        for path in &exports {
            match fs::remove_file(path) {
                Ok(()) => removed_inputs.push(path.display().to_string()),
                Err(e) => warn!(file = %path.display(), "could not remove consumed export: {e}"),
            }
        }
    }

    print_json(&RunOutput {
        summary: report.summary,
        commit,
        removed_inputs,
    })
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        bail!("Missing command");
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }

    let global = parse_global_args(&args)?;
    init_logging(global.verbose);
    let Some(command) = global.rest.first() else {
        usage();
        bail!("Missing command");
    };
    let command_args = &global.rest[1..];

    match command.as_str() {
        "parameters" => print_json(&global.params),
        "ledger-summary" => {
            let Some(path) = command_args.first() else {
                usage();
                bail!("ledger-summary requires a ledger path");
            };
            let ledger = Ledger::load_from_path(Path::new(path))?;
            print_json(&summarize_ledger(&ledger, &global.params)?)
        }
        "run" => run_pooling(command_args, &global.params),
        _ => {
            usage();
            Err(anyhow!("Unknown command '{command}'"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_run_date() {
        assert_eq!(run_date(&args(&["--date", "2021-03-01"])).unwrap(), "2021-03-01");
        assert!(run_date(&args(&["--date", "2021/03/01"])).is_err());
        assert!(run_date(&args(&["--date", "2021-02-30"])).is_err());
        assert!(run_date(&args(&["--output", "out", "--date"])).is_err());
        let today = run_date(&args(&["--output", "out"])).unwrap();
        assert!(chrono::NaiveDate::parse_from_str(&today, "%Y-%m-%d").is_ok());
    }
}
