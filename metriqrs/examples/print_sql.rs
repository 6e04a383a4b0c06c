use std::{env, path::PathBuf};

use metriq::compiler::{compile, CompileOptions};
use metriq::dialect::dialect_for;
use metriq::resolver::ResolvedMetric;
use metriq::Validator;

fn usage() {
    eprintln!("Usage: print_sql <definitions_dir> <metric_name> [dialect]");
    eprintln!("Example: cargo run --example print_sql -- ./definitions monthly_revenue postgres");
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let definitions_dir = PathBuf::from(args.remove(0));
    let metric_name = args.remove(0);
    let dialect_name = if args.is_empty() {
        "duckdb".to_string()
    } else {
        args.remove(0)
    };

    let registry = metriq::load_and_validate(&definitions_dir, &Validator::default())?;
    let metric = registry
        .get_metric(&metric_name)
        .ok_or_else(|| anyhow::anyhow!("metric {metric_name} not found"))?;
    let dialect = dialect_for(&dialect_name)
        .ok_or_else(|| anyhow::anyhow!("unknown dialect {dialect_name}"))?;

    let compiled = compile(
        &ResolvedMetric::plain(metric.clone()),
        dialect.as_ref(),
        &CompileOptions::default(),
    )?;

    println!("{}", compiled.sql);
    if !compiled.bindings.is_empty() {
        println!("-- bindings: {}", serde_json::to_string(&compiled.bindings)?);
    }
    println!("-- fingerprint: {}", compiled.fingerprint);
    Ok(())
}
