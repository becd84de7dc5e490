use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::sync::Arc;
use tracing::{error, info};

use audit_ledger::audit::{
    ChainVerifier, HashAlgorithm, LedgerReader, PartitionId, VerificationResult,
};
use audit_ledger::database::Database;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("verify-audit-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify audit ledger hash-chain integrity")
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .env("LEDGER_DATABASE_URL")
                .help("Audit database to verify")
                .required(true),
        )
        .arg(
            Arg::new("partition")
                .short('p')
                .long("partition")
                .value_name("ID")
                .help("Verify only this partition (default: all partitions)"),
        )
        .arg(
            Arg::new("hash-algorithm")
                .long("hash-algorithm")
                .value_name("ALGORITHM")
                .default_value("sha256")
                .help("Algorithm the ledger was written with"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    // Set log level based on flags
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let database_url = matches
        .get_one::<String>("database-url")
        .ok_or_else(|| anyhow!("--database-url is required"))?;
    let algorithm: HashAlgorithm = matches
        .get_one::<String>("hash-algorithm")
        .map(String::as_str)
        .unwrap_or("sha256")
        .parse()?;
    let partition = matches
        .get_one::<String>("partition")
        .map(|id| PartitionId::new(id.as_str()))
        .transpose()?;

    let results = verify_database(database_url, partition, algorithm).await?;

    let mut broken = 0;
    for result in &results {
        if !quiet || !result.ok {
            println!("{}", result.summary());
        }
        if verbose {
            println!("{}\n", result.detailed_status());
        }
        if !result.ok {
            broken += 1;
        }
    }

    if broken > 0 {
        error!("{} of {} partitions failed verification", broken, results.len());
        std::process::exit(1);
    }

    if !quiet {
        println!(
            "✓ Audit ledger verification completed successfully ({} partitions)",
            results.len()
        );
    }

    Ok(())
}

async fn verify_database(
    database_url: &str,
    partition: Option<PartitionId>,
    algorithm: HashAlgorithm,
) -> Result<Vec<VerificationResult>> {
    info!("Verifying audit ledger: {}", database_url);

    let database = Database::open_existing(database_url).await?;
    let reader = LedgerReader::new(Arc::new(database));
    let verifier = ChainVerifier::new(reader, algorithm);

    let results = match partition {
        Some(partition_id) => vec![verifier.verify(&partition_id).await?],
        None => verifier.verify_all().await?,
    };

    if results.is_empty() {
        info!("Audit ledger holds no partitions");
    }
    Ok(results)
}
