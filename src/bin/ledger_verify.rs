use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use audit_ledger::config::LedgerConfig;
use audit_ledger::error::LedgerError;
use audit_ledger::ledger::{chain_violations, load_entries, Ledger, LedgerEntry, MemoryStore};
use audit_ledger::merkle::MerkleTree;
use audit_ledger::verify::Verifier;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("ledger-verify")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify an exported audit ledger offline")
        .arg(
            Arg::new("log-path")
                .short('l')
                .long("log-path")
                .value_name("PATH")
                .help("Path to the JSON Lines ledger export")
                .required(true),
        )
        .arg(
            Arg::new("merkle-root")
                .short('m')
                .long("merkle-root")
                .value_name("HASH")
                .help("Expected Merkle root over all entries"),
        )
        .arg(
            Arg::new("session")
                .short('s')
                .long("session")
                .value_name("SESSION_ID")
                .help("Also verify one session and check it for tampering"),
        )
        .arg(
            Arg::new("attest-out")
                .long("attest-out")
                .value_name("PATH")
                .requires("session")
                .help("Write the session's attestation bundle to PATH"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Ledger configuration file"),
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
                .conflicts_with("verbose")
                .help("Suppress output except errors"),
        )
        .get_matches();

    let log_path = matches
        .get_one::<String>("log-path")
        .ok_or_else(|| anyhow!("--log-path is required"))?;
    let expected_merkle_root = matches.get_one::<String>("merkle-root");
    let session = matches.get_one::<String>("session");
    let attest_out = matches.get_one::<String>("attest-out").map(PathBuf::from);
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    let config = LedgerConfig::load(config_path.as_deref())?;

    // Flags win over RUST_LOG, which wins over the configured filter
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = VerifyOptions {
        log_path: Path::new(log_path),
        expected_merkle_root: expected_merkle_root.map(String::as_str),
        session: session.map(String::as_str),
        attest_out: attest_out.as_deref(),
        verbose,
    };

    if let Err(e) = verify_ledger_file(options).await {
        error!("Ledger verification failed: {}", e);
        std::process::exit(1);
    }

    if !quiet {
        println!("✓ Ledger verification completed successfully");
    }

    Ok(())
}

struct VerifyOptions<'a> {
    log_path: &'a Path,
    expected_merkle_root: Option<&'a str>,
    session: Option<&'a str>,
    attest_out: Option<&'a Path>,
    verbose: bool,
}

async fn verify_ledger_file(options: VerifyOptions<'_>) -> Result<()> {
    let VerifyOptions {
        log_path,
        expected_merkle_root,
        session,
        attest_out,
        verbose,
    } = options;

    info!("Verifying ledger export: {}", log_path.display());

    if !log_path.exists() {
        return Err(anyhow!("Ledger file not found: {}", log_path.display()));
    }

    let entries = load_entries(log_path)?;
    if entries.is_empty() {
        return Err(anyhow!("Ledger file is empty"));
    }

    if verbose {
        println!("Loaded {} ledger entries", entries.len());
    }

    info!("Verifying hash chain integrity");
    let violations = chain_violations(&entries);
    if !violations.is_empty() {
        for violation in &violations {
            println!("✗ {}", violation);
        }
        return Err(LedgerError::TamperDetected(format!(
            "{} chain violations, first at entry {}",
            violations.len(),
            violations[0].sequence_id()
        ))
        .into());
    }

    if verbose {
        println!("✓ Hash chain integrity verified");
    }

    info!("Calculating Merkle root");
    let merkle_root = MerkleTree::build_from_entries(&entries)?.root_hash();

    if verbose {
        println!("Merkle root: {}", merkle_root);
    }

    if let Some(expected) = expected_merkle_root {
        info!("Verifying Merkle root against expected value");
        if merkle_root != expected {
            return Err(anyhow!(
                "Merkle root mismatch. Expected: {}, Got: {}",
                expected,
                merkle_root
            ));
        }

        if verbose {
            println!("✓ Merkle root matches expected value");
        }
    }

    if verbose {
        print_summary(&entries, &merkle_root);
    }

    if let Some(session_id) = session {
        let ledger = Ledger::with_store(Box::new(MemoryStore::from_entries(entries)));
        verify_session(&ledger, session_id, attest_out, verbose).await?;
    }

    Ok(())
}

async fn verify_session(
    ledger: &Ledger,
    session_id: &str,
    attest_out: Option<&Path>,
    verbose: bool,
) -> Result<()> {
    let verifier = Verifier::new(ledger.clone());

    let result = verifier.verify_session(session_id).await;
    for warning in &result.warnings {
        warn!("Session {}: {}", session_id, warning);
    }

    let report = verifier.detect_tampering(session_id).await;
    if report.tampered {
        for issue in &report.issues {
            println!("✗ {}", issue);
        }
        return Err(LedgerError::TamperDetected(format!(
            "session {} has {} issues",
            session_id,
            report.issues.len()
        ))
        .into());
    }

    if verbose {
        println!(
            "✓ Session {} verified ({} entries)",
            session_id, result.event_count
        );
    }

    if let Some(path) = attest_out {
        let bundle = ledger.export_for_attestation(session_id, path).await?;
        if verbose {
            println!(
                "Wrote attestation for {} ({} events, final hash {}) to {}",
                session_id,
                bundle.event_count,
                bundle.final_hash,
                path.display()
            );
        }
    }

    Ok(())
}

fn print_summary(entries: &[LedgerEntry], merkle_root: &str) {
    let (first, last) = match (entries.first(), entries.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return,
    };

    println!("\nLedger Summary:");
    println!("  Total entries: {}", entries.len());
    println!("  First entry: {}", first.timestamp);
    println!("  Last entry: {}", last.timestamp);
    println!("  Merkle root: {}", merkle_root);
    println!("  Head hash: {}", last.hash);

    let mut kinds: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in entries {
        *kinds.entry(entry.event_type.as_str()).or_insert(0) += 1;
    }

    println!("\nEvent type distribution:");
    for (kind, count) in kinds {
        println!("  {}: {}", kind, count);
    }
}
