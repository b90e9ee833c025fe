use anyhow::{Context, Result, bail};
use std::{env, fs, path::PathBuf, sync::Arc};

use fieldcam::{
    AnalysisPipeline, ArtifactLoader, ClassifierCache, FsStorage, ParallelAnalyzer, PipelineConfig,
    RuntimeContext, ScanRecord,
};

struct Args {
    model_path: PathBuf,
    output_dir: PathBuf,
    scan_paths: Vec<PathBuf>,
    config_path: Option<PathBuf>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    let mut config_path = None;
    if let Some(pos) = args.iter().position(|arg| arg == "--config") {
        if pos + 1 >= args.len() {
            bail!("--config needs a path");
        }
        config_path = Some(PathBuf::from(args.remove(pos + 1)));
        args.remove(pos);
    }

    if args.len() < 3 {
        println!("Usage: scan_tester <model.json> <output_dir> <scan.json>... [--config <pipeline.json>]");
        return Ok(None);
    }

    Ok(Some(Args {
        model_path: PathBuf::from(&args[0]),
        output_dir: PathBuf::from(&args[1]),
        scan_paths: args[2..].iter().map(PathBuf::from).collect(),
        config_path,
    }))
}

/// Scan id for a file: its stem, e.g. `scans/patient-7.json` -> `patient-7`.
fn scan_id(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    // --- 1. Argument Parsing & Setup ---
    let Some(args) = parse_args()? else {
        return Ok(());
    };
    let config = PipelineConfig::load_or_default(args.config_path.as_deref())?;

    let mut requests = Vec::with_capacity(args.scan_paths.len());
    for path in &args.scan_paths {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read scan {}", path.display()))?;
        let record = ScanRecord::from_json(&text).with_context(|| format!("Failed to parse scan {}", path.display()))?;
        requests.push((scan_id(path), record));
    }

    // --- 2. Pipeline Initialization ---
    let classifiers = Arc::new(ClassifierCache::new(ArtifactLoader::new(&args.model_path)));
    let storage = Arc::new(FsStorage::new(&args.output_dir));
    let pipeline = Arc::new(AnalysisPipeline::new(config, classifiers, storage));
    let analyzer = ParallelAnalyzer::new(pipeline, RuntimeContext::default());

    // --- 3. Batch Processing ---
    let mut failures = 0;
    for outcome in analyzer.analyze_batch(requests).await {
        let report = outcome?;
        match &report.outcome {
            Ok(result) => {
                let record = result.to_output_record();
                println!("{}: {}", report.scan_id, serde_json::to_string(&record)?);
            }
            Err(err) => {
                failures += 1;
                let hint = if err.is_retryable() { " (retryable)" } else { "" };
                eprintln!("{}: {} failed: {err}{hint}", report.scan_id, err.reason().as_str());
            }
        }
    }
    analyzer.shutdown().await;

    println!(
        "Processing complete. {} of {} scans analysed, output saved to {}",
        args.scan_paths.len() - failures,
        args.scan_paths.len(),
        args.output_dir.display()
    );
    if failures > 0 {
        bail!("{failures} scan(s) failed");
    }
    Ok(())
}
