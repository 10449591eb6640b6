use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use imagegraph::{manifest, scheduler, Config, GraphError, ModuleRegistry, ObjectStore, PipelineRunner};

fn usage() -> &'static str {
    "Usage:\n  \
     imagegraph build <manifest.json> [--export NAME]... [--checkpoint GLOB]...\n  \
     imagegraph describe <manifest.json>\n  \
     imagegraph inspect-store <store-root>"
}

fn main() {
    env_logger::init();
    imagegraph::cancel::install();
    let args: Vec<String> = std::env::args().skip(1).collect();

    let code = match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("imagegraph: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(args: &[String]) -> Result<i32> {
    match args.first().map(String::as_str) {
        Some("build") => cmd_build(&args[1..]),
        Some("describe") => cmd_describe(&args[1..]),
        Some("inspect-store") => cmd_inspect_store(&args[1..]),
        _ => {
            eprintln!("{}", usage());
            Ok(1)
        }
    }
}

fn cmd_build(args: &[String]) -> Result<i32> {
    let mut manifest_path: Option<PathBuf> = None;
    let mut exports: Vec<String> = Vec::new();
    let mut checkpoints: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--export" => {
                i += 1;
                let value = args.get(i).context("--export requires a value")?;
                exports.push(value.clone());
            }
            "--checkpoint" => {
                i += 1;
                let value = args.get(i).context("--checkpoint requires a value")?;
                checkpoints.push(value.clone());
            }
            other if manifest_path.is_none() => manifest_path = Some(PathBuf::from(other)),
            other => bail!("unrecognized argument: {other}"),
        }
        i += 1;
    }
    let manifest_path = manifest_path.context("missing <manifest.json>")?;

    let config = Config::from_env();
    let doc = load_json(&manifest_path)?;
    let mut manifest = match manifest::load(&doc) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("manifest validation failed: {e}");
            return Ok(2);
        }
    };

    let unmatched = scheduler::apply_checkpoints(&mut manifest, &checkpoints);
    if !unmatched.is_empty() {
        for p in &unmatched {
            eprintln!("checkpoint pattern matched nothing: {}", p.0);
        }
        return Ok(2);
    }

    let targets = if exports.is_empty() {
        manifest.pipelines.iter().map(|p| p.name.clone()).collect::<Vec<_>>()
    } else {
        exports.clone()
    };

    let store = Arc::new(ObjectStore::open(&config.store_root).context("opening object store")?);
    let mut registry = ModuleRegistry::new(config.libdirs.clone());

    let order = match scheduler::schedule(&manifest, &store, &targets) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("scheduling failed: {e}");
            return Ok(2);
        }
    };

    let runner = PipelineRunner::new(store.clone(), config.stage_timeout_secs);
    let mut log = imagegraph::result::PipelineLog::new();
    let mut metadata = std::collections::BTreeMap::new();

    for name in &order {
        if imagegraph::cancel::requested() {
            eprintln!("interrupted: not scheduling remaining pipelines");
            let result = imagegraph::result::BuildResult::Failure {
                error: imagegraph::result::BuildError {
                    kind: "cancelled".to_string(),
                    details: imagegraph::result::StageErrorDetails {
                        stage: imagegraph::result::StageLogEntry {
                            id: String::new(),
                            stage_type: String::new(),
                            output: String::new(),
                            success: Some(false),
                            error: None,
                        },
                    },
                },
                log,
            };
            println!("{}", serde_json::to_string_pretty(&result.to_json())?);
            return Ok(130);
        }

        let pipeline = manifest
            .pipeline_by_name(name)
            .context("scheduled pipeline vanished from manifest")?;
        let (entries, outcome) = runner.run_pipeline(pipeline, &mut registry);
        log.insert(name.clone(), entries.clone());

        if let Err(e) = outcome {
            let failing = entries.last().cloned().unwrap_or(imagegraph::result::StageLogEntry {
                id: pipeline.id().unwrap_or_default().to_string(),
                stage_type: String::new(),
                output: String::new(),
                success: Some(false),
                error: None,
            });
            let kind = match &e {
                GraphError::Cancelled => "cancelled",
                GraphError::Timeout { .. } => "timeout",
                _ => "stage_failed",
            };
            let result = imagegraph::result::BuildResult::Failure {
                error: imagegraph::result::BuildError {
                    kind: kind.to_string(),
                    details: imagegraph::result::StageErrorDetails { stage: failing },
                },
                log,
            };
            println!("{}", serde_json::to_string_pretty(&result.to_json())?);
            return Ok(if matches!(e, GraphError::Cancelled) { 130 } else { 1 });
        }

        if let Some(id) = pipeline.id() {
            metadata.insert(name.clone(), std::collections::BTreeMap::from([(
                "id".to_string(),
                serde_json::Value::String(id.to_string()),
            )]));
        }
    }

    for target in &exports {
        let pipeline = manifest
            .resolve_export_target(target)
            .with_context(|| format!("unknown export target: {target}"))?;
        let id = pipeline
            .id()
            .with_context(|| format!("pipeline {target} has no stages to export"))?;
        let object = store.new_object(Some(id)).context("allocating export object")?;
        object.init(&store).context("materializing export tree")?;
        let dst = PathBuf::from(format!("{target}.export"));
        store
            .export(&object, &dst, config.preserve_owner_on_export)
            .with_context(|| format!("exporting {target}"))?;
    }

    let result = imagegraph::result::BuildResult::Success { metadata, log };
    println!("{}", serde_json::to_string_pretty(&result.to_json())?);
    Ok(0)
}

fn cmd_describe(args: &[String]) -> Result<i32> {
    let manifest_path = args.first().context("missing <manifest.json>")?;
    let doc = load_json(Path::new(manifest_path))?;
    match manifest::load(&doc) {
        Ok(m) => {
            println!("{}", serde_json::to_string_pretty(&manifest::describe(&m))?);
            Ok(0)
        }
        Err(e) => {
            eprintln!("manifest validation failed: {e}");
            Ok(2)
        }
    }
}

fn cmd_inspect_store(args: &[String]) -> Result<i32> {
    let root = args.first().context("missing <store-root>")?;
    let store = ObjectStore::open(Path::new(root)).context("opening object store")?;
    let status = store.status().context("reading store status")?;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "root": store.root(),
        "object_count": status.object_count,
        "total_bytes": status.total_bytes,
    }))?);
    Ok(0)
}

fn load_json(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {} as JSON", path.display()))
}
