//! riskcoord runner
//!
//! Runs risk extraction for a directory of OCR outputs, coordinating through
//! a file-backed medium so several runners on one machine share work.
//!
//! Usage:
//!   riskcoord run --project 42 --api http://127.0.0.1:3000 --ocr-dir ocr/
//!   riskcoord retry --project 42 --ocr-dir ocr/ --data-dir .riskcoord
//!   riskcoord status --project 42
//!   riskcoord clear --project 42 [--key acme-nda] [--force]
//!
//! Runners see each other's status changes by polling the medium file.
//! Clears are not propagated: a runner that is still working keeps its own
//! entries and writes them back with its next snapshot, so `clear` refuses
//! to run while any runner holds a lock unless `--force` is given.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use riskcoord_inference::{ApiConfig, HttpClassifier, HttpResultStore};
use riskcoord_jobs::{ContextBuilder, PassOutcome};
use riskcoord_store::{
    CacheConfig, CacheStore, FileKv, InProcessBus, KeyValueStore, LockConfig, LockManager,
};
use riskcoord_core::{
    Article, ExtractionCriteria, ExtractionTask, ProjectScope, SystemClock, TaskKey,
};

#[derive(Parser)]
#[command(name = "riskcoord")]
#[command(author, version, about = "Coordinated contract risk extraction")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every OCR file that needs it
    Run(RunArgs),

    /// Forget failures, then run again
    Retry(RunArgs),

    /// Print the cached status table
    Status(MediumArgs),

    /// Drop cached entries (all, or one with --key)
    Clear {
        #[command(flatten)]
        medium: MediumArgs,

        /// Task key to drop
        #[arg(short, long)]
        key: Option<String>,

        /// Clear even while another runner holds a lock
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct MediumArgs {
    /// Project id
    #[arg(short, long)]
    project: String,

    /// Shared medium directory
    #[arg(short, long, default_value = ".riskcoord")]
    data_dir: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    medium: MediumArgs,

    /// API base URL (default: $RISKCOORD_API_URL)
    #[arg(short, long)]
    api: Option<String>,

    /// Directory of OCR JSON files
    #[arg(short, long)]
    ocr_dir: PathBuf,

    /// Company the contracts are reviewed for
    #[arg(short = 'c', long, default_value = "")]
    target_company: String,
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter (default: "riskcoord=info")
    let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = env::var("LOG_FILE").ok();
    let log_ansi = env::var("LOG_ANSI").ok().map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "riskcoord=info,riskcoord_jobs=info,riskcoord_store=info,riskcoord_inference=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("riskcoord.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct OcrDocument {
    #[serde(default, rename = "fileName")]
    file_name: Option<String>,
    #[serde(default)]
    result: OcrResult,
}

#[derive(Debug, Default, Deserialize)]
struct OcrResult {
    #[serde(default)]
    articles: Vec<Article>,
}

/// One task per `*.json` file in `dir`, sorted by file name.
fn load_tasks(dir: &Path, criteria: &ExtractionCriteria) -> anyhow::Result<Vec<ExtractionTask>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading OCR directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut tasks = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let document: OcrDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable OCR file");
                continue;
            }
        };
        let file_name = document.file_name.unwrap_or_else(|| {
            path.file_name()
                .and_then(|f| f.to_str())
                .unwrap_or_default()
                .to_string()
        });
        let task = ExtractionTask::new(file_name)
            .with_articles(document.result.articles)
            .with_criteria(criteria.clone());
        if task.key.is_empty() {
            continue;
        }
        tasks.push(task);
    }
    Ok(tasks)
}

fn print_table(cache: &CacheStore) {
    let entries = cache.entries();
    if entries.is_empty() {
        println!("(no cached entries)");
        return;
    }
    println!("{:<32} {:<11} {:>8}  {}", "KEY", "STATUS", "FINDINGS", "DETAIL");
    for (key, entry) in entries {
        let findings = entry
            .finding_count()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        let detail = entry
            .error
            .clone()
            .unwrap_or_else(|| entry.timestamp.to_rfc3339());
        println!(
            "{:<32} {:<11} {:>8}  {}",
            key.as_str(),
            entry.status.as_str(),
            findings,
            detail
        );
    }
}

fn open_medium(args: &MediumArgs) -> anyhow::Result<Arc<FileKv>> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data directory {}", args.data_dir.display()))?;
    Ok(Arc::new(FileKv::open(args.data_dir.join("medium.json"))))
}

fn restored_cache(args: &MediumArgs, kv: Arc<dyn KeyValueStore>) -> CacheStore {
    let cache = CacheStore::new(
        ProjectScope::new(&args.project),
        kv,
        Arc::new(SystemClock),
        CacheConfig::from_env(),
    );
    cache.restore_from_medium();
    cache
}

/// A live runner would write cleared entries back with its next snapshot.
fn ensure_no_active_runner(
    project: &str,
    kv: Arc<dyn KeyValueStore>,
    force: bool,
) -> anyhow::Result<()> {
    let locks = LockManager::new(
        ProjectScope::new(project),
        kv,
        Arc::new(SystemClock),
        LockConfig::from_env(),
    );
    if locks.any_held() && !force {
        anyhow::bail!(
            "another runner is processing project {project}; its next snapshot would restore the cleared entries (use --force to clear anyway)"
        );
    }
    Ok(())
}

async fn run(args: RunArgs, retry: bool) -> anyhow::Result<()> {
    let project = args.medium.project.clone();
    let kv = open_medium(&args.medium)?;

    let mut api = ApiConfig::from_env();
    if let Some(url) = args.api.as_deref() {
        api.base_url = url.trim_end_matches('/').to_string();
    }
    let classifier = HttpClassifier::new(api.clone(), &project)?;
    let results = HttpResultStore::new(api, project.clone())?;

    let criteria = ExtractionCriteria {
        target_company: args.target_company,
        ..Default::default()
    };
    let tasks = load_tasks(&args.ocr_dir, &criteria)?;
    info!(project_id = %project, candidates = tasks.len(), "Loaded OCR files");

    let ctx = ContextBuilder::new(project)
        .from_env()
        .kv(kv)
        .bus(Arc::new(InProcessBus::new()))
        .classifier(Arc::new(classifier))
        .results(Arc::new(results))
        .build()?;

    let scheduler = ctx.scheduler().clone();
    scheduler.mount(tasks);
    let pass = async {
        if retry {
            scheduler.retry_failed().await
        } else {
            scheduler.run_mounted().await
        }
    };

    let outcome = tokio::select! {
        outcome = pass => outcome,
        _ = tokio::signal::ctrl_c() => {
            let aborted = ctx.lifecycle().on_page_hide();
            warn!(aborted, "Interrupted, in-flight tasks marked failed");
            print_table(ctx.cache());
            ctx.close();
            return Ok(());
        }
    };

    match &outcome {
        PassOutcome::Finished(summary) => println!(
            "Pass finished: {} total, {} completed, {} failed, {} skipped",
            summary.total, summary.completed, summary.failed, summary.skipped
        ),
        PassOutcome::Idle => println!("Nothing to do"),
        PassOutcome::Refused => println!("Another pass is running"),
    }
    print_table(ctx.cache());
    ctx.close();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _file_guard = init_tracing();

    match Cli::parse().command {
        Commands::Run(args) => run(args, false).await,
        Commands::Retry(args) => run(args, true).await,
        Commands::Status(medium) => {
            print_table(&restored_cache(&medium, open_medium(&medium)?));
            Ok(())
        }
        Commands::Clear { medium, key, force } => {
            let kv = open_medium(&medium)?;
            ensure_no_active_runner(&medium.project, kv.clone(), force)?;
            let cache = restored_cache(&medium, kv);
            let removed = match key.as_deref() {
                Some(key) => usize::from(cache.remove(&TaskKey::new(key)).is_some()),
                None => cache.clear(),
            };
            cache.flush();
            println!("Removed {removed} entr{}", if removed == 1 { "y" } else { "ies" });
            print_table(&cache);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_load_tasks_reads_ocr_directory() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "b.json",
            r#"{"fileName": "docs/ACME-NDA.pdf", "result": {"articles": [{"article_number": "第1条", "title": "目的", "content": "本契約の目的"}]}}"#,
        );
        write(dir.path(), "a.json", r#"{"result": {"articles": []}}"#);
        write(dir.path(), "broken.json", "{not json");
        write(dir.path(), "notes.txt", r#"{"fileName": "ignored.pdf"}"#);
        write(dir.path(), "blank.json", r#"{"fileName": ".pdf"}"#);

        let criteria = ExtractionCriteria {
            target_company: "Acme".into(),
            ..Default::default()
        };
        let tasks = load_tasks(dir.path(), &criteria).unwrap();

        let keys: Vec<&str> = tasks.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "acme-nda"]);
        // Without fileName the file's own name is used.
        assert_eq!(tasks[0].file_name, "a.json");
        assert_eq!(tasks[1].file_name, "docs/ACME-NDA.pdf");
        assert_eq!(tasks[1].articles.len(), 1);
        assert!(tasks.iter().all(|t| t.criteria.target_company == "Acme"));
    }

    #[test]
    fn test_load_tasks_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = load_tasks(&dir.path().join("absent"), &ExtractionCriteria::default()).unwrap_err();
        assert!(err.to_string().contains("reading OCR directory"));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["riskcoord", "clear", "--project", "42", "--key", "acme-nda"]).unwrap();
        match cli.command {
            Commands::Clear { medium, key, force } => {
                assert_eq!(medium.project, "42");
                assert_eq!(medium.data_dir, PathBuf::from(".riskcoord"));
                assert_eq!(key.as_deref(), Some("acme-nda"));
                assert!(!force);
            }
            _ => panic!("expected clear"),
        }

        let cli = Cli::try_parse_from(["riskcoord", "retry", "-p", "42", "-o", "ocr", "-c", "Acme"]).unwrap();
        match cli.command {
            Commands::Retry(args) => {
                assert_eq!(args.ocr_dir, PathBuf::from("ocr"));
                assert_eq!(args.target_company, "Acme");
                assert!(args.api.is_none());
            }
            _ => panic!("expected retry"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_arguments() {
        let cases: &[&[&str]] = &[
            // Flag without its value.
            &["riskcoord", "status", "--project"],
            // Missing project.
            &["riskcoord", "status"],
            // run needs an OCR directory.
            &["riskcoord", "run", "--project", "42"],
            &["riskcoord", "status", "--project", "42", "--bogus"],
            &["riskcoord", "launch", "--project", "42"],
            &["riskcoord"],
        ];
        for args in cases {
            assert!(Cli::try_parse_from(*args).is_err(), "accepted {args:?}");
        }
    }

    #[test]
    fn test_clear_refuses_while_a_runner_holds_a_lock() {
        let dir = TempDir::new().unwrap();
        let kv: Arc<dyn KeyValueStore> = Arc::new(FileKv::open(dir.path().join("medium.json")));
        ensure_no_active_runner("42", kv.clone(), false).unwrap();

        let runner = LockManager::new(
            ProjectScope::new("42"),
            kv.clone(),
            Arc::new(SystemClock),
            LockConfig::default(),
        );
        assert!(runner.try_acquire(&TaskKey::new("acme-nda")));

        let err = ensure_no_active_runner("42", kv.clone(), false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        ensure_no_active_runner("42", kv.clone(), true).unwrap();
        // Locks of other projects do not count.
        ensure_no_active_runner("7", kv.clone(), false).unwrap();

        runner.release(&TaskKey::new("acme-nda"));
        ensure_no_active_runner("42", kv, false).unwrap();
    }

    #[test]
    fn test_cli_parses_force_flag() {
        let cli = Cli::try_parse_from(["riskcoord", "clear", "-p", "42", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Clear { force: true, key: None, .. }));
    }
}
