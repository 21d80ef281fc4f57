use clap::Parser;
use fanvault::cloud::{self, WebdavClient};
use fanvault::config::{self, AppConfig};
use fanvault::feed::FeedClient;
use fanvault::paths::AppPaths;
use fanvault::store::{self, DownloadStatus, VideoRecord};
use fanvault::triage::TriageReport;
use fanvault::{db, download, reconcile, sched, tools, triage};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "fanvault")]
#[command(about = "Feed scraper and downloader with a local video store", version)]
struct Cli {
    /// Base data directory (config, store, downloads, tools)
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Headless mode: run the scheduled tasks until interrupted
    #[arg(long)]
    server: bool,

    /// Override the fetch interval in minutes
    #[arg(long)]
    interval: Option<u64>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.log_level.to_ascii_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let base_dir = cli.base_dir.clone().unwrap_or_else(|| {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("fanvault")
    });
    let paths = AppPaths::new(base_dir);

    // The store is the one thing this tool cannot run without.
    if let Err(e) = paths.ensure_dirs().map_err(Into::into).and_then(|_| db::ensure_schema(&paths)) {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }

    let mut config = match config::load_config(&paths) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    if let Some(minutes) = cli.interval {
        config.fetch_interval_minutes = minutes.max(1);
    }

    install_signal_handler();

    if cli.server {
        run_server_mode(&paths, &config);
    } else {
        run_interactive_mode(&paths, &config);
    }
}

#[cfg(unix)]
fn install_signal_handler() {
    use nix::sys::signal::{signal, SigHandler, Signal};

    extern "C" fn request_shutdown(_: nix::libc::c_int) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }

    unsafe {
        if let Err(e) = signal(Signal::SIGINT, SigHandler::Handler(request_shutdown)) {
            warn!(error = %e, "failed to install SIGINT handler");
        }
        if let Err(e) = signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown)) {
            warn!(error = %e, "failed to install SIGTERM handler");
        }
    }
}

#[cfg(not(unix))]
fn install_signal_handler() {}

// ---------------------------------------------------------------- server

fn run_server_mode(paths: &AppPaths, config: &AppConfig) {
    info!(base_dir = %paths.base_dir.to_string_lossy(), "starting server mode");

    if let Err(e) = std::fs::write(paths.pid_file_path(), format!("{}\n", std::process::id())) {
        warn!(error = %e, "could not write pid file");
    }

    let mut scheduler = sched::Scheduler::new();

    {
        let paths = paths.clone();
        let config = config.clone();
        scheduler.add_task(
            "fetch_new_videos",
            Duration::from_secs(config.fetch_interval_minutes * 60),
            move || {
                let report = fetch_and_triage(&paths, &config);
                let queued: Vec<VideoRecord> = report
                    .new
                    .iter()
                    .filter(|r| !r.is_paid())
                    .cloned()
                    .collect();
                let mut downloaded = 0usize;
                for record in &queued {
                    if download::download_video(&paths, record) {
                        downloaded += 1;
                    }
                }
                info!(
                    new = report.new.len(),
                    duplicate = report.duplicate.len(),
                    retryable = report.retryable.len(),
                    downloaded,
                    "fetch cycle finished"
                );
            },
        );
    }

    if config.webdav.is_some() {
        let paths = paths.clone();
        let config = config.clone();
        scheduler.add_task(
            "upload_completed_videos",
            Duration::from_secs(config.upload_interval_minutes * 60),
            move || {
                run_upload_sweep(&paths, &config);
            },
        );
    }

    {
        let paths = paths.clone();
        let retention_days = config.cleanup_retention_days;
        scheduler.add_task(
            "daily_cleanup",
            Duration::from_secs(24 * 60 * 60),
            move || match store::purge_failed_older_than(&paths, retention_days) {
                Ok(count) if count > 0 => info!(count, "purged stale failed records"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cleanup task failed"),
            },
        );
    }

    scheduler.start();
    // One immediate cycle so a fresh deployment does not idle a full
    // interval before doing anything.
    scheduler.run_task_once("fetch_new_videos");

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }

    info!("shutting down");
    scheduler.stop();
    if let Err(e) = std::fs::remove_file(paths.pid_file_path()) {
        if paths.pid_file_path().exists() {
            warn!(error = %e, "could not remove pid file");
        }
    }
}

// ----------------------------------------------------------- interactive

fn run_interactive_mode(paths: &AppPaths, config: &AppConfig) {
    println!("fanvault, base dir {}", paths.base_dir.to_string_lossy());
    match store::statistics(paths) {
        Ok(stats) => print_statistics(&stats),
        Err(e) => println!("could not read statistics: {e}"),
    }

    loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            break;
        }

        println!();
        println!("  1) full workflow (fetch, triage, download)");
        println!("  2) reconcile download directory");
        println!("  3) list records by status");
        println!("  4) search records by title");
        println!("  5) statistics");
        println!("  6) purge stale failed records");
        println!("  7) upload sweep");
        println!("  8) export records to JSON");
        println!("  9) install ffmpeg");
        println!("  0) quit");

        let choice = match prompt("select: ") {
            Some(v) => v,
            None => break,
        };

        match choice.as_str() {
            "1" => menu_full_workflow(paths, config),
            "2" => menu_reconcile(paths),
            "3" => menu_list_by_status(paths),
            "4" => menu_search(paths),
            "5" => match store::statistics(paths) {
                Ok(stats) => print_statistics(&stats),
                Err(e) => println!("statistics failed: {e}"),
            },
            "6" => match store::purge_failed_older_than(paths, config.cleanup_retention_days) {
                Ok(count) => println!(
                    "purged {count} failed records older than {} days",
                    config.cleanup_retention_days
                ),
                Err(e) => println!("purge failed: {e}"),
            },
            "7" => run_upload_sweep(paths, config),
            "8" => menu_export(paths),
            "9" => match tools::install_ffmpeg(paths) {
                Ok(status) => println!(
                    "ffmpeg installed at {} ({})",
                    status.ffmpeg_path,
                    status.ffmpeg_version.unwrap_or_else(|| "version unknown".to_string())
                ),
                Err(e) => println!("ffmpeg install failed: {e}"),
            },
            "0" | "q" => break,
            other => println!("unknown choice: {other}"),
        }
    }

    println!("bye");
}

fn menu_full_workflow(paths: &AppPaths, config: &AppConfig) {
    let report = fetch_and_triage(paths, config);
    print_triage_report(&report);

    let downloadable: Vec<&VideoRecord> = report.new.iter().filter(|r| !r.is_paid()).collect();
    let locked = report.new.len() - downloadable.len();
    if locked > 0 {
        println!("{locked} new items are access-restricted and cannot be downloaded");
    }

    if !downloadable.is_empty() {
        if confirm(&format!("download {} new videos?", downloadable.len())) {
            let mut ok = 0usize;
            let mut failed = 0usize;
            for &record in &downloadable {
                if download::download_video(paths, record) {
                    ok += 1;
                } else {
                    failed += 1;
                }
            }
            println!("downloads finished: {ok} succeeded, {failed} failed");
        }
    }

    let retryable: Vec<&VideoRecord> = report.retryable.iter().filter(|r| !r.is_paid()).collect();
    if !retryable.is_empty() {
        if confirm(&format!("retry {} previously failed videos?", retryable.len())) {
            let mut ok = 0usize;
            let mut failed = 0usize;
            for &record in &retryable {
                if download::download_video(paths, record) {
                    ok += 1;
                } else {
                    failed += 1;
                }
            }
            println!("retries finished: {ok} succeeded, {failed} failed");
        }
    }

    if config.webdav.is_some() && confirm("run an upload sweep now?") {
        run_upload_sweep(paths, config);
    }
}

fn menu_reconcile(paths: &AppPaths) {
    let dir = match paths.effective_download_dir() {
        Ok(v) => v,
        Err(e) => {
            println!("cannot resolve download directory: {e}");
            return;
        }
    };
    println!("reconciling {}", dir.to_string_lossy());
    match reconcile::reconcile(paths, &dir) {
        Ok(summary) => {
            println!("  matched to files:      {}", summary.files_matched);
            println!("  promoted to completed: {}", summary.updated_to_completed);
            println!("  demoted (file gone):   {}", summary.updated_to_missing);
            println!("  registered from disk:  {}", summary.created_from_files);
        }
        Err(e) => println!("reconciliation failed: {e}"),
    }
}

fn menu_list_by_status(paths: &AppPaths) {
    let Some(raw) = prompt("status (pending/downloading/completed/failed/uploaded): ") else {
        return;
    };
    let Some(status) = DownloadStatus::from_str(raw.trim()) else {
        println!("unknown status: {raw}");
        return;
    };
    match store::list_by_status(paths, status) {
        Ok(records) => print_record_list(&records),
        Err(e) => println!("listing failed: {e}"),
    }
}

fn menu_search(paths: &AppPaths) {
    let Some(keyword) = prompt("keyword: ") else {
        return;
    };
    match store::search(paths, &keyword, 50) {
        Ok(records) => print_record_list(&records),
        Err(e) => println!("search failed: {e}"),
    }
}

fn menu_export(paths: &AppPaths) {
    let out_path = paths.export_file_path();
    let result = store::all_records(paths).and_then(|records| {
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(&out_path, format!("{json}\n"))?;
        Ok(records.len())
    });
    match result {
        Ok(count) => println!("exported {count} records to {}", out_path.to_string_lossy()),
        Err(e) => println!("export failed: {e}"),
    }
}

// ------------------------------------------------------------- shared ops

fn fetch_and_triage(paths: &AppPaths, config: &AppConfig) -> TriageReport {
    let client = FeedClient::new(&config.feed, &config.retry);
    let items = client.fetch_with_retry(1, config.feed.page_size);
    if items.is_empty() {
        info!("feed returned no items");
        return TriageReport::default();
    }

    match triage::triage(paths, &items) {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "triage failed");
            TriageReport::default()
        }
    }
}

fn run_upload_sweep(paths: &AppPaths, config: &AppConfig) {
    let Some(webdav) = config.webdav.as_ref() else {
        println!("no webdav configuration; edit {} first", paths.config_file_path().to_string_lossy());
        return;
    };

    let client = match WebdavClient::new(webdav) {
        Ok(v) => v,
        Err(e) => {
            println!("webdav client setup failed: {e}");
            return;
        }
    };
    if !client.test_connection() {
        println!("webdav connection test failed; check credentials and server");
        return;
    }

    match cloud::upload_sweep(paths, &client, &webdav.remote_root) {
        Ok(summary) => println!(
            "upload sweep: {} attempted, {} uploaded, {} failed",
            summary.attempted, summary.uploaded, summary.failed
        ),
        Err(e) => println!("upload sweep failed: {e}"),
    }
}

// ------------------------------------------------------------ presentation

fn print_triage_report(report: &TriageReport) {
    println!(
        "triage: {} new, {} duplicate, {} retryable, {} in progress ({} skipped on errors)",
        report.new.len(),
        report.duplicate.len(),
        report.retryable.len(),
        report.in_progress.len(),
        report.skipped_errors
    );
    for record in &report.new {
        let access = if record.is_paid() { " [locked]" } else { "" };
        println!("  new: {} ({}){access}", record.title, record.identity_key);
    }
}

fn print_record_list(records: &[VideoRecord]) {
    if records.is_empty() {
        println!("no records");
        return;
    }
    for (i, record) in records.iter().enumerate() {
        println!(
            "[{:3}] {} | {} ({})",
            i + 1,
            record.status.as_str(),
            record.title,
            record.identity_key
        );
        if let Some(path) = record.file_path.as_deref() {
            println!("      file: {path}");
        }
        if let Some(cloud) = record.cloud_path.as_deref() {
            println!("      cloud: {cloud}");
        }
    }
}

fn print_statistics(stats: &store::StoreStatistics) {
    println!("store: {} records", stats.total);
    println!("  pending:     {}", stats.pending);
    println!("  downloading: {}", stats.downloading);
    println!("  completed:   {}", stats.completed);
    println!("  failed:      {}", stats.failed);
    println!("  uploaded:    {}", stats.uploaded);
    println!("  total size:  {}", format_size(stats.total_size_bytes));
}

fn format_size(bytes: i64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let bytes = bytes.max(0) as f64;
    if bytes >= GB {
        format!("{:.2} GB", bytes / GB)
    } else {
        format!("{:.2} MB", bytes / MB)
    }
}

fn prompt(message: &str) -> Option<String> {
    print!("{message}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(0) => None,
        Ok(_) => Some(line.trim().to_string()),
        Err(_) => None,
    }
}

fn confirm(message: &str) -> bool {
    matches!(
        prompt(&format!("{message} (y/n): ")).as_deref(),
        Some("y") | Some("Y") | Some("yes")
    )
}
