use clap::Parser;
use restock_monitor::app::build_pipeline;
use restock_monitor::utils::error::ErrorSeverity;
use restock_monitor::utils::monitor::SystemMonitor;
use restock_monitor::utils::{logger, validation::Validate};
use restock_monitor::{CliArgs, MonitorEngine, MonitorError, RunReport, TomlConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config = match TomlConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            logger::init_cli_logger(args.verbose);
            eprintln!(
                "❌ Failed to load config file '{}': {}",
                args.config.display(),
                e
            );
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    if args.json || config.json_logs() {
        logger::init_json_logger(args.verbose);
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("🚀 Starting restock-monitor '{}'", config.name());
    tracing::info!("📁 Configuration: {}", args.config.display());

    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    display_config_summary(&config, &args);

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - nothing will be fetched");
        perform_dry_run(&config);
        return Ok(());
    }

    let monitor_enabled = args.monitor || config.monitoring_enabled();
    if monitor_enabled {
        tracing::info!("🔍 System monitoring enabled");
    }
    // The probe always samples; `enabled` only controls stat logging.
    let monitor = Arc::new(SystemMonitor::new(monitor_enabled));

    let cancel = CancellationToken::new();
    let pipeline = match build_pipeline(&config, monitor.clone(), cancel.clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => exit_with(&e),
    };
    let engine = MonitorEngine::with_monitor(pipeline, monitor)
        .with_shutdown_timeout(config.shutdown_timeout());

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, finishing current run");
            ctrl_c.cancel();
        }
    });

    let last_report = if args.once {
        match engine.run_once().await {
            Ok(report) => Some(report),
            Err(e) => {
                shutdown(&engine).await;
                exit_with(&e);
            }
        }
    } else {
        let interval = args.interval_override().unwrap_or_else(|| config.interval());
        tracing::info!("⏱️ Checking every {:?}, press Ctrl-C to stop", interval);
        engine.run_every(interval, &cancel).await
    };

    shutdown(&engine).await;

    if let Some(report) = last_report {
        print_report(&report);
        if report.all_failed() {
            eprintln!("❌ Every target failed in the last run");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn shutdown<P: restock_monitor::core::Pipeline>(engine: &MonitorEngine<P>) {
    if let Err(e) = engine.shutdown().await {
        tracing::error!("❌ Shutdown did not complete cleanly: {}", e);
        eprintln!("❌ {}", e.user_friendly_message());
    }
}

fn exit_with(e: &MonitorError) -> ! {
    tracing::error!(
        "❌ Monitor failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
    eprintln!("❌ {}", e.user_friendly_message());

    let exit_code = match e.severity() {
        ErrorSeverity::Low | ErrorSeverity::High => 1,
        ErrorSeverity::Medium => 2,
        ErrorSeverity::Critical => 3,
    };
    std::process::exit(exit_code);
}

fn print_report(report: &RunReport) {
    println!(
        "✅ Checked {} targets ({} cached, {} errored), {} notifications sent",
        report.checked, report.cached, report.errored, report.notified
    );
    if report.notify_failures > 0 {
        println!("⚠️ {} notifications failed", report.notify_failures);
    }
    if !report.state_saved {
        println!("⚠️ State could not be saved");
    }
}

fn display_config_summary(config: &TomlConfig, args: &CliArgs) {
    let batch = config.batch_config();
    println!("📋 Configuration Summary:");
    println!("  Monitor: {}", config.name());
    println!("  Targets: {}", config.targets.len());
    println!(
        "  Batches: {} per batch, {} concurrent, {:?} apart",
        batch.batch_size, batch.concurrency, batch.inter_batch_delay
    );
    println!("  State: {}", config.state_path());
    println!(
        "  Notifier: {}",
        if config.webhook_url().is_some() { "webhook" } else { "log" }
    );

    if args.dry_run {
        println!("  🔍 DRY RUN MODE ENABLED");
    }

    println!();
}

fn perform_dry_run(config: &TomlConfig) {
    let scheduler = restock_monitor::core::batch::BatchScheduler::new(config.batch_config());

    println!("🔍 Dry Run Analysis:");
    for (index, range) in scheduler.plan(config.targets.len()).into_iter().enumerate() {
        println!("  Batch {}:", index + 1);
        for target in &config.targets[range] {
            match &target.label {
                Some(label) => println!("    - {} ({})", label, target.url),
                None => println!("    - {}", target.url),
            }
        }
    }

    let policy = config.retry_policy();
    println!();
    println!("🔁 Retry: up to {} retries, base delay {:?}", policy.max_retries, policy.base_delay);
    println!("🗃️ Cache TTL: {:?}", config.pipeline_settings().cache_ttl);
}
