//! PACS归档清理服务主程序

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use pacs_admin::{example_config, ArchiveConfig, ConfigManager, LogFormat};
use pacs_database::{ArchiveStore, DatabasePool, DatabaseQueries, PgArchiveStore};
use pacs_deletion::{
    ArchivePatientService, DeletionMetrics, DeletionService, ExpirationSweeper, StorageReclaimer, StoreCodeCache,
    TracingAuditEmitter,
};
use pacs_storage::{StorageRegistry, StudySizeCalculator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// 归档清理服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "PACS 归档清理服务：存储回收、过期检查删除与检查大小计算")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    /// 只执行一轮后退出
    #[arg(long)]
    once: bool,

    /// 启动前先删除指定存储上最久未访问的检查
    #[arg(long, value_name = "STORAGE_ID")]
    delete_studies_on: Option<String>,

    /// 输出示例配置后退出
    #[arg(long)]
    print_default_config: bool,
}

/// 一轮清理所需的组件
struct Workers {
    store: Arc<dyn ArchiveStore>,
    service: Arc<DeletionService>,
    reclaimer: StorageReclaimer,
    sweeper: ExpirationSweeper,
    size_calculator: StudySizeCalculator,
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

async fn run_cycle(workers: &Workers, config: &ArchiveConfig) {
    let batch_size = config.deletion.batch_size;

    match workers.reclaimer.run().await {
        Ok(report) => debug!(
            retried = report.retried,
            deleted = report.purge.deleted,
            failed = report.purge.failed,
            "Reclamation finished"
        ),
        Err(e) => error!("Storage reclamation failed: {}", e),
    }

    let updated_before = Utc::now() - ChronoDuration::seconds(config.deletion.study_size_delay_secs as i64);
    if let Err(e) = workers
        .size_calculator
        .calculate(workers.store.as_ref(), updated_before, batch_size)
        .await
    {
        error!("Study size calculation failed: {}", e);
    }

    if config.deletion.expiration_enabled {
        if let Err(e) = workers.sweeper.sweep(Utc::now().date_naive()).await {
            error!("Expiration sweep failed: {}", e);
        }
    }

    if let Some(metrics) = workers.service.metrics() {
        match metrics.gather_text() {
            Ok(text) => debug!(metrics = %text, "Deletion metrics"),
            Err(e) => error!("Failed to gather metrics: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        println!("{}", example_config().to_toml()?);
        return Ok(());
    }

    let manager = ConfigManager::load(args.config.as_deref())?;
    let config = manager.get_config().await;
    init_logging(
        args.log_level.as_deref().unwrap_or(&config.logging.level),
        config.logging.format,
    )?;

    info!("启动PACS归档清理服务...");
    info!("  批次大小: {}", config.deletion.batch_size);
    info!("  清理周期: {}s", config.deletion.purge_interval_secs);
    info!("  存储: {}", config.storage.len());

    let pool = DatabasePool::connect(&config.database).await?;
    DatabaseQueries::new(&pool).create_tables().await?;
    let store: Arc<dyn ArchiveStore> = Arc::new(PgArchiveStore::new(pool.clone()));
    let storages = StorageRegistry::from_descriptors(&config.storage)?;

    let service = Arc::new(
        DeletionService::new(
            config.deletion_settings(),
            Arc::new(ArchivePatientService),
            Arc::new(StoreCodeCache::new()),
            Arc::new(TracingAuditEmitter),
        )
        .with_metrics(DeletionMetrics::new()?),
    );
    let workers = Workers {
        reclaimer: StorageReclaimer::new(service.clone(), store.clone(), storages, config.deletion.batch_size)
            .retry_failed_on_run(config.deletion.retry_failed),
        sweeper: ExpirationSweeper::new(service.clone(), store.clone(), config.deletion.batch_size),
        size_calculator: StudySizeCalculator,
        store,
        service,
    };

    if let Some(storage_id) = &args.delete_studies_on {
        let outcome = workers.reclaimer.delete_studies(storage_id).await?;
        info!(
            storage_id = %storage_id,
            studies = outcome.removed_studies.len(),
            "Deleted least recently accessed studies"
        );
    }

    let mut interval = tokio::time::interval(Duration::from_secs(config.deletion.purge_interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_cycle(&workers, &config).await;
                if args.once {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("收到停止信号");
                break;
            }
        }
    }

    pool.close().await;
    info!("PACS归档清理服务已停止");
    Ok(())
}
