use anyhow::Context;
use clap::Parser;
use game_supervisor::app::stdio::write_lines;
use game_supervisor::domain::ports::EventSink;
use game_supervisor::utils::{logger, validation::Validate};
use game_supervisor::{
    CliArgs, CommandLauncher, Dispatcher, LocalConfigStore, Orchestrator, Outbound,
    PortAllocator, ProcessRegistry, SteamCmdFetcher, SupervisorConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // 初始化日誌 (stdout 保留給協定)
    if args.json_logs {
        logger::init_json_logger(args.verbose);
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("Starting game-supervisor");
    match dotenvy::dotenv() {
        Ok(path) => tracing::info!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => tracing::debug!("No .env file found"),
        Err(e) => tracing::warn!("Failed to load .env file: {}", e),
    }

    let config = match &args.config {
        Some(path) => SupervisorConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SupervisorConfig::from_env().context("loading configuration from environment")?,
    };
    if args.verbose {
        tracing::debug!("Supervisor config: {:?}", config);
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        return Err(e).context("invalid configuration");
    }

    let (outbound, rx) = Outbound::channel();
    let events: Arc<dyn EventSink> = Arc::new(outbound.clone());
    let writer = tokio::spawn(write_lines(rx, tokio::io::stdout()));

    let ports = Arc::new(PortAllocator::new(config.port_range()));
    let launcher = Arc::new(CommandLauncher::new(
        config.server_exe_path.clone(),
        config.server_args.clone(),
    ));
    let registry = ProcessRegistry::new(ports, launcher, events.clone());
    let fetcher = Arc::new(
        SteamCmdFetcher::new(config.steamcmd_path.clone(), config.game_app_id.clone())
            .with_timeout(config.fetch_timeout()),
    );
    let store = LocalConfigStore::new(config.config_base_dir.clone());
    let orchestrator = Arc::new(
        Orchestrator::new(registry, fetcher, events, store, config.install_dirs())
            .with_reference_paths(config.reference_paths()),
    );

    let dispatcher = Dispatcher::new(orchestrator.clone(), outbound);
    let stdin = BufReader::new(tokio::io::stdin());

    tokio::select! {
        result = dispatcher.run(stdin) => {
            if let Err(e) = result {
                tracing::error!("❌ Reading requests failed: {}", e);
            } else {
                tracing::info!("Input closed");
            }
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received"),
    }

    tracing::info!("Shutting down, stopping all servers");
    orchestrator.shutdown().await;
    drop(dispatcher);
    drop(orchestrator);

    match tokio::time::timeout(Duration::from_secs(2), writer).await {
        Ok(Ok(Err(e))) => tracing::warn!("Output writer failed: {}", e),
        Ok(Err(e)) => tracing::warn!("Output writer task failed: {}", e),
        Ok(Ok(Ok(()))) => {}
        Err(_) => tracing::debug!("Output writer still busy at exit"),
    }

    tracing::info!("✅ game-supervisor stopped");
    // stdin 的阻塞讀取無法取消，直接結束以免 runtime 關閉時卡住
    std::process::exit(0);
}
