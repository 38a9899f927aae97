use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use clustercode_gateway::app::Application;
use clustercode_gateway::logging::init_logging;
use clustercode_gateway::shutdown::{self, ShutdownManager};
use gateway_config::AppConfig;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Clustercode 事件中继网关")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时查找当前目录下的 defaults.* 与 config.*"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("覆盖 log.level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("覆盖 log.formatter")
                .value_parser(["json", "text", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);

    // 先加载配置，日志格式由配置决定
    let mut config = AppConfig::load(config_path.as_deref()).context("加载配置失败")?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.log.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.log.formatter = format.clone();
    }

    init_logging(&config.log)?;
    info!(version = env!("CARGO_PKG_VERSION"), "启动 Clustercode 网关");
    if let Some(path) = &config_path {
        info!(path = %path.display(), "使用配置文件");
    }

    let app = match Application::new(config).await {
        Ok(app) => Arc::new(app),
        Err(e) => {
            error!(error = %format!("{e:#}"), "网关启动失败");
            return Err(e);
        }
    };
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = shutdown::wait_for_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown().await;
        }
        result = &mut app_handle => {
            // 服务在没有关闭信号的情况下退出，一般是端口绑定失败
            let result = match result {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("应用任务失败: {e}")),
            };
            if let Err(e) = &result {
                error!(error = %format!("{e:#}"), "网关异常退出");
            }
            return result;
        }
    }

    // 发布者需要时间发完剩余事件
    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(Ok(()))) => info!("网关已优雅关闭"),
        Ok(Ok(Err(e))) => error!(error = %format!("{e:#}"), "网关关闭时发生错误"),
        Ok(Err(e)) => error!(error = %e, "应用任务失败"),
        Err(_) => warn!("网关关闭超时，强制退出"),
    }

    Ok(())
}
