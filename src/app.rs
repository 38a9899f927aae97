use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use gateway_api::{create_app, AppState};
use gateway_config::AppConfig;
use gateway_domain::{CompletionDecision, EventKind, TaskCancelledEvent};
use gateway_infrastructure::{
    handler_fn, metrics::describe_metrics, strip_credentials, Gateway, Inbound, PublisherStats,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};

/// 每个发布者进程内队列的容量
const PUBLISHER_CAPACITY: usize = 256;

/// 主应用程序
pub struct Application {
    config: AppConfig,
    gateway: Gateway,
}

impl Application {
    /// 加载 Schema 并连接消息代理，任一失败则无法启动
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!(
            broker = %strip_credentials(&config.rabbitmq.url),
            schema = %config.api.schema.latest,
            "初始化网关"
        );
        let gateway = Gateway::from_config(&config)
            .await
            .context("初始化网关失败")?;
        Ok(Self { config, gateway })
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// 运行到收到关闭信号为止
    ///
    /// 任务取消订阅或 HTTP 服务器提前退出时，其余组件随之停止，并返回错误。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let prometheus = self.install_prometheus();
        let (stop_tx, _) = broadcast::channel::<()>(1);

        let mut publishers = HashMap::new();
        let mut publisher_tasks: Vec<(EventKind, JoinHandle<PublisherStats>)> = Vec::new();
        for kind in EventKind::ALL {
            let (handle, task) = self
                .gateway
                .spawn_publisher(kind, PUBLISHER_CAPACITY, stop_tx.subscribe())
                .await
                .with_context(|| format!("创建 {kind} 发布者失败"))?;
            publishers.insert(kind, handle);
            publisher_tasks.push((kind, task));
        }

        let mut cancellation_task = self
            .gateway
            .consumer::<TaskCancelledEvent>(Arc::new(handler_fn(
                |inbound: Inbound<TaskCancelledEvent>| async move {
                    info!(
                        job_id = %inbound.event.job_id,
                        redelivered = inbound.meta.redelivered,
                        "任务已取消"
                    );
                    CompletionDecision::Accept
                },
            )))
            .await
            .context("订阅任务取消事件失败")?
            .spawn(stop_tx.subscribe());

        let state = AppState::new(
            self.gateway.clone(),
            publishers,
            self.config.api.schema.clone(),
            prometheus,
        );
        let app = create_app(state);

        let addr = &self.config.http.addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("绑定地址失败: {addr}"))?;
        info!(addr = %addr, "HTTP服务器已启动");

        let mut server_stop = stop_tx.subscribe();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_stop.recv().await;
                    info!("HTTP服务器收到关闭信号");
                })
                .await
        });

        let mut consumer_exit = None;
        let mut server_exit = None;
        tokio::select! {
            _ = shutdown_rx.recv() => info!("收到关闭信号，停止网关组件"),
            outcome = &mut cancellation_task => {
                error!("任务取消订阅提前退出，停止网关");
                consumer_exit = Some(outcome);
            }
            outcome = &mut server => {
                error!("HTTP服务器提前退出，停止网关");
                server_exit = Some(outcome);
            }
        }
        let stopped_early = consumer_exit.is_some() || server_exit.is_some();
        let _ = stop_tx.send(());

        let consumer_outcome = match consumer_exit {
            Some(outcome) => outcome,
            None => cancellation_task.await,
        };
        match consumer_outcome {
            Ok(Ok(stats)) => info!(
                received = stats.received,
                accepted = stats.accepted,
                invalid = stats.invalid,
                "任务取消订阅已停止"
            ),
            Ok(Err(e)) => error!(error = %e, "任务取消订阅异常退出"),
            Err(e) => error!(error = %e, "任务取消订阅任务失败"),
        }

        let server_outcome = match server_exit {
            Some(outcome) => outcome,
            None => server.await,
        };
        match server_outcome {
            Ok(Ok(())) => info!("HTTP服务器已停止"),
            Ok(Err(e)) => error!(error = %e, "HTTP服务器运行失败"),
            Err(e) => error!(error = %e, "HTTP服务器任务失败"),
        }

        for (kind, task) in publisher_tasks {
            if let Err(e) = task.await {
                error!(event = %kind, error = %e, "发布者任务失败");
            }
        }

        self.gateway.shutdown().await.context("关闭网关失败")?;
        if stopped_early {
            bail!("网关组件提前退出");
        }
        Ok(())
    }

    fn install_prometheus(&self) -> Option<PrometheusHandle> {
        if !self.config.prometheus.enabled {
            return None;
        }
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                describe_metrics();
                Some(handle)
            }
            Err(e) => {
                warn!(error = %e, "安装Prometheus导出器失败，/metrics 不可用");
                None
            }
        }
    }
}
