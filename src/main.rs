use anyhow::Context;
use chaton_relay::proxy::{AxumServer, GatewayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chaton_relay::logger::init_tracing();

    let mut config = GatewayConfig::from_env().context("加载配置失败")?;
    // 第一个命令行参数覆盖端口
    if let Some(port) = std::env::args().nth(1) {
        config.port = port
            .parse()
            .with_context(|| format!("非法端口参数: {}", port))?;
    }

    let server = AxumServer::new(config).context("初始化网关失败")?;
    let cancel = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到 Ctrl-C，准备退出");
            cancel.cancel();
        }
    });

    server.start().await
}
