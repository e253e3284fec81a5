use tracing_subscriber::EnvFilter;

/// 默认日志过滤规则，可被 RUST_LOG 覆盖
const DEFAULT_FILTER: &str = "info,reqwest=warn,hyper=warn";

/// 初始化全局日志
///
/// 重复调用时忽略 (测试中可能多次初始化)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
