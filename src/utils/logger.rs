use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CRATE_TARGET: &str = "game_supervisor";

/// `RUST_LOG` 優先；否則只輸出本 crate 的紀錄
fn supervisor_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new(format!("{}=debug,info", CRATE_TARGET))
        } else {
            EnvFilter::new(format!("{}=info", CRATE_TARGET))
        }
    })
}

// stdout 保留給 JSON-lines 傳輸，紀錄一律寫到 stderr

pub fn init_cli_logger(verbose: bool) {
    tracing_subscriber::registry()
        .with(supervisor_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

/// 每筆紀錄一行 JSON，`server`、`request_id` 等欄位攤平在最上層方便收集器篩選
pub fn init_json_logger(verbose: bool) {
    tracing_subscriber::registry()
        .with(supervisor_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();
}
