use std::sync::Once;

use log::LevelFilter;
use logforth::diagnostic::ThreadLocalDiagnostic;

const FILTER_ENV: &str = "MEDIAFLOW_RDMA_LOG";
const DEFAULT_FILTER: &str = "info,mediaflow_rdma=debug";

static INIT: Once = Once::new();

/// Installs a stderr logger unless the host application already set one up.
pub fn ensure_initialized() {
    if log::max_level() != LevelFilter::Off {
        return;
    }

    INIT.call_once(|| {
        let filter_str = std::env::var(FILTER_ENV)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string());
        let filter: logforth::filter::EnvFilter = filter_str
            .parse()
            .unwrap_or_else(|_| DEFAULT_FILTER.into());

        logforth::starter_log::builder()
            .dispatch(|d| {
                d.filter(filter)
                    .diagnostic(ThreadLocalDiagnostic::default())
                    .append(logforth::append::Stderr::default())
            })
            .apply();
    });
}
