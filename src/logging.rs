use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `-v` turns on debug output for this crate.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let filter = if crate::env::rust_log_set() {
        EnvFilter::from_default_env()
    } else {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new("warn").add_directive(format!("astoria={}", level).parse()?)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .try_init()
        .map_err(|e| anyhow::anyhow!("unable to install log subscriber: {}", e))
}
