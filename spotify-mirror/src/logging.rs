use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "spotify_mirror=info,spotify_core=info";
const VERBOSE_FILTER: &str = "spotify_mirror=debug,spotify_core=debug";

/// Filter directives in effect: `RUST_LOG` when set, otherwise the default for
/// the requested verbosity.
pub fn filter_directives(verbose: bool, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim).filter(|value| !value.is_empty()) {
        Some(custom) => custom.to_string(),
        None if verbose => VERBOSE_FILTER.to_string(),
        None => DEFAULT_FILTER.to_string(),
    }
}

/// Installs a compact stderr subscriber. Stdout is left to command output.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = EnvFilter::try_new(filter_directives(verbose, rust_log.as_deref()))
        .map_err(|err| anyhow::anyhow!("invalid log filter: {err}"))?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(verbose)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logging: {err}"))
}
