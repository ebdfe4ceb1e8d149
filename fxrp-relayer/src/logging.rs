//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "fxrp_relayer=info,fxrp_engine=info,fxrp_fdc=info";
const FORMAT_ENV: &str = "FXRP_LOG_FORMAT";

/// Install the global subscriber. `RUST_LOG` overrides the default filter;
/// `FXRP_LOG_FORMAT=json` switches to one JSON object per line.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var(FORMAT_ENV).map_or(false, |format| format.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // A subscriber installed earlier (tests) wins.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
