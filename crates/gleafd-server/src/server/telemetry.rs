use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber at the configured level.
///
/// `fatal` has no tracing equivalent and collapses into `error`. An
/// explicit `RUST_LOG` still wins, matching tracing convention.
pub fn init(level: &str) -> anyhow::Result<()> {
    let directive = match level {
        "fatal" => "error",
        other => other,
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
