//! Tracing setup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies to this
/// process with quieter defaults for `sqlx` and `tower_http`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("{level},sqlx=warn,tower_http=info"))
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,tower_http=info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_applied() {
        assert!(default_filter("debug").to_string().contains("debug"));
    }
}
