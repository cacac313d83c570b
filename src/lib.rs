//! Schoolsheet Library
//!
//! On-device worksheet generation: hardware probe, engine lifecycle,
//! generation queue and result history.

pub mod export;
pub mod inference;
pub mod queue;
pub mod storage;
pub mod system;
pub mod types;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber; `RUST_LOG` wins over the `schoolsheet=info` default
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "schoolsheet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
