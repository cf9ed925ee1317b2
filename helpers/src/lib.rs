/// Initialize logging for a demo or a test binary.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging() {
    use tracing_subscriber::prelude::*;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .compact(),
        )
        .try_init();
}
