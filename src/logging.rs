use tracing_subscriber::{fmt, layer::SubscriberExt as _, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false),
    );

    // Ignore the error so tests can call init() more than once.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
