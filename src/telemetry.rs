use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the process-wide tracing subscriber.
///
/// Verbosity follows `RUST_LOG` when set and defaults to `info`. Structured
/// fields on the custody paths (agent id, tool name, tx hash, run outcome)
/// make the plain fmt output greppable; export backends are a deployment
/// concern layered outside this crate.
pub struct Telemetry {
    name: &'static str,
    version: &'static str,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            name: "custodian",
            version: "unknown",
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = version;
        self
    }

    /// Registers the subscriber globally. Call once, from `main`.
    pub fn register(self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
        tracing::info!(service = self.name, version = self.version, "telemetry initialized");
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
