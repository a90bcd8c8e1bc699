use dotenvy::dotenv;
use sandbox_hub::billing::BillingTokenService;
use sandbox_hub::config::Settings;
use sandbox_hub::hub::{HubDeps, HubRegistry};
use sandbox_hub::sandbox::DockerSandboxProvider;
use sandbox_hub::server::{self, AppState};
use sandbox_hub::session::InMemorySessionStore;
use sandbox_hub::snapshot::{
    ConfigurationCatalog, EmptyConfigurationCatalog, FailureMode, HttpConfigurationCatalog,
};
use sandbox_hub::tools::ToolRegistry;
use sandbox_hub::utils::redact_secrets;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = redact_secrets(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // We return the original buffer length to satisfy the contract,
        // even if the redacted string length differs.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: (self.make_inner)(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    init_logging();

    info!("Starting sandbox hub...");

    let settings = init_settings();
    let store = Arc::new(InMemorySessionStore::new());

    let provider = match DockerSandboxProvider::connect(settings.sandbox_image.clone()).await {
        Ok(p) => {
            info!("Docker sandbox provider initialized.");
            Arc::new(p)
        }
        Err(e) => {
            error!("Failed to initialize sandbox provider: {}", e);
            std::process::exit(1);
        }
    };

    let hub_deps = HubDeps {
        store: store.clone(),
        provider,
        catalog: init_catalog(&settings),
        tools: Arc::new(ToolRegistry::with_builtin_tools()),
        snapshot_logger: None,
        snapshot_failure_mode: FailureMode::Throw,
    };
    info!(tools = ?hub_deps.tools.names(), "Intercepted tools registered.");

    if settings.control_token.is_none() {
        warn!("No control token configured, control routes are disabled.");
    }

    let state = AppState {
        billing: Arc::new(BillingTokenService::new(
            settings.billing_token_secret.as_bytes(),
            store,
        )),
        hubs: Arc::new(HubRegistry::new()),
        hub_deps,
        control_token: settings.control_token.as_deref().map(Arc::from),
        hub_queue_capacity: settings.hub_queue_capacity,
    };

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "Sandbox hub is listening...");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received.");
        })
        .await?;

    Ok(())
}

fn init_logging() {
    let make_writer = RedactingMakeWriter {
        make_inner: io::stderr,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_catalog(settings: &Settings) -> Arc<dyn ConfigurationCatalog> {
    let Some(url) = settings.config_catalog_url.as_deref() else {
        warn!("No configuration catalog configured, snapshots scrub no env files.");
        return Arc::new(EmptyConfigurationCatalog);
    };
    match HttpConfigurationCatalog::new(url, settings.config_catalog_token.clone()) {
        Ok(c) => {
            info!("Configuration catalog client initialized.");
            Arc::new(c)
        }
        Err(e) => {
            error!("Failed to initialize configuration catalog: {}", e);
            std::process::exit(1);
        }
    }
}
