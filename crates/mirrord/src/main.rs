use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod mode;
mod telemetry;

use config::Config;
use dbus_interface::MirrorService;
use mode::{CancelToken, Mode, ModeFlag};
use telemetry::{TelemetrySink, TracingSink, WatchSink};

const BUS_NAME: &str = "org.freedesktop.Mirror1";
const OBJECT_PATH: &str = "/org/freedesktop/Mirror1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("mirrord starting");

    let config = Config::load()?;
    let mode = ModeFlag::new(Mode::Detect);
    let cancel = CancelToken::new();

    let (watch_sink, latest) = WatchSink::channel();
    let sinks: Vec<Box<dyn TelemetrySink + Send>> = vec![Box::new(TracingSink), Box::new(watch_sink)];

    let engine = engine::spawn_engine(&config, &mode, cancel.clone(), Box::new(sinks))?;

    let service = MirrorService {
        mode: mode.clone(),
        latest,
    };
    // Keep the connection alive for as long as the daemon runs.
    let _connection = match zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
    {
        Ok(conn) => {
            tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");
            Some(conn)
        }
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus unavailable; host control disabled");
            None
        }
    };

    tracing::info!("mirrord ready");

    let mut done = engine.done;
    let result = tokio::select! {
        result = &mut done => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received; stopping capture loop");
            cancel.cancel();
            done.await
        }
    };

    match result {
        Ok(Ok(exit)) => {
            tracing::info!(?exit, mode = %mode.get(), "mirrord shutting down");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("engine thread exited without reporting"),
    }
}
