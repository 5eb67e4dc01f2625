//! Scripted call against the loopback media service.
//!
//! Reads its configuration from `CALLROOM_*` environment variables and
//! prints every call event as one JSON line on stdout.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use callroom_core::loopback::LoopbackService;
use callroom_core::{CallConfig, CallEvent, CallEventListener, CallView, TrackKind};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "callroom_core=debug,callroom_demo=info";

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Prints call events for whatever host UI would consume them.
struct JsonPrinter;

impl CallEventListener for JsonPrinter {
    fn on_event(&self, event: CallEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!("failed to serialize event {event:?}: {e}"),
        }
    }
}

async fn pause() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match CallConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(room = %config.settings.room_name, "starting call");

    let service = LoopbackService::new();
    let room = service.room(&config.settings.room_name);
    let view = CallView::from_config(service.clone(), &config);
    view.add_listener(Arc::new(JsonPrinter));

    if let Err(e) = view.start().await {
        tracing::error!("call did not start: {e}");
        return ExitCode::FAILURE;
    }

    let guest = room.join("guest");
    let (_, camera) = room.publish(&guest, TrackKind::Video, "camera");
    room.publish_subscribed(&guest, TrackKind::Audio, "microphone");
    pause().await;

    room.subscribe(&guest, &camera);
    pause().await;
    tracing::info!(
        remote = view.remote_elements().await.len(),
        local = view.local_elements().await.len(),
        "guest on screen"
    );

    room.leave(&guest);
    pause().await;

    view.leave().await;
    tracing::info!("call finished in state {:?}", view.state().await);
    ExitCode::SUCCESS
}
