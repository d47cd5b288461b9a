//! Actor implementation for the hybrid loader.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::Collaborators;
use super::commands::{LoaderCommand, LoaderEvent};
use super::core::HybridLoader;
use super::handle::LoaderHandle;
use crate::ShoalError;
use crate::config::ShoalConfig;
use crate::events::EventBus;

/// Far-future placeholder for a disabled pass deadline.
const IDLE_DEADLINE: Duration = Duration::from_secs(3600);

/// Spawns the hybrid loader actor and returns its handle.
///
/// Must be called from within a tokio runtime. The actor processes caller
/// commands, transfer events and timers sequentially, so requests, cache
/// and peers are never shared across tasks.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use std::sync::Arc;
/// use shoal_core::config::ShoalConfig;
/// use shoal_core::loader::{Collaborators, spawn_hybrid_loader};
/// use shoal_core::transport::ReqwestHttpTransport;
///
/// let collaborators = Collaborators::new(Arc::new(ReqwestHttpTransport::new()));
/// let handle = spawn_hybrid_loader(ShoalConfig::default(), collaborators).unwrap();
/// # }
/// ```
///
/// # Errors
///
/// - `ShoalError::Configuration` - Config failed validation
pub fn spawn_hybrid_loader(
    config: ShoalConfig,
    collaborators: Collaborators,
) -> Result<LoaderHandle, ShoalError> {
    config.validate()?;

    let (sender, receiver) = mpsc::channel(100);
    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    let events = EventBus::new();
    let loader = HybridLoader::new(config, collaborators, events.clone(), event_sender);

    tokio::spawn(async move {
        run_actor_loop(loader, receiver, event_receiver).await;
    });

    Ok(LoaderHandle::new(sender, events))
}

/// Runs the main actor message processing loop.
///
/// Besides commands and transfer events, the loop owns two timers: the
/// random HTTP tick and the debounced queue pass. It ends on `Shutdown` or
/// when every handle was dropped.
async fn run_actor_loop(
    mut loader: HybridLoader,
    mut receiver: mpsc::Receiver<LoaderCommand>,
    mut event_receiver: mpsc::UnboundedReceiver<LoaderEvent>,
) {
    tracing::info!(peer = %loader.local_id(), "Hybrid loader actor started");

    let mut random_http = tokio::time::interval(loader.random_http_interval());
    random_http.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = loader.pass_deadline();
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    loader.shutdown().await;
                    break;
                };
                if !handle_command(&mut loader, command).await {
                    break;
                }
            }
            Some(event) = event_receiver.recv() => {
                loader.handle_event(event);
            }
            _ = random_http.tick() => {
                loader.on_random_http_tick();
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + IDLE_DEADLINE)), if deadline.is_some() => {
                loader.process_queue();
            }
        }
    }

    tracing::info!("Hybrid loader actor stopped");
}

/// Handles a single command.
///
/// Returns false when the actor should stop.
async fn handle_command(loader: &mut HybridLoader, command: LoaderCommand) -> bool {
    match command {
        LoaderCommand::LoadSegment { key, responder } => {
            loader.load_segment(key, responder);
        }
        LoaderCommand::AbortSegmentLoading { key, responder } => {
            loader.abort_segment_loading(&key);
            let _ = responder.send(());
        }
        LoaderCommand::UpdatePlayback {
            position,
            rate,
            responder,
        } => {
            loader.update_playback(position, rate);
            let _ = responder.send(());
        }
        LoaderCommand::AddStream { stream, responder } => {
            let _ = responder.send(loader.add_stream(stream));
        }
        LoaderCommand::UpdateStream {
            stream,
            added,
            removed,
            responder,
        } => {
            let _ = responder.send(loader.update_stream(stream, added, removed));
        }
        LoaderCommand::GetStats { responder } => {
            let _ = responder.send(loader.stats());
        }
        LoaderCommand::Shutdown { responder } => {
            loader.shutdown().await;
            let _ = responder.send(());
            return false;
        }
    }
    true
}
