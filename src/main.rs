//! Headless-Client: verbindet mit dem Relay und ruft an oder nimmt an.
//!
//! `pulse-call <eigene-id> [ziel-id]`

use anyhow::{Context, Result};
use call_core::media::{CaptureDevice, CpalCapture, CpalPlayback, NullCapture};
use call_core::monitor::BackoffPolicy;
use call_core::peer::WebRtcPeerFactory;
use call_core::signaling::WebSocketTransport;
use call_core::{logging, CallConfig, CallEvent, CallOrchestrator};
use cpal::traits::HostTrait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let mut args = std::env::args().skip(1);
    let local_id = args
        .next()
        .context("usage: pulse-call <local-id> [target-id]")?;
    let target = args.next();

    let config = CallConfig::from_env().context("invalid configuration")?;
    let retry = BackoffPolicy::from(&config.monitor_config());
    let transport = WebSocketTransport::connect_with_retry(&config.signaling_url, retry)
        .await
        .context("signaling relay unreachable")?;

    let capture: Arc<dyn CaptureDevice> = if cpal::default_host().default_input_device().is_some() {
        Arc::new(CpalCapture)
    } else {
        tracing::warn!("No microphone found, sending silence");
        Arc::new(NullCapture)
    };
    let factory = Arc::new(WebRtcPeerFactory::new(&config.ice_servers));

    let has_speaker = cpal::default_host().default_output_device().is_some();
    let orchestrator = CallOrchestrator::new(config, capture, factory);
    if has_speaker {
        orchestrator.set_playback(Arc::new(CpalPlayback));
    } else {
        tracing::warn!("No speaker found, remote audio is not played");
    }
    orchestrator
        .initialize(Arc::new(transport), &local_id)
        .await?;

    let mut events = orchestrator.subscribe();
    let handle = orchestrator.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::IncomingCall(call)) => {
                    tracing::info!("Auto-accepting call from {}", call.caller_id);
                    if let Err(e) = handle.accept_call(call).await {
                        tracing::error!("Failed to accept call: {}", e);
                    }
                }
                Ok(CallEvent::StateChange(state)) => tracing::info!("Call state: {}", state),
                Ok(CallEvent::CallEnd(session)) => tracing::info!(
                    "Call {} ended after {:?}",
                    session.session_id,
                    session.ended_at.map(|end| end - session.started_at)
                ),
                Ok(CallEvent::Error(report)) => {
                    tracing::warn!("{}: {}", report.kind, report.message)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} call events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(target) = target {
        let session_id = orchestrator.make_call(&target).await?;
        tracing::info!("Calling {} (session {})", target, session_id);
    } else {
        tracing::info!("Waiting for calls as {}", local_id);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    if let Err(e) = orchestrator.hangup().await {
        tracing::debug!("Nothing to hang up: {}", e);
    }
    orchestrator.dispose().await;
    Ok(())
}
