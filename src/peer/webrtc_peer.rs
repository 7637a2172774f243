//! WebRTC Peer Connection (webrtc-rs)
//!
//! Erstellt RTCPeerConnections mit Opus-Track und Control-Data-Channel
//! und übersetzt deren Callbacks in [`PeerEvent`]s.
//!
//! Ein Sender-Task kodiert die 20ms Frames des lokalen Streams nach Opus und
//! schreibt sie als Samples in den Track; empfangene RTP-Payloads werden
//! dekodiert und im [`RemoteStream`] veröffentlicht.

use super::{
    IceCandidate, PeerConnection, PeerError, PeerEvent, PeerFactory, PeerState, SdpKind,
    SessionDescription, StatsSnapshot,
};
use crate::config::IceServerConfig;
use crate::media::{
    resample_linear, AudioFrame, AudioTrack, FrameDecoder, FrameEncoder, LocalStream,
    RemoteStream, RemoteTrackInfo, SAMPLE_RATE,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::media::Sample;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Label des Control-Data-Channels (Digits, App-Daten)
const CONTROL_CHANNEL: &str = "control";

/// Dauer eines Opus-Pakets
const PACKET_DURATION: Duration = Duration::from_millis(20);

fn webrtc_err(e: impl std::fmt::Display) -> PeerError {
    PeerError::WebRTC(e.to_string())
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: None,
            credential: None,
        },
    ]
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt webrtc-rs Peer Connections mit den konfigurierten STUN/TURN Servern
#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
    loopback_candidates: bool,
}

impl WebRtcPeerFactory {
    pub fn new(servers: &[IceServerConfig]) -> Self {
        let ice_servers = servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Self {
            ice_servers,
            loopback_candidates: false,
        }
    }

    /// Auch 127.0.0.1 als Host-Candidate anbieten (lokale Gegenstellen)
    pub fn with_loopback_candidates(mut self) -> Self {
        self.loopback_candidates = true;
        self
    }
}

impl Default for WebRtcPeerFactory {
    fn default() -> Self {
        Self::new(&default_ice_servers())
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        // Media Engine mit Opus konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let mut settings = SettingEngine::default();
        if self.loopback_candidates {
            settings.set_include_loopback_candidate(true);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        let peer = WebRtcPeer {
            pc,
            data_channel: Arc::new(Mutex::new(None)),
            sender: Mutex::new(None),
            events,
        };
        peer.setup_handlers();

        Ok(Arc::new(peer))
    }
}

// ============================================================================
// PEER
// ============================================================================

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    /// Kodiert lokale Frames in den Audio-Track
    sender: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl WebRtcPeer {
    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(&self) {
        // Connection State Handler
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);

                let state = match s {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
                    RTCPeerConnectionState::Connecting => PeerState::Connecting,
                    RTCPeerConnectionState::Connected => PeerState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerState::Failed,
                    RTCPeerConnectionState::Closed => PeerState::Closed,
                };
                let _ = events.send(PeerEvent::ConnectionState(state));

                Box::pin(async {})
            }));

        // ICE Candidate Handler (None = Sammlung abgeschlossen)
        let events = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            match candidate {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                },
                None => {
                    let _ = events.send(PeerEvent::GatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (für eingehendes Audio)
        let events = self.events.clone();
        self.pc.on_track(Box::new(move |track, _, _| {
            let info = RemoteTrackInfo {
                track_id: track.id(),
                stream_id: track.stream_id(),
                mime_type: track.codec().capability.mime_type,
            };
            tracing::info!("Received track: {} ({})", info.track_id, info.mime_type);
            let remote = RemoteStream::new(info);
            let _ = events.send(PeerEvent::RemoteTrack(remote.clone()));

            Box::pin(receive_audio(track, remote))
        }));

        // Control-Channel vom Anrufer
        let events = self.events.clone();
        let slot = Arc::clone(&self.data_channel);
        self.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            if channel.label() == CONTROL_CHANNEL {
                register_channel(&channel, events.clone());
                *slot.lock() = Some(channel);
            }
            Box::pin(async {})
        }));
    }

    async fn ensure_control_channel(&self) -> Result<(), PeerError> {
        if self.data_channel.lock().is_some() {
            return Ok(());
        }

        let channel = self
            .pc
            .create_data_channel(CONTROL_CHANNEL, None)
            .await
            .map_err(webrtc_err)?;
        register_channel(&channel, self.events.clone());
        *self.data_channel.lock() = Some(channel);
        Ok(())
    }
}

/// Liest RTP bis der Track endet und veröffentlicht die dekodierten Frames
async fn receive_audio(track: Arc<TrackRemote>, remote: RemoteStream) {
    let mut decoder = match FrameDecoder::new() {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::error!("Remote audio not decodable: {}", e);
            // RTP trotzdem abholen, sonst staut sich der Track
            while track.read_rtp().await.is_ok() {}
            return;
        }
    };

    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.payload.is_empty() {
            continue;
        }
        if let Some(samples) = decoder.decode_or_conceal(&packet.payload) {
            remote.audio.publish(AudioFrame::new(samples, SAMPLE_RATE));
        }
    }
    tracing::info!("Remote track {} ended", remote.info.track_id);
}

/// Kodiert die Frames des lokalen Streams und schreibt sie in den Track.
///
/// Ein stummer Track sendet Stille, damit der Empfänger im Takt bleibt.
fn spawn_sender(
    track: Arc<TrackLocalStaticSample>,
    stream: &LocalStream,
) -> Result<JoinHandle<()>, PeerError> {
    let mut encoder = FrameEncoder::new().map_err(|e| PeerError::Codec(e.to_string()))?;
    let mut frames = stream.audio().subscribe();
    let source: Option<AudioTrack> = stream.first_audio_track().cloned();

    Ok(tokio::spawn(async move {
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Audio sender dropped {} frames", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let muted = source.as_ref().map(|t| !t.is_enabled()).unwrap_or(false);
            let samples = if muted {
                vec![0.0; frame.samples.len()]
            } else {
                resample_linear(&frame.samples, frame.sample_rate, SAMPLE_RATE)
            };

            let packets = match encoder.push(&samples) {
                Ok(packets) => packets,
                Err(e) => {
                    tracing::warn!("Opus encode error: {}", e);
                    continue;
                }
            };
            for data in packets {
                let sample = Sample {
                    data,
                    duration: PACKET_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    tracing::debug!("Failed to write audio sample: {}", e);
                }
            }
        }
    }))
}

fn register_channel(channel: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = events.send(PeerEvent::Data(msg.data));
        Box::pin(async {})
    }));
}

fn to_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        other => return Err(PeerError::InvalidSdp(format!("unsupported type {:?}", other))),
    };
    Ok(SessionDescription { kind, sdp: desc.sdp })
}

fn from_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
    };
    parsed.map_err(|e| PeerError::InvalidSdp(e.to_string()))
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_audio(&self, stream: &LocalStream) -> Result<(), PeerError> {
        let track_id = stream
            .first_audio_track()
            .map(|t| t.id().to_string())
            .unwrap_or_else(|| "audio".to_string());

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            track_id,
            stream.id().to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        let sender = spawn_sender(audio_track, stream)?;
        if let Some(previous) = self.sender.lock().replace(sender) {
            previous.abort();
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        self.ensure_control_channel().await?;

        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(webrtc_err)?;
        to_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        to_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(from_description(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(from_description(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    async fn stats(&self) -> Result<StatsSnapshot, PeerError> {
        let report = self.pc.get_stats().await;
        let mut snapshot = StatsSnapshot::default();

        for stats in report.reports.values() {
            match stats {
                // Nominiertes Paar = aktive Verbindung
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    snapshot.bytes_sent = pair.bytes_sent as u64;
                    snapshot.bytes_received = pair.bytes_received as u64;
                    snapshot.packets_received = pair.packets_received as u64;
                    snapshot.round_trip_time_ms = Some(pair.current_round_trip_time * 1000.0);
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    snapshot.packets_lost += remote.packets_lost.max(0) as u64;
                }
                _ => {}
            }
        }

        Ok(snapshot)
    }

    async fn send_data(&self, data: Bytes) -> Result<(), PeerError> {
        let channel = self
            .data_channel
            .lock()
            .clone()
            .ok_or(PeerError::DataChannelUnavailable)?;
        channel.send(&data).await.map_err(webrtc_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Some(sender) = self.sender.lock().take() {
            sender.abort();
        }
        self.pc.close().await.map_err(webrtc_err)
    }
}

// ============================================================================
// TESTS
// ============================================================================
