//! Negotiation engine backed by the `webrtc` crate.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_remote::TrackRemote;

use crate::error::EngineError;
use crate::logger::dump_selected_pair;
use crate::media::{LocalTrack, MediaKind, RemoteTrack};
use crate::peer::engine::{EngineEvent, EngineEvents, NegotiationEngine, PeerLink};
use crate::peer::types::{
    CandidateType, ConnectionState, IceCandidate, IceServerKind, MediaCounters, RawStats,
    SdpKind, ServerConfig, SessionDescription,
};
use crate::signaling::PeerId;
use crate::utils::add_ice_url_scheme;

/// Builds peer connections with the default codecs and interceptors.
pub struct RtcEngine {
    api: API,
    candidate_pool_size: u8,
}

impl RtcEngine {
    pub fn new(candidate_pool_size: u8) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            candidate_pool_size,
        })
    }
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    async fn create_peer(
        &self,
        peer: &PeerId,
        ice_servers: &[ServerConfig],
        events: EngineEvents,
    ) -> Result<Arc<dyn PeerLink>, EngineError> {
        let config = rtc_config(ice_servers, self.candidate_pool_size);
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        attach_handlers(&pc, peer, events);
        debug!(peer = %peer, "peer connection created");
        let link: Arc<dyn PeerLink> = Arc::new(RtcLink { pc });
        Ok(link)
    }
}

fn rtc_config(servers: &[ServerConfig], candidate_pool_size: u8) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Maps configured servers onto the engine's ICE server list.
pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn attach_handlers(pc: &Arc<RTCPeerConnection>, peer: &PeerId, events: EngineEvents) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        match candidate {
            Some(c) => match c.to_json() {
                Ok(init) => candidate_events.emit(EngineEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => warn!(error = %e, "could not serialize local candidate"),
            },
            // end of candidates
            None => candidate_events.emit(EngineEvent::GatheringComplete),
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        debug!(?state, "ICE gathering state changed");
        Box::pin(async {})
    }));

    let state_events = events.clone();
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    let peer_id = peer.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!(peer = %peer_id, state = ?st, "peer connection state");
        if matches!(
            st,
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
        ) {
            if let Some(pc) = weak.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        state_events.emit(EngineEvent::StateChanged(connection_state(st)));
        Box::pin(async {})
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            match MediaKind::from_codec_type(track.kind()) {
                Some(kind) => events.emit(EngineEvent::RemoteTrack(RemoteTrack {
                    kind,
                    id: track.id(),
                    stream_id: track.stream_id(),
                    handle: Some(track),
                })),
                None => warn!("remote track of unspecified kind ignored"),
            }
            Box::pin(async {})
        },
    ));
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Checking,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        other => return Err(EngineError::UnsupportedDescription(other.to_string())),
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

struct RtcLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), EngineError> {
        let sender = self.pc.add_track(track.track.clone()).await?;
        // RTCP has to be drained for interceptors like NACK to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        from_rtc(self.pc.create_offer(options).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn stats(&self) -> RawStats {
        let report = self.pc.get_stats().await;
        collect_stats(report.reports.into_values().filter_map(MediaReport::from_report))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc.close().await?;
        Ok(())
    }
}

/// The part of one engine stats report that feeds [`RawStats`]
#[derive(Debug, Clone, PartialEq)]
enum MediaReport {
    Inbound {
        kind: String,
        bytes_received: u64,
    },
    Outbound {
        kind: String,
        bytes_sent: u64,
    },
    /// The peer's view of our outbound stream. Loss and receive counts both
    /// come from here so the ratio describes a single direction.
    RemoteInbound {
        kind: String,
        packets_received: u64,
        packets_lost: u64,
    },
    SucceededPair {
        nominated: bool,
        round_trip_secs: f64,
    },
}

impl MediaReport {
    fn from_report(report: StatsReportType) -> Option<Self> {
        match report {
            StatsReportType::InboundRTP(inbound) => Some(Self::Inbound {
                kind: inbound.kind,
                bytes_received: inbound.bytes_received,
            }),
            StatsReportType::OutboundRTP(outbound) => Some(Self::Outbound {
                kind: outbound.kind,
                bytes_sent: outbound.bytes_sent,
            }),
            StatsReportType::RemoteInboundRTP(remote) => Some(Self::RemoteInbound {
                kind: remote.kind,
                packets_received: remote.packets_received,
                packets_lost: remote.packets_lost.max(0) as u64,
            }),
            StatsReportType::CandidatePair(pair) if pair.state == CandidatePairState::Succeeded => {
                Some(Self::SucceededPair {
                    nominated: pair.nominated,
                    round_trip_secs: pair.current_round_trip_time,
                })
            }
            _ => None,
        }
    }
}

// A nominated succeeded pair wins over any other succeeded pair.
fn collect_stats(reports: impl IntoIterator<Item = MediaReport>) -> RawStats {
    let mut raw = RawStats::default();
    let mut rtt_from_nominated = false;
    for report in reports {
        match report {
            MediaReport::Inbound {
                kind,
                bytes_received,
            } => counters_for(&mut raw, &kind).bytes_received += bytes_received,
            MediaReport::Outbound { kind, bytes_sent } => {
                counters_for(&mut raw, &kind).bytes_sent += bytes_sent
            }
            MediaReport::RemoteInbound {
                kind,
                packets_received,
                packets_lost,
            } => {
                let counters = counters_for(&mut raw, &kind);
                counters.packets_received += packets_received;
                counters.packets_lost += packets_lost;
            }
            MediaReport::SucceededPair {
                nominated,
                round_trip_secs,
            } => {
                if nominated || !rtt_from_nominated {
                    raw.round_trip_time_ms = Some(round_trip_secs * 1000.0);
                    rtt_from_nominated |= nominated;
                }
            }
        }
    }
    raw
}

fn counters_for<'a>(raw: &'a mut RawStats, kind: &str) -> &'a mut MediaCounters {
    match kind {
        "video" => raw.video.get_or_insert_with(MediaCounters::default),
        _ => raw.audio.get_or_insert_with(MediaCounters::default),
    }
}

/// Checks that a single STUN or TURN server answers.
///
/// Gathers candidates against `config` only and reports whether a
/// server-reflexive (STUN) or relay (TURN) candidate shows up in time.
pub async fn probe_ice_server(config: &ServerConfig, wait: Duration) -> Result<bool, EngineError> {
    let expected = match config.kind {
        IceServerKind::Stun => CandidateType::Srflx,
        IceServerKind::Turn => CandidateType::Relay,
    };
    info!(server = %config.id, url = %add_ice_url_scheme(config), "probing ICE server");

    let api = APIBuilder::new().build();
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers: ice_servers(std::slice::from_ref(config)),
            ..Default::default()
        })
        .await?,
    );

    let (tx, mut rx) = mpsc::channel::<()>(1);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(c) = candidate else {
                debug!("probe gathering complete");
                return;
            };
            if let Ok(init) = c.to_json() {
                if CandidateType::from_candidate_line(&init.candidate) == expected {
                    let _ = tx.try_send(());
                }
            }
        })
    }));

    // a data channel gives the offer something to gather for
    pc.create_data_channel("probe", None).await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;

    let found = matches!(timeout(wait, rx.recv()).await, Ok(Some(())));
    if found {
        info!(server = %config.id, "ICE server reachable");
    } else {
        warn!(server = %config.id, "no {} candidate from ICE server", expected.as_str());
    }
    if let Err(e) = pc.close().await {
        debug!(error = %e, "closing probe connection failed");
    }
    Ok(found)
}
