//! Peer connection capability backed by the `webrtc` crate

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ConnectivityState, DataChannel, PeerConfig, PeerEvent, PeerEventSink, PeerFactory, PeerHandle,
};
use crate::error::{NegotiationError, Result};
use crate::signaling::{IceCandidate, IceServer, SdpType, SessionDescription};

/// Creates `webrtc` peer connections
#[derive(Debug, Clone, Default)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, config: PeerConfig, sink: PeerEventSink) -> Result<Arc<dyn PeerHandle>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Peer(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            NegotiationError::Peer(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            NegotiationError::Peer(format!("Failed to create peer connection: {}", e))
        })?;

        let handle = RtcPeerHandle {
            pc: Arc::new(pc),
            sink,
        };
        handle.setup_event_handlers();
        info!(
            "Peer connection created (generation {})",
            handle.sink.generation()
        );

        Ok(Arc::new(handle))
    }
}

/// `webrtc` peer connection wrapper
pub struct RtcPeerHandle {
    pc: Arc<RTCPeerConnection>,
    sink: PeerEventSink,
}

impl RtcPeerHandle {
    fn setup_event_handlers(&self) {
        let sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();

                Box::pin(async move {
                    // None marks the end of gathering
                    let Some(c) = candidate else {
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            debug!("Local ICE candidate: {}", init.candidate);
                            sink.emit(PeerEvent::LocalCandidate(from_rtc_candidate(init)));
                        }
                        Err(e) => debug!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let sink = self.sink.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let sink = sink.clone();

                Box::pin(async move {
                    if let Some(state) = from_rtc_ice_state(state) {
                        debug!("ICE connection state: {}", state);
                        sink.emit(PeerEvent::Connectivity(state));
                    }
                })
            }));

        let sink = self.sink.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let sink = sink.clone();

                Box::pin(async move {
                    info!("Remote data channel announced: {}", dc.label());
                    wire_data_channel(&dc, &sink);
                    sink.emit(PeerEvent::RemoteChannel(Arc::new(RtcDataChannel { dc })));
                })
            }));
    }
}

#[async_trait]
impl PeerHandle for RtcPeerHandle {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self.pc.create_data_channel(label, None).await.map_err(|e| {
            NegotiationError::Peer(format!("Failed to create data channel: {}", e))
        })?;

        wire_data_channel(&dc, &self.sink);
        info!("Data channel '{}' created", label);

        Ok(Arc::new(RtcDataChannel { dc }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Peer(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Peer(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(description)?;
        self.pc.set_local_description(desc).await.map_err(|e| {
            NegotiationError::Peer(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(description)?;
        self.pc.set_remote_description(desc).await.map_err(|e| {
            NegotiationError::Peer(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc.add_ice_candidate(init).await.map_err(|e| {
            NegotiationError::CandidateApplicationFailed(format!("Failed to add ICE candidate: {}", e))
        })
    }

    async fn restart_ice(&self) -> Result<Option<SessionDescription>> {
        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(|e| {
            NegotiationError::Peer(format!("Failed to create ICE restart offer: {}", e))
        })?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                NegotiationError::Peer(format!("Failed to apply ICE restart offer: {}", e))
            })?;

        from_rtc_description(&offer).map(Some)
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| NegotiationError::Peer(format!("Failed to close peer connection: {}", e)))
    }
}

/// `webrtc` data channel wrapper
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| NegotiationError::Peer(format!("Failed to send message: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| NegotiationError::Peer(format!("Failed to close data channel: {}", e)))
    }
}

/// Forward open/message/close callbacks of `dc` into `sink`
fn wire_data_channel(dc: &Arc<RTCDataChannel>, sink: &PeerEventSink) {
    let sink_open = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = sink_open.clone();
        Box::pin(async move {
            sink.emit(PeerEvent::ChannelOpened);
        })
    }));

    let sink_message = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = sink_message.clone();
        Box::pin(async move {
            if !msg.is_string {
                debug!("Binary data channel message: {} bytes", msg.data.len());
            }
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            sink.emit(PeerEvent::ChannelMessage(text));
        })
    }));

    let sink_close = sink.clone();
    dc.on_close(Box::new(move || {
        let sink = sink_close.clone();
        Box::pin(async move {
            sink.emit(PeerEvent::ChannelClosed);
        })
    }));
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(NegotiationError::Peer(
                "Rollback descriptions are not supported".to_string(),
            ))
        }
    };
    result.map_err(|e| NegotiationError::Peer(format!("Invalid SDP: {}", e)))
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::Peer(
                "Session description has no type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_ice_state(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    let state = match state {
        RTCIceConnectionState::New => ConnectivityState::New,
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
        _ => return None,
    };
    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(
            from_rtc_ice_state(RTCIceConnectionState::Failed),
            Some(ConnectivityState::Failed)
        );
        assert_eq!(from_rtc_ice_state(RTCIceConnectionState::Unspecified), None);
    }

    #[test]
    fn test_rollback_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(desc).is_err());
    }

    #[test]
    fn test_ice_server_conversion() {
        let server = IceServer::with_credentials(
            vec!["turn:turn.example.com:3478".to_string()],
            "user",
            "secret",
        );
        let rtc = to_rtc_ice_server(&server);
        assert_eq!(rtc.urls, server.urls);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "secret");
    }

    #[tokio::test]
    async fn test_offer_contains_data_channel() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = RtcPeerFactory::new()
            .create(PeerConfig::default(), PeerEventSink::new(1, tx))
            .await
            .unwrap();
        handle.create_data_channel("chat").await.unwrap();

        let offer = handle.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=application"));

        handle.set_local_description(offer).await.unwrap();
        handle.close().await.unwrap();
    }
}
