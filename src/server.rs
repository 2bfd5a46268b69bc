//! Relay server (C8): accepts logins, negotiates a secure channel per
//! entity, and relays audio/control packets between visible peers.
//!
//! Grounded on the teacher's `ServerState`/`DashMap<SocketAddr, ClientInfo>`
//! client table and its `control_loop`/`audio_multicast_loop` split, folded
//! into one async poll loop over a single [`crate::transport::Transport`]
//! since delivery-class reliability is an external transport library's job
//! here rather than a second TCP control socket.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{
    AcceptResponseBody, DenyResponseBody, EncryptedEnvelopeBody, EntityCreatedBody,
    EntityDestroyedBody, InfoRequestBody, InfoResponseBody, LoginRequestBody, Packet,
    SetEntityVisibilityBody,
};
use crate::config::{ProtocolVersion, ServerProperties};
use crate::error::{ProtocolError, SecurityError};
use crate::security::SecuritySession;
use crate::stats::NetworkStats;
use crate::transport::{DeliveryClass, Transport};

/// One connected peer. Visibility is modelled as a set of entity ids this
/// entity can currently hear; audio from a non-visible entity is dropped.
pub struct Entity {
    pub id: i32,
    pub addr: SocketAddr,
    pub user_id: String,
    pub security: Mutex<SecuritySession>,
    pub stats: NetworkStats,
    pub muted: AtomicBool,
    pub deafened: AtomicBool,
    pub visible_to_me: Mutex<HashSet<i32>>,
    pub last_seen: Mutex<Instant>,
    pub position: Mutex<Option<[f32; 3]>>,
    pub rotation: Mutex<Option<[f32; 2]>>,
}

/// Entity registry plus address lookup, generalized from the teacher's
/// `DashMap<SocketAddr, ClientInfo>` into an id-indexed table so relaying
/// and visibility bookkeeping can key off stable entity ids rather than
/// transport addresses.
pub struct RelayServer {
    properties: ServerProperties,
    entities: DashMap<i32, Arc<Entity>>,
    by_addr: DashMap<SocketAddr, i32>,
    next_id: AtomicI32,
    running: AtomicBool,
}

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

impl RelayServer {
    pub fn new(properties: ServerProperties) -> Arc<Self> {
        Arc::new(Self {
            properties,
            entities: DashMap::new(),
            by_addr: DashMap::new(),
            next_id: AtomicI32::new(1),
            running: AtomicBool::new(true),
        })
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Drive the server's receive loop until [`RelayServer::stop`] is called.
    pub async fn run(self: Arc<Self>, transport: Arc<dyn Transport>) {
        let mut buf = vec![0u8; 65536];
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let recv = tokio::time::timeout(Duration::from_millis(500), transport.recv_from(&mut buf)).await;
            match recv {
                Ok(Ok((n, src))) => {
                    self.handle_datagram(&transport, src, &buf[..n]).await;
                }
                Ok(Err(e)) => warn!(error = %e, "transport recv failed"),
                Err(_) => {}
            }
            self.reap_stale_entities();
        }
    }

    fn reap_stale_entities(&self) {
        let now = Instant::now();
        let stale: Vec<i32> = self
            .entities
            .iter()
            .filter(|e| now.duration_since(*e.last_seen.lock()) > CLIENT_TIMEOUT)
            .map(|e| e.id)
            .collect();
        for id in stale {
            self.remove_entity(id);
        }
    }

    fn remove_entity(&self, id: i32) {
        if let Some((_, entity)) = self.entities.remove(&id) {
            self.by_addr.remove(&entity.addr);
            info!(entity_id = id, "entity disconnected");
        }
    }

    async fn handle_datagram(&self, transport: &Arc<dyn Transport>, src: SocketAddr, raw: &[u8]) {
        let packet = match Packet::decode(raw) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, %src, "dropping malformed frame");
                return;
            }
        };

        match packet {
            Packet::InfoRequest(body) => self.handle_info_request(transport, src, body).await,
            Packet::LoginRequest(body) => self.handle_login(transport, src, body).await,
            Packet::EncryptedEnvelope(body) => self.handle_envelope(transport, src, body).await,
            other => debug!(?other, %src, "unexpected unencrypted packet, dropping"),
        }
    }

    async fn handle_info_request(&self, transport: &Arc<dyn Transport>, src: SocketAddr, body: InfoRequestBody) {
        let resp = Packet::InfoResponse(InfoResponseBody {
            request_id: body.request_id,
            motd: self.properties.motd.clone(),
            version: ProtocolVersion::CURRENT,
            connected_clients: self.entities.len() as u32,
        });
        let _ = transport.send_to(src, DeliveryClass::Unconnected, &resp.encode()).await;
    }

    async fn handle_login(&self, transport: &Arc<dyn Transport>, src: SocketAddr, body: LoginRequestBody) {
        if !body.version.compatible_with(&ProtocolVersion::CURRENT) {
            let err = ProtocolError::VersionMismatch(
                (body.version.major, body.version.minor),
                (ProtocolVersion::CURRENT.major, ProtocolVersion::CURRENT.minor),
            );
            self.deny(transport, src, body.request_id, err.to_string()).await;
            return;
        }
        if self.entities.len() >= self.properties.max_clients {
            self.deny(transport, src, body.request_id, ProtocolError::ServerFull.to_string()).await;
            return;
        }

        let mut session = SecuritySession::new();
        if session.complete_handshake(&body.public_key).is_err() {
            self.deny(transport, src, body.request_id, SecurityError::InvalidRemoteKey.to_string()).await;
            return;
        }
        let server_public_key = session.local_public_key();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entity = Arc::new(Entity {
            id,
            addr: src,
            user_id: body.user_id.clone(),
            security: Mutex::new(session),
            stats: NetworkStats::new(),
            muted: AtomicBool::new(false),
            deafened: AtomicBool::new(false),
            visible_to_me: Mutex::new(HashSet::new()),
            last_seen: Mutex::new(Instant::now()),
            position: Mutex::new(None),
            rotation: Mutex::new(None),
        });

        let accept = Packet::AcceptResponse(AcceptResponseBody {
            request_id: body.request_id,
            entity_id: id,
            server_public_key: bytes::Bytes::from(server_public_key),
        });
        if transport.send_to(src, DeliveryClass::ReliableOrdered, &accept.encode()).await.is_err() {
            return;
        }

        self.broadcast_reliable(&Packet::EntityCreated(EntityCreatedBody { entity_id: id, name: body.user_id.clone() }), transport)
            .await;

        self.entities.insert(id, entity);
        self.by_addr.insert(src, id);
        info!(entity_id = id, user_id = %body.user_id, %src, "entity joined");
    }

    async fn deny(&self, transport: &Arc<dyn Transport>, src: SocketAddr, request_id: u128, reason: String) {
        let resp = Packet::DenyResponse(DenyResponseBody { request_id, reason });
        let _ = transport.send_to(src, DeliveryClass::ReliableOrdered, &resp.encode()).await;
    }

    async fn handle_envelope(&self, transport: &Arc<dyn Transport>, src: SocketAddr, body: EncryptedEnvelopeBody) {
        let Some(id) = self.by_addr.get(&src).map(|r| *r) else {
            debug!(%src, "envelope from unknown peer, dropping");
            return;
        };
        let Some(entity) = self.entities.get(&id).map(|r| r.clone()) else { return };

        let plaintext = {
            let mut session = entity.security.lock();
            match session.decrypt(&body.iv, &body.ciphertext, &body.tag) {
                Ok(pt) => pt,
                Err(e) => {
                    debug!(entity_id = id, error = %e, "dropping undecryptable frame");
                    return;
                }
            }
        };
        *entity.last_seen.lock() = Instant::now();
        entity.stats.record_packet_received(body.ciphertext.len(), None, 0.0);

        let inner = match Packet::decode(&plaintext) {
            Ok(p) => p,
            Err(e) => {
                debug!(entity_id = id, error = %e, "malformed inner frame");
                return;
            }
        };

        match inner {
            // A second encryption layer is never valid; reject rather than
            // recursing into the outer decrypt (REDESIGN FLAG resolution).
            Packet::EncryptedEnvelope(_) => {
                debug!(entity_id = id, "rejecting nested EncryptedEnvelope");
            }
            Packet::Audio(_) | Packet::AdvancedAudio(_) => {
                self.relay_audio(transport, &entity, inner).await;
            }
            Packet::SetMute(v) => entity.muted.store(v, Ordering::Relaxed),
            Packet::SetDeafen(v) => entity.deafened.store(v, Ordering::Relaxed),
            Packet::SetEntityVisibility(SetEntityVisibilityBody { entity_id, visible }) => {
                let mut vis = entity.visible_to_me.lock();
                if visible {
                    vis.insert(entity_id);
                } else {
                    vis.remove(&entity_id);
                }
            }
            Packet::LogoutRequest => {
                self.remove_entity(id);
                self.broadcast_reliable(&Packet::EntityDestroyed(EntityDestroyedBody { entity_id: id }), transport).await;
            }
            Packet::Heartbeat => {}
            other => debug!(entity_id = id, ?other, "unhandled control packet"),
        }
    }

    /// Relay an already-decrypted audio packet to every other entity that
    /// has the sender in its visibility set, re-encrypting per recipient.
    ///
    /// Per spec §4.8 audio-relay: update the sender's tracked position/
    /// rotation from an `AdvancedAudio` frame's flags, then re-stamp
    /// `entity_id` on the outgoing packet before forwarding, so a relayed
    /// frame always carries the sender's current entity id rather than
    /// whatever it happened to be tagged with on the wire.
    async fn relay_audio(&self, transport: &Arc<dyn Transport>, sender: &Entity, inner: Packet) {
        let outgoing = match inner {
            Packet::AdvancedAudio(mut body) => {
                if let Some(position) = body.position {
                    *sender.position.lock() = Some(position);
                }
                if let Some(rotation) = body.rotation {
                    *sender.rotation.lock() = Some(rotation);
                }
                body.entity_id = sender.id;
                Packet::AdvancedAudio(body)
            }
            Packet::Audio(mut body) => {
                body.entity_id = sender.id;
                Packet::Audio(body)
            }
            _ => unreachable!("relay_audio is only called with Packet::Audio/Packet::AdvancedAudio"),
        };
        if sender.muted.load(Ordering::Relaxed) {
            return;
        }
        let encoded_plaintext = outgoing.encode();

        let recipients: Vec<Arc<Entity>> = self
            .entities
            .iter()
            .filter(|e| e.id != sender.id && e.visible_to_me.lock().contains(&sender.id) && !e.deafened.load(Ordering::Relaxed))
            .map(|e| e.clone())
            .collect();

        for recipient in recipients {
            let sealed = {
                let mut session = recipient.security.lock();
                session.encrypt(&encoded_plaintext)
            };
            let Ok((iv, ciphertext, tag)) = sealed else { continue };
            let envelope = Packet::EncryptedEnvelope(EncryptedEnvelopeBody { iv, tag, ciphertext: bytes::Bytes::from(ciphertext) });
            let encoded = envelope.encode();
            recipient.stats.record_packet_sent(encoded.len());
            let _ = transport.send_to(recipient.addr, DeliveryClass::Unreliable, &encoded).await;
        }
    }

    async fn broadcast_reliable(&self, packet: &Packet, transport: &Arc<dyn Transport>) {
        let encoded = packet.encode();
        let addrs: Vec<SocketAddr> = self.entities.iter().map(|e| e.addr).collect();
        for addr in addrs {
            let _ = transport.send_to(addr, DeliveryClass::ReliableOrdered, &encoded).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UdpTransport;
    use crate::security::SecuritySession as ClientSecurity;

    async fn bound_transport() -> (Arc<UdpTransport>, SocketAddr) {
        let t = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = t.local_addr().unwrap();
        (Arc::new(t), addr)
    }

    #[tokio::test]
    async fn login_then_info_request_roundtrip() {
        let server = RelayServer::new(ServerProperties::default());
        let (server_transport, server_addr) = bound_transport().await;
        let (client_transport, _client_addr) = bound_transport().await;

        let server_clone = server.clone();
        let server_transport_clone: Arc<dyn Transport> = server_transport.clone();
        let handle = tokio::spawn(async move { server_clone.run(server_transport_clone).await });

        let session = ClientSecurity::new();
        let login = Packet::LoginRequest(LoginRequestBody {
            request_id: 0x42,
            version: ProtocolVersion::CURRENT,
            user_id: "alice".into(),
            public_key: bytes::Bytes::from(session.local_public_key()),
        });
        client_transport.send_to(server_addr, DeliveryClass::ReliableOrdered, &login.encode()).await.unwrap();

        let mut buf = [0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client_transport.recv_from(&mut buf)).await.unwrap().unwrap();
        let accepted = Packet::decode(&buf[..n]).unwrap();
        match accepted {
            Packet::AcceptResponse(body) => assert_eq!(body.request_id, 0x42),
            other => panic!("expected AcceptResponse, got {other:?}"),
        }
        assert_eq!(server.entity_count(), 1);

        server.stop();
        let _ = handle.await;
    }

    async fn login(
        transport: &UdpTransport,
        server_addr: SocketAddr,
        request_id: u128,
        user_id: &str,
    ) -> (i32, ClientSecurity) {
        let mut session = ClientSecurity::new();
        let login = Packet::LoginRequest(LoginRequestBody {
            request_id,
            version: ProtocolVersion::CURRENT,
            user_id: user_id.into(),
            public_key: bytes::Bytes::from(session.local_public_key()),
        });
        transport.send_to(server_addr, DeliveryClass::ReliableOrdered, &login.encode()).await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), transport.recv_from(&mut buf)).await.unwrap().unwrap();
            if let Ok(Packet::AcceptResponse(body)) = Packet::decode(&buf[..n]) {
                session.complete_handshake(&body.server_public_key).unwrap();
                return (body.entity_id, session);
            }
        }
    }

    async fn send_encrypted(transport: &UdpTransport, server_addr: SocketAddr, session: &mut ClientSecurity, packet: &Packet) {
        let (iv, ciphertext, tag) = session.encrypt(&packet.encode()).unwrap();
        let envelope = Packet::EncryptedEnvelope(EncryptedEnvelopeBody { iv, tag, ciphertext: bytes::Bytes::from(ciphertext) });
        transport.send_to(server_addr, DeliveryClass::Sequenced, &envelope.encode()).await.unwrap();
    }

    async fn recv_decrypted(transport: &UdpTransport, session: &mut ClientSecurity) -> Packet {
        let mut buf = [0u8; 65536];
        loop {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), transport.recv_from(&mut buf)).await.unwrap().unwrap();
            if let Ok(Packet::EncryptedEnvelope(body)) = Packet::decode(&buf[..n]) {
                if let Ok(plaintext) = session.decrypt(&body.iv, &body.ciphertext, &body.tag) {
                    if let Ok(p) = Packet::decode(&plaintext) {
                        return p;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn audio_relay_updates_position_and_restamps_entity_id() {
        use crate::codec::{AdvancedAudioBody, AudioFlags};

        let server = RelayServer::new(ServerProperties::default());
        let (a_transport, _) = bound_transport().await;
        let (b_transport, _) = bound_transport().await;
        let (server_transport, server_addr) = bound_transport().await;

        let server_clone = server.clone();
        let server_transport_clone: Arc<dyn Transport> = server_transport.clone();
        let handle = tokio::spawn(async move { server_clone.run(server_transport_clone).await });

        let (id_a, mut session_a) = login(&a_transport, server_addr, 1, "alice").await;
        let (id_b, mut session_b) = login(&b_transport, server_addr, 2, "bob").await;

        send_encrypted(
            &b_transport,
            server_addr,
            &mut session_b,
            &Packet::SetEntityVisibility(SetEntityVisibilityBody { entity_id: id_a, visible: true }),
        )
        .await;
        // wait for the server to have actually applied the visibility update,
        // rather than guessing at a fixed delay.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if server.entities.get(&id_b).unwrap().visible_to_me.lock().contains(&id_a) {
                break;
            }
            assert!(Instant::now() < deadline, "server never applied visibility update");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sent = Packet::AdvancedAudio(AdvancedAudioBody {
            entity_id: 0,
            timestamp: 7,
            loudness: 0.3,
            flags: AudioFlags::HAS_POSITION,
            position: Some([1.0, 2.0, 3.0]),
            rotation: None,
            opus_payload: bytes::Bytes::from_static(&[1, 2, 3]),
        });
        send_encrypted(&a_transport, server_addr, &mut session_a, &sent).await;

        let relayed = recv_decrypted(&b_transport, &mut session_b).await;
        match relayed {
            Packet::AdvancedAudio(body) => {
                assert_eq!(body.entity_id, id_a);
                assert_eq!(body.position, Some([1.0, 2.0, 3.0]));
            }
            other => panic!("expected AdvancedAudio, got {other:?}"),
        }
        assert_eq!(*server.entities.get(&id_a).unwrap().position.lock(), Some([1.0, 2.0, 3.0]));

        server.stop();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn muted_sender_still_updates_position_but_is_not_relayed() {
        use crate::codec::{AdvancedAudioBody, AudioFlags};

        let server = RelayServer::new(ServerProperties::default());
        let (a_transport, _) = bound_transport().await;
        let (b_transport, _) = bound_transport().await;
        let (server_transport, server_addr) = bound_transport().await;

        let server_clone = server.clone();
        let server_transport_clone: Arc<dyn Transport> = server_transport.clone();
        let handle = tokio::spawn(async move { server_clone.run(server_transport_clone).await });

        let (id_a, mut session_a) = login(&a_transport, server_addr, 1, "alice").await;
        let (id_b, mut session_b) = login(&b_transport, server_addr, 2, "bob").await;

        send_encrypted(
            &b_transport,
            server_addr,
            &mut session_b,
            &Packet::SetEntityVisibility(SetEntityVisibilityBody { entity_id: id_a, visible: true }),
        )
        .await;
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if server.entities.get(&id_b).unwrap().visible_to_me.lock().contains(&id_a) {
                break;
            }
            assert!(Instant::now() < deadline, "server never applied visibility update");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        send_encrypted(&a_transport, server_addr, &mut session_a, &Packet::SetMute(true)).await;
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if server.entities.get(&id_a).unwrap().muted.load(Ordering::Relaxed) {
                break;
            }
            assert!(Instant::now() < deadline, "server never applied mute");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sent = Packet::AdvancedAudio(AdvancedAudioBody {
            entity_id: 0,
            timestamp: 9,
            loudness: 0.1,
            flags: AudioFlags::HAS_POSITION,
            position: Some([4.0, 5.0, 6.0]),
            rotation: None,
            opus_payload: bytes::Bytes::from_static(&[9]),
        });
        send_encrypted(&a_transport, server_addr, &mut session_a, &sent).await;

        // give the server a moment to process the muted audio frame; no reply
        // is expected so there's nothing to block on directly.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if *server.entities.get(&id_a).unwrap().position.lock() == Some([4.0, 5.0, 6.0]) {
                break;
            }
            assert!(Instant::now() < deadline, "server never updated muted sender's position");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut buf = [0u8; 4096];
        let nothing_relayed =
            tokio::time::timeout(Duration::from_millis(100), b_transport.recv_from(&mut buf)).await;
        assert!(nothing_relayed.is_err(), "muted sender's audio must not be relayed");

        server.stop();
        let _ = handle.await;
    }
}
