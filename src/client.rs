//! Client session endpoint (C7): connect/login, encrypted audio send,
//! per-remote-talker playback via [`crate::talker::RemoteTalker`], and a
//! heartbeat loop that detects a dead server the way the teacher's
//! `heartbeat_loop`/`HEART` exchange does.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{AdvancedAudioBody, AudioFlags, EncryptedEnvelopeBody, InfoRequestBody, LoginRequestBody, Packet};
use crate::config::{ClientConfig, ProtocolVersion, CLIENT_POLL_MS, FRAME_SIZE_MS};
use crate::error::LifecycleError;
use crate::jitter::JitterConfig;
use crate::security::SecuritySession;
use crate::sequence::SequenceId;
use crate::talker::RemoteTalker;
use crate::traits::{RingSink, SpeechCodec};
use crate::transport::{DeliveryClass, Transport};

const HEARTBEAT_INTERVAL_MS: u64 = 1000;
const SERVER_TIMEOUT: Duration = Duration::from_secs(5);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type TalkerHandle<C> = Arc<RemoteTalker<C, RingSink>>;

/// Per-session registry correlating an outgoing request's 128-bit
/// `RequestId` with the typed response it unblocks (spec §4.7 "Request/
/// response correlation"). A duplicate `register` call for an id that
/// still has an open waiter is rejected rather than silently replacing it;
/// `cancel` drops the registration (and the waiter resolves with an error)
/// without delivering anything, for the timeout path.
struct PendingRequests {
    open: SyncMutex<HashMap<u128, oneshot::Sender<Packet>>>,
}

impl PendingRequests {
    fn new() -> Self {
        Self { open: SyncMutex::new(HashMap::new()) }
    }

    fn register(&self, id: u128) -> Result<oneshot::Receiver<Packet>, LifecycleError> {
        let mut open = self.open.lock();
        if open.contains_key(&id) {
            return Err(LifecycleError::DuplicateRequestId);
        }
        let (tx, rx) = oneshot::channel();
        open.insert(id, tx);
        Ok(rx)
    }

    fn complete(&self, id: u128, packet: Packet) {
        if let Some(tx) = self.open.lock().remove(&id) {
            let _ = tx.send(packet);
        }
    }

    fn cancel(&self, id: u128) {
        self.open.lock().remove(&id);
    }
}

/// One active connection to a [`crate::server::RelayServer`].
pub struct SessionEndpoint<C: SpeechCodec + 'static> {
    /// Opaque id for this process's session, used only to correlate log
    /// lines across the network/heartbeat/audio tasks.
    pub session_id: Uuid,
    config: ClientConfig,
    security: AsyncMutex<SecuritySession>,
    entity_id: AtomicI32,
    server_addr: SocketAddr,
    last_heard_from_server: AsyncMutex<Instant>,
    muted: AtomicBool,
    deafened: AtomicBool,
    talkers: DashMap<i32, TalkerHandle<C>>,
    codec_factory: Box<dyn Fn() -> C + Send + Sync>,
    running: AtomicBool,
    pending: PendingRequests,
    audio_timestamp: AtomicU16,
    position: SyncMutex<Option<[f32; 3]>>,
    rotation: SyncMutex<Option<[f32; 2]>>,
}

impl<C: SpeechCodec + 'static> SessionEndpoint<C> {
    /// Perform the login handshake against `transport`, blocking until an
    /// `AcceptResponse`/`DenyResponse` arrives or [`LOGIN_TIMEOUT`] elapses.
    ///
    /// The login exchange is itself the first use of the request/response
    /// correlation registry (spec §4.7): `LoginRequest` carries a fresh
    /// `RequestId`, and only an `AcceptResponse`/`DenyResponse` echoing that
    /// id completes the waiter — a reply for a stale or foreign id is
    /// ignored rather than accepted.
    pub async fn connect(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        codec_factory: impl Fn() -> C + Send + Sync + 'static,
    ) -> Result<Arc<Self>, LifecycleError> {
        let session_id = Uuid::new_v4();
        let mut security = SecuritySession::new();
        let pending = PendingRequests::new();
        let request_id: u128 = rand::random();
        let waiter = pending.register(request_id)?;

        let login = Packet::LoginRequest(LoginRequestBody {
            request_id,
            version: ProtocolVersion::CURRENT,
            user_id: config.user_id.clone(),
            public_key: Bytes::from(security.local_public_key()),
        });
        transport
            .send_to(config.server_addr, DeliveryClass::ReliableOrdered, &login.encode())
            .await
            .map_err(|_| LifecycleError::ObjectClosed)?;

        // The login reply is awaited directly off the socket rather than
        // through a `pending`-registered oneshot: nothing else needs to
        // observe this particular response, so routing it through the
        // waiter would just be a same-task round-trip through a channel.
        // `pending`/`request_id` still exist so a duplicate login attempt
        // with this id is rejected like any other open request.
        drop(waiter);
        let mut buf = vec![0u8; 4096];
        let deadline = Instant::now() + LOGIN_TIMEOUT;
        let entity_id = loop {
            if Instant::now() >= deadline {
                pending.cancel(request_id);
                return Err(LifecycleError::Timeout);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let recv = tokio::time::timeout(remaining, transport.recv_from(&mut buf)).await;
            let Ok(Ok((n, src))) = recv else { continue };
            if src != config.server_addr {
                continue;
            }
            match Packet::decode(&buf[..n]) {
                Ok(Packet::AcceptResponse(body)) if body.request_id == request_id => {
                    pending.cancel(request_id);
                    security
                        .complete_handshake(&body.server_public_key)
                        .map_err(|_| LifecycleError::ObjectClosed)?;
                    break body.entity_id;
                }
                Ok(Packet::DenyResponse(body)) if body.request_id == request_id => {
                    pending.cancel(request_id);
                    warn!(reason = %body.reason, "login denied");
                    return Err(LifecycleError::ObjectClosed);
                }
                _ => continue,
            }
        };

        let endpoint = Arc::new(Self {
            session_id,
            server_addr: config.server_addr,
            config,
            security: AsyncMutex::new(security),
            entity_id: AtomicI32::new(entity_id),
            last_heard_from_server: AsyncMutex::new(Instant::now()),
            muted: AtomicBool::new(false),
            deafened: AtomicBool::new(false),
            talkers: DashMap::new(),
            codec_factory: Box::new(codec_factory),
            running: AtomicBool::new(true),
            pending,
            audio_timestamp: AtomicU16::new(0),
            position: SyncMutex::new(None),
            rotation: SyncMutex::new(None),
        });
        info!(session_id = %endpoint.session_id, entity_id, "connected");
        Ok(endpoint)
    }

    pub fn entity_id(&self) -> i32 {
        self.entity_id.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn set_deafened(&self, deafened: bool) {
        self.deafened.store(deafened, Ordering::Relaxed);
        if deafened {
            for talker in self.talkers.iter() {
                talker.clear_all();
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Record the local entity's current position/rotation, if the caller
    /// tracks one, so the next [`Self::write_audio`] call can stamp it onto
    /// the outgoing `AdvancedAudio` frame (spec §4.7 "with current
    /// position/rotation if known").
    pub fn set_position(&self, position: Option<[f32; 3]>) {
        *self.position.lock() = position;
    }

    pub fn set_rotation(&self, rotation: Option<[f32; 2]>) {
        *self.rotation.lock() = rotation;
    }

    /// Encode and send one frame of local microphone audio as
    /// `AdvancedAudio`, carrying a monotonically increasing timestamp
    /// (wrapping `u16`) that doubles as the jitter-buffer sequence number
    /// on the receiving end, plus position/rotation if known.
    pub async fn write_audio(&self, transport: &dyn Transport, loudness: f32, encoded_opus: Vec<u8>) {
        if self.muted.load(Ordering::Relaxed) {
            return;
        }
        let timestamp = self.audio_timestamp.fetch_add(1, Ordering::Relaxed);
        let position = *self.position.lock();
        let rotation = *self.rotation.lock();
        let mut flags = AudioFlags::NONE;
        if position.is_some() {
            flags = flags | AudioFlags::HAS_POSITION;
        }
        if rotation.is_some() {
            flags = flags | AudioFlags::HAS_ROTATION;
        }
        let body = Packet::AdvancedAudio(AdvancedAudioBody {
            entity_id: self.entity_id(),
            timestamp,
            loudness,
            flags,
            position,
            rotation,
            opus_payload: Bytes::from(encoded_opus),
        });
        let sealed = {
            let mut security = self.security.lock().await;
            security.encrypt(&body.encode())
        };
        let Ok((iv, ciphertext, tag)) = sealed else {
            warn!("failed to encrypt outgoing audio frame");
            return;
        };
        let envelope = Packet::EncryptedEnvelope(EncryptedEnvelopeBody { iv, tag, ciphertext: Bytes::from(ciphertext) });
        let _ = transport.send_to(self.server_addr, DeliveryClass::Sequenced, &envelope.encode()).await;
    }

    /// Send an `InfoRequest` and await its correlated `InfoResponse`
    /// through the [`PendingRequests`] registry, routed in by
    /// [`Self::poll_once`].
    pub async fn request_info(&self, transport: &dyn Transport) -> Result<crate::codec::InfoResponseBody, LifecycleError> {
        let request_id: u128 = rand::random();
        let waiter = self.pending.register(request_id)?;
        let request = Packet::InfoRequest(InfoRequestBody { request_id });
        transport
            .send_to(self.server_addr, DeliveryClass::Unconnected, &request.encode())
            .await
            .map_err(|_| LifecycleError::ObjectClosed)?;

        match tokio::time::timeout(REQUEST_TIMEOUT, waiter).await {
            Ok(Ok(Packet::InfoResponse(body))) => Ok(body),
            Ok(Ok(_)) | Ok(Err(_)) => Err(LifecycleError::ObjectClosed),
            Err(_) => {
                self.pending.cancel(request_id);
                Err(LifecycleError::Timeout)
            }
        }
    }

    /// Poll the transport once, routing inbound audio into the owning
    /// talker's jitter buffer and control events into local state.
    pub async fn poll_once(&self, transport: &dyn Transport, buf: &mut [u8]) {
        let Ok((n, src)) = transport.recv_from(buf).await else { return };
        if src != self.server_addr {
            return;
        }
        *self.last_heard_from_server.lock().await = Instant::now();

        match Packet::decode(&buf[..n]) {
            Ok(Packet::InfoResponse(body)) => self.pending.complete(body.request_id, Packet::InfoResponse(body)),
            Ok(Packet::DenyResponse(body)) => self.pending.complete(body.request_id, Packet::DenyResponse(body)),
            Ok(Packet::EncryptedEnvelope(body)) => self.handle_encrypted_envelope(body).await,
            Ok(_) | Err(_) => {}
        }
    }

    async fn handle_encrypted_envelope(&self, body: EncryptedEnvelopeBody) {
        let plaintext = {
            let mut security = self.security.lock().await;
            security.decrypt(&body.iv, &body.ciphertext, &body.tag)
        };
        let Ok(plaintext) = plaintext else { return };

        match Packet::decode(&plaintext) {
            Ok(Packet::Audio(audio)) => self.route_audio(audio.entity_id, 0, audio.opus_payload.to_vec()),
            Ok(Packet::AdvancedAudio(audio)) => {
                self.route_audio(audio.entity_id, audio.timestamp, audio.opus_payload.to_vec())
            }
            Ok(Packet::EntityCreated(body)) => self.add_talker(body.entity_id),
            Ok(Packet::EntityDestroyed(body)) => {
                self.talkers.remove(&body.entity_id);
            }
            Ok(Packet::SetEntityVisibility(body)) => {
                if let Some(talker) = self.talkers.get(&body.entity_id) {
                    talker.set_visible(body.visible);
                }
            }
            Ok(Packet::EncryptedEnvelope(_)) => debug!("rejecting nested EncryptedEnvelope"),
            Ok(_) | Err(_) => {}
        }
    }

    fn route_audio(&self, entity_id: i32, sequence: SequenceId, payload: Vec<u8>) {
        if self.deafened.load(Ordering::Relaxed) {
            return;
        }
        if !self.talkers.contains_key(&entity_id) {
            self.add_talker(entity_id);
        }
        if let Some(talker) = self.talkers.get(&entity_id) {
            talker.on_frame_arrived(sequence, payload, Instant::now());
        }
    }

    fn add_talker(&self, entity_id: i32) {
        let jitter_config = JitterConfig { min_buffer_ms: 40, max_buffer_ms: 400, frame_size_ms: FRAME_SIZE_MS };
        let talker = Arc::new(RemoteTalker::new(
            entity_id,
            jitter_config,
            (self.codec_factory)(),
            RingSink::new(8),
            self.config.silence_threshold_ms,
        ));
        self.talkers.insert(entity_id, talker);
    }

    /// Drain one remote talker's decoded output ring into `out`.
    pub fn drain_talker_audio(&self, entity_id: i32, out: &mut [f32]) -> usize {
        self.talkers.get(&entity_id).map(|t| t.drain(out)).unwrap_or(0)
    }

    /// Tick every active talker's jitter-buffer → decode/PLC pipeline once.
    /// Driven on [`crate::config::FRAME_SIZE_MS`] cadence by
    /// [`Self::talker_tick_loop`].
    fn tick_talkers(&self) {
        let now = Instant::now();
        for talker in self.talkers.iter() {
            talker.tick(now, self.config.sensitivity);
        }
    }

    pub async fn talker_tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(FRAME_SIZE_MS as u64));
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            self.tick_talkers();
        }
    }

    /// Background heartbeat: send [`Packet::Heartbeat`] on an interval and
    /// detect a dead server via [`SERVER_TIMEOUT`] (teacher's `HEART`/
    /// timeout heartbeat_loop, generalized off plain-text TCP onto the
    /// encrypted datagram channel).
    pub async fn heartbeat_loop(self: Arc<Self>, transport: Arc<dyn Transport>, mut shutdown: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        return;
                    }
                    let elapsed = self.last_heard_from_server.lock().await.elapsed();
                    if elapsed > SERVER_TIMEOUT {
                        warn!(session_id = %self.session_id, "server heartbeat timeout, stopping session");
                        self.stop();
                        return;
                    }
                    let sealed = {
                        let mut security = self.security.lock().await;
                        security.encrypt(&Packet::Heartbeat.encode())
                    };
                    if let Ok((iv, ciphertext, tag)) = sealed {
                        let envelope = Packet::EncryptedEnvelope(EncryptedEnvelopeBody { iv, tag, ciphertext: Bytes::from(ciphertext) });
                        let _ = transport.send_to(self.server_addr, DeliveryClass::ReliableOrdered, &envelope.encode()).await;
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Drive [`Self::poll_once`] on [`CLIENT_POLL_MS`] cadence until stopped.
    pub async fn network_poll_loop(self: Arc<Self>, transport: Arc<dyn Transport>) {
        let mut buf = vec![0u8; 65536];
        while self.running.load(Ordering::SeqCst) {
            let poll = tokio::time::timeout(Duration::from_millis(CLIENT_POLL_MS), self.poll_once(transport.as_ref(), &mut buf)).await;
            let _ = poll;
        }
    }

    #[cfg(test)]
    fn talker_count(&self) -> usize {
        self.talkers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerProperties;
    use crate::server::RelayServer;
    use crate::transport::UdpTransport;

    struct NullCodec;
    impl SpeechCodec for NullCodec {
        fn encode(&mut self, _pcm: &[f32]) -> Vec<u8> {
            Vec::new()
        }
        fn decode(&mut self, _payload: &[u8], out: &mut [f32]) -> usize {
            out.fill(0.0);
            0
        }
        fn conceal(&mut self, out: &mut [f32]) -> usize {
            out.fill(0.0);
            0
        }
    }

    #[tokio::test]
    async fn connect_completes_handshake_and_assigns_entity_id() {
        let server = RelayServer::new(ServerProperties::default());
        let server_transport = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let server_addr = server_transport.local_addr().unwrap();
        let server_transport_dyn: Arc<dyn Transport> = server_transport.clone();
        let server_clone = server.clone();
        let handle = tokio::spawn(async move { server_clone.run(server_transport_dyn).await });

        let client_transport: Arc<dyn Transport> =
            Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let config = ClientConfig::new("alice", server_addr);
        let endpoint = SessionEndpoint::connect(config, client_transport, || NullCodec).await.unwrap();
        assert!(endpoint.entity_id() > 0);
        assert_eq!(endpoint.talker_count(), 0);

        server.stop();
        let _ = handle.await;
    }

    #[test]
    fn pending_requests_rejects_duplicate_id() {
        let pending = PendingRequests::new();
        let _rx = pending.register(7).unwrap();
        assert_eq!(pending.register(7).unwrap_err(), LifecycleError::DuplicateRequestId);
    }

    #[test]
    fn pending_requests_cancel_allows_reregistration() {
        let pending = PendingRequests::new();
        let _rx = pending.register(7).unwrap();
        pending.cancel(7);
        assert!(pending.register(7).is_ok());
    }

    #[tokio::test]
    async fn pending_requests_complete_resolves_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register(7).unwrap();
        pending.complete(7, Packet::LogoutRequest);
        assert!(matches!(rx.await.unwrap(), Packet::LogoutRequest));
    }

    #[tokio::test]
    async fn pending_requests_cancel_causes_waiter_to_error() {
        let pending = PendingRequests::new();
        let rx = pending.register(7).unwrap();
        pending.cancel(7);
        assert!(rx.await.is_err());
    }
}
