//! The control stream: handshake, steady-state worker, and teardown.
//!
//! [`ControlStream::init`] runs the handshake inline (framing, login, first
//! auth) and then spawns a single worker task that owns the session for the
//! rest of its life. The worker multiplexes, in one `tokio::select!`:
//!
//! 1. teardown requests from [`ControlStream::deinit`],
//! 2. inbound datagrams, classified through the reply table,
//! 3. the 100 ms keepalive tick,
//! 4. the named deadlines (second auth, request timeout, reauth, status).
//!
//! Fatal conditions are delivered once through [`ControlStream::next_fatal`];
//! the worker then stops processing traffic and waits for teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use icomlan_core::audio::AudioBackend;
use icomlan_core::error::{Error, Result};
use icomlan_core::events::SessionEvent;
use icomlan_core::serial::SerialBridge;
use icomlan_core::transport::DatagramTransport;

use crate::audio::{AudioPipeline, AudioQueues, PlayBufferMode};
use crate::auth::AuthContext;
use crate::dispatch::{self, ReplyKind};
use crate::packet::{
    self, AuthMagic, Credentials, HEADER_LEN, I_AM_HERE_PREFIX, LOGIN_REPLY_LEN,
    LOGIN_REPLY_PREFIX, LoginOutcome, READY_PREFIX, SessionIds, StreamCapabilities,
};
use crate::session::{MAX_DATAGRAM, SessionChannel};
use crate::timers::{Deadline, Deadlines};

/// How long one worker receive waits before the loop re-polls.
const RECV_POLL: Duration = Duration::from_secs(1);

/// Depth of the audio queues on each side of the pipeline.
const AUDIO_QUEUE_DEPTH: usize = 64;

/// Capacity of the session event broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Progress of the control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Init,
    LoginSent,
    FirstAuthSent,
    SecondAuthSent,
    StreamRequested,
    Streaming,
    Closed,
}

/// Session parameters, assembled by
/// [`ControlStreamBuilder`](crate::builder::ControlStreamBuilder).
#[derive(Debug, Clone)]
pub(crate) struct ControlConfig {
    pub credentials: Credentials,
    pub client_name: String,
    /// Device name sent in the stream request.
    pub device_name: String,
    pub capabilities: StreamCapabilities,
    /// Timeout of each handshake reply.
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub second_auth_delay: Duration,
    pub request_timeout: Duration,
    pub reauth_interval: Duration,
    pub status_interval: Duration,
    pub local_id: Option<u32>,
    pub client_id: Option<u16>,
    pub initial_inner_seq: Option<u16>,
    pub play_buffer_mode: PlayBufferMode,
}

// ---------------------------------------------------------------------------
// Fatal error path
// ---------------------------------------------------------------------------

/// Sender half of the single fatal error path.
///
/// Shared by the worker and the audio pipeline. Only the first report is
/// delivered.
#[derive(Debug, Clone)]
pub(crate) struct FatalReporter {
    tx: mpsc::Sender<Error>,
    reported: Arc<AtomicBool>,
}

impl FatalReporter {
    pub(crate) fn new() -> (Self, mpsc::Receiver<Error>) {
        let (tx, rx) = mpsc::channel(1);
        let reporter = FatalReporter {
            tx,
            reported: Arc::new(AtomicBool::new(false)),
        };
        (reporter, rx)
    }

    /// Report `error`. Returns false if a fatal error was already reported.
    pub(crate) fn report(&self, error: Error) -> bool {
        if self.reported.swap(true, Ordering::SeqCst) {
            debug!(error = %error, "Suppressing fatal error after the first");
            return false;
        }
        error!(error = %error, "Fatal session error");
        let _ = self.tx.try_send(error);
        true
    }
}

// ---------------------------------------------------------------------------
// ControlStream
// ---------------------------------------------------------------------------

enum WorkerRequest {
    /// Tear down the session, then acknowledge.
    Shutdown { ack: oneshot::Sender<()> },
}

struct WorkerHandle {
    requests: mpsc::Sender<WorkerRequest>,
    task: JoinHandle<()>,
}

/// Client side of the radio's control stream.
///
/// Build one with [`ControlStreamBuilder`](crate::builder::ControlStreamBuilder),
/// then call [`init`](Self::init) once. A stream is single-use: after
/// [`deinit`](Self::deinit) build a new one to reconnect.
///
/// # Example
///
/// ```no_run
/// use icomlan_control::ControlStreamBuilder;
///
/// # async fn example() -> icomlan_core::Result<()> {
/// let mut stream = ControlStreamBuilder::new("beer", "beerbeer")
///     .connect("192.168.1.50")
///     .await?;
/// stream.init().await?;
///
/// if let Some(error) = stream.next_fatal().await {
///     eprintln!("session lost: {error}");
/// }
/// stream.deinit().await;
/// # Ok(())
/// # }
/// ```
pub struct ControlStream {
    config: ControlConfig,
    transport: Option<Box<dyn DatagramTransport>>,
    serial: Option<Box<dyn SerialBridge>>,
    audio: Option<Box<dyn AudioBackend>>,
    /// Worker ends of the audio queues, handed to the pipeline on grant.
    audio_queues: Option<AudioQueues>,
    playback_tx: mpsc::Sender<Bytes>,
    capture_rx: Option<mpsc::Receiver<Bytes>>,
    event_tx: broadcast::Sender<SessionEvent>,
    state_tx: Option<watch::Sender<ControlState>>,
    state_rx: watch::Receiver<ControlState>,
    fatal_rx: Option<mpsc::Receiver<Error>>,
    worker: Option<WorkerHandle>,
    started: bool,
}

impl ControlStream {
    pub(crate) fn new(
        config: ControlConfig,
        transport: Box<dyn DatagramTransport>,
        serial: Option<Box<dyn SerialBridge>>,
        audio: Option<Box<dyn AudioBackend>>,
    ) -> Self {
        let (playback_tx, inbound) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let (outbound, capture_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ControlState::Init);

        ControlStream {
            config,
            transport: Some(transport),
            serial,
            audio,
            audio_queues: Some(AudioQueues { inbound, outbound }),
            playback_tx,
            capture_rx: Some(capture_rx),
            event_tx,
            state_tx: Some(state_tx),
            state_rx,
            fatal_rx: None,
            worker: None,
            started: false,
        }
    }

    /// Run the handshake and start the session worker.
    ///
    /// Returns once the first auth packet has been sent; the stream grant
    /// arrives later and is announced by [`SessionEvent::StreamsOpened`].
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the radio stops answering during the handshake.
    /// - [`Error::InvalidCredentials`] if the login is rejected.
    /// - Transport errors from sending.
    ///
    /// Failures are not retried. The transport is closed before returning
    /// an error.
    pub async fn init(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Protocol("control stream already started".into()));
        }
        self.started = true;

        let transport = self.transport.take().ok_or(Error::NotConnected)?;
        let state_tx = self.state_tx.take().ok_or(Error::NotConnected)?;
        let config = self.config.clone();

        let local_id = config.local_id.unwrap_or_else(rand::random);
        let mut channel = SessionChannel::new(transport, local_id);
        let mut auth = AuthContext::new(config.initial_inner_seq.unwrap_or_else(rand::random));
        let mut keepalive = tokio::time::interval_at(
            Instant::now() + config.keepalive_interval,
            config.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(local_id = format_args!("{local_id:08x}"), "Starting control stream");
        if let Err(e) = handshake(&mut channel, &mut auth, &mut keepalive, &config, &state_tx).await
        {
            error!(error = %e, "Handshake failed");
            if channel.ids().remote != 0 {
                let _ = channel.send_disconnect().await;
            }
            let _ = channel.close().await;
            state_tx.send_replace(ControlState::Closed);
            return Err(e);
        }
        let _ = self.event_tx.send(SessionEvent::Authenticated);

        let mut deadlines = Deadlines::new();
        deadlines.arm_once(Deadline::SecondAuth, config.second_auth_delay);
        deadlines.arm_once(Deadline::RequestTimeout, config.request_timeout);
        deadlines.arm_periodic(Deadline::Reauth, config.reauth_interval);
        deadlines.arm_periodic(Deadline::StatusLog, config.status_interval);

        let (fatal, fatal_rx) = FatalReporter::new();
        let (requests, request_rx) = mpsc::channel(4);
        let worker = Worker {
            channel,
            auth,
            deadlines,
            keepalive,
            state: ControlState::FirstAuthSent,
            state_tx,
            serial: self.serial.take(),
            serial_started: false,
            audio: self.audio.take(),
            audio_queues: self.audio_queues.take(),
            pipeline: None,
            streams_open: false,
            started_at: Instant::now(),
            events: self.event_tx.clone(),
            fatal,
            halted: false,
            config,
        };
        let task = tokio::spawn(worker.run(request_rx));

        self.fatal_rx = Some(fatal_rx);
        self.worker = Some(WorkerHandle { requests, task });
        Ok(())
    }

    /// Tear the session down and wait until the worker has finished.
    ///
    /// Sends one deauthentication packet if the login succeeded, then the
    /// disconnect packet, and releases the transport, serial bridge and
    /// audio pipeline. Calling it again, or before `init()`, does nothing.
    pub async fn deinit(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let (ack, ack_rx) = oneshot::channel();
        if worker
            .requests
            .send(WorkerRequest::Shutdown { ack })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        let _ = worker.task.await;
    }

    /// Wait for the session's fatal error.
    ///
    /// Resolves at most once with `Some`. Returns `None` before `init()` and
    /// after the session has been torn down.
    pub async fn next_fatal(&mut self) -> Option<Error> {
        match self.fatal_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Current state of the session.
    pub fn state(&self) -> ControlState {
        *self.state_rx.borrow()
    }

    /// Queue for received network audio to be played locally.
    pub fn playback_sender(&self) -> mpsc::Sender<Bytes> {
        self.playback_tx.clone()
    }

    /// Take the queue of captured 20 ms quanta to transmit.
    pub fn take_capture_receiver(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.capture_rx.take()
    }
}

async fn send_auth(
    channel: &mut SessionChannel,
    auth: &mut AuthContext,
    magic: AuthMagic,
) -> Result<()> {
    let seq = channel.next_seq();
    let inner_seq = auth.next_inner_seq();
    debug!(?magic, inner_seq, "Sending auth packet");
    let pkt = packet::auth(seq, channel.ids(), magic, inner_seq, auth.auth_id());
    channel.send(&pkt).await
}

/// Framing, login and first auth.
async fn handshake(
    channel: &mut SessionChannel,
    auth: &mut AuthContext,
    keepalive: &mut Interval,
    config: &ControlConfig,
    state_tx: &watch::Sender<ControlState>,
) -> Result<()> {
    let timeout = config.handshake_timeout;

    debug!("Sending are-you-there");
    channel.send_are_you_there().await?;
    channel.send_are_you_there().await?;
    let reply = channel
        .expect(HEADER_LEN, &I_AM_HERE_PREFIX, timeout, None)
        .await?;
    let remote = packet::sender_id(&reply)
        .ok_or_else(|| Error::Protocol("short are-you-there reply".into()))?;
    channel.set_ids(SessionIds {
        local: channel.ids().local,
        remote,
    });
    debug!(remote_id = format_args!("{remote:08x}"), "Radio answered");

    channel.send_are_you_ready().await?;
    channel.expect(HEADER_LEN, &READY_PREFIX, timeout, None).await?;

    let seq = channel.next_seq();
    let login = packet::login(&packet::Login {
        seq,
        ids: channel.ids(),
        inner_seq: auth.next_inner_seq(),
        client_id: config.client_id.unwrap_or_else(rand::random),
        credentials: &config.credentials,
        client_name: &config.client_name,
    });
    debug!(username = %config.credentials.username, "Sending login");
    channel.send(&login).await?;
    state_tx.send_replace(ControlState::LoginSent);
    keepalive.reset();

    let reply = channel
        .expect(LOGIN_REPLY_LEN, &LOGIN_REPLY_PREFIX, timeout, Some(keepalive))
        .await?;
    match packet::parse_login_reply(&reply)? {
        LoginOutcome::InvalidCredentials => return Err(Error::InvalidCredentials),
        LoginOutcome::Accepted(auth_id) => auth.accept(auth_id),
    }
    info!("Login accepted");

    send_auth(channel, auth, AuthMagic::FirstAuth).await?;
    state_tx.send_replace(ControlState::FirstAuthSent);
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    channel: SessionChannel,
    auth: AuthContext,
    deadlines: Deadlines,
    keepalive: Interval,
    state: ControlState,
    state_tx: watch::Sender<ControlState>,
    serial: Option<Box<dyn SerialBridge>>,
    serial_started: bool,
    audio: Option<Box<dyn AudioBackend>>,
    audio_queues: Option<AudioQueues>,
    pipeline: Option<AudioPipeline>,
    streams_open: bool,
    started_at: Instant,
    events: broadcast::Sender<SessionEvent>,
    fatal: FatalReporter,
    /// Set after a fatal error; only teardown is processed from then on.
    halted: bool,
    config: ControlConfig,
}

impl Worker {
    async fn run(mut self, mut requests: mpsc::Receiver<WorkerRequest>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                biased;

                request = requests.recv() => {
                    match request {
                        Some(WorkerRequest::Shutdown { ack }) => {
                            debug!("Control worker shutdown requested");
                            self.teardown().await;
                            let _ = ack.send(());
                        }
                        None => {
                            debug!("Control stream dropped, tearing down");
                            self.teardown().await;
                        }
                    }
                    return;
                }

                received = self.channel.recv(&mut buf, RECV_POLL), if !self.halted => {
                    match received {
                        Ok(n) => {
                            if let Err(e) = self.handle_datagram(&buf[..n]).await {
                                self.fail(e);
                            }
                        }
                        Err(Error::Timeout) => {}
                        Err(e) => self.fail(e),
                    }
                }

                _ = self.keepalive.tick(), if !self.halted => {
                    if let Err(e) = self.channel.send_keepalive().await {
                        self.fail(e);
                    }
                }

                deadline = self.deadlines.next(), if !self.halted => {
                    if let Err(e) = self.on_deadline(deadline).await {
                        self.fail(e);
                    }
                }
            }
        }
    }

    fn set_state(&mut self, state: ControlState) {
        trace!(from = ?self.state, to = ?state, "Control state change");
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn fail(&mut self, error: Error) {
        self.fatal.report(error);
        self.halted = true;
        self.deadlines.cancel_all();
    }

    async fn handle_datagram(&mut self, r: &[u8]) -> Result<()> {
        match dispatch::classify(r) {
            None => {
                trace!(len = r.len(), "Dropping unrecognized packet");
                Ok(())
            }
            Some(ReplyKind::RemoteIdle) => self.channel.echo_idle(r).await,
            Some(ReplyKind::Ping) => self.channel.handle_ping(r).await.map(|_| ()),
            Some(ReplyKind::SecondAuthAck) => self.on_second_auth_ack().await,
            Some(ReplyKind::AuthFailed) => Err(Error::AuthFailed),
            Some(ReplyKind::RemoteDisconnect) => Err(Error::RemoteDisconnected),
            Some(ReplyKind::StreamGrant) => self.on_stream_grant(r).await,
        }
    }

    async fn on_second_auth_ack(&mut self) -> Result<()> {
        let awaiting = matches!(
            self.state,
            ControlState::FirstAuthSent | ControlState::SecondAuthSent
        );
        if self.streams_open || !awaiting {
            trace!(state = ?self.state, "Ignoring auth acknowledgement");
            return Ok(());
        }
        self.deadlines.cancel(Deadline::SecondAuth);

        info!(device = %self.config.device_name, "Requesting serial and audio streams");
        let seq = self.channel.next_seq();
        let inner_seq = self.auth.next_inner_seq();
        let pkt = packet::stream_request(&packet::StreamRequest {
            seq,
            ids: self.channel.ids(),
            inner_seq,
            auth_id: self.auth.auth_id(),
            device_name: &self.config.device_name,
            username: &self.config.credentials.username,
            capabilities: &self.config.capabilities,
        });
        self.channel.send(&pkt).await?;
        self.set_state(ControlState::StreamRequested);
        Ok(())
    }

    async fn on_stream_grant(&mut self, r: &[u8]) -> Result<()> {
        if self.streams_open {
            debug!("Ignoring duplicate stream grant");
            return Ok(());
        }
        let Some(grant) = packet::parse_stream_grant(r) else {
            return Ok(());
        };
        self.deadlines.cancel(Deadline::RequestTimeout);
        self.channel.set_ids(grant.ids);
        self.auth.refresh(grant.auth_id);
        info!(device = %grant.device_name, "Serial and audio streams granted");

        if let Some(serial) = self.serial.as_mut() {
            self.serial_started = true;
            serial.init(&grant.device_name).await?;
        }
        if let (Some(backend), Some(queues)) = (self.audio.as_mut(), self.audio_queues.take()) {
            let endpoints = backend.open(&grant.device_name)?;
            self.pipeline = Some(AudioPipeline::start(
                endpoints,
                queues,
                self.config.play_buffer_mode,
                self.fatal.clone(),
            ));
        }

        self.streams_open = true;
        self.set_state(ControlState::Streaming);
        let _ = self.events.send(SessionEvent::StreamsOpened {
            device_name: grant.device_name,
        });
        Ok(())
    }

    async fn on_deadline(&mut self, deadline: Deadline) -> Result<()> {
        match deadline {
            Deadline::SecondAuth => {
                if self.state == ControlState::FirstAuthSent {
                    send_auth(&mut self.channel, &mut self.auth, AuthMagic::Reauth).await?;
                    self.set_state(ControlState::SecondAuthSent);
                }
                Ok(())
            }
            Deadline::RequestTimeout => Err(Error::Stalled(format!(
                "no stream grant within {:?}",
                self.config.request_timeout
            ))),
            Deadline::Reauth => {
                debug!("Reauthenticating");
                send_auth(&mut self.channel, &mut self.auth, AuthMagic::Reauth).await
            }
            Deadline::StatusLog => {
                let rtt = self.channel.latency();
                info!(
                    uptime = ?self.started_at.elapsed(),
                    latency = ?rtt,
                    state = ?self.state,
                    "Session status"
                );
                let _ = self.events.send(SessionEvent::LatencyMeasured { rtt });
                Ok(())
            }
        }
    }

    async fn teardown(&mut self) {
        self.deadlines.cancel_all();

        if self.auth.is_authenticated() {
            if let Err(e) = send_auth(&mut self.channel, &mut self.auth, AuthMagic::Deauth).await {
                debug!(error = %e, "Deauth not sent");
            }
        }
        if let Err(e) = self.channel.send_disconnect().await {
            debug!(error = %e, "Disconnect not sent");
        }
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Closing transport");
        }

        if self.serial_started {
            if let Some(serial) = self.serial.as_mut() {
                serial.deinit().await;
            }
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop().await;
        }

        self.streams_open = false;
        self.set_state(ControlState::Closed);
        let _ = self.events.send(SessionEvent::Disconnected);
        info!(uptime = ?self.started_at.elapsed(), "Control stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ControlStreamBuilder;
    use icomlan_core::QUANTUM_BYTES;
    use icomlan_test_harness::{MockAudioBackend, MockRemote, RecordingSerialBridge, mock_pair};

    const LOCAL_ID: u32 = 0xbb41_3f2b;
    const RADIO_ID: u32 = 0xe6b2_7b7b;
    const LOGIN_AUTH_ID: [u8; 6] = [0x5d, 0x37, 0x12, 0x82, 0x3b, 0xde];
    const GRANT_AUTH_ID: [u8; 6] = [0x31, 0x30, 0x31, 0x47, 0x39, 0x07];
    const GRANT_IDS: SessionIds = SessionIds {
        local: 0x5f8b_1e89,
        remote: 0xc65f_6f0c,
    };

    /// How the scripted radio behaves.
    #[derive(Clone, Copy)]
    struct Script {
        /// Answer the handshake at all.
        answer: bool,
        reject_login: bool,
        /// Acknowledge the first auth packet with a 0x05 echo.
        ack_first_auth: bool,
        ack_second_auth: bool,
        grant: bool,
    }

    impl Default for Script {
        fn default() -> Self {
            Script {
                answer: true,
                reject_login: false,
                ack_first_auth: false,
                ack_second_auth: true,
                grant: true,
            }
        }
    }

    fn radio_header(len: usize, frame_type: u8, seq: u16) -> Vec<u8> {
        let mut r = vec![0u8; len];
        r[0] = len as u8;
        r[4] = frame_type;
        r[6..8].copy_from_slice(&seq.to_le_bytes());
        r[8..12].copy_from_slice(&RADIO_ID.to_be_bytes());
        r[12..16].copy_from_slice(&LOCAL_ID.to_be_bytes());
        r
    }

    fn auth_ack() -> Vec<u8> {
        let mut r = radio_header(64, 0, 0x0e);
        r[16..20].copy_from_slice(&[0x00, 0x00, 0x00, 0x30]);
        r[20] = 0x02;
        r[21] = 0x05;
        r
    }

    fn grant() -> Vec<u8> {
        let mut r = vec![0u8; 144];
        r[0] = 0x90;
        r[8..12].copy_from_slice(&GRANT_IDS.remote.to_be_bytes());
        r[12..16].copy_from_slice(&GRANT_IDS.local.to_be_bytes());
        r[26..32].copy_from_slice(&GRANT_AUTH_ID);
        r[64..70].copy_from_slice(b"IC-705");
        r[96] = 0x01;
        r
    }

    fn responder(script: Script) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
        move |pkt: &[u8]| {
            if !script.answer {
                return Vec::new();
            }
            match (pkt.len(), pkt.get(4).copied(), packet::magic(pkt)) {
                (16, Some(0x03), _) => vec![radio_header(16, 0x04, 0)],
                (16, Some(0x06), _) => vec![radio_header(16, 0x06, 1)],
                (128, _, _) => {
                    let mut r = radio_header(96, 0, 1);
                    r[26..32].copy_from_slice(&LOGIN_AUTH_ID);
                    if script.reject_login {
                        r[48..52].copy_from_slice(&[0xff, 0xff, 0xff, 0xfe]);
                    }
                    vec![r]
                }
                (64, _, Some(0x02)) if script.ack_first_auth => vec![auth_ack()],
                (64, _, Some(0x05)) if script.ack_second_auth => vec![auth_ack()],
                (144, _, _) if script.grant => vec![grant()],
                _ => Vec::new(),
            }
        }
    }

    struct Session {
        stream: ControlStream,
        remote: MockRemote,
        serial: RecordingSerialBridge,
        audio: MockAudioBackend,
        events: broadcast::Receiver<SessionEvent>,
    }

    fn session(script: Script, initial_inner_seq: u16) -> Session {
        let (transport, remote) = mock_pair();
        remote.set_responder(responder(script));
        let serial = RecordingSerialBridge::new();
        let audio = MockAudioBackend::new();
        let stream = ControlStreamBuilder::new("beer", "beerbeer")
            .client_name("icom-pc")
            .local_id(LOCAL_ID)
            .client_id(0xa1b2)
            .initial_inner_seq(initial_inner_seq)
            .serial_bridge(Box::new(serial.clone()))
            .audio_backend(Box::new(audio.clone()))
            .build_with_transport(Box::new(transport))
            .unwrap();
        let events = stream.subscribe();
        Session {
            stream,
            remote,
            serial,
            audio,
            events,
        }
    }

    /// Datagrams that carry an auth id and inner sequence.
    fn authenticated(remote: &MockRemote) -> Vec<Vec<u8>> {
        remote.sent_matching(|p| matches!(p.len(), 64 | 128 | 144))
    }

    fn auth_packets_with_magic(remote: &MockRemote, magic: AuthMagic) -> usize {
        remote
            .sent_matching(|p| p.len() == 64 && p[21] == magic as u8)
            .len()
    }

    async fn run_for(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_reaches_streaming() {
        let mut s = session(Script::default(), 0x1234);
        s.stream.init().await.unwrap();
        assert_eq!(s.stream.state(), ControlState::FirstAuthSent);

        run_for(Duration::from_millis(1500)).await;
        assert_eq!(s.stream.state(), ControlState::Streaming);
        assert_eq!(s.serial.device_names(), vec!["IC-705".to_string()]);
        assert_eq!(s.audio.opens(), 1);

        assert_eq!(s.events.try_recv().unwrap(), SessionEvent::Authenticated);
        assert_eq!(
            s.events.try_recv().unwrap(),
            SessionEvent::StreamsOpened {
                device_name: "IC-705".into()
            }
        );

        // Framing first: two are-you-there, then are-you-ready.
        let sent = s.remote.sent();
        assert_eq!(sent[0][4], 0x03);
        assert_eq!(sent[1][4], 0x03);
        assert_eq!(sent[2][4], 0x06);
        assert_eq!(packet::sender_id(&sent[2]), Some(LOCAL_ID));
        assert_eq!(&sent[2][12..16], &RADIO_ID.to_be_bytes());
        assert_eq!(sent[3].len(), 128);

        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn inner_sequence_increments_once_per_authenticated_packet() {
        let mut s = session(Script::default(), 0xfffe);
        s.stream.init().await.unwrap();
        // Past one reauth.
        run_for(Duration::from_secs(61)).await;
        s.stream.deinit().await;

        let seqs: Vec<u16> = authenticated(&s.remote)
            .iter()
            .map(|p| packet::inner_sequence(p).unwrap())
            .collect();
        // login, first auth, second auth, stream request, reauth, deauth
        assert_eq!(seqs, vec![0xfffe, 0xffff, 0x0000, 0x0001, 0x0002, 0x0003]);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_id_is_reused_until_grant_replaces_it() {
        let mut s = session(Script::default(), 0);
        s.stream.init().await.unwrap();
        run_for(Duration::from_secs(61)).await;
        s.stream.deinit().await;

        let packets = authenticated(&s.remote);
        let request_at = packets.iter().position(|p| p.len() == 144).unwrap();
        for pkt in &packets[1..=request_at] {
            assert_eq!(packet::auth_id(pkt), Some(LOGIN_AUTH_ID));
        }
        let after = &packets[request_at + 1..];
        assert_eq!(after.len(), 2, "reauth and deauth expected after the grant");
        for pkt in after {
            assert_eq!(packet::auth_id(pkt), Some(GRANT_AUTH_ID));
            assert_eq!(packet::sender_id(pkt), Some(GRANT_IDS.local));
            assert_eq!(&pkt[12..16], &GRANT_IDS.remote.to_be_bytes());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_grant_is_ignored() {
        let mut s = session(Script::default(), 0);
        s.stream.init().await.unwrap();
        run_for(Duration::from_millis(1500)).await;
        assert_eq!(s.stream.state(), ControlState::Streaming);

        s.remote.push(&grant());
        s.remote.push(&grant());
        run_for(Duration::from_millis(500)).await;

        assert_eq!(s.serial.inits(), 1);
        assert_eq!(s.audio.opens(), 1);
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn early_ack_prevents_second_auth() {
        let script = Script {
            ack_first_auth: true,
            ..Script::default()
        };
        let mut s = session(script, 0);
        s.stream.init().await.unwrap();
        run_for(Duration::from_secs(10)).await;

        assert_eq!(s.stream.state(), ControlState::Streaming);
        assert_eq!(auth_packets_with_magic(&s.remote, AuthMagic::Reauth), 0);
        assert_eq!(s.remote.sent_matching(|p| p.len() == 144).len(), 1);
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_auth_fires_exactly_once_without_ack() {
        let script = Script {
            ack_second_auth: false,
            ..Script::default()
        };
        let mut s = session(script, 0);
        s.stream.init().await.unwrap();

        run_for(Duration::from_millis(900)).await;
        assert_eq!(auth_packets_with_magic(&s.remote, AuthMagic::Reauth), 0);

        run_for(Duration::from_secs(3)).await;
        assert_eq!(auth_packets_with_magic(&s.remote, AuthMagic::Reauth), 1);
        assert_eq!(s.stream.state(), ControlState::SecondAuthSent);
        assert!(s.remote.sent_matching(|p| p.len() == 144).is_empty());
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_grant_is_fatal_once() {
        let script = Script {
            grant: false,
            ..Script::default()
        };
        let mut s = session(script, 0);
        s.stream.init().await.unwrap();

        let start = Instant::now();
        let fatal = s.stream.next_fatal().await;
        assert!(matches!(fatal, Some(Error::Stalled(_))), "got {fatal:?}");
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(s.stream.state(), ControlState::StreamRequested);

        let second = tokio::time::timeout(Duration::from_secs(30), s.stream.next_fatal()).await;
        assert!(second.is_err(), "fatal error delivered twice");

        s.stream.deinit().await;
        assert!(s.stream.next_fatal().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_credentials_fail_init_without_auth() {
        let script = Script {
            reject_login: true,
            ..Script::default()
        };
        let mut s = session(script, 0);
        let result = s.stream.init().await;
        assert!(matches!(result, Err(Error::InvalidCredentials)));
        assert_eq!(s.stream.state(), ControlState::Closed);

        s.stream.deinit().await;
        assert!(s.remote.sent_matching(|p| p.len() == 64).is_empty());
        assert!(s.remote.sent_matching(|p| p.len() == 144).is_empty());
        assert!(s.remote.is_closed());
        assert_eq!(s.serial.inits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_radio_times_out() {
        let script = Script {
            answer: false,
            ..Script::default()
        };
        let mut s = session(script, 0);
        let result = s.stream.init().await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(s.remote.is_closed());
        assert!(s.remote.sent_matching(|p| p.len() == 128).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn init_twice_is_rejected() {
        let mut s = session(Script::default(), 0);
        s.stream.init().await.unwrap();
        assert!(matches!(s.stream.init().await, Err(Error::Protocol(_))));
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deinit_sends_exactly_one_deauth() {
        let mut s = session(Script::default(), 0);
        s.stream.init().await.unwrap();
        run_for(Duration::from_millis(1500)).await;

        s.stream.deinit().await;
        s.stream.deinit().await;

        assert_eq!(auth_packets_with_magic(&s.remote, AuthMagic::Deauth), 1);
        let sent = s.remote.sent();
        let last = sent.last().unwrap();
        assert_eq!(&last[..8], &[0x10, 0, 0, 0, 0x05, 0, 0, 0]);
        assert_eq!(sent[sent.len() - 2][21], AuthMagic::Deauth as u8);

        assert!(s.remote.is_closed());
        assert_eq!(s.serial.deinits(), 1);
        assert!(s.audio.playback_closed());
        assert!(s.audio.capture_closed());
        assert_eq!(s.stream.state(), ControlState::Closed);

        let mut saw_disconnected = false;
        while let Ok(event) = s.events.try_recv() {
            saw_disconnected |= event == SessionEvent::Disconnected;
        }
        assert!(saw_disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn deinit_before_init_sends_nothing() {
        let mut s = session(Script::default(), 0);
        s.stream.deinit().await;
        assert!(s.remote.sent().is_empty());
        assert!(s.stream.next_fatal().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_disconnect_is_fatal() {
        let mut s = session(Script::default(), 0);
        s.stream.init().await.unwrap();
        run_for(Duration::from_millis(1500)).await;

        let mut disconnect = radio_header(80, 0, 0x20);
        disconnect[64] = 0x01;
        s.remote.push(&disconnect);
        let fatal = s.stream.next_fatal().await;
        assert!(matches!(fatal, Some(Error::RemoteDisconnected)));
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connection_status_keeps_streaming() {
        let mut s = session(Script::default(), 0);
        s.stream.init().await.unwrap();
        run_for(Duration::from_millis(1500)).await;
        assert_eq!(s.stream.state(), ControlState::Streaming);

        s.remote.push(&radio_header(80, 0, 0x21));
        run_for(Duration::from_millis(500)).await;

        assert_eq!(s.stream.state(), ControlState::Streaming);
        let fatal = tokio::time::timeout(Duration::from_secs(1), s.stream.next_fatal()).await;
        assert!(fatal.is_err(), "status packet treated as fatal");
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn serial_init_failure_is_fatal_before_audio_opens() {
        let mut s = session(Script::default(), 0);
        s.serial.fail_init();
        s.stream.init().await.unwrap();
        run_for(Duration::from_millis(1500)).await;

        let fatal = s.stream.next_fatal().await;
        assert!(matches!(fatal, Some(Error::Transport(_))), "got {fatal:?}");
        let second = tokio::time::timeout(Duration::from_secs(30), s.stream.next_fatal()).await;
        assert!(second.is_err(), "fatal error delivered twice");

        assert_eq!(s.serial.inits(), 1);
        assert_eq!(s.audio.opens(), 0);
        assert_ne!(s.stream.state(), ControlState::Streaming);

        s.stream.deinit().await;
        assert_eq!(s.serial.deinits(), 1);
        assert_eq!(s.audio.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_auth_failure_is_fatal() {
        let mut s = session(Script::default(), 0);
        s.stream.init().await.unwrap();

        let mut failure = radio_header(80, 0, 0x03);
        failure[48..52].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        s.remote.push(&failure);
        let fatal = s.stream.next_fatal().await;
        assert!(matches!(fatal, Some(Error::AuthFailed)));
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_and_idle_echo_run_in_steady_state() {
        let mut s = session(Script::default(), 0);
        s.stream.init().await.unwrap();
        run_for(Duration::from_millis(1500)).await;
        s.remote.clear_sent();

        s.remote.push(&radio_header(16, 0, 0x7a31));
        run_for(Duration::from_millis(1000)).await;

        let pings = s.remote.sent_matching(|p| p.len() == 21);
        assert!((9..=11).contains(&pings.len()), "got {} pings", pings.len());
        let echoes = s
            .remote
            .sent_matching(|p| p.len() == 16 && packet::sequence(p) == Some(0x7a31));
        assert_eq!(echoes.len(), 1);
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_log_reports_latency() {
        let mut s = session(Script::default(), 0);
        s.stream.init().await.unwrap();
        run_for(Duration::from_millis(3100)).await;

        let mut latency_events = 0;
        while let Ok(event) = s.events.try_recv() {
            if matches!(event, SessionEvent::LatencyMeasured { .. }) {
                latency_events += 1;
            }
        }
        assert_eq!(latency_events, 1);
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn received_audio_is_played_after_grant() {
        let mut s = session(Script::default(), 0);
        let playback = s.stream.playback_sender();
        s.stream.init().await.unwrap();
        run_for(Duration::from_millis(1500)).await;

        let audio: Vec<u8> = (0..QUANTUM_BYTES * 2).map(|i| i as u8).collect();
        playback.send(Bytes::from(audio.clone())).await.unwrap();
        run_for(Duration::from_millis(100)).await;

        assert_eq!(s.audio.played(), audio);
        s.stream.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn captured_audio_reaches_the_capture_queue() {
        let mut s = session(Script::default(), 0);
        let mut captured = s.stream.take_capture_receiver().unwrap();
        assert!(s.stream.take_capture_receiver().is_none());
        s.stream.init().await.unwrap();
        run_for(Duration::from_millis(1500)).await;

        s.audio.feed_capture(&vec![7u8; QUANTUM_BYTES]);
        run_for(Duration::from_millis(100)).await;

        let quantum = captured.try_recv().unwrap();
        assert_eq!(quantum.len(), QUANTUM_BYTES);
        s.stream.deinit().await;
    }
}
