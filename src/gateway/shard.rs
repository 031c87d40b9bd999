//! Gateway shard: socket lifecycle, heartbeat, identify/resume, and the
//! outbound send path.
//!
//! A shard is a driver task owning one websocket connection at a time plus
//! the session state that survives reconnects. The caller talks to it
//! through a [`Shard`] handle: a command channel in, a [`ShardEvent`]
//! stream out. Outbound frames pass through the [`SendScheduler`] so
//! heartbeats and handshake frames jump ahead of ordinary traffic without
//! breaking the server's send budget.

use crate::backoff::RetryBackoff;
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::events::{CloseEvent, DiagnosticEvent, EventBus, ShardEvent};
use crate::gateway::inflater::Inflater;
use crate::gateway::payload::{self, GatewayFrame, OpCode};
use crate::gateway::session::Session;
use crate::gateway::subscriptions;
use crate::jitter::{self, Jitter};
use crate::scheduler::{SendPoll, SendScheduler};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

/// Hard cap on a single outbound frame.
const MAX_OUTBOUND_BYTES: usize = 15 * 1024;

/// How long the server has to send HELLO after the socket opens.
const HELLO_TIMEOUT: Duration = Duration::from_secs(20);

/// Close code asking the server for a clean reconnect.
const CLOSE_RECONNECT: u16 = 4000;

/// Close code for session timeout; also used for synthesized closes
/// (zombie connection, missing close frame).
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Reconnecting,
    /// Socket open, waiting for HELLO.
    Nearly,
    Identifying,
    Resuming,
    /// Session started, guild payloads still streaming in.
    WaitingForGuilds,
    Ready,
    Disconnected,
}

impl ConnectionState {
    /// States in which heartbeats are forced out even without an ack for
    /// the previous one.
    fn forces_heartbeat(self) -> bool {
        matches!(self, Self::Identifying | Self::Resuming | Self::WaitingForGuilds)
    }
}

/// Whether the previous heartbeat situation means the connection is a
/// zombie at this tick.
fn is_zombie(acked: bool, state: ConnectionState) -> bool {
    !acked && !state.forces_heartbeat()
}

/// What to do after a close code from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseAction {
    /// Reconnect and try to resume.
    Resume,
    /// Session is gone; reconnect and identify fresh.
    Reidentify,
    /// Stop reconnecting and surface the close.
    Fatal,
}

fn classify_close(code: u16) -> CloseAction {
    match code {
        // Authentication failed, invalid shard, sharding required,
        // invalid version, invalid or disallowed intents.
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseAction::Fatal,
        // Normal close, invalid sequence, session timed out.
        1000 | 4007 | 4009 => CloseAction::Reidentify,
        _ => CloseAction::Resume,
    }
}

enum Command {
    Send { payload: String, important: bool },
    Destroy { code: u16 },
}

/// How one connection ended, deciding the next step of the reconnect
/// loop.
enum End {
    /// Reconnect now; the session may be resumable.
    Resume,
    /// Session invalidated; wait, then identify from scratch.
    ReidentifyAfter(Duration),
    /// Transport trouble; reconnect after backoff.
    Backoff,
    /// Fatal close; stop the shard.
    Fatal(CloseEvent),
    /// Caller tore the shard down.
    Shutdown,
}

/// Handle to a running shard.
#[derive(Debug)]
pub struct Shard {
    id: u16,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<Mutex<ConnectionState>>,
    ping_ms: Arc<AtomicU64>,
}

impl Shard {
    /// Connect a shard and wait for the first READY or RESUMED.
    ///
    /// Returns the handle plus the lifecycle event stream. The driver task
    /// keeps the connection alive (reconnecting as needed) until
    /// [`destroy`](Self::destroy) is called or the handle and receiver are
    /// dropped.
    pub async fn connect(
        config: GatewayConfig,
        bus: EventBus,
    ) -> Result<(Self, mpsc::Receiver<ShardEvent>), GatewayError> {
        let shard_id = config.shard_id;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        let (ready_tx, ready_rx) = oneshot::channel();
        let state = Arc::new(Mutex::new(ConnectionState::Idle));
        let ping_ms = Arc::new(AtomicU64::new(0));

        let clock = SystemClock::default();
        let scheduler = SendScheduler::new(
            config.scheduler.capacity,
            config.scheduler.window_ms,
            config.scheduler.important_burst,
            clock.now_millis(),
        );

        let driver = Driver {
            id: shard_id,
            config: Arc::new(config),
            bus,
            events: event_tx,
            commands: command_rx,
            state: Arc::clone(&state),
            ping_ms: Arc::clone(&ping_ms),
            session: Session::new(),
            scheduler,
            clock,
            inflater: Inflater::new(),
            expected_guilds: BTreeSet::new(),
            ready_notify: Some(ready_tx),
            destroyed: false,
        };
        tokio::spawn(driver.run());

        match ready_rx.await {
            Ok(Ok(())) => Ok((
                Self { id: shard_id, commands: command_tx, state, ping_ms },
                event_rx,
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::ChannelClosed),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Latest heartbeat round trip, zero before the first ack.
    pub fn ping(&self) -> Duration {
        Duration::from_millis(self.ping_ms.load(Ordering::Relaxed))
    }

    /// Queue a payload for the gateway. Important frames jump the send
    /// queue.
    ///
    /// Refuses frames above the outbound size cap; the connection stays
    /// open.
    pub fn send(&self, payload: &serde_json::Value, important: bool) -> Result<(), GatewayError> {
        let encoded = serde_json::to_string(payload)?;
        if encoded.len() > MAX_OUTBOUND_BYTES {
            return Err(GatewayError::PayloadTooLarge {
                len: encoded.len(),
                max: MAX_OUTBOUND_BYTES,
            });
        }
        self.commands
            .send(Command::Send { payload: encoded, important })
            .map_err(|_| GatewayError::ChannelClosed)
    }

    /// Tear the shard down with a normal close.
    pub fn destroy(&self) {
        let _ = self.commands.send(Command::Destroy { code: 1000 });
    }
}

struct Driver {
    id: u16,
    config: Arc<GatewayConfig>,
    bus: EventBus,
    events: mpsc::Sender<ShardEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: Arc<Mutex<ConnectionState>>,
    ping_ms: Arc<AtomicU64>,
    session: Session,
    scheduler: SendScheduler,
    clock: SystemClock,
    /// Persistent zlib context, reset on every reconnect because the
    /// server starts a fresh stream per connection.
    inflater: Inflater,
    expected_guilds: BTreeSet<String>,
    ready_notify: Option<oneshot::Sender<Result<(), GatewayError>>>,
    destroyed: bool,
}

/// Per-connection heartbeat bookkeeping.
struct Heartbeat {
    interval: Duration,
    next_at: Instant,
    acked: bool,
    last_sent: Option<Instant>,
}

/// Per-connection deadlines. `None` means "not armed".
#[derive(Default)]
struct Timers {
    ready_deadline: Option<Instant>,
    close_watchdog: Option<Instant>,
    scheduler_wake: Option<Instant>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        let reconnect = RetryBackoff::reconnect();
        let mut attempts: u32 = 0;
        let mut first = true;

        loop {
            if self.destroyed {
                break;
            }
            self.set_state(if first { ConnectionState::Connecting } else {
                ConnectionState::Reconnecting
            });
            first = false;

            let url = match self.connect_url() {
                Ok(url) => url,
                Err(e) => {
                    self.notify_ready(Err(e));
                    break;
                }
            };
            self.debug(format!("connecting to {url}"));

            let socket = match connect_async(url.as_str()).await {
                Ok((socket, _)) => socket,
                Err(e) => {
                    warn!(shard_id = self.id, error = %e, "gateway connect failed");
                    self.emit(ShardEvent::Error {
                        shard_id: self.id,
                        message: format!("connect failed: {e}"),
                    })
                    .await;
                    // A socket that never opened fails the initial
                    // connect() call outright.
                    if self.ready_notify.is_some() {
                        self.notify_ready(Err(GatewayError::Transport(e)));
                        break;
                    }
                    attempts += 1;
                    sleep(reconnect.delay(attempts)).await;
                    continue;
                }
            };

            info!(shard_id = self.id, "gateway socket open");
            self.set_state(ConnectionState::Nearly);
            attempts = 0;

            let end = self.run_connection(socket).await;

            self.session.snapshot_on_close();
            self.scheduler.clear();
            self.ping_ms.store(0, Ordering::Relaxed);
            self.set_state(ConnectionState::Disconnected);

            match end {
                End::Resume => continue,
                End::ReidentifyAfter(delay) => {
                    self.session.invalidate();
                    sleep(delay).await;
                }
                End::Backoff => {
                    attempts += 1;
                    sleep(reconnect.delay(attempts)).await;
                }
                End::Fatal(close) => {
                    self.notify_ready(Err(GatewayError::Closed {
                        code: close.code,
                        reason: close.reason,
                    }));
                    break;
                }
                End::Shutdown => {
                    self.notify_ready(Err(GatewayError::Destroyed));
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.emit(ShardEvent::Destroyed { shard_id: self.id }).await;
    }

    /// Resume URL when a session is resumable, otherwise the configured
    /// gateway, with protocol query parameters attached.
    fn connect_url(&self) -> Result<Url, GatewayError> {
        let base = match (self.session.resumable(), self.session.resume_url()) {
            (Some(_), Some(url)) => url,
            _ => self.config.gateway_url.as_str(),
        };
        let mut url = Url::parse(base)?;
        url.query_pairs_mut()
            .clear()
            .append_pair("v", &self.config.version.to_string())
            .append_pair("encoding", &self.config.encoding);
        if self.config.compress {
            url.query_pairs_mut().append_pair("compress", "zlib-stream");
        }
        Ok(url)
    }

    async fn run_connection(&mut self, socket: WebSocketStream<MaybeTlsStream<TcpStream>>) -> End {
        let (mut sink, mut stream) = socket.split();
        self.inflater.reset();

        // Phase 1: HELLO within the handshake window.
        let interval_ms = match self.await_hello(&mut stream).await {
            Ok(interval) => interval,
            Err(end) => {
                let _ = close_socket(&mut sink, CLOSE_SESSION_TIMEOUT, "hello timeout").await;
                return end;
            }
        };

        let mut hb = Heartbeat {
            interval: Duration::from_millis(interval_ms),
            // First heartbeat lands uniformly inside the interval.
            next_at: Instant::now() + Jitter::Full.apply(Duration::from_millis(interval_ms)),
            acked: true,
            last_sent: None,
        };
        self.debug(format!("hello received, heartbeat every {interval_ms}ms"));

        // Phase 2: identify or resume, through the scheduler like every
        // other important frame.
        if let Some((session_id, seq)) = self.session.resumable() {
            self.set_state(ConnectionState::Resuming);
            let frame = payload::resume(&self.config.token, session_id, seq);
            self.scheduler.enqueue(frame, true);
        } else {
            self.set_state(ConnectionState::Identifying);
            self.scheduler.enqueue(payload::identify(&self.config), true);
        }

        let mut timers = Timers::default();

        loop {
            if let Err(end) = self.pump_sends(&mut sink, &mut timers).await {
                return end;
            }

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Send { payload, important }) => {
                            self.enqueue_checked(payload, important).await;
                        }
                        Some(Command::Destroy { code }) => {
                            self.destroyed = true;
                            self.debug(format!("destroying with close {code}"));
                            if close_socket(&mut sink, code, "shutting down").await.is_err() {
                                return End::Shutdown;
                            }
                            timers.close_watchdog = Some(
                                Instant::now()
                                    + Duration::from_millis(self.config.close_timeout_ms),
                            );
                        }
                        None => {
                            // Handle dropped; treat as a quiet shutdown.
                            self.destroyed = true;
                            let _ = close_socket(&mut sink, 1000, "handle dropped").await;
                            return End::Shutdown;
                        }
                    }
                }

                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(end) =
                                self.handle_frame(&text, &mut sink, &mut hb, &mut timers).await
                            {
                                return end;
                            }
                        }
                        Some(Ok(WsMessage::Binary(chunk))) => {
                            match self.inflater.push(&chunk) {
                                Ok(Some(text)) => {
                                    if let Some(end) = self
                                        .handle_frame(&text, &mut sink, &mut hb, &mut timers)
                                        .await
                                    {
                                        return end;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    self.emit(ShardEvent::Error {
                                        shard_id: self.id,
                                        message: e.to_string(),
                                    })
                                    .await;
                                    let _ = close_socket(&mut sink, 1011, "bad zlib stream").await;
                                    return End::Backoff;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = sink.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let close = match frame {
                                Some(f) => CloseEvent {
                                    code: f.code.into(),
                                    reason: f.reason.into_owned(),
                                    was_clean: true,
                                },
                                None => CloseEvent {
                                    code: 1005,
                                    reason: String::new(),
                                    was_clean: true,
                                },
                            };
                            return self.finish_close(close).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            self.emit(ShardEvent::Error {
                                shard_id: self.id,
                                message: format!("websocket error: {e}"),
                            })
                            .await;
                            return if self.destroyed { End::Shutdown } else { End::Backoff };
                        }
                        None => {
                            let close = CloseEvent {
                                code: 1006,
                                reason: "connection reset".to_owned(),
                                was_clean: false,
                            };
                            return self.finish_close(close).await;
                        }
                    }
                }

                _ = sleep_until(hb.next_at) => {
                    if is_zombie(hb.acked, self.current_state()) {
                        warn!(shard_id = self.id, "heartbeat never acked, zombie connection");
                        let _ = close_socket(&mut sink, CLOSE_SESSION_TIMEOUT, "zombie").await;
                        let close = CloseEvent {
                            code: CLOSE_SESSION_TIMEOUT,
                            reason: "heartbeat ack timeout".to_owned(),
                            was_clean: false,
                        };
                        self.emit(ShardEvent::Close { shard_id: self.id, event: close }).await;
                        return if self.destroyed { End::Shutdown } else { End::Resume };
                    }
                    let seq = self.session.heartbeat_sequence();
                    self.scheduler
                        .enqueue(payload::heartbeat(seq, self.config.use_qos_heartbeat), true);
                    hb.acked = false;
                    hb.last_sent = Some(Instant::now());
                    hb.next_at = Instant::now() + hb.interval;
                }

                _ = sleep_until_opt(timers.scheduler_wake) => {
                    // Tokens refilled; the next pump drains what it can.
                    timers.scheduler_wake = None;
                }

                _ = sleep_until_opt(timers.ready_deadline) => {
                    timers.ready_deadline = None;
                    let leftover = std::mem::take(&mut self.expected_guilds);
                    self.set_state(ConnectionState::Ready);
                    self.emit(ShardEvent::AllReady {
                        shard_id: self.id,
                        pending: if leftover.is_empty() { None } else { Some(leftover) },
                    })
                    .await;
                }

                _ = sleep_until_opt(timers.close_watchdog) => {
                    // No close frame arrived in time; synthesize one.
                    let close = CloseEvent {
                        code: CLOSE_SESSION_TIMEOUT,
                        reason: "close frame never arrived".to_owned(),
                        was_clean: false,
                    };
                    return self.finish_close(close).await;
                }
            }
        }
    }

    /// Wait for the HELLO frame, inflating if the link is compressed.
    async fn await_hello(&mut self, stream: &mut WsStream) -> Result<u64, End> {
        let deadline = Instant::now() + HELLO_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match timeout(remaining, stream.next()).await {
                Err(_) => {
                    warn!(shard_id = self.id, "no HELLO within {HELLO_TIMEOUT:?}");
                    self.emit(ShardEvent::Error {
                        shard_id: self.id,
                        message: GatewayError::HelloTimeout(HELLO_TIMEOUT).to_string(),
                    })
                    .await;
                    return Err(End::Backoff);
                }
                Ok(None) => return Err(End::Backoff),
                Ok(Some(Err(_))) => return Err(End::Backoff),
                Ok(Some(Ok(message))) => message,
            };

            let text = match message {
                WsMessage::Text(text) => text,
                WsMessage::Binary(chunk) => match self.inflater.push(&chunk) {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(_) => return Err(End::Backoff),
                },
                WsMessage::Close(frame) => {
                    let code = frame.as_ref().map(|f| f.code.into()).unwrap_or(1005u16);
                    let close = CloseEvent {
                        code,
                        reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                        was_clean: true,
                    };
                    self.emit(ShardEvent::Close { shard_id: self.id, event: close.clone() }).await;
                    return Err(match classify_close(code) {
                        CloseAction::Fatal => End::Fatal(close),
                        _ => End::Backoff,
                    });
                }
                _ => continue,
            };

            let frame: GatewayFrame = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            if frame.opcode() == Some(OpCode::Hello) {
                let interval = frame
                    .d
                    .as_ref()
                    .and_then(|d| d.get("heartbeat_interval"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(41_250);
                return Ok(interval);
            }
        }
    }

    /// Drain the scheduler into the socket until it runs dry or runs out
    /// of tokens.
    async fn pump_sends(&mut self, sink: &mut WsSink, timers: &mut Timers) -> Result<(), End> {
        loop {
            match self.scheduler.poll_send(self.clock.now_millis()) {
                SendPoll::Ready(frame) => {
                    if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                        self.emit(ShardEvent::Error {
                            shard_id: self.id,
                            message: format!("websocket send failed: {e}"),
                        })
                        .await;
                        return Err(if self.destroyed { End::Shutdown } else { End::Backoff });
                    }
                }
                SendPoll::WaitUntil(at_ms) => {
                    let in_ms = at_ms.saturating_sub(self.clock.now_millis());
                    timers.scheduler_wake =
                        Some(Instant::now() + Duration::from_millis(in_ms));
                    return Ok(());
                }
                SendPoll::Empty => {
                    timers.scheduler_wake = None;
                    return Ok(());
                }
            }
        }
    }

    /// Process one inbound text frame. Returns how the connection ends,
    /// when it does.
    async fn handle_frame(
        &mut self,
        text: &str,
        sink: &mut WsSink,
        hb: &mut Heartbeat,
        timers: &mut Timers,
    ) -> Option<End> {
        self.bus.emit_with(|| DiagnosticEvent::Raw {
            shard_id: self.id,
            payload: text.to_owned(),
        });

        let frame: GatewayFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.emit(ShardEvent::Error {
                    shard_id: self.id,
                    message: format!("undecodable frame: {e}"),
                })
                .await;
                return None;
            }
        };

        if let Some(seq) = frame.s {
            self.session.record_sequence(seq);
        }

        match frame.opcode() {
            Some(OpCode::Dispatch) => {
                let name = frame.t.clone().unwrap_or_default();
                let data = frame.d.clone().unwrap_or(serde_json::Value::Null);
                let sequence = frame.s.unwrap_or(self.session.sequence());

                match name.as_str() {
                    "READY" => self.handle_ready(&data, timers).await,
                    "RESUMED" => {
                        self.set_state(ConnectionState::Ready);
                        self.emit(ShardEvent::Resumed { shard_id: self.id }).await;
                        self.notify_ready(Ok(()));
                    }
                    "GUILD_CREATE" => {
                        if let Some(id) = data.get("id").and_then(|v| v.as_str()) {
                            if self.expected_guilds.remove(id)
                                && self.expected_guilds.is_empty()
                                && self.current_state() == ConnectionState::WaitingForGuilds
                            {
                                timers.ready_deadline = None;
                                self.set_state(ConnectionState::Ready);
                                self.emit(ShardEvent::AllReady {
                                    shard_id: self.id,
                                    pending: None,
                                })
                                .await;
                            }
                        }
                    }
                    _ => {}
                }

                if self
                    .events
                    .send(ShardEvent::Dispatch {
                        shard_id: self.id,
                        event: name,
                        data,
                        sequence,
                    })
                    .await
                    .is_err()
                {
                    // Consumer is gone; shut down quietly.
                    self.destroyed = true;
                    return Some(End::Shutdown);
                }
            }
            Some(OpCode::Heartbeat) => {
                let seq = self.session.heartbeat_sequence();
                self.scheduler
                    .enqueue(payload::heartbeat(seq, self.config.use_qos_heartbeat), true);
            }
            Some(OpCode::HeartbeatAck) => {
                hb.acked = true;
                if let Some(sent) = hb.last_sent.take() {
                    let rtt = sent.elapsed();
                    self.ping_ms.store(rtt.as_millis() as u64, Ordering::Relaxed);
                    self.debug(format!("heartbeat acked in {}ms", rtt.as_millis()));
                }
            }
            Some(OpCode::InvalidSession) => {
                let resumable = frame.d.as_ref().and_then(|d| d.as_bool()).unwrap_or(false);
                self.emit(ShardEvent::InvalidSession { shard_id: self.id, resumable }).await;

                if resumable {
                    if let Some((session_id, seq)) = self.session.resumable() {
                        let resume = payload::resume(&self.config.token, session_id, seq);
                        self.set_state(ConnectionState::Resuming);
                        self.scheduler.enqueue(resume, true);
                        return None;
                    }
                }
                self.session.invalidate();
                self.notify_ready(Err(GatewayError::SessionInvalidated));
                let delay = jitter::range_millis(1_000, 5_000);
                return Some(End::ReidentifyAfter(delay));
            }
            Some(OpCode::Reconnect) => {
                self.debug("server requested reconnect".to_owned());
                let _ = close_socket(sink, CLOSE_RECONNECT, "reconnect requested").await;
                let close = CloseEvent {
                    code: CLOSE_RECONNECT,
                    reason: "reconnect requested".to_owned(),
                    was_clean: false,
                };
                self.emit(ShardEvent::Close { shard_id: self.id, event: close }).await;
                return Some(End::Resume);
            }
            _ => {
                self.debug(format!("ignoring frame op {}", frame.op));
            }
        }

        None
    }

    async fn handle_ready(&mut self, data: &serde_json::Value, timers: &mut Timers) {
        let session_id = data
            .get("session_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let resume_url = data
            .get("resume_gateway_url")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        self.session.establish(session_id.clone(), resume_url);

        self.expected_guilds = data
            .get("guilds")
            .and_then(|v| v.as_array())
            .map(|guilds| {
                guilds
                    .iter()
                    .filter_map(|g| g.get("id").and_then(|id| id.as_str()))
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let guild_count = self.expected_guilds.len();
        info!(shard_id = self.id, guilds = guild_count, "session started");
        self.emit(ShardEvent::Ready { shard_id: self.id, session_id, guild_count }).await;
        self.notify_ready(Ok(()));

        // Announce interest in every guild, within the per-frame budget.
        for chunk in subscriptions::plan(self.expected_guilds.iter().cloned()) {
            let frame = format!("{{\"op\":{},\"d\":{}}}", OpCode::GuildSubscriptionsBulk as u8, chunk);
            self.scheduler.enqueue(frame, false);
        }

        if self.expected_guilds.is_empty() {
            self.set_state(ConnectionState::Ready);
            self.emit(ShardEvent::AllReady { shard_id: self.id, pending: None }).await;
        } else {
            self.set_state(ConnectionState::WaitingForGuilds);
            let wait = if self.config.wants_guilds() {
                Duration::from_millis(self.config.wait_guild_timeout_ms)
            } else {
                Duration::ZERO
            };
            timers.ready_deadline = Some(Instant::now() + wait);
        }
    }

    /// Emit the terminal close event and pick what happens next.
    async fn finish_close(&mut self, close: CloseEvent) -> End {
        warn!(shard_id = self.id, code = close.code, clean = close.was_clean, "gateway closed");
        self.emit(ShardEvent::Close { shard_id: self.id, event: close.clone() }).await;

        if self.destroyed {
            return End::Shutdown;
        }
        match classify_close(close.code) {
            CloseAction::Fatal => End::Fatal(close),
            CloseAction::Reidentify => {
                self.session.invalidate();
                self.notify_ready(Err(GatewayError::Closed {
                    code: close.code,
                    reason: close.reason,
                }));
                End::ReidentifyAfter(Duration::ZERO)
            }
            CloseAction::Resume => End::Resume,
        }
    }

    async fn enqueue_checked(&mut self, payload: String, important: bool) {
        if payload.len() > MAX_OUTBOUND_BYTES {
            self.emit(ShardEvent::Error {
                shard_id: self.id,
                message: GatewayError::PayloadTooLarge {
                    len: payload.len(),
                    max: MAX_OUTBOUND_BYTES,
                }
                .to_string(),
            })
            .await;
            return;
        }
        self.scheduler.enqueue(payload, important);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != next {
            debug!(shard_id = self.id, ?next, "state change");
            *state = next;
        }
    }

    fn notify_ready(&mut self, result: Result<(), GatewayError>) {
        if let Some(tx) = self.ready_notify.take() {
            let _ = tx.send(result);
        }
    }

    async fn emit(&self, event: ShardEvent) {
        let _ = self.events.send(event).await;
    }

    fn debug(&self, message: String) {
        debug!(shard_id = self.id, "{message}");
        self.bus.emit_with(|| DiagnosticEvent::Debug {
            shard_id: Some(self.id),
            message,
        });
    }
}

async fn close_socket(
    sink: &mut WsSink,
    code: u16,
    reason: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    sink.send(WsMessage::Close(Some(CloseFrame {
        code: code.into(),
        reason: reason.to_owned().into(),
    })))
    .await
}
