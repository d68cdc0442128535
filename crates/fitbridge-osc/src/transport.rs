//! UDP transport actor
//!
//! One task owns the socket, the dispatcher table and the outbound queue.
//! Handles talk to it over a channel, so callbacks always run on the actor
//! task and never race each other.
//!
//! Handlers are keyed by `(address, scope)`. The scope is a manager or
//! correlation uid, [`WILDCARD_UID`] for every uid, or empty for messages that
//! carry no uid. A message whose first argument is uid-shaped is offered to
//! the exact uid scope, then the wildcard, then the empty scope.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fitbridge_core::state::MSG_COMMAND_TIMEOUT;
use fitbridge_core::{ConfirmCode, LivenessMode, OscConfig, Uid};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::address;
use crate::codec::{self, Arg, OscMessage};
use crate::error::{OscError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Scope matching every uid
pub const WILDCARD_UID: &str = "*";

const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(50);
const MAX_PACKET: usize = 65_536;

// ----------------------------------------------------------------------------
// Deliveries
// ----------------------------------------------------------------------------

/// What a handler callback receives
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub address: String,
    /// Uid the message was scoped to, stripped from `args`
    pub uid: Option<String>,
    pub args: Vec<Arg>,
    /// Set when the handler's deadline passed without a message
    pub timed_out: bool,
}

impl Delivery {
    fn timeout(address: String, uid: Option<String>) -> Self {
        Self {
            address,
            uid,
            args: Vec::new(),
            timed_out: true,
        }
    }
}

pub type Callback = Box<dyn FnMut(Delivery) + Send + 'static>;

/// Parsed `/confirm` payload: `(code, message, extra...)`
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmReply {
    pub code: ConfirmCode,
    pub message: String,
    pub payload: Vec<Arg>,
}

impl ConfirmReply {
    /// Reply synthesized when no confirm arrived in time
    pub fn timeout() -> Self {
        Self {
            code: ConfirmCode::Failed3,
            message: MSG_COMMAND_TIMEOUT.to_string(),
            payload: Vec::new(),
        }
    }

    pub fn from_delivery(delivery: Delivery) -> Self {
        if delivery.timed_out {
            return Self::timeout();
        }
        let mut args = delivery.args.into_iter();
        let code = args
            .next()
            .and_then(|a| a.as_i64())
            .and_then(ConfirmCode::from_code)
            .unwrap_or(ConfirmCode::Failed1);
        let message = match args.next() {
            Some(Arg::Str(s)) => s,
            _ => String::new(),
        };
        Self {
            code,
            message,
            payload: args.collect(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

// ----------------------------------------------------------------------------
// Actor Requests
// ----------------------------------------------------------------------------

type Key = (String, String);

struct Entry {
    callback: Callback,
    deadline: Option<Instant>,
    one_shot: bool,
}

enum Request {
    Send(OscMessage),
    Handle { key: Key, entry: Entry },
    Unhandle(Key),
    Close(oneshot::Sender<()>),
}

fn scope_uid(scope: &str) -> Option<String> {
    (!scope.is_empty() && scope != WILDCARD_UID).then(|| scope.to_string())
}

// ----------------------------------------------------------------------------
// Transport Handle
// ----------------------------------------------------------------------------

/// Cloneable handle to a running transport
#[derive(Clone)]
pub struct OscTransport {
    requests: mpsc::UnboundedSender<Request>,
    peer_live: Arc<AtomicBool>,
    local_addr: SocketAddr,
    command_timeout: Duration,
}

impl OscTransport {
    /// Bind the configured address and start the actor
    pub async fn start(config: &OscConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        Self::start_with_socket(socket, config.peer, config)
    }

    /// Start the actor on an already bound socket
    pub fn start_with_socket(
        socket: UdpSocket,
        peer: SocketAddr,
        config: &OscConfig,
    ) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let peer_live = Arc::new(AtomicBool::new(config.liveness == LivenessMode::Sender));
        let (requests, receiver) = mpsc::unbounded_channel();

        let actor = Actor {
            socket,
            peer,
            mode: config.liveness,
            ping_timeout: config.ping_timeout(),
            peer_live: peer_live.clone(),
            last_ping: None,
            queue: VecDeque::new(),
            handlers: HashMap::new(),
        };
        info!(
            "OSC transport on {} talking to {} ({:?})",
            local_addr, peer, config.liveness
        );
        tokio::spawn(actor.run(receiver, config.ping_interval()));

        Ok(Self {
            requests,
            peer_live,
            local_addr,
            command_timeout: config.command_timeout(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether outbound messages currently leave immediately
    pub fn is_peer_live(&self) -> bool {
        self.peer_live.load(Ordering::SeqCst)
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    fn request(&self, request: Request) -> Result<()> {
        self.requests.send(request).map_err(|_| OscError::Closed)
    }

    /// Send a message, queued while the peer is down
    ///
    /// A uid-shaped string as the first argument is indistinguishable from a
    /// [`send_device`](Self::send_device) scope on the wire. Receivers with a
    /// uid or [`WILDCARD_UID`] handler for `address` take it as the scope and
    /// strip it; only an unscoped handler sees the arguments unchanged.
    pub fn send(&self, address: &str, args: Vec<Arg>) -> Result<()> {
        self.request(Request::Send(OscMessage::new(address, args)))
    }

    /// Send a message scoped to a uid
    pub fn send_device(&self, address: &str, uid: &str, mut args: Vec<Arg>) -> Result<()> {
        args.insert(0, Arg::from(uid));
        self.send(address, args)
    }

    fn install(&self, address: &str, scope: &str, entry: Entry) -> Result<()> {
        self.request(Request::Handle {
            key: (address.to_string(), scope.to_string()),
            entry,
        })
    }

    /// Install a persistent handler for messages without a uid
    pub fn handle<F>(&self, address: &str, callback: F) -> Result<()>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        self.handle_device(address, "", callback)
    }

    /// Install a persistent handler for one uid, or [`WILDCARD_UID`]
    ///
    /// Scoped handlers win over an unscoped one for the same address.
    pub fn handle_device<F>(&self, address: &str, uid: &str, callback: F) -> Result<()>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        self.install(
            address,
            uid,
            Entry {
                callback: Box::new(callback),
                deadline: None,
                one_shot: false,
            },
        )
    }

    /// Install a one-shot handler, called with `timed_out` set if nothing
    /// arrives before `timeout`
    pub fn handle_once<F>(
        &self,
        address: &str,
        uid: &str,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        self.install(
            address,
            uid,
            Entry {
                callback: Box::new(callback),
                deadline: timeout.map(|t| Instant::now() + t),
                one_shot: true,
            },
        )
    }

    /// Forward every message for `(address, uid)` into a channel
    pub fn subscribe(&self, address: &str, uid: &str) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handle_device(address, uid, move |delivery| {
            let _ = tx.send(delivery);
        })?;
        Ok(rx)
    }

    pub fn unhandle(&self, address: &str, uid: &str) -> Result<()> {
        self.request(Request::Unhandle((address.to_string(), uid.to_string())))
    }

    /// Send `[uid, args...]` and call `callback` exactly once with the
    /// matching `/confirm`, or with `timed_out` set after the deadline
    pub fn send_confirm<F>(
        &self,
        address: &str,
        uid: &str,
        args: Vec<Arg>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        let timeout = timeout.unwrap_or(self.command_timeout);
        self.handle_once(address::CONFIRM, uid, Some(timeout), callback)?;
        self.send_device(address, uid, args)
    }

    /// Send a command and wait for its confirm
    ///
    /// Without a uid a fresh correlation uid is generated.
    pub async fn call(&self, address: &str, uid: Option<&str>, args: Vec<Arg>) -> ConfirmReply {
        let correlation = match uid {
            Some(uid) => uid.to_string(),
            None => Uid::generate().to_string(),
        };
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let sent = self.send_confirm(address, &correlation, args, None, move |delivery| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(ConfirmReply::from_delivery(delivery));
            }
        });
        if let Err(e) = sent {
            warn!("Cannot send {}: {}", address, e);
            return ConfirmReply::timeout();
        }
        rx.await.unwrap_or_else(|_| ConfirmReply::timeout())
    }

    /// Answer a command with `/confirm [uid, code, message, extra...]`
    pub fn reply(&self, uid: &str, code: ConfirmCode, message: &str, extra: Vec<Arg>) -> Result<()> {
        let mut args = Vec::with_capacity(extra.len() + 2);
        args.push(Arg::Int(i64::from(code.code())));
        args.push(Arg::from(message));
        args.extend(extra);
        self.send_device(address::CONFIRM, uid, args)
    }

    /// Stop the actor; pending one-shot handlers receive their timeout
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.request(Request::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

// ----------------------------------------------------------------------------
// Actor
// ----------------------------------------------------------------------------

struct Actor {
    socket: UdpSocket,
    peer: SocketAddr,
    mode: LivenessMode,
    ping_timeout: Duration,
    peer_live: Arc<AtomicBool>,
    last_ping: Option<Instant>,
    queue: VecDeque<Vec<u8>>,
    handlers: HashMap<Key, VecDeque<Entry>>,
}

impl Actor {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>, ping_interval: Duration) {
        let mut buf = vec![0u8; MAX_PACKET];
        let pinging = self.mode == LivenessMode::Sender;
        let mut ping = time::interval(ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Close(done)) => {
                        requests.close();
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(request) => self.apply(request).await,
                    None => {
                        self.shutdown();
                        break;
                    }
                },

                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.on_packet(&buf[..len], from).await,
                    Err(e) => debug!("OSC receive error: {}", e),
                },

                _ = ping.tick(), if pinging => self.send_ping().await,

                _ = maintenance.tick() => self.maintain(Instant::now()),
            }
        }
        debug!("OSC transport on {:?} stopped", self.socket.local_addr().ok());
    }

    async fn apply(&mut self, request: Request) {
        match request {
            Request::Send(message) => match codec::encode(&message) {
                Ok(bytes) => {
                    if self.peer_live.load(Ordering::SeqCst) {
                        self.transmit(&bytes).await;
                    } else {
                        trace!("Peer down, queueing {}", message.address);
                        self.queue.push_back(bytes);
                    }
                }
                Err(e) => warn!("Dropping {}: {}", message.address, e),
            },
            Request::Handle { key, entry } => {
                if entry.one_shot {
                    self.handlers.entry(key).or_default().push_back(entry);
                } else if let Some(previous) = self.handlers.insert(key.clone(), VecDeque::from([entry])) {
                    for old in previous.into_iter().filter(|e| e.one_shot) {
                        Self::fire_timeout(&key, old);
                    }
                }
            }
            Request::Unhandle(key) => {
                self.handlers.remove(&key);
            }
            Request::Close(_) => {}
        }
    }

    async fn transmit(&mut self, bytes: &[u8]) {
        if let Err(e) = self.socket.send_to(bytes, self.peer).await {
            debug!("OSC send to {} failed: {}", self.peer, e);
        }
    }

    async fn send_ping(&mut self) {
        match codec::encode(&OscMessage::new(address::PING, Vec::new())) {
            Ok(bytes) => self.transmit(&bytes).await,
            Err(e) => warn!("Cannot encode ping: {}", e),
        }
    }

    async fn on_packet(&mut self, bytes: &[u8], from: SocketAddr) {
        let messages = match codec::decode(bytes) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Dropping malformed packet from {}: {}", from, e);
                return;
            }
        };
        for message in messages {
            if message.address == address::PING {
                self.on_ping().await;
            } else {
                self.dispatch(message);
            }
        }
    }

    async fn on_ping(&mut self) {
        self.last_ping = Some(Instant::now());
        if !self.peer_live.swap(true, Ordering::SeqCst) {
            info!(
                "OSC peer {} is up, flushing {} queued messages",
                self.peer,
                self.queue.len()
            );
        }
        while let Some(bytes) = self.queue.pop_front() {
            self.transmit(&bytes).await;
        }
    }

    fn dispatch(&mut self, message: OscMessage) {
        let OscMessage { address, mut args } = message;
        let uid = match args.first() {
            Some(Arg::Str(s)) if Uid::is_uid(s) => Some(s.clone()),
            _ => None,
        };
        let scopes: Vec<&str> = match &uid {
            Some(uid) => vec![uid.as_str(), WILDCARD_UID, ""],
            None => vec!["", WILDCARD_UID],
        };
        let Some(key) = scopes
            .into_iter()
            .map(|scope| (address.clone(), scope.to_string()))
            .find(|key| self.handlers.contains_key(key))
        else {
            debug!("No handler for {}", address);
            return;
        };

        let scoped = uid.is_some() && !key.1.is_empty();
        if scoped {
            args.remove(0);
        }
        let delivery = Delivery {
            address,
            uid: if scoped { uid } else { None },
            args,
            timed_out: false,
        };

        let Some(queue) = self.handlers.get_mut(&key) else {
            return;
        };
        let Some(one_shot) = queue.front().map(|e| e.one_shot) else {
            return;
        };
        if one_shot {
            if let Some(mut entry) = queue.pop_front() {
                (entry.callback)(delivery);
            }
            if queue.is_empty() {
                self.handlers.remove(&key);
            }
        } else if let Some(front) = queue.front_mut() {
            front.deadline = None;
            (front.callback)(delivery);
        }
    }

    fn maintain(&mut self, now: Instant) {
        if self.mode == LivenessMode::Receiver && self.peer_live.load(Ordering::SeqCst) {
            if let Some(last) = self.last_ping {
                if now.duration_since(last) > self.ping_timeout {
                    self.peer_live.store(false, Ordering::SeqCst);
                    warn!(
                        "No ping from {} for {:?}, holding outbound messages",
                        self.peer, self.ping_timeout
                    );
                }
            }
        }

        let mut expired = Vec::new();
        self.handlers.retain(|key, queue| {
            let mut i = 0;
            while i < queue.len() {
                if queue[i].deadline.is_some_and(|d| d <= now) {
                    if let Some(entry) = queue.remove(i) {
                        expired.push((key.clone(), entry));
                    }
                } else {
                    i += 1;
                }
            }
            !queue.is_empty()
        });
        for (key, entry) in expired {
            Self::fire_timeout(&key, entry);
        }
    }

    fn fire_timeout(key: &Key, mut entry: Entry) {
        debug!("Handler for {} ({:?}) timed out", key.0, key.1);
        (entry.callback)(Delivery::timeout(key.0.clone(), scope_uid(&key.1)));
    }

    fn shutdown(&mut self) {
        for (key, queue) in std::mem::take(&mut self.handlers) {
            for entry in queue.into_iter().filter(|e| e.one_shot) {
                Self::fire_timeout(&key, entry);
            }
        }
        if !self.queue.is_empty() {
            warn!("Discarding {} queued messages on close", self.queue.len());
        }
    }
}
