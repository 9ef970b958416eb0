//! The `mio`-based readiness multiplexer every socket in this crate runs
//! on: a `Token -> listener` table driven by a blocking `Poll::poll`, the
//! same shape as this workspace's existing `TcpConnector`/`ConnectionManager`
//! pair, generalized to host arbitrary listeners (plain sockets, TLS
//! sockets, accept listeners) instead of one baked-in connection type.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::Instant;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{error, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;

/// Registered against a [`Token`]; receives readiness notifications.
///
/// Implementors own their underlying `mio` source (a `TcpStream` or
/// `TcpListener`) and expose it via [`Listener::source`] so the loop can
/// register/reregister/deregister it without taking ownership away from the
/// listener.
pub trait Listener {
    fn source(&mut self) -> &mut dyn Source;

    /// Dispatch already holds `self.listeners` mutably here, so a listener
    /// can't register a new listener (accepted connection) or remove itself
    /// in place. It reports both back through [`DispatchEffects`] and
    /// [`EventLoop::turn`] applies them once the current pass finishes.
    fn on_readable(&mut self, registry: &Registry, token: Token) -> DispatchEffects;
    fn on_writable(&mut self, registry: &Registry, token: Token) -> DispatchEffects;
    /// `poll_error` distinguishes "`mio` reported an error on this fd" from
    /// an ordinary close request routed through [`EventLoop::remove_listener`].
    fn on_error(&mut self, registry: &Registry, token: Token, poll_error: bool);

    /// The next instant this listener needs another chance to run even
    /// without a readiness event — e.g. a connect attempt's overall
    /// deadline. `None` (the default) for listeners with nothing to wait on;
    /// most never override this.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    /// Called once `next_deadline()` has passed without an intervening
    /// readiness event. Default is a no-op for listeners that never report a
    /// deadline.
    fn on_timeout(&mut self, _registry: &Registry, _token: Token) -> DispatchEffects {
        DispatchEffects::none()
    }

    /// Lets [`EventLoop::listener_mut`] downcast back to the concrete type
    /// (e.g. a `Socket<A, Fr, M>`) so code holding a `Token` can reach it —
    /// e.g. to queue an outbound message — without the loop itself knowing
    /// about socket types. Implementations are always just `{ self }`.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// A listener awaiting registration, handed back from a dispatch callback
/// (e.g. a socket accepted off a listening fd).
pub struct PendingRegistration {
    pub listener: Box<dyn Listener>,
    pub interest: Interest,
}

/// What a dispatch callback asks the loop to do once it returns: register
/// any newly produced listeners, and/or remove this one.
#[derive(Default)]
pub struct DispatchEffects {
    pub new_listeners: Vec<PendingRegistration>,
    pub close_self: bool,
}

impl DispatchEffects {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn close() -> Self {
        Self { new_listeners: Vec::new(), close_self: true }
    }

    pub fn spawn(listener: Box<dyn Listener>, interest: Interest) -> Self {
        Self { new_listeners: vec![PendingRegistration { listener, interest }], close_self: false }
    }
}

type PostedTask = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Single-threaded dispatcher. All listener and registration state is
/// mutated only from the thread that calls [`EventLoop::run`] /
/// [`EventLoop::turn`]; [`EventLoop::poster`] is the only way other threads
/// feed it work.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listeners: HashMap<Token, Box<dyn Listener>>,
    next_token: usize,
    post_rx: Receiver<PostedTask>,
    post_tx: Sender<PostedTask>,
    waker: Arc<Waker>,
    stopped: bool,
}

/// A cheaply-cloneable handle other threads use to enqueue work onto the
/// loop thread and wake it up immediately.
#[derive(Clone)]
pub struct Poster {
    tx: Sender<PostedTask>,
    waker: Arc<Waker>,
}

impl Poster {
    /// Enqueues `task` to run on the loop thread at its next wake, and wakes
    /// the loop immediately rather than waiting for the next readiness event.
    pub fn post(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        if self.tx.send(Box::new(task)).is_err() {
            warn!("posted task dropped: event loop is gone");
            return;
        }
        if let Err(e) = self.waker.wake() {
            error!(%e, "failed to wake event loop after post");
        }
    }
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (post_tx, post_rx) = mpsc::channel();
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listeners: HashMap::new(),
            next_token: 0,
            post_rx,
            post_tx,
            waker,
            stopped: false,
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn poster(&self) -> Poster {
        Poster { tx: self.post_tx.clone(), waker: self.waker.clone() }
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let candidate = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1);
            if candidate != WAKER_TOKEN && !self.listeners.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Registers `listener`'s source for `interest` under a freshly
    /// allocated token and takes ownership of it.
    pub fn add_listener(&mut self, mut listener: Box<dyn Listener>, interest: Interest) -> io::Result<Token> {
        let token = self.allocate_token();
        self.poll.registry().register(listener.source(), token, interest)?;
        self.listeners.insert(token, listener);
        Ok(token)
    }

    /// Deregisters and drops the listener at `token`, if present.
    pub fn remove_listener(&mut self, token: Token) {
        if let Some(mut listener) = self.listeners.remove(&token) {
            let _ = self.poll.registry().deregister(listener.source());
            listener.on_error(self.poll.registry(), token, false);
        }
    }

    /// Looks up the listener registered at `token` and downcasts it to `T`.
    /// Returns `None` if the token is unknown or registered to a different
    /// concrete type.
    pub fn listener_mut<T: 'static>(&mut self, token: Token) -> Option<&mut T> {
        self.listeners.get_mut(&token)?.as_any_mut().downcast_mut::<T>()
    }

    /// Looks up and downcasts the listener at `token`, then calls `f` with
    /// it plus the loop's registry and that same token — the shape a
    /// `Poster`-deferred callback needs to act on a listener as if it were
    /// still inside `on_readable`/`on_writable` (e.g. a proxy leg forwarding
    /// onto its peer). No-op if `token` is unknown or registered to a
    /// different concrete type.
    pub fn with_listener<T: 'static>(&mut self, token: Token, f: impl FnOnce(&mut T, &Registry, Token)) {
        if let Some(listener) = self.listeners.get_mut(&token).and_then(|l| l.as_any_mut().downcast_mut::<T>()) {
            f(listener, self.poll.registry(), token);
        }
    }

    pub fn set_interest(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let Some(listener) = self.listeners.get_mut(&token) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown token"));
        };
        self.poll.registry().reregister(listener.source(), token, interest)
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Blocks until at least one readiness event or posted task is
    /// processed. Returns `false` once [`EventLoop::stop`] has been called.
    pub fn turn(&mut self) -> io::Result<bool> {
        if self.stopped {
            return Ok(false);
        }

        let now = Instant::now();
        let timeout = self.listeners.values().filter_map(|l| l.next_deadline()).map(|d| d.saturating_duration_since(now)).min();
        self.poll.poll(&mut self.events, timeout)?;

        let mut woken = false;
        let mut pending = Vec::new();
        let mut to_close = Vec::new();
        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        let flags: Vec<(bool, bool, bool)> =
            self.events.iter().map(|e| (e.is_error(), e.is_readable(), e.is_writable())).collect();

        for (token, (is_error, is_readable, is_writable)) in tokens.into_iter().zip(flags) {
            if token == WAKER_TOKEN {
                woken = true;
                continue;
            }
            if !self.listeners.contains_key(&token) {
                continue;
            }
            if is_error {
                if let Some(mut listener) = self.listeners.remove(&token) {
                    listener.on_error(self.poll.registry(), token, true);
                }
                continue;
            }
            if is_readable {
                if let Some(listener) = self.listeners.get_mut(&token) {
                    let effects = listener.on_readable(self.poll.registry(), token);
                    pending.extend(effects.new_listeners);
                    if effects.close_self {
                        to_close.push(token);
                    }
                }
            }
            if is_writable && self.listeners.contains_key(&token) && !to_close.contains(&token) {
                if let Some(listener) = self.listeners.get_mut(&token) {
                    let effects = listener.on_writable(self.poll.registry(), token);
                    pending.extend(effects.new_listeners);
                    if effects.close_self {
                        to_close.push(token);
                    }
                }
            }
        }

        // A hanging connect never raises a readiness event on its own (the
        // fd just never reports writable), so deadlines have to be swept
        // explicitly rather than discovered as a side effect of dispatch.
        let now = Instant::now();
        let timed_out: Vec<Token> = self
            .listeners
            .iter()
            .filter(|(token, listener)| !to_close.contains(token) && listener.next_deadline().is_some_and(|d| d <= now))
            .map(|(token, _)| *token)
            .collect();
        for token in timed_out {
            if let Some(listener) = self.listeners.get_mut(&token) {
                let effects = listener.on_timeout(self.poll.registry(), token);
                pending.extend(effects.new_listeners);
                if effects.close_self {
                    to_close.push(token);
                }
            }
        }

        for token in to_close {
            self.remove_listener(token);
        }
        for reg in pending {
            if let Err(e) = self.add_listener(reg.listener, reg.interest) {
                error!(%e, "failed to register listener accepted during dispatch");
            }
        }

        if woken {
            self.drain_posted();
        }

        Ok(!self.stopped)
    }

    fn drain_posted(&mut self) {
        loop {
            match self.post_rx.try_recv() {
                Ok(task) => task(self),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Runs [`EventLoop::turn`] until [`EventLoop::stop`] is called.
    pub fn run(&mut self) -> io::Result<()> {
        while self.turn()? {}
        Ok(())
    }
}
