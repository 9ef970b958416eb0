//! Liveness monitor: a shared registry ticked on its own thread, deciding
//! when a connection should be pinged, reconnected, or dropped.
//!
//! Grounded on `flux-network`'s `TcpConnector` reconnect loop (a `Repeater`
//! gating retry attempts) generalized from "one connector watching one
//! target" to an arbitrary set of named tasks. The monitor never touches a
//! `Socket` directly — it's generic only over `Token` and the closures a
//! caller supplies at registration, the same type-erasure [`crate::server::proxy`]
//! uses to forward across two independently-typed legs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mio::Token;
use tracing::{debug, warn};

use crate::config::NetConfig;
use crate::event_loop::Poster;
use crate::time::Repeater;

/// Whether a task is a connection this process merely observes, or one it
/// is responsible for keeping alive by reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorRole {
    WatchExisting,
    KeepAliveTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LivenessState {
    NotConnected,
    Connecting,
    Connected,
    MaybeConnected,
}

fn now_epoch_secs() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

type PingFn = Box<dyn Fn(&Poster, Token) + Send + Sync>;
type ReconnectFn = Box<dyn Fn(&Poster) + Send + Sync>;
type DropFn = Box<dyn Fn(&Poster, Token) + Send + Sync>;

/// One monitored connection. `last_read_epoch_seconds` is the only field
/// the event loop thread touches (via [`LivenessMonitor::touch`]); `state`
/// and `token` only ever change from the monitor's own tick thread.
struct MonitorTask {
    role: MonitorRole,
    state: Mutex<LivenessState>,
    token: Mutex<Option<Token>>,
    last_read_epoch_seconds: AtomicU32,
    send_ping: PingFn,
    reconnect: ReconnectFn,
    drop_connection: DropFn,
}

/// Shared liveness registry, ticked every [`NetConfig::liveness_tick`] on a
/// dedicated thread. Call [`LivenessMonitor::spawn`] once per process (or
/// per independently-lifecycled group of connections) and keep the
/// returned handle alive for as long as its tasks should be monitored.
pub struct LivenessMonitor {
    tasks: Mutex<HashMap<String, MonitorTask>>,
    poster: Poster,
    idle_threshold: Duration,
    unresponsive_threshold: Duration,
    stop: Arc<AtomicBool>,
}

impl LivenessMonitor {
    /// Starts the tick thread and returns the handle used to register and
    /// update tasks. Dropping every clone of the returned `Arc` does not
    /// stop the thread by itself — call [`LivenessMonitor::shutdown`].
    pub fn spawn(poster: Poster, config: &NetConfig) -> Arc<Self> {
        let monitor = Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            poster,
            idle_threshold: config.idle_threshold(),
            unresponsive_threshold: config.unresponsive_threshold(),
            stop: Arc::new(AtomicBool::new(false)),
        });

        let tick_interval = config.liveness_tick();
        let worker = monitor.clone();
        std::thread::spawn(move || {
            let mut repeater = Repeater::every(tick_interval);
            while !worker.stop.load(Ordering::Relaxed) {
                if repeater.fired() {
                    worker.tick_once();
                }
                std::thread::sleep(tick_interval.min(Duration::from_millis(50)));
            }
        });

        monitor
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Registers a new task under `name`, starting in `NotConnected` with no
    /// token. `send_ping` is invoked (with the task's current token) once
    /// the connection has been idle past the configured threshold;
    /// `reconnect` is invoked with no token, for a `KeepAliveTarget` that has
    /// none yet; `drop_connection` is invoked when a `WatchExisting` task is
    /// declared unresponsive.
    pub fn register(
        &self,
        name: impl Into<String>,
        role: MonitorRole,
        send_ping: impl Fn(&Poster, Token) + Send + Sync + 'static,
        reconnect: impl Fn(&Poster) + Send + Sync + 'static,
        drop_connection: impl Fn(&Poster, Token) + Send + Sync + 'static,
    ) {
        let task = MonitorTask {
            role,
            state: Mutex::new(LivenessState::NotConnected),
            token: Mutex::new(None),
            last_read_epoch_seconds: AtomicU32::new(now_epoch_secs()),
            send_ping: Box::new(send_ping),
            reconnect: Box::new(reconnect),
            drop_connection: Box::new(drop_connection),
        };
        self.tasks.lock().unwrap().insert(name.into(), task);
    }

    pub fn unregister(&self, name: &str) {
        self.tasks.lock().unwrap().remove(name);
    }

    /// Called from the event loop thread once a dial attempt for `name` has
    /// started (before a token exists).
    pub fn mark_connecting(&self, name: &str) {
        let tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get(name) {
            *task.state.lock().unwrap() = LivenessState::Connecting;
        }
    }

    /// Called once `name`'s connection is active under `token`.
    pub fn mark_connected(&self, name: &str, token: Token) {
        let tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get(name) {
            *task.token.lock().unwrap() = Some(token);
            *task.state.lock().unwrap() = LivenessState::Connected;
            task.last_read_epoch_seconds.store(now_epoch_secs(), Ordering::Relaxed);
        }
    }

    /// Called from the I/O thread whenever `name`'s socket completes a read.
    /// Cheap: one atomic store, no lock beyond looking the task up.
    pub fn touch(&self, name: &str) {
        let tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get(name) {
            task.last_read_epoch_seconds.store(now_epoch_secs(), Ordering::Relaxed);
            let mut state = task.state.lock().unwrap();
            if *state == LivenessState::MaybeConnected {
                *state = LivenessState::Connected;
            }
        }
    }

    fn tick_once(&self) {
        let tasks = self.tasks.lock().unwrap();
        let now = now_epoch_secs();
        for (name, task) in tasks.iter() {
            let mut state = task.state.lock().unwrap();
            match *state {
                LivenessState::NotConnected => {
                    if task.role == MonitorRole::KeepAliveTarget {
                        debug!(name, "monitor starting reconnect, no client attached");
                        (task.reconnect)(&self.poster);
                        *state = LivenessState::Connecting;
                    }
                }
                LivenessState::Connecting => {}
                LivenessState::Connected => {
                    let idle = now.saturating_sub(task.last_read_epoch_seconds.load(Ordering::Relaxed));
                    if Duration::from_secs(idle as u64) > self.idle_threshold {
                        if let Some(token) = *task.token.lock().unwrap() {
                            debug!(name, idle, "monitor pinging idle connection");
                            (task.send_ping)(&self.poster, token);
                        }
                        *state = LivenessState::MaybeConnected;
                    }
                }
                LivenessState::MaybeConnected => {
                    let idle = now.saturating_sub(task.last_read_epoch_seconds.load(Ordering::Relaxed));
                    if Duration::from_secs(idle as u64) > self.unresponsive_threshold {
                        let token = task.token.lock().unwrap().take();
                        warn!(name, idle, role = ?task.role, "monitor declaring connection unresponsive");
                        match (task.role, token) {
                            (MonitorRole::KeepAliveTarget, _) => {
                                (task.reconnect)(&self.poster);
                                *state = LivenessState::Connecting;
                            }
                            (MonitorRole::WatchExisting, Some(token)) => {
                                (task.drop_connection)(&self.poster, token);
                                *state = LivenessState::NotConnected;
                            }
                            (MonitorRole::WatchExisting, None) => {
                                *state = LivenessState::NotConnected;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn keep_alive_target_with_no_client_triggers_reconnect_on_tick() {
        let event_loop = EventLoop::new().unwrap();
        let poster = event_loop.poster();
        let mut config = NetConfig::default();
        config.liveness_tick_ms = 5;
        let monitor = LivenessMonitor::spawn(poster, &config);

        let reconnect_calls = Arc::new(AtomicUsize::new(0));
        let counted = reconnect_calls.clone();
        monitor.register(
            "upstream",
            MonitorRole::KeepAliveTarget,
            |_poster, _token| {},
            move |_poster| {
                counted.fetch_add(1, Ordering::SeqCst);
            },
            |_poster, _token| {},
        );

        std::thread::sleep(Duration::from_millis(50));
        monitor.shutdown();
        assert!(reconnect_calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn touch_resets_maybe_connected_back_to_connected() {
        let event_loop = EventLoop::new().unwrap();
        let poster = event_loop.poster();
        let config = NetConfig::default();
        let monitor = LivenessMonitor::spawn(poster, &config);
        monitor.register("peer", MonitorRole::WatchExisting, |_, _| {}, |_| {}, |_, _| {});
        monitor.mark_connected("peer", Token(1));

        {
            let tasks = monitor.tasks.lock().unwrap();
            *tasks.get("peer").unwrap().state.lock().unwrap() = LivenessState::MaybeConnected;
        }
        monitor.touch("peer");
        {
            let tasks = monitor.tasks.lock().unwrap();
            assert_eq!(*tasks.get("peer").unwrap().state.lock().unwrap(), LivenessState::Connected);
        }
        monitor.shutdown();
    }
}
