//! TCP accept loop shared by every decoy
//!
//! One [`Listener`] per enabled service. Each accepted socket runs on its
//! own task; the accept loop never waits on a session.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ListenerSettings;
use crate::decoy::{Decoy, Session};
use crate::models::{DisconnectReason, EventKind};
use crate::sink::EventSender;
use crate::tracker::ActivityTracker;

#[derive(Default)]
struct LimiterState {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

/// Fleet-wide cap on concurrent sessions, in total and per source address
pub struct ConnectionLimiter {
    max_total: usize,
    max_per_ip: usize,
    state: Arc<Mutex<LimiterState>>,
}

impl ConnectionLimiter {
    pub fn new(max_total: usize, max_per_ip: usize) -> Self {
        Self {
            max_total,
            max_per_ip,
            state: Arc::new(Mutex::new(LimiterState::default())),
        }
    }

    /// Reserve a slot for `ip`, or `None` if either cap is reached
    pub fn try_acquire(&self, ip: IpAddr) -> Option<ConnectionPermit> {
        let mut state = self.state.lock();
        let from_ip = state.per_ip.get(&ip).copied().unwrap_or(0);
        if state.total >= self.max_total || from_ip >= self.max_per_ip {
            return None;
        }
        state.total += 1;
        state.per_ip.insert(ip, from_ip + 1);
        Some(ConnectionPermit {
            ip,
            state: self.state.clone(),
        })
    }

    pub fn active(&self) -> usize {
        self.state.lock().total
    }

    pub fn active_from(&self, ip: IpAddr) -> usize {
        self.state.lock().per_ip.get(&ip).copied().unwrap_or(0)
    }
}

/// Slot held for the lifetime of one session
pub struct ConnectionPermit {
    ip: IpAddr,
    state: Arc<Mutex<LimiterState>>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        if let Some(count) = state.per_ip.get_mut(&self.ip) {
            *count -= 1;
            if *count == 0 {
                state.per_ip.remove(&self.ip);
            }
        }
    }
}

/// Shared pieces every listener hands to its sessions
#[derive(Clone)]
pub struct ListenerContext {
    pub sender: EventSender,
    pub tracker: Arc<ActivityTracker>,
    pub limiter: Arc<ConnectionLimiter>,
}

pub struct Listener {
    decoy: Arc<dyn Decoy>,
    listener: TcpListener,
    ctx: ListenerContext,
}

impl Listener {
    /// Bind the decoy's port. Failing to bind aborts startup.
    pub async fn bind(
        decoy: Arc<dyn Decoy>,
        settings: &ListenerSettings,
        ctx: ListenerContext,
    ) -> Result<Self> {
        let addr = settings.addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {} decoy on {}", decoy.service(), addr))?;

        info!("{} decoy listening on {}", decoy.service(), listener.local_addr()?);

        Ok(Self {
            decoy,
            listener,
            ctx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown, then wait up to `grace` for live sessions.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, grace: Duration) {
        let service = self.decoy.service();
        let mut sessions = JoinSet::new();
        let session_shutdown = shutdown.clone();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let Some(permit) = self.ctx.limiter.try_acquire(peer.ip()) else {
                            debug!("{} refusing {}: connection cap reached", service, peer);
                            continue;
                        };
                        sessions.spawn(serve(
                            self.decoy.clone(),
                            stream,
                            peer,
                            self.ctx.clone(),
                            permit,
                            session_shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("{} accept error: {}", service, e);
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        drop(self.listener);
        if sessions.is_empty() {
            return;
        }

        info!("{} decoy stopping, {} sessions in flight", service, sessions.len());
        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} decoy: {} sessions still open after {:?}",
                service,
                sessions.len(),
                grace
            );
            sessions.abort_all();
        }
    }
}

/// Resolve once shutdown is requested or the sender is gone
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Run one session and guarantee its `connection`/`disconnect` pair.
async fn serve(
    decoy: Arc<dyn Decoy>,
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ListenerContext,
    _permit: ConnectionPermit,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = decoy.service();
    let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);
    let session = Session::new(peer, local_port, ctx.sender.emitter(service));

    ctx.tracker.record_connection(service, peer.ip());
    debug!("{} connection from {}", service, peer);
    session.emit(EventKind::Connection);

    // The handler runs on its own task so a panic is caught at the join.
    let handler_session = session.clone();
    let mut handler = tokio::spawn(async move { decoy.handle(stream, handler_session).await });

    let reason = tokio::select! {
        joined = &mut handler => match joined {
            Ok(Ok(reason)) => reason,
            Ok(Err(e)) => {
                debug!("{} session {} ended: {}", service, session.id(), e);
                e.disconnect_reason()
            }
            Err(e) => {
                error!("{} handler for {} failed: {}", service, peer, e);
                DisconnectReason::HandlerFailed
            }
        },
        _ = wait_for_shutdown(&mut shutdown) => {
            handler.abort();
            DisconnectReason::Shutdown
        }
    };

    session.emit_disconnect(reason);
    info!(
        "{} session {} closed ({}, {:.1}s)",
        service,
        session.id(),
        reason,
        session.elapsed().as_secs_f64()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as DecoyResult;
    use crate::models::{Event, Service};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    enum Behavior {
        Greet,
        Panic,
        Hang,
    }

    struct FakeDecoy(Behavior);

    #[async_trait]
    impl Decoy for FakeDecoy {
        fn service(&self) -> Service {
            Service::Telnet
        }

        async fn handle(&self, mut stream: TcpStream, _session: Session) -> DecoyResult<DisconnectReason> {
            match self.0 {
                Behavior::Greet => {
                    stream.write_all(b"hi\r\n").await?;
                    Ok(DisconnectReason::SessionEnded)
                }
                Behavior::Panic => panic!("handler bug"),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    Ok(DisconnectReason::Closed)
                }
            }
        }
    }

    fn settings() -> ListenerSettings {
        ListenerSettings {
            enabled: true,
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            idle_timeout: Duration::from_secs(5),
        }
    }

    async fn start(
        behavior: Behavior,
        limiter: ConnectionLimiter,
    ) -> (
        SocketAddr,
        watch::Sender<bool>,
        mpsc::Receiver<Event>,
        tokio::task::JoinHandle<()>,
    ) {
        let (sender, rx) = EventSender::channel(256);
        let ctx = ListenerContext {
            sender,
            tracker: Arc::new(ActivityTracker::new()),
            limiter: Arc::new(limiter),
        };
        let listener = Listener::bind(Arc::new(FakeDecoy(behavior)), &settings(), ctx)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown, Duration::from_secs(2)));
        (addr, tx, rx, task)
    }

    async fn next_pair(rx: &mut mpsc::Receiver<Event>) -> (Event, Event) {
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        (first, second)
    }

    #[test]
    fn test_limiter_caps() {
        let limiter = ConnectionLimiter::new(3, 2);
        let a: IpAddr = "198.51.100.1".parse().unwrap();
        let b: IpAddr = "198.51.100.2".parse().unwrap();

        let p1 = limiter.try_acquire(a).unwrap();
        let _p2 = limiter.try_acquire(a).unwrap();
        assert!(limiter.try_acquire(a).is_none());

        let _p3 = limiter.try_acquire(b).unwrap();
        assert!(limiter.try_acquire(b).is_none());
        assert_eq!(limiter.active(), 3);

        drop(p1);
        assert_eq!(limiter.active_from(a), 1);
        assert!(limiter.try_acquire(b).is_some());
    }

    #[tokio::test]
    async fn test_connection_and_disconnect_events() {
        let (addr, _tx, mut rx, _task) = start(Behavior::Greet, ConnectionLimiter::new(8, 8)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hi\r\n");

        let (connect, disconnect) = next_pair(&mut rx).await;
        assert_eq!(connect.event_type(), "connection");
        assert_eq!(connect.destination_port, addr.port());
        assert_eq!(connect.session_id, disconnect.session_id);
        assert!(matches!(
            disconnect.kind,
            EventKind::Disconnect {
                reason: DisconnectReason::SessionEnded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_panic_still_disconnects() {
        let (addr, _tx, mut rx, _task) = start(Behavior::Panic, ConnectionLimiter::new(8, 8)).await;
        let _client = TcpStream::connect(addr).await.unwrap();

        let (_, disconnect) = next_pair(&mut rx).await;
        assert!(matches!(
            disconnect.kind,
            EventKind::Disconnect {
                reason: DisconnectReason::HandlerFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_over_cap_refused_silently() {
        let (addr, _tx, mut rx, _task) = start(Behavior::Hang, ConnectionLimiter::new(8, 1)).await;

        let _first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event_type(), "connection");

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let n = second.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let (addr, tx, mut rx, task) = start(Behavior::Hang, ConnectionLimiter::new(8, 8)).await;
        let _client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event_type(), "connection");

        tx.send(true).unwrap();
        let disconnect = rx.recv().await.unwrap();
        assert!(matches!(
            disconnect.kind,
            EventKind::Disconnect {
                reason: DisconnectReason::Shutdown,
                ..
            }
        ));
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
