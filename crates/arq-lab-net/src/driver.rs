use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use arq_lab_abstract::config::MAX_TIMER_MS;
use arq_lab_abstract::packet::MAX_DATAGRAM;
use arq_lab_abstract::{
    ActionBuffer, ArqConfig, ScopedContext, TimerOp, TransferReport, TransportProtocol,
};
use arq_lab_core::{ReceiverSession, SenderSession};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::NetError;
use crate::stop::StopSignal;

enum Input<'b> {
    Init,
    Datagram(&'b [u8]),
    Timer(u32),
}

/// What a receiving endpoint hands back once its loop ends.
#[derive(Debug)]
pub struct ReceiveSummary<W> {
    pub sink: W,
    pub streams_completed: u32,
    pub delivered_bytes: u64,
    pub duplicates: u64,
}

/// A bound UDP socket that can run one sender or receiver session.
pub struct Endpoint {
    socket: UdpSocket,
    stop: StopSignal,
}

impl Endpoint {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            stop: StopSignal::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Transfer everything `source` yields to `peer`.
    ///
    /// Only datagrams coming from `peer` are handed to the session.
    pub async fn send<R: Read>(
        &self,
        config: ArqConfig,
        source: R,
        peer: SocketAddr,
    ) -> Result<TransferReport, NetError> {
        info!(
            "sending to {} with {} (window {}, timeout {} ms)",
            peer,
            config.policy,
            config.effective_window(),
            config.timeout_ms
        );
        let mut session = SenderSession::new(config, source)?;
        let mut driver = Driver::new(&self.socket, Some(peer), false, &self.stop, None, "sender");
        driver.run(&mut session, Duration::ZERO, |_| {}).await?;

        if !session.is_complete() {
            return Err(NetError::Stopped);
        }
        session.report().ok_or(NetError::Stopped)
    }

    /// Accept up to `streams` streams (0 = until stopped) and write them to `sink`.
    ///
    /// Acks go to whoever sent the most recent datagram. A datagram from a
    /// new address ends the settling period of a finished stream, so a fresh
    /// sender never has its packets mistaken for retransmissions. After the
    /// last stream the endpoint keeps echoing acks for a few timeouts so a
    /// sender that lost the final burst can still finish.
    pub async fn receive<W: Write + Send>(
        &self,
        config: ArqConfig,
        mut sink: W,
        streams: u32,
    ) -> Result<ReceiveSummary<W>, NetError> {
        let linger = if streams == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(config.linger_ms())
        };
        info!(
            "receiving on {} with {} (window {})",
            self.local_addr()?,
            config.policy,
            config.effective_window()
        );
        let mut session = ReceiverSession::new(config)?.with_stream_limit(streams);
        {
            let mut driver = Driver::new(
                &self.socket,
                None,
                true,
                &self.stop,
                Some(&mut sink as &mut (dyn Write + Send)),
                "receiver",
            );
            driver
                .run(&mut session, linger, ReceiverSession::accept_new_stream)
                .await?;
        }
        sink.flush().map_err(NetError::Sink)?;

        Ok(ReceiveSummary {
            sink,
            streams_completed: session.streams_completed(),
            delivered_bytes: session.delivered_bytes(),
            duplicates: session.duplicates(),
        })
    }
}

/// Bind an ephemeral port of the right address family and send to `peer`.
pub async fn run_sender<R: Read>(
    config: ArqConfig,
    source: R,
    peer: SocketAddr,
) -> Result<TransferReport, NetError> {
    let local: SocketAddr = if peer.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    Endpoint::bind(local).await?.send(config, source, peer).await
}

/// Listen on `port` on all interfaces and receive into `sink` until the
/// stream limit is reached or `stop` is set.
pub async fn run_receiver<W: Write + Send>(
    config: ArqConfig,
    port: u16,
    sink: W,
    streams: u32,
    stop: StopSignal,
) -> Result<ReceiveSummary<W>, NetError> {
    Endpoint::bind((Ipv4Addr::UNSPECIFIED, port))
        .await?
        .with_stop(stop)
        .receive(config, sink, streams)
        .await
}

pub async fn resolve_peer(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| NetError::Resolve(format!("{host}:{port}")))
}

struct Driver<'a> {
    socket: &'a UdpSocket,
    peer: Option<SocketAddr>,
    follow_peer: bool,
    origin: Instant,
    timers: HashMap<u32, Instant>,
    stop: &'a StopSignal,
    sink: Option<&'a mut (dyn Write + Send)>,
    label: &'static str,
}

impl<'a> Driver<'a> {
    fn new(
        socket: &'a UdpSocket,
        peer: Option<SocketAddr>,
        follow_peer: bool,
        stop: &'a StopSignal,
        sink: Option<&'a mut (dyn Write + Send)>,
        label: &'static str,
    ) -> Self {
        Self {
            socket,
            peer,
            follow_peer,
            origin: Instant::now(),
            timers: HashMap::new(),
            stop,
            sink,
            label,
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn next_timer(&self) -> Option<(u32, Instant)> {
        self.timers
            .iter()
            .min_by_key(|&(_, at)| *at)
            .map(|(&id, &at)| (id, at))
    }

    /// Drive `session` until it completes and `linger` has passed, or until stopped.
    ///
    /// `on_new_peer` runs before a datagram from a different address than the
    /// previous one is dispatched.
    async fn run<P, F>(
        &mut self,
        session: &mut P,
        linger: Duration,
        mut on_new_peer: F,
    ) -> Result<(), NetError>
    where
        P: TransportProtocol,
        F: FnMut(&mut P),
    {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut linger_until: Option<Instant> = None;
        self.dispatch(session, Input::Init).await?;

        loop {
            if session.is_complete() {
                if linger.is_zero() {
                    return Ok(());
                }
                linger_until.get_or_insert_with(|| Instant::now() + linger);
            }
            if self.stop.is_stopped() {
                debug!("[{}] stop requested", self.label);
                return Ok(());
            }

            let next_timer = self.next_timer();
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(v) => v,
                        Err(e) if is_transient(&e) => {
                            debug!("[{}] transient receive error: {}", self.label, e);
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    if self.follow_peer {
                        if self.peer.is_some_and(|peer| peer != from) {
                            debug!("[{}] new peer {}", self.label, from);
                            on_new_peer(session);
                        }
                        self.peer = Some(from);
                    } else if self.peer != Some(from) {
                        debug!("[{}] ignoring datagram from {}", self.label, from);
                        continue;
                    }
                    self.dispatch(session, Input::Datagram(&buf[..len])).await?;
                }
                _ = sleep_until(next_timer.map(|(_, at)| at)) => {
                    if let Some((id, _)) = next_timer {
                        self.timers.remove(&id);
                        self.dispatch(session, Input::Timer(id)).await?;
                    }
                }
                _ = sleep_until(linger_until) => {
                    debug!("[{}] linger period over", self.label);
                    return Ok(());
                }
                _ = self.stop.stopped() => {}
            }
        }
    }

    async fn dispatch<P: TransportProtocol>(
        &mut self,
        session: &mut P,
        input: Input<'_>,
    ) -> Result<(), NetError> {
        let mut buffer = ActionBuffer::default();
        {
            let mut ctx = ScopedContext::new(&mut buffer, self.now_ms());
            match input {
                Input::Init => session.init(&mut ctx)?,
                Input::Datagram(datagram) => session.on_datagram(&mut ctx, datagram)?,
                Input::Timer(id) => session.on_timer(&mut ctx, id)?,
            }
        }
        self.apply(buffer).await
    }

    async fn apply(&mut self, buffer: ActionBuffer) -> Result<(), NetError> {
        for log in &buffer.logs {
            debug!("[{}] {}", self.label, log);
        }
        for (name, value) in &buffer.metrics {
            trace!(metric = %name, value, "[{}] metric", self.label);
        }

        if !buffer.delivered.is_empty() {
            if let Some(sink) = self.sink.as_mut() {
                sink.write_all(&buffer.delivered).map_err(NetError::Sink)?;
            }
        }
        if buffer.streams_ended > 0 {
            if let Some(sink) = self.sink.as_mut() {
                sink.flush().map_err(NetError::Sink)?;
            }
            info!("[{}] stream complete", self.label);
        }

        for op in buffer.timer_ops {
            match op {
                TimerOp::Start { delay, id } => {
                    let delay = Duration::from_millis(delay.min(MAX_TIMER_MS));
                    self.timers.insert(id, Instant::now() + delay);
                }
                TimerOp::Cancel { id } => {
                    self.timers.remove(&id);
                }
            }
        }

        for datagram in buffer.outgoing {
            match self.peer {
                Some(peer) => {
                    self.socket.send_to(&datagram, peer).await?;
                }
                None => warn!(
                    "[{}] no peer yet, dropping {} byte datagram",
                    self.label,
                    datagram.len()
                ),
            }
        }
        Ok(())
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// ICMP errors surfaced by some platforms on unconnected sockets.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused | ErrorKind::Interrupted
    )
}
