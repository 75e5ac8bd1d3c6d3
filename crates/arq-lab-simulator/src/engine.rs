use crate::trace::SimulationReport;
use arq_lab_abstract::packet::peek_seq;
use arq_lab_abstract::{
    ActionBuffer, ArqError, ScopedContext, SimConfig, TimerOp, TransportProtocol,
};
use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeId {
    Sender,
    Receiver,
}

impl NodeId {
    pub fn peer(&self) -> Self {
        match self {
            NodeId::Sender => NodeId::Receiver,
            NodeId::Receiver => NodeId::Sender,
        }
    }
}

#[derive(Debug)]
pub enum EventType {
    DatagramArrival {
        to: NodeId,
        datagram: Bytes,
    },
    TimerExpiry {
        node: NodeId,
        timer_id: u32,
        generation: u64,
    },
}

#[derive(Debug)]
struct Event {
    time: u64,
    event_type: EventType,
    id: u64, // tie-breaker for events at the same time
}

// Min-heap on (time, id)
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A compact textual summary of a link-layer event.
#[derive(Debug, Clone, Serialize)]
pub struct LinkEventSummary {
    pub time: u64,
    pub description: String,
}

/// Discrete-event simulation of one sender/receiver pair over a faulty channel.
pub struct Simulator {
    time: u64,
    event_queue: BinaryHeap<Event>,
    event_id_counter: u64,

    config: SimConfig,
    rng: rand::rngs::StdRng,

    pub sender: Box<dyn TransportProtocol>,
    pub receiver: Box<dyn TransportProtocol>,

    /// Everything the receiver delivered, concatenated.
    pub delivered_data: Vec<u8>,
    pub streams_completed: u32,
    pub sender_packet_count: u32,
    pub receiver_packet_count: u32,
    /// Simulated time at which the sender reported completion.
    pub sender_completed_at: Option<u64>,

    /// Key: metric name, Value: `(time_ms, value)` samples.
    pub metrics: HashMap<String, Vec<(u64, f64)>>,

    drop_sender_seq_once: Vec<u16>,
    drop_receiver_ack_once: Vec<u16>,
    /// `(ack, extra copies)`
    duplicate_ack_once: Vec<(u16, u32)>,

    pub link_events: Vec<LinkEventSummary>,

    /// Bumped on every start/cancel so superseded expiries are skipped.
    timer_generations: HashMap<(NodeId, u32), u64>,
    initialized: bool,
}

impl Simulator {
    pub fn new(
        config: SimConfig,
        sender: Box<dyn TransportProtocol>,
        receiver: Box<dyn TransportProtocol>,
    ) -> Self {
        use rand::SeedableRng;
        let rng = rand::rngs::StdRng::seed_from_u64(config.seed);

        Self {
            time: 0,
            event_queue: BinaryHeap::new(),
            event_id_counter: 0,
            config,
            rng,
            sender,
            receiver,
            delivered_data: Vec::new(),
            streams_completed: 0,
            sender_packet_count: 0,
            receiver_packet_count: 0,
            sender_completed_at: None,
            metrics: HashMap::new(),
            drop_sender_seq_once: Vec::new(),
            drop_receiver_ack_once: Vec::new(),
            duplicate_ack_once: Vec::new(),
            link_events: Vec::new(),
            timer_generations: HashMap::new(),
            initialized: false,
        }
    }

    /// Drop the first data packet the sender emits with wire sequence `seq`.
    pub fn add_drop_sender_seq_once(&mut self, seq: u16) {
        self.drop_sender_seq_once.push(seq);
    }

    /// Drop the first ack the receiver emits for wire sequence `ack`.
    pub fn add_drop_receiver_ack_once(&mut self, ack: u16) {
        self.drop_receiver_ack_once.push(ack);
    }

    /// Deliver the next ack for `ack` to the sender `times` additional times.
    pub fn add_duplicate_ack_once(&mut self, ack: u16, times: u32) {
        self.duplicate_ack_once.push((ack, times));
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn metric_series(&self, name: &str) -> Option<&[(u64, f64)]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }

    fn push_event(&mut self, time: u64, event_type: EventType) {
        self.event_queue.push(Event {
            time,
            event_type,
            id: self.event_id_counter,
        });
        self.event_id_counter += 1;
    }

    pub fn init(&mut self) -> Result<(), ArqError> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        for node in [NodeId::Receiver, NodeId::Sender] {
            let mut buffer = ActionBuffer::default();
            let mut ctx = ScopedContext::new(&mut buffer, self.time);
            match node {
                NodeId::Sender => self.sender.init(&mut ctx)?,
                NodeId::Receiver => self.receiver.init(&mut ctx)?,
            }
            self.process_actions(node, buffer);
        }
        self.note_completion();
        Ok(())
    }

    pub fn peek_next_event_time(&self) -> Option<u64> {
        self.event_queue.peek().map(|e| e.time)
    }

    pub fn current_time(&self) -> u64 {
        self.time
    }

    pub fn remaining_events(&self) -> usize {
        self.event_queue.len()
    }

    /// Process the next event. Returns `false` once the queue is empty.
    pub fn step(&mut self) -> Result<bool, ArqError> {
        let Some(event) = self.event_queue.pop() else {
            return Ok(false);
        };

        self.time = event.time;

        match event.event_type {
            EventType::DatagramArrival { to, datagram } => {
                debug!(
                    "t={} datagram to {:?} ({} bytes)",
                    self.time,
                    to,
                    datagram.len()
                );
                let mut buffer = ActionBuffer::default();
                {
                    let mut ctx = ScopedContext::new(&mut buffer, self.time);
                    match to {
                        NodeId::Sender => self.sender.on_datagram(&mut ctx, &datagram)?,
                        NodeId::Receiver => self.receiver.on_datagram(&mut ctx, &datagram)?,
                    }
                }
                self.process_actions(to, buffer);
            }
            EventType::TimerExpiry {
                node,
                timer_id,
                generation,
            } => {
                if self.timer_generations.get(&(node, timer_id)) != Some(&generation) {
                    debug!("skipping superseded timer {} on {:?}", timer_id, node);
                    return Ok(true);
                }

                let mut buffer = ActionBuffer::default();
                {
                    let mut ctx = ScopedContext::new(&mut buffer, self.time);
                    match node {
                        NodeId::Sender => self.sender.on_timer(&mut ctx, timer_id)?,
                        NodeId::Receiver => self.receiver.on_timer(&mut ctx, timer_id)?,
                    }
                }
                self.process_actions(node, buffer);
            }
        }
        self.note_completion();
        Ok(true)
    }

    fn note_completion(&mut self) {
        if self.sender_completed_at.is_none() && self.sender.is_complete() {
            self.sender_completed_at = Some(self.time);
            info!("sender completed at t={}ms", self.time);
        }
    }

    /// Run until no events remain.
    pub fn run_until_complete(&mut self) -> Result<(), ArqError> {
        self.init()?;
        while self.step()? {}
        Ok(())
    }

    /// Run until no events remain or simulated time passes `max_ms`.
    /// Returns `true` if the queue drained.
    pub fn run_for(&mut self, max_ms: u64) -> Result<bool, ArqError> {
        self.init()?;
        while let Some(next) = self.peek_next_event_time() {
            if next > max_ms {
                return Ok(false);
            }
            self.step()?;
        }
        Ok(true)
    }

    pub fn export_report(&self) -> SimulationReport {
        SimulationReport {
            config: self.config.clone(),
            duration_ms: self.time,
            delivered_bytes: self.delivered_data.len(),
            streams_completed: self.streams_completed,
            sender_packet_count: self.sender_packet_count,
            receiver_packet_count: self.receiver_packet_count,
            sender_completed_at: self.sender_completed_at,
            transfer: self.sender.report(),
            metrics: self.metrics.clone(),
            link_events: self.link_events.clone(),
        }
    }

    fn link_event(&mut self, description: String) {
        self.link_events.push(LinkEventSummary {
            time: self.time,
            description,
        });
    }

    fn take_once<T: Copy>(list: &mut Vec<T>, pred: impl Fn(&T) -> bool) -> Option<T> {
        let pos = list.iter().position(pred)?;
        Some(list.remove(pos))
    }

    fn process_actions(&mut self, source_node: NodeId, buffer: ActionBuffer) {
        for (name, value) in buffer.metrics {
            self.metrics
                .entry(name)
                .or_default()
                .push((self.time, value));
        }

        for log in buffer.logs {
            debug!("[{:?}] {}", source_node, log);
        }

        if !buffer.delivered.is_empty() {
            self.link_event(format!(
                "[{:?}] DELIVERED {} bytes to application",
                source_node,
                buffer.delivered.len()
            ));
            self.delivered_data.extend_from_slice(&buffer.delivered);
        }
        if buffer.streams_ended > 0 {
            self.streams_completed += buffer.streams_ended;
            info!(
                "[{:?}] end of stream ({} bytes delivered)",
                source_node,
                self.delivered_data.len()
            );
        }

        for op in buffer.timer_ops {
            match op {
                TimerOp::Cancel { id } => {
                    *self.timer_generations.entry((source_node, id)).or_insert(0) += 1;
                }
                TimerOp::Start { delay, id } => {
                    let generation = self.timer_generations.entry((source_node, id)).or_insert(0);
                    *generation += 1;
                    let generation = *generation;
                    self.push_event(
                        self.time.saturating_add(delay),
                        EventType::TimerExpiry {
                            node: source_node,
                            timer_id: id,
                            generation,
                        },
                    );
                }
            }
        }

        for datagram in buffer.outgoing {
            self.transmit(source_node, datagram);
        }
    }

    /// Push one datagram through the channel model.
    fn transmit(&mut self, source_node: NodeId, datagram: Bytes) {
        let target_node = source_node.peer();
        let seq = peek_seq(&datagram);
        let mut extra_copies = 0;

        match source_node {
            NodeId::Sender => {
                self.sender_packet_count += 1;
                if let Some(s) = seq
                    && Self::take_once(&mut self.drop_sender_seq_once, |x| *x == s).is_some()
                {
                    self.link_event(format!("[Sender->Receiver] DROP (deterministic) seq={s}"));
                    return;
                }
            }
            NodeId::Receiver => {
                self.receiver_packet_count += 1;
                if let Some(s) = seq {
                    if Self::take_once(&mut self.drop_receiver_ack_once, |x| *x == s).is_some() {
                        self.link_event(format!("[Receiver->Sender] DROP (deterministic) ack={s}"));
                        return;
                    }
                    if let Some((_, times)) =
                        Self::take_once(&mut self.duplicate_ack_once, |(a, _)| *a == s)
                    {
                        self.link_event(format!(
                            "[Receiver->Sender] DUPLICATE (deterministic) ack={s} x{times}"
                        ));
                        extra_copies = times;
                    }
                }
            }
        }

        let label = seq.map_or_else(|| "?".to_string(), |s| s.to_string());

        if self.rng.random::<f64>() < self.config.loss_rate {
            self.link_event(format!(
                "[{:?}->{:?}] DROP (random loss) seq={}",
                source_node, target_node, label
            ));
            return;
        }

        let datagram = if !datagram.is_empty() && self.rng.random::<f64>() < self.config.corrupt_rate
        {
            let mut bytes = datagram.to_vec();
            let at = self.rng.random_range(0..bytes.len());
            bytes[at] ^= self.rng.random_range(1..=u8::MAX);
            self.link_event(format!(
                "[{:?}->{:?}] CORRUPT seq={} byte={}",
                source_node, target_node, label, at
            ));
            Bytes::from(bytes)
        } else {
            datagram
        };

        if self.rng.random::<f64>() < self.config.duplicate_rate {
            extra_copies += 1;
            self.link_event(format!(
                "[{:?}->{:?}] DUPLICATE (random) seq={}",
                source_node, target_node, label
            ));
        }

        let min_latency = self.config.min_latency;
        let max_latency = self.config.max_latency.max(min_latency);
        for _ in 0..=extra_copies {
            let latency = self.rng.random_range(min_latency..=max_latency);
            self.link_event(format!(
                "[{:?}->{:?}] SEND seq={} (latency={}ms)",
                source_node, target_node, label, latency
            ));
            self.push_event(
                self.time + latency,
                EventType::DatagramArrival {
                    to: target_node,
                    datagram: datagram.clone(),
                },
            );
        }
    }
}
