use std::collections::HashMap;

use arq_lab_abstract::{Ack, Codec, Packet, SystemContext};
use bytes::Bytes;

/// Context that records every effect a session asks for.
#[derive(Default)]
pub struct Recorder {
    pub now: u64,
    pub sent: Vec<Bytes>,
    pub timers: HashMap<u32, u64>,
    pub delivered: Vec<u8>,
    pub streams: u32,
    pub logs: Vec<String>,
}

impl Recorder {
    pub fn advance(&mut self, ms: u64) {
        self.now += ms;
    }

    pub fn take_sent(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent_log(&self) -> &[Bytes] {
        &self.sent
    }

    /// Delay the timer was last started with, if still armed.
    pub fn timer(&self, id: u32) -> Option<u64> {
        self.timers.get(&id).copied()
    }
}

impl SystemContext for Recorder {
    fn send_datagram(&mut self, datagram: Bytes) {
        self.sent.push(datagram);
    }

    fn start_timer(&mut self, delay_ms: u64, timer_id: u32) {
        self.timers.insert(timer_id, delay_ms);
    }

    fn cancel_timer(&mut self, timer_id: u32) {
        self.timers.remove(&timer_id);
    }

    fn deliver_data(&mut self, data: &[u8]) {
        self.delivered.extend_from_slice(data);
    }

    fn end_of_stream(&mut self) {
        self.streams += 1;
    }

    fn log(&mut self, message: &str) {
        self.logs.push(message.to_string());
    }

    fn now(&self) -> u64 {
        self.now
    }
}

pub fn pkt(seq: u16, eof: bool, payload: &[u8]) -> Bytes {
    Packet::new(seq, eof, Bytes::copy_from_slice(payload))
        .encode(&Codec::default())
        .unwrap()
}

pub fn ack(seq: u16) -> Bytes {
    Ack::new(seq).encode(&Codec::default())
}

pub fn data(datagram: &Bytes) -> Packet {
    Packet::decode(&Codec::default(), datagram).unwrap()
}

/// Drain the recorder and decode everything as acks.
pub fn acks(ctx: &mut Recorder) -> Vec<u16> {
    ctx.take_sent()
        .iter()
        .map(|d| Ack::decode(&Codec::default(), d).unwrap().seq)
        .collect()
}
