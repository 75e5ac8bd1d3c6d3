//! Buffered [`SystemContext`] shared by the drivers.
//!
//! A driver lends a [`ScopedContext`] to one session callback, then applies
//! the collected [`ActionBuffer`] once the callback has returned.

use bytes::Bytes;

use crate::interface::SystemContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    Start { delay: u64, id: u32 },
    Cancel { id: u32 },
}

/// Effects requested by a session during one callback.
#[derive(Debug, Default)]
pub struct ActionBuffer {
    pub outgoing: Vec<Bytes>,
    pub timer_ops: Vec<TimerOp>,
    pub logs: Vec<String>,
    pub delivered: Vec<u8>,
    pub streams_ended: u32,
    pub metrics: Vec<(String, f64)>,
}

pub struct ScopedContext<'a> {
    buffer: &'a mut ActionBuffer,
    now: u64,
}

impl<'a> ScopedContext<'a> {
    pub fn new(buffer: &'a mut ActionBuffer, now: u64) -> Self {
        Self { buffer, now }
    }
}

impl SystemContext for ScopedContext<'_> {
    fn send_datagram(&mut self, datagram: Bytes) {
        self.buffer.outgoing.push(datagram);
    }

    fn start_timer(&mut self, delay_ms: u64, timer_id: u32) {
        self.buffer.timer_ops.push(TimerOp::Start {
            delay: delay_ms,
            id: timer_id,
        });
    }

    fn cancel_timer(&mut self, timer_id: u32) {
        self.buffer.timer_ops.push(TimerOp::Cancel { id: timer_id });
    }

    fn deliver_data(&mut self, data: &[u8]) {
        self.buffer.delivered.extend_from_slice(data);
    }

    fn end_of_stream(&mut self) {
        self.buffer.streams_ended += 1;
    }

    fn log(&mut self, message: &str) {
        self.buffer.logs.push(message.to_string());
    }

    fn now(&self) -> u64 {
        self.now
    }

    fn record_metric(&mut self, name: &str, value: f64) {
        self.buffer.metrics.push((name.to_string(), value));
    }
}
