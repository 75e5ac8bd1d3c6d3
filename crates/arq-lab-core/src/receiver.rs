use std::collections::BTreeMap;

use arq_lab_abstract::{
    Ack, ArqConfig, ArqError, Codec, Packet, Policy, SeqSpace, SystemContext, TransportProtocol,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Awaiting,
    /// Selective repeat holding out-of-order packets.
    Buffering,
    /// Between streams: retransmissions from the finished stream's last
    /// window are acked again, nothing is delivered.
    Settling,
    /// Stream limit reached; only acks are produced from here on.
    Complete,
}

/// Tail of a finished stream, in that stream's absolute indices.
#[derive(Debug, Clone, Copy)]
struct Settling {
    first: u64,
    eof: u64,
    until: u64,
}

/// Receiving half of a transfer, parametrized by [`Policy`].
pub struct ReceiverSession {
    config: ArqConfig,
    codec: Codec,
    space: SeqSpace,
    window: u64,
    state: ReceiverState,
    /// `expSeq` for stop-and-wait / go-back-n, `rcvBase` for selective repeat.
    expected: u64,
    /// Last packet accepted by stop-and-wait.
    last_accepted: Option<u64>,
    buffer: BTreeMap<u64, Packet>,
    settling: Option<Settling>,
    stream_limit: Option<u32>,
    streams_completed: u32,
    duplicates: u64,
    delivered_bytes: u64,
}

impl ReceiverSession {
    pub fn new(config: ArqConfig) -> Result<Self, ArqError> {
        config.validate()?;
        Ok(Self {
            codec: config.codec(),
            space: config.seq_space(),
            window: config.effective_window() as u64,
            state: ReceiverState::Awaiting,
            expected: 0,
            last_accepted: None,
            buffer: BTreeMap::new(),
            settling: None,
            stream_limit: Some(1),
            streams_completed: 0,
            duplicates: 0,
            delivered_bytes: 0,
            config,
        })
    }

    /// Number of streams to accept before completing; `0` means no limit.
    pub fn with_stream_limit(mut self, limit: u32) -> Self {
        self.stream_limit = (limit > 0).then_some(limit);
        self
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn streams_completed(&self) -> u32 {
        self.streams_completed
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.delivered_bytes
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Absolute indices held in the selective-repeat reorder buffer.
    pub fn buffered_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.buffer.keys().copied()
    }

    /// End the settling period early and treat the next packet as the start
    /// of a new stream. Drivers call this once they know a different sender
    /// is talking.
    pub fn accept_new_stream(&mut self) {
        if self.state == ReceiverState::Settling {
            self.settling = None;
            self.state = ReceiverState::Awaiting;
        }
    }

    /// Absolute index of the next in-order packet.
    pub fn expected(&self) -> u64 {
        self.expected
    }

    fn send_ack(&self, ctx: &mut dyn SystemContext, seq: u16) {
        ctx.send_datagram(Ack::new(seq).encode(&self.codec));
    }

    fn deliver(&mut self, ctx: &mut dyn SystemContext, packet: &Packet) {
        if !packet.payload.is_empty() {
            ctx.deliver_data(&packet.payload);
            self.delivered_bytes += packet.payload.len() as u64;
        }
    }

    /// `eof` is the absolute index of the EOF packet, `None` for the
    /// unreliable policy, which never acks.
    fn finish_stream(&mut self, ctx: &mut dyn SystemContext, eof: Option<u64>) {
        if let Some(eof) = eof {
            let seq = self.space.wire(eof);
            for _ in 0..self.config.final_ack_burst {
                self.send_ack(ctx, seq);
            }
        }
        ctx.end_of_stream();
        self.streams_completed += 1;
        ctx.log(&format!(
            "stream {} complete ({} bytes delivered so far)",
            self.streams_completed, self.delivered_bytes
        ));

        self.expected = 0;
        self.last_accepted = None;
        self.buffer.clear();
        self.settling = None;
        self.state = match (self.stream_limit, eof) {
            (Some(limit), _) if self.streams_completed >= limit => ReceiverState::Complete,
            (_, Some(eof)) => {
                self.settling = Some(Settling {
                    first: (eof + 1).saturating_sub(self.window),
                    eof,
                    until: ctx.now().saturating_add(self.config.linger_ms()),
                });
                ReceiverState::Settling
            }
            _ => ReceiverState::Awaiting,
        };
    }

    /// Handle `packet` while a finished stream settles. Returns `false` once
    /// the settling period is over and the packet belongs to a new stream.
    fn settle(&mut self, ctx: &mut dyn SystemContext, packet: &Packet) -> bool {
        let Some(tail) = self.settling else {
            return false;
        };
        if ctx.now() >= tail.until {
            self.accept_new_stream();
            return false;
        }
        let span = tail.eof - tail.first + 1;
        if self.space.resolve_forward(tail.first, packet.seq, span).is_some() {
            self.duplicates += 1;
            self.send_ack(ctx, packet.seq);
        } else {
            ctx.log(&format!("settling, ignoring seq={}", packet.seq));
        }
        true
    }

    fn on_unreliable(&mut self, ctx: &mut dyn SystemContext, packet: Packet) {
        self.deliver(ctx, &packet);
        if packet.eof {
            self.finish_stream(ctx, None);
        }
    }

    /// Stop-and-wait and go-back-n: accept only `expected`.
    fn on_in_order(&mut self, ctx: &mut dyn SystemContext, packet: Packet) {
        if packet.seq == self.space.wire(self.expected) {
            self.deliver(ctx, &packet);
            if packet.eof {
                self.finish_stream(ctx, Some(self.expected));
                return;
            }
            self.send_ack(ctx, packet.seq);
            self.last_accepted = Some(self.expected);
            self.expected += 1;
            return;
        }

        match self.config.policy {
            Policy::StopAndWait => {
                if self
                    .last_accepted
                    .is_some_and(|prev| self.space.wire(prev) == packet.seq)
                {
                    self.duplicates += 1;
                    self.send_ack(ctx, packet.seq);
                }
            }
            _ => {
                if self.space.is_behind(self.expected, packet.seq, self.window) {
                    self.duplicates += 1;
                }
                if self.expected > 0 {
                    self.send_ack(ctx, self.space.wire(self.expected - 1));
                }
            }
        }
    }

    fn on_selective(&mut self, ctx: &mut dyn SystemContext, packet: Packet) {
        let seq = packet.seq;
        if let Some(index) = self.space.resolve_forward(self.expected, seq, self.window) {
            self.send_ack(ctx, seq);
            if self.buffer.contains_key(&index) {
                self.duplicates += 1;
            } else {
                self.buffer.insert(index, packet);
            }
            if index == self.expected {
                self.deliver_run(ctx);
            }
            if matches!(
                self.state,
                ReceiverState::Awaiting | ReceiverState::Buffering
            ) {
                self.state = if self.buffer.is_empty() {
                    ReceiverState::Awaiting
                } else {
                    ReceiverState::Buffering
                };
            }
        } else if self.space.is_behind(self.expected, seq, self.window) {
            self.duplicates += 1;
            self.send_ack(ctx, seq);
        }
    }

    /// Deliver the contiguous run starting at `expected`.
    fn deliver_run(&mut self, ctx: &mut dyn SystemContext) {
        while let Some(packet) = self.buffer.remove(&self.expected) {
            self.deliver(ctx, &packet);
            if packet.eof {
                self.finish_stream(ctx, Some(self.expected));
                return;
            }
            self.expected += 1;
        }
    }
}

impl TransportProtocol for ReceiverSession {
    fn init(&mut self, ctx: &mut dyn SystemContext) -> Result<(), ArqError> {
        ctx.log(&format!(
            "{} receiver ready (window={})",
            self.config.policy, self.window
        ));
        Ok(())
    }

    fn on_datagram(
        &mut self,
        ctx: &mut dyn SystemContext,
        datagram: &[u8],
    ) -> Result<(), ArqError> {
        let packet = match Packet::decode(&self.codec, datagram) {
            Ok(packet) => packet,
            Err(e) => {
                ctx.log(&format!("dropping datagram: {e}"));
                return Ok(());
            }
        };

        let state = self.state;
        match state {
            ReceiverState::Complete => {
                // keep answering so a sender that lost our acks can finish
                if self.config.policy != Policy::Unreliable {
                    self.duplicates += 1;
                    self.send_ack(ctx, packet.seq);
                }
                return Ok(());
            }
            ReceiverState::Settling if self.settle(ctx, &packet) => return Ok(()),
            _ => {}
        }

        match self.config.policy {
            Policy::Unreliable => self.on_unreliable(ctx, packet),
            Policy::StopAndWait | Policy::GoBackN => self.on_in_order(ctx, packet),
            Policy::SelectiveRepeat => self.on_selective(ctx, packet),
        }
        Ok(())
    }

    fn on_timer(&mut self, _ctx: &mut dyn SystemContext, _timer_id: u32) -> Result<(), ArqError> {
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.state == ReceiverState::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Recorder, acks, pkt};

    fn receiver(policy: Policy, window: u32) -> ReceiverSession {
        let mut cfg = ArqConfig::new(policy, window);
        cfg.final_ack_burst = 3;
        ReceiverSession::new(cfg).unwrap()
    }

    #[test]
    fn stop_and_wait_delivers_in_order() {
        let mut r = receiver(Policy::StopAndWait, 1);
        let mut ctx = Recorder::default();

        r.on_datagram(&mut ctx, &pkt(0, false, b"ab")).unwrap();
        r.on_datagram(&mut ctx, &pkt(1, false, b"cd")).unwrap();
        r.on_datagram(&mut ctx, &pkt(2, true, b"ef")).unwrap();

        assert_eq!(ctx.delivered, b"abcdef");
        assert_eq!(ctx.streams, 1);
        assert_eq!(acks(&mut ctx), vec![0, 1, 2, 2, 2]);
        assert!(r.is_complete());
    }

    #[test]
    fn stop_and_wait_reacks_duplicate_without_redelivery() {
        let mut r = receiver(Policy::StopAndWait, 1);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &pkt(0, false, b"ab")).unwrap();
        r.on_datagram(&mut ctx, &pkt(0, false, b"ab")).unwrap();
        // neither previous nor expected
        r.on_datagram(&mut ctx, &pkt(5, false, b"zz")).unwrap();

        assert_eq!(ctx.delivered, b"ab");
        assert_eq!(acks(&mut ctx), vec![0, 0]);
        assert_eq!(r.duplicates(), 1);
    }

    #[test]
    fn go_back_n_nudges_with_last_in_order_ack() {
        let mut r = receiver(Policy::GoBackN, 4);
        let mut ctx = Recorder::default();

        // nothing accepted yet: stay quiet
        r.on_datagram(&mut ctx, &pkt(1, false, b"b")).unwrap();
        assert!(acks(&mut ctx).is_empty());

        r.on_datagram(&mut ctx, &pkt(0, false, b"a")).unwrap();
        r.on_datagram(&mut ctx, &pkt(1, false, b"b")).unwrap();
        r.on_datagram(&mut ctx, &pkt(3, false, b"d")).unwrap();
        r.on_datagram(&mut ctx, &pkt(4, true, b"e")).unwrap();
        assert_eq!(acks(&mut ctx), vec![0, 1, 1, 1]);

        r.on_datagram(&mut ctx, &pkt(2, false, b"c")).unwrap();
        r.on_datagram(&mut ctx, &pkt(3, false, b"d")).unwrap();
        r.on_datagram(&mut ctx, &pkt(4, true, b"e")).unwrap();
        assert_eq!(ctx.delivered, b"abcde");
        assert_eq!(acks(&mut ctx), vec![2, 3, 4, 4, 4]);
    }

    #[test]
    fn selective_repeat_buffers_and_delivers_run() {
        let mut r = receiver(Policy::SelectiveRepeat, 4);
        let mut ctx = Recorder::default();

        r.on_datagram(&mut ctx, &pkt(1, false, b"1")).unwrap();
        assert_eq!(r.state(), ReceiverState::Buffering);
        assert_eq!(r.buffered(), 1);
        assert!(ctx.delivered.is_empty());

        r.on_datagram(&mut ctx, &pkt(0, false, b"0")).unwrap();
        assert_eq!(ctx.delivered, b"01");
        assert_eq!(r.expected(), 2);
        assert_eq!(r.state(), ReceiverState::Awaiting);

        r.on_datagram(&mut ctx, &pkt(2, true, b"2")).unwrap();
        assert_eq!(ctx.delivered, b"012");
        assert_eq!(acks(&mut ctx), vec![1, 0, 2, 2, 2, 2]);
        assert!(r.is_complete());
    }

    #[test]
    fn selective_repeat_acks_stale_and_drops_beyond_window() {
        let mut r = receiver(Policy::SelectiveRepeat, 2);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &pkt(0, false, b"a")).unwrap();
        r.on_datagram(&mut ctx, &pkt(1, false, b"b")).unwrap();
        acks(&mut ctx);

        r.on_datagram(&mut ctx, &pkt(0, false, b"a")).unwrap();
        r.on_datagram(&mut ctx, &pkt(9, false, b"x")).unwrap();
        assert_eq!(acks(&mut ctx), vec![0]);
        assert_eq!(ctx.delivered, b"ab");
        assert_eq!(r.duplicates(), 1);
    }

    #[test]
    fn selective_repeat_duplicate_in_window_not_rebuffered() {
        let mut r = receiver(Policy::SelectiveRepeat, 4);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &pkt(2, false, b"c")).unwrap();
        r.on_datagram(&mut ctx, &pkt(2, false, b"c")).unwrap();
        assert_eq!(r.buffered(), 1);
        assert_eq!(acks(&mut ctx), vec![2, 2]);
    }

    #[test]
    fn unreliable_appends_everything() {
        let mut r = receiver(Policy::Unreliable, 1);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &pkt(0, false, b"ab")).unwrap();
        r.on_datagram(&mut ctx, &pkt(0, false, b"ab")).unwrap();
        r.on_datagram(&mut ctx, &pkt(7, true, b"!")).unwrap();
        assert_eq!(ctx.delivered, b"abab!");
        assert!(ctx.take_sent().is_empty());
        assert!(r.is_complete());
    }

    #[test]
    fn completed_receiver_only_acks() {
        let mut r = receiver(Policy::GoBackN, 4);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &pkt(0, true, b"x")).unwrap();
        acks(&mut ctx);

        r.on_datagram(&mut ctx, &pkt(0, true, b"x")).unwrap();
        assert_eq!(acks(&mut ctx), vec![0]);
        assert_eq!(ctx.delivered, b"x");
        assert_eq!(ctx.streams, 1);
    }

    #[test]
    fn unlimited_receiver_resets_between_streams() {
        let mut r = receiver(Policy::StopAndWait, 1).with_stream_limit(0);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &pkt(0, true, b"one")).unwrap();
        assert_eq!(r.state(), ReceiverState::Settling);
        ctx.advance(r.config.linger_ms());
        r.on_datagram(&mut ctx, &pkt(0, true, b"two")).unwrap();
        assert_eq!(ctx.delivered, b"onetwo");
        assert_eq!(r.streams_completed(), 2);
        assert!(!r.is_complete());
    }

    #[test]
    fn resent_tail_of_finished_stream_is_acked_not_redelivered() {
        let mut r = receiver(Policy::GoBackN, 4).with_stream_limit(0);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &pkt(0, false, b"ab")).unwrap();
        r.on_datagram(&mut ctx, &pkt(1, true, b"cd")).unwrap();
        acks(&mut ctx);

        // every ack was lost, the sender resends its window
        ctx.advance(50);
        r.on_datagram(&mut ctx, &pkt(0, false, b"ab")).unwrap();
        r.on_datagram(&mut ctx, &pkt(1, true, b"cd")).unwrap();
        // outside the finished window
        r.on_datagram(&mut ctx, &pkt(5, false, b"zz")).unwrap();
        assert_eq!(ctx.delivered, b"abcd");
        assert_eq!(r.streams_completed(), 1);
        assert_eq!(acks(&mut ctx), vec![0, 1]);
        assert_eq!(r.duplicates(), 2);

        ctx.advance(r.config.linger_ms());
        r.on_datagram(&mut ctx, &pkt(0, true, b"ef")).unwrap();
        assert_eq!(ctx.delivered, b"abcdef");
        assert_eq!(r.streams_completed(), 2);
    }

    #[test]
    fn new_sender_skips_settling() {
        let mut r = receiver(Policy::SelectiveRepeat, 4).with_stream_limit(0);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &pkt(0, true, b"old")).unwrap();
        assert_eq!(r.state(), ReceiverState::Settling);

        r.accept_new_stream();
        assert_eq!(r.state(), ReceiverState::Awaiting);
        r.on_datagram(&mut ctx, &pkt(0, true, b"new")).unwrap();
        assert_eq!(ctx.delivered, b"oldnew");
        assert_eq!(r.streams_completed(), 2);
    }

    #[test]
    fn unreliable_streams_do_not_settle() {
        let mut r = receiver(Policy::Unreliable, 1).with_stream_limit(0);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &pkt(0, true, b"a")).unwrap();
        assert_eq!(r.state(), ReceiverState::Awaiting);
        r.on_datagram(&mut ctx, &pkt(0, true, b"b")).unwrap();
        assert_eq!(ctx.delivered, b"ab");
    }

    #[test]
    fn wraparound_keeps_order() {
        let cfg = ArqConfig::new(Policy::SelectiveRepeat, 2).with_seq_modulus(4);
        let mut r = ReceiverSession::new(cfg).unwrap();
        let mut ctx = Recorder::default();
        for (seq, byte) in [(0u16, b'a'), (1, b'b'), (3, b'd'), (2, b'c'), (0, b'e')] {
            r.on_datagram(&mut ctx, &pkt(seq, false, &[byte])).unwrap();
        }
        r.on_datagram(&mut ctx, &pkt(1, true, b"f")).unwrap();
        assert_eq!(ctx.delivered, b"abcdef");
    }

    #[test]
    fn malformed_datagram_is_ignored() {
        let mut r = receiver(Policy::GoBackN, 4);
        let mut ctx = Recorder::default();
        r.on_datagram(&mut ctx, &[0x00, 0x00]).unwrap();
        assert!(ctx.take_sent().is_empty());
        assert_eq!(r.state(), ReceiverState::Awaiting);
    }
}
