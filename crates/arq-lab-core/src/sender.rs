use std::collections::BTreeMap;
use std::io::Read;

use arq_lab_abstract::{
    Ack, ArqConfig, ArqError, Codec, PACE_TIMER, Packet, Policy, RETRANSMIT_TIMER, SeqSpace,
    SystemContext, TransferReport, TransportProtocol,
};
use bytes::Bytes;

use crate::segmenter::Segmenter;
use crate::timer::RetransmitTimers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Sending,
    /// Stop-and-wait with its single packet outstanding.
    WaitingAck,
    /// Go-back-n / selective repeat with a window in flight.
    Pipelining,
    Done,
}

/// Sending half of a transfer, parametrized by [`Policy`].
///
/// Packets are tracked by absolute index; only the wire representation is
/// reduced modulo the configured sequence space.
pub struct SenderSession<R> {
    config: ArqConfig,
    codec: Codec,
    space: SeqSpace,
    window: u64,
    segmenter: Segmenter<R>,
    state: SenderState,
    /// Encoded packets sent but not yet acknowledged.
    in_flight: BTreeMap<u64, Bytes>,
    send_base: u64,
    next_seq: u64,
    eof_index: Option<u64>,
    timers: RetransmitTimers,
    /// Deadline currently mirrored onto the driver timer.
    armed: Option<u64>,
    terminal_acks: u32,
    packets: u64,
    retransmissions: u64,
    duplicate_acks: u64,
    started_at: u64,
    finished_at: u64,
}

impl<R: Read> SenderSession<R> {
    pub fn new(config: ArqConfig, source: R) -> Result<Self, ArqError> {
        config.validate()?;
        let timers = match config.policy {
            Policy::SelectiveRepeat => RetransmitTimers::per_packet(config.timeout_ms),
            _ => RetransmitTimers::single(config.timeout_ms),
        };
        Ok(Self {
            codec: config.codec(),
            space: config.seq_space(),
            window: config.effective_window() as u64,
            segmenter: Segmenter::new(source, config.chunk_size),
            state: SenderState::Idle,
            in_flight: BTreeMap::new(),
            send_base: 0,
            next_seq: 0,
            eof_index: None,
            timers,
            armed: None,
            terminal_acks: 0,
            packets: 0,
            retransmissions: 0,
            duplicate_acks: 0,
            started_at: 0,
            finished_at: 0,
            config,
        })
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn policy(&self) -> Policy {
        self.config.policy
    }

    /// Absolute index of the oldest unacknowledged packet.
    pub fn send_base(&self) -> u64 {
        self.send_base
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    pub fn duplicate_acks(&self) -> u64 {
        self.duplicate_acks
    }

    fn is_done(&self) -> bool {
        self.state == SenderState::Done
    }

    fn window_state(&self) -> SenderState {
        match self.config.policy {
            Policy::StopAndWait => SenderState::WaitingAck,
            Policy::Unreliable => SenderState::Sending,
            _ => SenderState::Pipelining,
        }
    }

    fn record_window(&self, ctx: &mut dyn SystemContext) {
        ctx.record_metric("send_base", self.send_base as f64);
        ctx.record_metric("in_flight", self.in_flight.len() as f64);
    }

    fn encode_next(&mut self) -> Result<Option<(Bytes, bool)>, ArqError> {
        let Some(chunk) = self.segmenter.next_chunk()? else {
            return Ok(None);
        };
        let seq = self.space.wire(self.next_seq);
        let datagram = Packet::new(seq, chunk.eof, chunk.payload).encode(&self.codec)?;
        Ok(Some((datagram, chunk.eof)))
    }

    /// Transmit new packets while the window has room.
    fn fill_window(&mut self, ctx: &mut dyn SystemContext) -> Result<(), ArqError> {
        let mut sent = false;
        while self.eof_index.is_none() && self.next_seq < self.send_base + self.window {
            let Some((datagram, eof)) = self.encode_next()? else {
                break;
            };
            let index = self.next_seq;
            if eof {
                self.eof_index = Some(index);
            }
            ctx.log(&format!(
                "send seq={} idx={} len={}{}",
                self.space.wire(index),
                index,
                datagram.len(),
                if eof { " eof" } else { "" }
            ));
            ctx.send_datagram(datagram.clone());
            self.in_flight.insert(index, datagram);
            self.timers.arm(index, ctx.now());
            self.next_seq += 1;
            self.packets += 1;
            sent = true;
        }
        if sent {
            self.state = self.window_state();
            self.record_window(ctx);
        }
        Ok(())
    }

    /// Unreliable policy: one packet per pacing tick, or everything at once
    /// when pacing is off.
    fn pump_unreliable(&mut self, ctx: &mut dyn SystemContext) -> Result<(), ArqError> {
        loop {
            let Some((datagram, eof)) = self.encode_next()? else {
                self.finish(ctx);
                return Ok(());
            };
            ctx.send_datagram(datagram);
            self.next_seq += 1;
            self.packets += 1;
            if eof {
                self.finish(ctx);
                return Ok(());
            }
            if self.config.pace_ms > 0 {
                ctx.start_timer(self.config.pace_ms, PACE_TIMER);
                return Ok(());
            }
        }
    }

    fn on_cumulative_ack(&mut self, ctx: &mut dyn SystemContext, ack: Ack) {
        let span = self.next_seq - self.send_base;
        let Some(acked) = self.space.resolve_forward(self.send_base, ack.seq, span) else {
            self.duplicate_acks += 1;
            return;
        };

        self.in_flight = self.in_flight.split_off(&(acked + 1));
        self.send_base = acked + 1;
        ctx.log(&format!("ack seq={} base={}", ack.seq, self.send_base));

        if self.eof_index.is_some_and(|eof| self.send_base > eof) {
            self.finish(ctx);
            return;
        }
        // restart against the new oldest packet, or leave stopped when the window drained
        self.timers.stop();
        if !self.in_flight.is_empty() {
            self.timers.arm(self.send_base, ctx.now());
        }
        self.record_window(ctx);
    }

    fn on_selective_ack(&mut self, ctx: &mut dyn SystemContext, ack: Ack) {
        let span = self.next_seq - self.send_base;
        let Some(acked) = self.space.resolve_forward(self.send_base, ack.seq, span) else {
            self.duplicate_acks += 1;
            return;
        };

        let is_eof = self.eof_index == Some(acked);

        if self.in_flight.remove(&acked).is_some() {
            self.timers.remove(acked);
            self.send_base = self
                .in_flight
                .keys()
                .next()
                .copied()
                .unwrap_or(self.next_seq);
            ctx.log(&format!("ack seq={} base={}", ack.seq, self.send_base));
            self.record_window(ctx);
        } else {
            self.duplicate_acks += 1;
            // a repeat of an ack already taken: the receiver's final burst,
            // sent only once the whole stream was delivered
            if is_eof {
                self.terminal_acks += 1;
            }
        }

        let threshold = self.config.terminal_ack_threshold;
        let drained = self.eof_index.is_some_and(|eof| self.send_base > eof);
        let terminal = is_eof && threshold > 0 && self.terminal_acks >= threshold;
        if drained || terminal {
            if !drained {
                ctx.log(&format!(
                    "eof acked {} times with {} packets outstanding, assuming delivery",
                    self.terminal_acks,
                    self.in_flight.len()
                ));
            }
            self.finish(ctx);
        }
    }

    fn on_retransmit_timeout(&mut self, ctx: &mut dyn SystemContext) {
        let now = ctx.now();
        match self.config.policy {
            Policy::SelectiveRepeat => {
                while let Some(index) = self.timers.pop_expired(now) {
                    let Some(datagram) = self.in_flight.get(&index) else {
                        continue;
                    };
                    ctx.log(&format!("timeout, resending seq={}", self.space.wire(index)));
                    ctx.send_datagram(datagram.clone());
                    self.retransmissions += 1;
                    self.timers.arm(index, now);
                }
            }
            Policy::StopAndWait | Policy::GoBackN => {
                if self.timers.pop_expired(now).is_none() {
                    return;
                }
                ctx.log(&format!(
                    "timeout, resending {} packet(s) from seq={}",
                    self.in_flight.len(),
                    self.space.wire(self.send_base)
                ));
                for datagram in self.in_flight.values() {
                    ctx.send_datagram(datagram.clone());
                }
                self.retransmissions += self.in_flight.len() as u64;
                if !self.in_flight.is_empty() {
                    self.timers.arm(self.send_base, now);
                }
            }
            Policy::Unreliable => {}
        }
    }

    fn finish(&mut self, ctx: &mut dyn SystemContext) {
        self.state = SenderState::Done;
        self.finished_at = ctx.now();
        self.timers.clear();
        self.in_flight.clear();
        self.send_base = self.next_seq;
        self.record_window(ctx);
        ctx.log(&format!(
            "transfer complete: {} packets, {} retransmissions",
            self.packets, self.retransmissions
        ));
    }

    /// Mirror the earliest retransmission deadline onto the driver timer.
    fn sync_timer(&mut self, ctx: &mut dyn SystemContext) {
        let wanted = if self.is_done() {
            None
        } else {
            self.timers.earliest()
        };
        if wanted == self.armed {
            return;
        }
        match wanted {
            Some(at) => ctx.start_timer(at.saturating_sub(ctx.now()), RETRANSMIT_TIMER),
            None => ctx.cancel_timer(RETRANSMIT_TIMER),
        }
        self.armed = wanted;
    }
}

impl<R: Read> TransportProtocol for SenderSession<R> {
    fn init(&mut self, ctx: &mut dyn SystemContext) -> Result<(), ArqError> {
        if self.state != SenderState::Idle {
            return Ok(());
        }
        self.state = SenderState::Sending;
        self.started_at = ctx.now();
        ctx.log(&format!(
            "{} sender ready (window={}, timeout={}ms)",
            self.config.policy, self.window, self.config.timeout_ms
        ));
        match self.config.policy {
            Policy::Unreliable => self.pump_unreliable(ctx)?,
            _ => self.fill_window(ctx)?,
        }
        self.sync_timer(ctx);
        Ok(())
    }

    fn on_datagram(
        &mut self,
        ctx: &mut dyn SystemContext,
        datagram: &[u8],
    ) -> Result<(), ArqError> {
        if self.is_done() || self.state == SenderState::Idle {
            return Ok(());
        }
        if self.config.policy == Policy::Unreliable {
            return Ok(());
        }
        let ack = match Ack::decode(&self.codec, datagram) {
            Ok(ack) => ack,
            Err(e) => {
                ctx.log(&format!("dropping ack: {e}"));
                return Ok(());
            }
        };

        match self.config.policy {
            Policy::SelectiveRepeat => self.on_selective_ack(ctx, ack),
            _ => self.on_cumulative_ack(ctx, ack),
        }
        if !self.is_done() {
            self.fill_window(ctx)?;
        }
        self.sync_timer(ctx);
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut dyn SystemContext, timer_id: u32) -> Result<(), ArqError> {
        if self.is_done() {
            return Ok(());
        }
        match timer_id {
            PACE_TIMER if self.config.policy == Policy::Unreliable => {
                self.pump_unreliable(ctx)?;
            }
            RETRANSMIT_TIMER => {
                self.armed = None;
                self.on_retransmit_timeout(ctx);
                self.sync_timer(ctx);
            }
            _ => {}
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.is_done()
    }

    fn report(&self) -> Option<TransferReport> {
        self.is_done().then(|| {
            TransferReport::new(
                self.config.policy,
                self.segmenter.consumed(),
                self.packets,
                self.retransmissions,
                self.duplicate_acks,
                self.finished_at.saturating_sub(self.started_at),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Recorder, ack, data};
    use arq_lab_abstract::config::MAX_TIMER_MS;
    use std::io::Cursor;

    fn session(config: ArqConfig, input: &[u8]) -> SenderSession<Cursor<Vec<u8>>> {
        SenderSession::new(config, Cursor::new(input.to_vec())).unwrap()
    }

    fn seqs(ctx: &mut Recorder) -> Vec<u16> {
        ctx.take_sent()
            .iter()
            .map(|d| Packet::decode(&Codec::default(), d).unwrap().seq)
            .collect()
    }

    #[test]
    fn stop_and_wait_sends_one_at_a_time() {
        let cfg = ArqConfig::new(Policy::StopAndWait, 8).with_chunk_size(2);
        let mut s = session(cfg, b"abcdef");
        let mut ctx = Recorder::default();

        s.init(&mut ctx).unwrap();
        assert_eq!(seqs(&mut ctx), vec![0]);
        assert_eq!(s.state(), SenderState::WaitingAck);
        assert_eq!(ctx.timer(RETRANSMIT_TIMER), Some(50));

        s.on_datagram(&mut ctx, &ack(0)).unwrap();
        assert_eq!(seqs(&mut ctx), vec![1]);
        s.on_datagram(&mut ctx, &ack(1)).unwrap();
        assert_eq!(seqs(&mut ctx), vec![2]);
        s.on_datagram(&mut ctx, &ack(2)).unwrap();
        // "abcdef" in 2-byte chunks needs a trailing empty EOF packet
        let last = ctx.take_sent();
        assert!(Packet::decode(&Codec::default(), &last[0]).unwrap().eof);
        s.on_datagram(&mut ctx, &ack(3)).unwrap();

        assert!(s.is_complete());
        assert_eq!(ctx.timer(RETRANSMIT_TIMER), None);
        let report = s.report().unwrap();
        assert_eq!(report.bytes, 6);
        assert_eq!(report.packets, 4);
        assert_eq!(report.retransmissions, 0);
    }

    #[test]
    fn stop_and_wait_timeout_resends_identical_bytes() {
        let mut s = session(ArqConfig::new(Policy::StopAndWait, 1), b"hello");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        let original = ctx.take_sent();

        ctx.advance(50);
        s.on_timer(&mut ctx, RETRANSMIT_TIMER).unwrap();
        assert_eq!(ctx.take_sent(), original);
        assert_eq!(s.retransmissions(), 1);
        assert_eq!(ctx.timer(RETRANSMIT_TIMER), Some(50));
    }

    #[test]
    fn go_back_n_fills_window_and_resends_it_on_timeout() {
        let cfg = ArqConfig::new(Policy::GoBackN, 4).with_chunk_size(1);
        let mut s = session(cfg, b"abcdefgh");
        let mut ctx = Recorder::default();

        s.init(&mut ctx).unwrap();
        assert_eq!(seqs(&mut ctx), vec![0, 1, 2, 3]);
        assert_eq!(s.in_flight(), 4);

        s.on_datagram(&mut ctx, &ack(1)).unwrap();
        assert_eq!(s.send_base(), 2);
        assert_eq!(seqs(&mut ctx), vec![4, 5]);

        ctx.advance(50);
        s.on_timer(&mut ctx, RETRANSMIT_TIMER).unwrap();
        assert_eq!(seqs(&mut ctx), vec![2, 3, 4, 5]);
        assert_eq!(s.retransmissions(), 4);
    }

    #[test]
    fn go_back_n_ignores_stale_and_future_acks() {
        let cfg = ArqConfig::new(Policy::GoBackN, 2).with_chunk_size(1);
        let mut s = session(cfg, b"abcd");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        s.on_datagram(&mut ctx, &ack(0)).unwrap();
        ctx.take_sent();

        // 0 is stale, 7 was never sent
        s.on_datagram(&mut ctx, &ack(0)).unwrap();
        s.on_datagram(&mut ctx, &ack(7)).unwrap();
        assert_eq!(s.send_base(), 1);
        assert_eq!(s.duplicate_acks(), 2);
        assert!(ctx.take_sent().is_empty());
    }

    #[test]
    fn go_back_n_timer_stops_when_window_drains() {
        let cfg = ArqConfig::new(Policy::GoBackN, 4).with_chunk_size(4);
        let mut s = session(cfg, b"abcdefgh");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        assert_eq!(s.next_seq(), 3);
        s.on_datagram(&mut ctx, &ack(2)).unwrap();
        assert!(s.is_complete());
        assert_eq!(ctx.timer(RETRANSMIT_TIMER), None);
    }

    #[test]
    fn duplicate_ack_flood_is_harmless() {
        let cfg = ArqConfig::new(Policy::GoBackN, 4).with_chunk_size(1);
        let mut s = session(cfg, b"abcdefgh");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        ctx.take_sent();

        for _ in 0..5 {
            s.on_datagram(&mut ctx, &ack(2)).unwrap();
        }
        assert_eq!(s.send_base(), 3);
        assert_eq!(s.duplicate_acks(), 4);
        // only the three slots freed by the first ack were refilled
        assert_eq!(seqs(&mut ctx), vec![4, 5, 6]);
    }

    #[test]
    fn selective_repeat_retransmits_only_expired_packet() {
        let cfg = ArqConfig::new(Policy::SelectiveRepeat, 3).with_chunk_size(1);
        let mut s = session(cfg, b"abcdef");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        assert_eq!(seqs(&mut ctx), vec![0, 1, 2]);

        ctx.advance(10);
        s.on_datagram(&mut ctx, &ack(1)).unwrap();
        // base stays at 0, no room opened
        assert_eq!(s.send_base(), 0);
        assert!(ctx.take_sent().is_empty());

        ctx.advance(40);
        s.on_timer(&mut ctx, RETRANSMIT_TIMER).unwrap();
        assert_eq!(seqs(&mut ctx), vec![0, 2]);
        assert_eq!(s.retransmissions(), 2);

        s.on_datagram(&mut ctx, &ack(0)).unwrap();
        assert_eq!(s.send_base(), 2);
        assert_eq!(seqs(&mut ctx), vec![3, 4]);
    }

    #[test]
    fn selective_repeat_terminal_ack_threshold() {
        let mut cfg = ArqConfig::new(Policy::SelectiveRepeat, 4).with_chunk_size(4);
        cfg.terminal_ack_threshold = 2;
        let mut s = session(cfg, b"abcdefgh");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();

        // acks for 0 and 1 lost; the first EOF ack only retires packet 2
        s.on_datagram(&mut ctx, &ack(2)).unwrap();
        assert!(!s.is_complete());
        assert_eq!(s.in_flight(), 2);
        s.on_datagram(&mut ctx, &ack(2)).unwrap();
        assert!(!s.is_complete());
        s.on_datagram(&mut ctx, &ack(2)).unwrap();
        assert!(s.is_complete());
        assert_eq!(s.report().unwrap().bytes, 8);
    }

    #[test]
    fn selective_repeat_eof_ack_behind_gap_keeps_retransmitting() {
        let cfg = ArqConfig::new(Policy::SelectiveRepeat, 4).with_chunk_size(1);
        let mut s = session(cfg, b"abc");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        assert_eq!(seqs(&mut ctx), vec![0, 1, 2, 3]);

        // packet 0 lost: the receiver buffers 1..=3 and acks each once, the
        // channel duplicates the EOF ack nine times
        s.on_datagram(&mut ctx, &ack(1)).unwrap();
        s.on_datagram(&mut ctx, &ack(2)).unwrap();
        for _ in 0..10 {
            s.on_datagram(&mut ctx, &ack(3)).unwrap();
        }
        assert!(!s.is_complete());
        assert_eq!(s.in_flight(), 1);

        ctx.advance(50);
        s.on_timer(&mut ctx, RETRANSMIT_TIMER).unwrap();
        assert_eq!(seqs(&mut ctx), vec![0]);
        s.on_datagram(&mut ctx, &ack(0)).unwrap();
        assert!(s.is_complete());
    }

    #[test]
    fn wire_numbers_wrap_with_small_modulus() {
        let cfg = ArqConfig::new(Policy::GoBackN, 3)
            .with_chunk_size(1)
            .with_seq_modulus(4);
        let mut s = session(cfg, b"abcdefg");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        assert_eq!(seqs(&mut ctx), vec![0, 1, 2]);
        s.on_datagram(&mut ctx, &ack(2)).unwrap();
        assert_eq!(seqs(&mut ctx), vec![3, 0, 1]);
        s.on_datagram(&mut ctx, &ack(0)).unwrap();
        assert_eq!(s.send_base(), 5);
        assert_eq!(seqs(&mut ctx), vec![2, 3]);
        // idx 7 is the empty EOF packet, wire 3
        s.on_datagram(&mut ctx, &ack(3)).unwrap();
        assert!(s.is_complete());
    }

    #[test]
    fn unreliable_paces_and_ignores_acks() {
        let cfg = ArqConfig::new(Policy::Unreliable, 1).with_chunk_size(2);
        let mut s = session(cfg, b"abc");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        assert_eq!(seqs(&mut ctx), vec![0]);
        assert_eq!(ctx.timer(PACE_TIMER), Some(1));

        s.on_datagram(&mut ctx, &ack(0)).unwrap();
        ctx.advance(1);
        s.on_timer(&mut ctx, PACE_TIMER).unwrap();
        assert_eq!(seqs(&mut ctx), vec![1]);
        assert!(s.is_complete());
    }

    #[test]
    fn unreliable_unpaced_sends_everything_on_init() {
        let mut cfg = ArqConfig::new(Policy::Unreliable, 1).with_chunk_size(1);
        cfg.pace_ms = 0;
        let mut s = session(cfg, b"xyz");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        assert_eq!(seqs(&mut ctx), vec![0, 1, 2, 3]);
        assert!(s.is_complete());
    }

    #[test]
    fn undecodable_ack_is_dropped() {
        let mut s = session(ArqConfig::default(), b"abc");
        let mut ctx = Recorder::default();
        s.init(&mut ctx).unwrap();
        s.on_datagram(&mut ctx, &[0x01]).unwrap();
        assert_eq!(s.state(), SenderState::WaitingAck);
        assert!(data(&ctx.sent_log()[0]).eof);
    }

    #[test]
    fn rejects_invalid_config() {
        let cfg = ArqConfig::new(Policy::SelectiveRepeat, 5).with_seq_modulus(8);
        assert!(SenderSession::new(cfg, Cursor::new(Vec::new())).is_err());
        let cfg = ArqConfig::new(Policy::GoBackN, 4).with_timeout_ms(u64::MAX);
        assert!(SenderSession::new(cfg, Cursor::new(Vec::new())).is_err());
    }

    #[test]
    fn longest_timeout_arms_without_overflow() {
        let cfg = ArqConfig::new(Policy::GoBackN, 2)
            .with_chunk_size(1)
            .with_timeout_ms(MAX_TIMER_MS);
        let mut s = session(cfg, b"abc");
        let mut ctx = Recorder::default();
        ctx.advance(u64::MAX - 10);
        s.init(&mut ctx).unwrap();
        s.on_datagram(&mut ctx, &ack(0)).unwrap();
        assert_eq!(ctx.timer(RETRANSMIT_TIMER), Some(10));
        assert_eq!(s.send_base(), 1);
    }
}
