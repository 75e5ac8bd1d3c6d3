//! Retransmission deadlines.
//!
//! The manager is pure bookkeeping over absolute packet indices and
//! millisecond timestamps; the owning session mirrors `earliest()` onto a
//! single driver timer.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub enum RetransmitTimers {
    /// One deadline guarding the oldest unacknowledged packet.
    Single {
        timeout: u64,
        guarded: u64,
        deadline: Option<u64>,
    },
    /// An independent deadline per in-flight packet.
    PerPacket {
        timeout: u64,
        order: BTreeSet<(u64, u64)>,
        deadlines: HashMap<u64, u64>,
    },
}

impl RetransmitTimers {
    pub fn single(timeout: u64) -> Self {
        Self::Single {
            timeout,
            guarded: 0,
            deadline: None,
        }
    }

    pub fn per_packet(timeout: u64) -> Self {
        Self::PerPacket {
            timeout,
            order: BTreeSet::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Start guarding `index`.
    ///
    /// The single timer is left alone if it is already running; per-packet
    /// timers replace any previous deadline for `index`.
    pub fn arm(&mut self, index: u64, now: u64) {
        match self {
            Self::Single {
                timeout,
                guarded,
                deadline,
            } => {
                if deadline.is_none() {
                    *guarded = index;
                    *deadline = Some(now.saturating_add(*timeout));
                }
            }
            Self::PerPacket {
                timeout,
                order,
                deadlines,
            } => {
                let at = now.saturating_add(*timeout);
                if let Some(old) = deadlines.insert(index, at) {
                    order.remove(&(old, index));
                }
                order.insert((at, index));
            }
        }
    }

    /// Push every running deadline out to `now + timeout`.
    pub fn restart(&mut self, now: u64) {
        match self {
            Self::Single {
                timeout, deadline, ..
            } => *deadline = Some(now.saturating_add(*timeout)),
            Self::PerPacket {
                timeout,
                order,
                deadlines,
            } => {
                let at = now.saturating_add(*timeout);
                order.clear();
                for (index, deadline) in deadlines.iter_mut() {
                    *deadline = at;
                    order.insert((at, *index));
                }
            }
        }
    }

    pub fn stop(&mut self) {
        self.clear();
    }

    /// Forget the deadline of an acknowledged packet. Returns whether one existed.
    pub fn remove(&mut self, index: u64) -> bool {
        match self {
            Self::Single {
                guarded, deadline, ..
            } => {
                if deadline.is_some() && *guarded == index {
                    *deadline = None;
                    true
                } else {
                    false
                }
            }
            Self::PerPacket {
                order, deadlines, ..
            } => match deadlines.remove(&index) {
                Some(at) => {
                    order.remove(&(at, index));
                    true
                }
                None => false,
            },
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        match self {
            Self::Single {
                guarded, deadline, ..
            } => deadline.is_some() && *guarded == index,
            Self::PerPacket { deadlines, .. } => deadlines.contains_key(&index),
        }
    }

    /// Earliest running deadline.
    pub fn earliest(&self) -> Option<u64> {
        match self {
            Self::Single { deadline, .. } => *deadline,
            Self::PerPacket { order, .. } => order.first().map(|&(at, _)| at),
        }
    }

    /// Take the earliest entry if it has expired at `now` and return the
    /// index it guarded. Later entries are never looked at; callers loop
    /// to drain several expiries.
    pub fn pop_expired(&mut self, now: u64) -> Option<u64> {
        match self {
            Self::Single {
                guarded, deadline, ..
            } => match *deadline {
                Some(at) if at <= now => {
                    *deadline = None;
                    Some(*guarded)
                }
                _ => None,
            },
            Self::PerPacket {
                order, deadlines, ..
            } => {
                let &(at, index) = order.first()?;
                if at > now {
                    return None;
                }
                order.remove(&(at, index));
                deadlines.remove(&index);
                Some(index)
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single { deadline, .. } => usize::from(deadline.is_some()),
            Self::PerPacket { deadlines, .. } => deadlines.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            Self::Single { deadline, .. } => *deadline = None,
            Self::PerPacket {
                order, deadlines, ..
            } => {
                order.clear();
                deadlines.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_arm_keeps_running_deadline() {
        let mut t = RetransmitTimers::single(100);
        t.arm(0, 10);
        t.arm(1, 50);
        assert_eq!(t.earliest(), Some(110));
        assert!(t.contains(0));
        assert!(!t.contains(1));
    }

    #[test]
    fn single_expiry_and_restart() {
        let mut t = RetransmitTimers::single(100);
        t.arm(3, 0);
        assert_eq!(t.pop_expired(99), None);
        assert_eq!(t.pop_expired(100), Some(3));
        assert!(t.is_empty());
        t.restart(100);
        assert_eq!(t.earliest(), Some(200));
        assert_eq!(t.pop_expired(250), Some(3));
    }

    #[test]
    fn single_stop_then_rearm_moves_guard() {
        let mut t = RetransmitTimers::single(50);
        t.arm(0, 0);
        t.stop();
        t.arm(4, 20);
        assert_eq!(t.pop_expired(70), Some(4));
    }

    #[test]
    fn per_packet_orders_by_deadline() {
        let mut t = RetransmitTimers::per_packet(100);
        t.arm(0, 0);
        t.arm(1, 10);
        t.arm(2, 20);
        assert_eq!(t.len(), 3);
        assert_eq!(t.earliest(), Some(100));

        assert!(t.remove(0));
        assert!(!t.remove(0));
        assert_eq!(t.earliest(), Some(110));
    }

    #[test]
    fn per_packet_pops_only_earliest() {
        let mut t = RetransmitTimers::per_packet(100);
        t.arm(5, 0);
        t.arm(6, 0);
        t.arm(7, 50);
        assert_eq!(t.pop_expired(100), Some(5));
        // re-armed behind the others
        t.arm(5, 100);
        assert_eq!(t.pop_expired(100), Some(6));
        assert_eq!(t.pop_expired(100), None);
        assert_eq!(t.earliest(), Some(150));
    }

    #[test]
    fn per_packet_rearm_replaces_entry() {
        let mut t = RetransmitTimers::per_packet(100);
        t.arm(1, 0);
        t.arm(1, 30);
        assert_eq!(t.len(), 1);
        assert_eq!(t.pop_expired(100), None);
        assert_eq!(t.pop_expired(130), Some(1));
    }

    #[test]
    fn huge_timeout_saturates() {
        let mut s = RetransmitTimers::single(u64::MAX);
        s.arm(0, 5);
        s.restart(10);
        assert_eq!(s.earliest(), Some(u64::MAX));
        assert_eq!(s.pop_expired(1_000), None);

        let mut p = RetransmitTimers::per_packet(u64::MAX);
        p.arm(0, 1);
        p.arm(1, 2);
        p.restart(3);
        assert_eq!(p.earliest(), Some(u64::MAX));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn clear_empties_both_variants() {
        let mut s = RetransmitTimers::single(10);
        s.arm(0, 0);
        s.clear();
        assert_eq!(s.earliest(), None);

        let mut p = RetransmitTimers::per_packet(10);
        p.arm(0, 0);
        p.arm(1, 0);
        p.restart(5);
        assert_eq!(p.earliest(), Some(15));
        p.clear();
        assert!(p.is_empty());
    }
}
