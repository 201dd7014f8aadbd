//! Per-peer active traffic accounting.
//!
//! Every mapped peer owns one counter per traffic category. Classified flows
//! bump these counters as they become active or inactive, and the monitor
//! turns them into a bitmask for firmware once per pass.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use crate::core::tuple::{TrafficType, TRAFFIC_TYPE_COUNT};
use crate::error::StcError;

/// Six-byte MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    fn to_u64(self) -> u64 {
        let mut buf = [0u8; 8];
        buf[..6].copy_from_slice(&self.0);
        u64::from_le_bytes(buf)
    }

    fn from_u64(v: u64) -> Self {
        let buf = v.to_le_bytes();
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&buf[..6]);
        MacAddr(mac)
    }
}

/// Active traffic bitmask destined for firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActiveTrafficMap {
    pub peer_id: u16,
    pub mac: MacAddr,
    pub vdev_id: u8,
    pub bitmask: u32,
}

#[derive(Debug, Default)]
struct PeerSlot {
    mapped: AtomicBool,
    generation: AtomicU32,
    mac: AtomicU64,
    vdev_id: AtomicU8,
    counters: [AtomicU32; TRAFFIC_TYPE_COUNT],
    needs_indication: AtomicBool,
    last_ping_us: AtomicU64,
    last_sent_mask: AtomicU32,
}

impl PeerSlot {
    fn clear_activity(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
        self.needs_indication.store(false, Ordering::Relaxed);
        self.last_ping_us.store(0, Ordering::Relaxed);
        self.last_sent_mask.store(0, Ordering::Relaxed);
    }
}

/// Handle recorded by a classified flow so that counter updates never land on
/// a peer slot that was remapped in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerHandle {
    pub peer_id: u16,
    pub generation: u32,
}

/// Fixed array of peer slots indexed by peer id.
#[derive(Debug)]
pub struct PeerTrafficMap {
    slots: Box<[PeerSlot]>,
}

impl PeerTrafficMap {
    pub fn allocate(size: usize) -> Result<Self, StcError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(size)?;
        slots.resize_with(size, PeerSlot::default);
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    fn slot(&self, peer_id: u16) -> Result<&PeerSlot, StcError> {
        self.slots
            .get(peer_id as usize)
            .ok_or(StcError::InvalidPeerId(peer_id))
    }

    fn live_slot(&self, handle: PeerHandle) -> Option<&PeerSlot> {
        self.slots.get(handle.peer_id as usize).filter(|s| {
            s.mapped.load(Ordering::Acquire)
                && s.generation.load(Ordering::Relaxed) == handle.generation
        })
    }

    pub fn map(&self, peer_id: u16, mac: MacAddr, vdev_id: u8) -> Result<(), StcError> {
        let slot = self.slot(peer_id)?;
        if slot.mapped.load(Ordering::Acquire) {
            return Err(StcError::PeerAlreadyMapped(peer_id));
        }
        slot.clear_activity();
        slot.mac.store(mac.to_u64(), Ordering::Relaxed);
        slot.vdev_id.store(vdev_id, Ordering::Relaxed);
        slot.generation.fetch_add(1, Ordering::Relaxed);
        slot.mapped.store(true, Ordering::Release);
        Ok(())
    }

    pub fn unmap(&self, peer_id: u16, mac: MacAddr) -> Result<(), StcError> {
        let slot = self.slot(peer_id)?;
        if !slot.mapped.load(Ordering::Acquire) {
            return Err(StcError::PeerNotMapped(peer_id));
        }
        if MacAddr::from_u64(slot.mac.load(Ordering::Relaxed)) != mac {
            return Err(StcError::PeerMacMismatch(peer_id));
        }
        slot.mapped.store(false, Ordering::Release);
        slot.clear_activity();
        Ok(())
    }

    pub fn is_mapped(&self, peer_id: u16) -> bool {
        self.slot(peer_id)
            .map(|s| s.mapped.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Handle for the current mapping of `peer_id`, if any.
    pub fn handle(&self, peer_id: u16) -> Option<PeerHandle> {
        let slot = self.slot(peer_id).ok()?;
        slot.mapped.load(Ordering::Acquire).then(|| PeerHandle {
            peer_id,
            generation: slot.generation.load(Ordering::Relaxed),
        })
    }

    /// Count one more active flow of `ty`. A 0 → 1 transition requests an indication.
    pub fn increment(&self, handle: PeerHandle, ty: TrafficType) {
        let (Some(slot), Some(idx)) = (self.live_slot(handle), ty.index()) else {
            return;
        };
        let prev = slot.counters[idx].fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            slot.needs_indication.store(true, Ordering::Release);
        }
    }

    /// Count one fewer active flow of `ty`, never going below zero.
    pub fn decrement(&self, handle: PeerHandle, ty: TrafficType) {
        let (Some(slot), Some(idx)) = (self.live_slot(handle), ty.index()) else {
            return;
        };
        let prev = slot.counters[idx]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        if prev == Ok(1) {
            slot.needs_indication.store(true, Ordering::Release);
        }
    }

    pub fn request_indication(&self, handle: PeerHandle) {
        if let Some(slot) = self.live_slot(handle) {
            slot.needs_indication.store(true, Ordering::Release);
        }
    }

    pub fn touch_ping(&self, handle: PeerHandle, now_us: u64) {
        if let Some(slot) = self.live_slot(handle) {
            slot.last_ping_us.store(now_us, Ordering::Relaxed);
        }
    }

    pub fn counter(&self, peer_id: u16, ty: TrafficType) -> u32 {
        match (self.slot(peer_id), ty.index()) {
            (Ok(slot), Some(idx)) => slot.counters[idx].load(Ordering::Acquire),
            _ => 0,
        }
    }

    fn bitmask(slot: &PeerSlot, now_us: u64, ping_hold_us: u64) -> u32 {
        let mut mask = 0;
        for ty in TrafficType::TRACKED {
            if let Some(idx) = ty.index() {
                if slot.counters[idx].load(Ordering::Acquire) > 0 {
                    mask |= ty.mask_bit();
                }
            }
        }
        let last_ping = slot.last_ping_us.load(Ordering::Relaxed);
        if last_ping != 0 && now_us.saturating_sub(last_ping) < ping_hold_us {
            mask |= TrafficType::Ping.mask_bit();
        }
        mask
    }

    /// Collect at most one indication per peer whose bitmask changed since the
    /// last one sent. Batches every category change made during the pass.
    pub fn drain_indications(&self, now_us: u64, ping_hold_us: u64) -> Vec<ActiveTrafficMap> {
        let mut out = Vec::new();
        for (peer_id, slot) in self.slots.iter().enumerate() {
            if !slot.mapped.load(Ordering::Acquire) {
                continue;
            }
            let last_sent = slot.last_sent_mask.load(Ordering::Relaxed);
            let ping_expired = last_sent & TrafficType::Ping.mask_bit() != 0;
            if !slot.needs_indication.swap(false, Ordering::AcqRel) && !ping_expired {
                continue;
            }
            let mask = Self::bitmask(slot, now_us, ping_hold_us);
            if mask == last_sent {
                continue;
            }
            slot.last_sent_mask.store(mask, Ordering::Relaxed);
            out.push(ActiveTrafficMap {
                peer_id: peer_id as u16,
                mac: MacAddr::from_u64(slot.mac.load(Ordering::Relaxed)),
                vdev_id: slot.vdev_id.load(Ordering::Relaxed),
                bitmask: mask,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddr = MacAddr([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);

    fn mapped() -> (PeerTrafficMap, PeerHandle) {
        let map = PeerTrafficMap::allocate(8).unwrap();
        map.map(3, MAC, 1).unwrap();
        let handle = map.handle(3).unwrap();
        (map, handle)
    }

    #[test]
    fn test_duplicate_map_is_rejected() {
        let (map, _) = mapped();
        assert_eq!(map.map(3, MAC, 1).unwrap_err().kind(), "PeerAlreadyMapped");
    }

    #[test]
    fn test_unmap_unknown_peer_is_rejected() {
        let map = PeerTrafficMap::allocate(8).unwrap();
        assert_eq!(map.unmap(2, MAC).unwrap_err().kind(), "PeerNotMapped");
        assert_eq!(map.unmap(200, MAC).unwrap_err().kind(), "InvalidPeerId");
    }

    #[test]
    fn test_unmap_with_wrong_mac_keeps_mapping() {
        let (map, _) = mapped();
        let other = MacAddr([0; 6]);
        assert_eq!(map.unmap(3, other).unwrap_err().kind(), "PeerMacMismatch");
        assert!(map.is_mapped(3));
    }

    #[test]
    fn test_counter_never_goes_negative() {
        let (map, h) = mapped();
        map.decrement(h, TrafficType::Gaming);
        assert_eq!(map.counter(3, TrafficType::Gaming), 0);
        map.increment(h, TrafficType::Gaming);
        map.decrement(h, TrafficType::Gaming);
        map.decrement(h, TrafficType::Gaming);
        assert_eq!(map.counter(3, TrafficType::Gaming), 0);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let (map, h) = mapped();
        map.unmap(3, MAC).unwrap();
        map.map(3, MAC, 1).unwrap();
        map.increment(h, TrafficType::Streaming);
        assert_eq!(map.counter(3, TrafficType::Streaming), 0);
    }

    #[test]
    fn test_indications_are_batched_per_peer() {
        let (map, h) = mapped();
        map.increment(h, TrafficType::Streaming);
        map.increment(h, TrafficType::VoiceCall);
        map.increment(h, TrafficType::Streaming);
        let out = map.drain_indications(0, 1_000);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].bitmask,
            TrafficType::Streaming.mask_bit() | TrafficType::VoiceCall.mask_bit()
        );
        assert_eq!(out[0].mac, MAC);
        // Nothing changed: nothing to send.
        assert!(map.drain_indications(0, 1_000).is_empty());
    }

    #[test]
    fn test_unchanged_mask_is_not_resent() {
        let (map, h) = mapped();
        map.increment(h, TrafficType::Gaming);
        assert_eq!(map.drain_indications(0, 1_000).len(), 1);
        map.request_indication(h);
        assert!(map.drain_indications(0, 1_000).is_empty());
    }

    #[test]
    fn test_ping_bit_holds_then_expires() {
        let (map, h) = mapped();
        map.touch_ping(h, 1_000);
        map.request_indication(h);
        let out = map.drain_indications(2_000, 5_000);
        assert_eq!(out[0].bitmask, TrafficType::Ping.mask_bit());
        assert!(map.drain_indications(4_000, 5_000).is_empty());
        let out = map.drain_indications(7_000, 5_000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bitmask, 0);
    }
}
