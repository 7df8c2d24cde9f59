//! Slot manager — tracks the backend's fixed set of inference slots and
//! serializes assignment so that no two in-flight requests ever share a
//! slot.
//!
//! `assign` blocks (async) until a slot is available or the caller's
//! deadline expires, honoring first-waiter-first-served FIFO. The
//! "prefer a slot already holding `preferred_entry`" optimization from
//! the design is consulted only among slots that are *already idle*
//! when a waiter is served — it never lets a later arrival jump the
//! FIFO queue, and never blocks a request waiting on a specific busy
//! slot (that half of the optimization is explicitly advisory in the
//! design; this implementation takes the simpler, still-conformant
//! reading — see `DESIGN.md`).

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// What a slot is presently doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Reserved { request_id: u64 },
    Busy { request_id: u64 },
}

struct Slot {
    id: u32,
    phase: Phase,
    /// save_id of the cache entry this slot's backend-side KV state
    /// currently holds, if any. Persists across Busy -> Idle so the
    /// next `assign` targeting the same entry can skip restore.
    resident_entry: Option<String>,
}

struct Waiter {
    request_id: u64,
    preferred_entry: Option<String>,
    responder: oneshot::Sender<u32>,
}

struct Inner {
    slots: Vec<Slot>,
    waiters: VecDeque<Waiter>,
}

/// Shared, cloneable handle to the slot table.
#[derive(Clone)]
pub struct SlotManager {
    inner: std::sync::Arc<Mutex<Inner>>,
}

/// Error returned when no slot became available before the deadline.
#[derive(Debug, thiserror::Error)]
#[error("no slot available before deadline")]
pub struct AssignTimeout;

impl SlotManager {
    pub fn new(n_slots: u32) -> Self {
        let slots = (0..n_slots)
            .map(|id| Slot {
                id,
                phase: Phase::Idle,
                resident_entry: None,
            })
            .collect();
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                slots,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn n_slots(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Assign a slot to `request_id`, blocking up to `deadline`.
    ///
    /// Policy (design §4.4):
    /// 1. Among currently-idle slots, prefer one already resident with
    ///    `preferred_entry` — its KV state is already loaded, no
    ///    restore needed.
    /// 2. Otherwise take any idle slot.
    /// 3. If none idle, queue as a FIFO waiter until one is released.
    pub async fn assign(
        &self,
        request_id: u64,
        preferred_entry: Option<String>,
        deadline: Duration,
    ) -> Result<u32, AssignTimeout> {
        let immediate = {
            let mut inner = self.inner.lock();
            if inner.waiters.is_empty() {
                Self::try_take_slot(&mut inner, request_id, preferred_entry.as_deref())
            } else {
                None
            }
        };

        if let Some(slot_id) = immediate {
            return Ok(slot_id);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.waiters.push_back(Waiter {
                request_id,
                preferred_entry,
                responder: tx,
            });
        }

        match timeout(deadline, rx).await {
            Ok(Ok(slot_id)) => Ok(slot_id),
            // Sender dropped or deadline hit: drop our queued waiter
            // entry (if still present) and report timeout.
            _ => {
                let mut inner = self.inner.lock();
                inner.waiters.retain(|w| w.request_id != request_id);
                Err(AssignTimeout)
            }
        }
    }

    /// Transition `Reserved -> Busy` on the first backend byte.
    pub fn mark_busy(&self, slot_id: u32, request_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == slot_id) {
            slot.phase = Phase::Busy { request_id };
        }
    }

    /// Return a slot to `Idle`. If `final_entry` is given, record it as
    /// this slot's resident entry (hinting the next `assign` targeting
    /// it can skip restore); otherwise leave the prior hint untouched —
    /// the request may simply have been a plain forward with no save.
    /// Wakes the next FIFO waiter, if any, handing it this slot.
    pub fn release(&self, slot_id: u32, final_entry: Option<String>) {
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == slot_id) {
            slot.phase = Phase::Idle;
            if final_entry.is_some() {
                slot.resident_entry = final_entry;
            }
        }

        if let Some(waiter) = inner.waiters.pop_front() {
            let request_id = waiter.request_id;
            if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == slot_id) {
                slot.phase = Phase::Reserved { request_id };
            }
            let _ = waiter.responder.send(slot_id);
        }
    }

    /// Current resident entry of a slot (set by the most recent
    /// `release` that carried one), regardless of current phase.
    pub fn resident_entry(&self, slot_id: u32) -> Option<String> {
        self.inner
            .lock()
            .slots
            .iter()
            .find(|s| s.id == slot_id)
            .and_then(|s| s.resident_entry.clone())
    }

    pub fn snapshot(&self) -> Vec<(u32, Phase, Option<String>)> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|s| (s.id, s.phase.clone(), s.resident_entry.clone()))
            .collect()
    }

    fn try_take_slot(
        inner: &mut Inner,
        request_id: u64,
        preferred_entry: Option<&str>,
    ) -> Option<u32> {
        if let Some(wanted) = preferred_entry {
            if let Some(slot) = inner.slots.iter_mut().find(|s| {
                s.phase == Phase::Idle && s.resident_entry.as_deref() == Some(wanted)
            }) {
                slot.phase = Phase::Reserved { request_id };
                return Some(slot.id);
            }
        }

        let slot = inner.slots.iter_mut().find(|s| s.phase == Phase::Idle)?;
        slot.phase = Phase::Reserved { request_id };
        Some(slot.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn at_most_one_request_per_slot() {
        let mgr = SlotManager::new(2);
        let a = mgr.assign(1, None, Duration::from_secs(1)).await.unwrap();
        let b = mgr.assign(2, None, Duration::from_secs(1)).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn blocks_until_release_when_full() {
        let mgr = SlotManager::new(1);
        let slot = mgr.assign(1, None, Duration::from_secs(1)).await.unwrap();

        let mgr2 = mgr.clone();
        let waiter =
            tokio::spawn(async move { mgr2.assign(2, None, Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.release(slot, None);

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, slot);
    }

    #[tokio::test]
    async fn times_out_when_no_slot_frees_up() {
        let mgr = SlotManager::new(1);
        let _held = mgr.assign(1, None, Duration::from_secs(1)).await.unwrap();
        let result = mgr.assign(2, None, Duration::from_millis(30)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fifo_order_across_waiters() {
        let mgr = SlotManager::new(1);
        let slot = mgr.assign(1, None, Duration::from_secs(1)).await.unwrap();

        let mgr_a = mgr.clone();
        let first =
            tokio::spawn(async move { mgr_a.assign(2, None, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mgr_b = mgr.clone();
        let second =
            tokio::spawn(async move { mgr_b.assign(3, None, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        mgr.release(slot, None);
        let first_slot = first.await.unwrap().unwrap();
        assert_eq!(first_slot, slot);

        mgr.release(first_slot, None);
        let second_slot = second.await.unwrap().unwrap();
        assert_eq!(second_slot, slot);
    }

    #[tokio::test]
    async fn preferred_idle_slot_is_chosen_over_others() {
        let mgr = SlotManager::new(2);
        let a = mgr.assign(1, None, Duration::from_secs(1)).await.unwrap();
        mgr.release(a, Some("save-xyz".to_string()));

        let chosen = mgr
            .assign(2, Some("save-xyz".to_string()), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(chosen, a);
    }

    #[tokio::test]
    async fn fifo_not_violated_by_preference() {
        // A waiter queued first must be served first even if a later
        // caller's preference would otherwise match the freed slot.
        let mgr = SlotManager::new(1);
        let held = mgr.assign(1, None, Duration::from_secs(1)).await.unwrap();
        mgr.release(held, Some("save-xyz".to_string()));
        let held = mgr.assign(99, None, Duration::from_secs(1)).await.unwrap();

        let mgr_a = mgr.clone();
        let first = tokio::spawn(async move {
            mgr_a
                .assign(2, None, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mgr_b = mgr.clone();
        let second = tokio::spawn(async move {
            mgr_b
                .assign(3, Some("save-xyz".to_string()), Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        mgr.release(held, None);
        let first_slot = first.await.unwrap().unwrap();
        assert_eq!(first_slot, held);
        let _ = second;
    }
}
