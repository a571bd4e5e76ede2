//! Upstream socket table and round-robin selection.

use std::path::{Path, PathBuf};
use std::time::Instant;

/// State of one worker socket
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamState {
    pub socket: PathBuf,

    /// A forwarded request is outstanding on this socket
    pub inflight: bool,

    /// Skipped for selection until this instant
    pub quarantine_until: Option<Instant>,

    /// Last readiness probe succeeded
    pub ready: bool,
}

impl UpstreamState {
    fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            inflight: false,
            quarantine_until: None,
            ready: false,
        }
    }

    fn quarantined(&self, now: Instant) -> bool {
        self.quarantine_until.is_some_and(|until| now < until)
    }

    /// Eligible for a new request
    fn selectable(&self, now: Instant) -> bool {
        self.ready && !self.inflight && !self.quarantined(now)
    }
}

/// The balancer's view of the pool.
///
/// Insertion order is kept; selection walks it round-robin from a cursor
/// that advances past every chosen socket.
#[derive(Debug, Default)]
pub struct UpstreamSet {
    upstreams: Vec<UpstreamState>,
    cursor: usize,
}

impl UpstreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn get(&self, socket: &Path) -> Option<&UpstreamState> {
        self.upstreams.iter().find(|u| u.socket == socket)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpstreamState> {
        self.upstreams.iter()
    }

    fn get_mut(&mut self, socket: &Path) -> Option<&mut UpstreamState> {
        self.upstreams.iter_mut().find(|u| u.socket == socket)
    }

    /// Replace the membership with `found`, keeping the state of sockets
    /// that stay. Returns the sockets that were added.
    pub fn reconcile(&mut self, found: Vec<PathBuf>) -> Vec<PathBuf> {
        let mut previous = std::mem::take(&mut self.upstreams);
        let mut added = Vec::new();

        for socket in found {
            if self.upstreams.iter().any(|u| u.socket == socket) {
                continue;
            }
            match previous.iter().position(|u| u.socket == socket) {
                Some(index) => self.upstreams.push(previous.swap_remove(index)),
                None => {
                    added.push(socket.clone());
                    self.upstreams.push(UpstreamState::new(socket));
                }
            }
        }

        self.clamp_cursor();
        added
    }

    /// Track a socket; returns false if it was already known.
    pub fn insert(&mut self, socket: PathBuf) -> bool {
        if self.get(&socket).is_some() {
            return false;
        }
        self.upstreams.push(UpstreamState::new(socket));
        true
    }

    /// Stop tracking a socket; returns false if it was unknown.
    pub fn remove(&mut self, socket: &Path) -> bool {
        let Some(index) = self.upstreams.iter().position(|u| u.socket == socket) else {
            return false;
        };
        self.upstreams.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        self.clamp_cursor();
        true
    }

    /// Pick the next selectable socket round-robin and mark it in flight.
    pub fn acquire_next(&mut self, now: Instant) -> Option<PathBuf> {
        let len = self.upstreams.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            let upstream = &mut self.upstreams[index];
            if upstream.selectable(now) {
                upstream.inflight = true;
                self.cursor = (index + 1) % len;
                return Some(upstream.socket.clone());
            }
        }
        None
    }

    /// Clear the in-flight mark of a socket.
    pub fn release(&mut self, socket: &Path) {
        if let Some(upstream) = self.get_mut(socket) {
            upstream.inflight = false;
        }
    }

    /// Exclude a socket from selection until `until`; it stays not-ready
    /// until a later probe succeeds.
    pub fn quarantine(&mut self, socket: &Path, until: Instant) {
        if let Some(upstream) = self.get_mut(socket) {
            upstream.quarantine_until = Some(until);
            upstream.ready = false;
        }
    }

    /// Record a probe result.
    pub fn set_ready(&mut self, socket: &Path, ready: bool) {
        if let Some(upstream) = self.get_mut(socket) {
            upstream.ready = ready;
        }
    }

    /// Some socket is ready and not quarantined.
    pub fn has_available(&self, now: Instant) -> bool {
        self.upstreams
            .iter()
            .any(|u| u.ready && !u.quarantined(now))
    }

    /// Some socket could take a request right now.
    pub fn has_idle(&self, now: Instant) -> bool {
        self.upstreams.iter().any(|u| u.selectable(now))
    }

    /// Sockets passing their last probe and not quarantined.
    pub fn ready_count(&self, now: Instant) -> usize {
        self.upstreams
            .iter()
            .filter(|u| u.ready && !u.quarantined(now))
            .count()
    }

    /// Sockets due for a readiness probe. A socket serving a request
    /// would only answer busy, so it keeps its last result.
    pub fn probe_targets(&self, now: Instant) -> Vec<PathBuf> {
        self.upstreams
            .iter()
            .filter(|u| !u.inflight && !u.quarantined(now))
            .map(|u| u.socket.clone())
            .collect()
    }

    fn clamp_cursor(&mut self) {
        if self.cursor >= self.upstreams.len() {
            self.cursor = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sockets(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("/tmp/rip-t-{}.sock", i))).collect()
    }

    fn ready_set(n: usize) -> UpstreamSet {
        let mut set = UpstreamSet::new();
        for socket in sockets(n) {
            set.insert(socket.clone());
            set.set_ready(&socket, true);
        }
        set
    }

    #[test]
    fn test_round_robin_is_fair() {
        let mut set = ready_set(3);
        let now = Instant::now();
        let mut picks = Vec::new();
        for _ in 0..6 {
            let socket = set.acquire_next(now).unwrap();
            set.release(&socket);
            picks.push(socket);
        }
        let expected: Vec<PathBuf> = sockets(3).into_iter().cycle().take(6).collect();
        assert_eq!(picks, expected);
    }

    #[test]
    fn test_inflight_sockets_are_skipped() {
        let mut set = ready_set(2);
        let now = Instant::now();
        let first = set.acquire_next(now).unwrap();
        let second = set.acquire_next(now).unwrap();
        assert_ne!(first, second);
        assert!(set.acquire_next(now).is_none());
        assert!(!set.has_idle(now));
        assert!(set.has_available(now));

        set.release(&first);
        assert_eq!(set.acquire_next(now), Some(first));
    }

    #[test]
    fn test_quarantine_excludes_until_probed() {
        let mut set = ready_set(2);
        let all = sockets(2);
        let now = Instant::now();
        set.quarantine(&all[0], now + Duration::from_secs(1));

        assert_eq!(set.ready_count(now), 1);
        assert_eq!(set.probe_targets(now), vec![all[1].clone()]);
        assert_eq!(set.acquire_next(now), Some(all[1].clone()));

        // In flight, so not probed
        assert!(set.probe_targets(now).is_empty());
        set.release(&all[1]);

        // Expired but not yet re-probed
        let later = now + Duration::from_secs(2);
        assert!(!set.get(&all[0]).unwrap().ready);
        assert_eq!(set.probe_targets(later).len(), 2);
        set.set_ready(&all[0], true);
        assert_eq!(set.ready_count(later), 2);
    }

    #[test]
    fn test_not_ready_means_degraded() {
        let mut set = UpstreamSet::new();
        let now = Instant::now();
        assert!(!set.has_available(now));
        set.insert(sockets(1).remove(0));
        assert!(!set.has_available(now));
        assert!(set.acquire_next(now).is_none());
    }

    #[test]
    fn test_reconcile_keeps_state_and_reports_additions() {
        let mut set = ready_set(2);
        let all = sockets(3);
        let now = Instant::now();
        set.acquire_next(now);

        let added = set.reconcile(vec![all[1].clone(), all[2].clone()]);
        assert_eq!(added, vec![all[2].clone()]);
        assert_eq!(set.len(), 2);
        assert!(set.get(&all[0]).is_none());
        assert!(set.get(&all[1]).unwrap().ready);
        assert!(!set.get(&all[2]).unwrap().ready);
    }

    #[test]
    fn test_insert_and_remove() {
        let mut set = ready_set(3);
        let all = sockets(3);
        assert!(!set.insert(all[0].clone()));
        assert!(set.remove(&all[1]));
        assert!(!set.remove(&all[1]));
        assert_eq!(set.len(), 2);

        let now = Instant::now();
        let picks: Vec<PathBuf> = (0..2)
            .map(|_| {
                let s = set.acquire_next(now).unwrap();
                set.release(&s);
                s
            })
            .collect();
        assert_eq!(picks, vec![all[0].clone(), all[2].clone()]);
    }
}
