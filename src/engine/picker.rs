//! Piece arbitration across peer connections.
//!
//! The picker owns the missing set and the borrower relation between
//! connections and pieces. A piece can be borrowed by several connections
//! near the end of a download, when nothing unclaimed remains; the first
//! delivery wins and the rest are cancelled.
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{HashMap, HashSet};

pub(crate) struct Picker {
    missing: HashSet<u32>,
    peer_pieces: HashMap<u64, HashSet<u32>>,
    piece_peers: HashMap<u32, HashSet<u64>>,
    rng: StdRng,
}

impl Picker {
    pub fn new(missing: HashSet<u32>, rng: StdRng) -> Self {
        Self {
            missing,
            peer_pieces: HashMap::new(),
            piece_peers: HashMap::new(),
            rng,
        }
    }

    pub fn add_peer(&mut self, connection: u64) {
        self.peer_pieces.entry(connection).or_default();
    }

    /// Removes a connection, returning its borrowed pieces to circulation.
    /// Pieces whose borrower set empties stay missing and become eligible
    /// for fresh assignment.
    pub fn drop_peer(&mut self, connection: u64) {
        let Some(pieces) = self.peer_pieces.remove(&connection) else {
            return;
        };
        for piece in pieces {
            if let Some(borrowers) = self.piece_peers.get_mut(&piece) {
                borrowers.remove(&connection);
                if borrowers.is_empty() {
                    self.piece_peers.remove(&piece);
                }
            }
        }
    }

    /// Picks a piece for `connection` out of `available`, or `None` if every
    /// assignable piece is already borrowed by this connection or delivered.
    ///
    /// Unborrowed pieces are preferred, to spread connections across the
    /// missing set; re-borrowing is the fallback that keeps the tail of the
    /// download moving. The tie-break is uniformly random, deterministic
    /// under a seeded RNG.
    pub fn assign(&mut self, connection: u64, available: &HashSet<u32>) -> Option<u32> {
        let borrowed = self.peer_pieces.get(&connection)?;
        let candidates: Vec<u32> = self
            .missing
            .iter()
            .copied()
            .filter(|index| available.contains(index) && !borrowed.contains(index))
            .collect();
        let mut pool: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|index| !self.piece_peers.contains_key(index))
            .collect();
        if pool.is_empty() {
            pool = candidates;
        }
        if pool.is_empty() {
            return None;
        }
        // Hash sets iterate in arbitrary order; sorting keeps the choice a
        // pure function of the RNG state.
        pool.sort_unstable();
        let piece = pool[self.rng.random_range(0..pool.len())];
        self.peer_pieces.entry(connection).or_default().insert(piece);
        self.piece_peers.entry(piece).or_default().insert(connection);
        Some(piece)
    }

    /// Records `piece` as delivered by `connection`.
    ///
    /// Returns the other borrowers that should cancel it, or `None` if the
    /// piece was not missing (a race with another connection finishing
    /// first; the caller ignores the delivery).
    pub fn deliver(&mut self, connection: u64, piece: u32) -> Option<Vec<u64>> {
        if !self.missing.remove(&piece) {
            return None;
        }
        let borrowers = self.piece_peers.remove(&piece).unwrap_or_default();
        let mut others = Vec::new();
        for borrower in borrowers {
            if let Some(pieces) = self.peer_pieces.get_mut(&borrower) {
                pieces.remove(&piece);
            }
            if borrower != connection {
                others.push(borrower);
            }
        }
        Some(others)
    }

    pub fn is_done(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn missing_len(&self) -> usize {
        self.missing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn picker(pieces: u32) -> Picker {
        Picker::new((0..pieces).collect(), StdRng::seed_from_u64(7))
    }

    // The two borrower maps must stay symmetric, and every borrowed piece
    // must still be missing.
    fn assert_consistent(picker: &Picker) {
        for (peer, pieces) in &picker.peer_pieces {
            for piece in pieces {
                assert!(picker.piece_peers[piece].contains(peer));
            }
        }
        for (piece, peers) in &picker.piece_peers {
            assert!(!peers.is_empty());
            assert!(picker.missing.contains(piece));
            for peer in peers {
                assert!(picker.peer_pieces[peer].contains(piece));
            }
        }
    }

    #[test]
    fn assign_prefers_unborrowed_pieces() {
        let mut picker = picker(2);
        picker.add_peer(1);
        picker.add_peer(2);
        let all: HashSet<u32> = [0, 1].into();
        let first = picker.assign(1, &all).unwrap();
        let second = picker.assign(2, &all).unwrap();
        assert_ne!(first, second);
        assert_consistent(&picker);
    }

    #[test]
    fn assign_reborrows_only_when_nothing_is_unclaimed() {
        let mut picker = picker(1);
        picker.add_peer(1);
        picker.add_peer(2);
        let all: HashSet<u32> = [0].into();
        assert_eq!(picker.assign(1, &all), Some(0));
        // The only piece is borrowed; peer 2 re-borrows it.
        assert_eq!(picker.assign(2, &all), Some(0));
        // Neither peer can borrow the same piece twice.
        assert_eq!(picker.assign(1, &all), None);
        assert_eq!(picker.assign(2, &all), None);
        assert_consistent(&picker);
    }

    #[test]
    fn assign_respects_availability() {
        let mut picker = picker(4);
        picker.add_peer(1);
        assert_eq!(picker.assign(1, &HashSet::new()), None);
        let only: HashSet<u32> = [2].into();
        assert_eq!(picker.assign(1, &only), Some(2));
        assert_consistent(&picker);
    }

    #[test]
    fn deliver_is_at_most_once_and_cancels_other_borrowers() {
        let mut picker = picker(1);
        picker.add_peer(1);
        picker.add_peer(2);
        let all: HashSet<u32> = [0].into();
        picker.assign(1, &all);
        picker.assign(2, &all);

        assert_eq!(picker.deliver(1, 0), Some(vec![2]));
        assert!(picker.is_done());
        // A duplicate delivery from the slower borrower is ignored.
        assert_eq!(picker.deliver(2, 0), None);
        // A delivered piece is never reassigned.
        assert_eq!(picker.assign(1, &all), None);
        assert_consistent(&picker);
    }

    #[test]
    fn missing_is_monotonic() {
        let mut picker = picker(3);
        picker.add_peer(1);
        let all: HashSet<u32> = (0..3).collect();
        let mut previous = picker.missing_len();
        for _ in 0..3 {
            let piece = picker.assign(1, &all).unwrap();
            picker.deliver(1, piece);
            assert!(picker.missing_len() < previous);
            previous = picker.missing_len();
            assert_consistent(&picker);
        }
        assert!(picker.is_done());
    }

    #[test]
    fn dropped_peer_returns_its_pieces() {
        let mut picker = picker(2);
        picker.add_peer(1);
        picker.add_peer(2);
        let all: HashSet<u32> = [0, 1].into();
        let borrowed = picker.assign(1, &all).unwrap();
        picker.drop_peer(1);
        assert_consistent(&picker);
        assert_eq!(picker.missing_len(), 2);
        // The returned piece is unborrowed again and preferred over nothing.
        picker.add_peer(3);
        let only: HashSet<u32> = [borrowed].into();
        assert_eq!(picker.assign(3, &only), Some(borrowed));
        assert_consistent(&picker);
    }

    #[test]
    fn seeded_choice_is_deterministic() {
        let run = || {
            let mut picker = picker(16);
            picker.add_peer(1);
            let all: HashSet<u32> = (0..16).collect();
            (0..16)
                .map(|_| picker.assign(1, &all).unwrap())
                .collect::<Vec<u32>>()
        };
        assert_eq!(run(), run());
    }
}
