use peer_proto::bitfield::Bitfield;

/// Arena key of a peer in the torrent's peer slab.
pub type PeerKey = usize;

/// Request-sized sub-range of a piece.
pub const BLOCK_LEN: u32 = 16384;

/// How many peers may work the same block in aggressive mode.
const MAX_OVERLAP: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Off,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTransfer {
    pub peer: PeerKey,
    pub piece: u32,
    pub begin: u32,
    pub len: u32,
}

struct Transfer {
    peer: PeerKey,
    stalled: bool,
}

struct Block {
    transfers: Vec<Transfer>,
    finished_by: Option<PeerKey>,
}

impl Block {
    fn new() -> Self {
        Self {
            transfers: Vec::new(),
            finished_by: None,
        }
    }

    fn is_finished(&self) -> bool {
        self.finished_by.is_some()
    }

    /// No active request on this block. An untouched block is vacuously
    /// stalled.
    fn is_stalled(&self) -> bool {
        self.transfers.iter().all(|t| t.stalled)
    }

    fn active_count(&self) -> u16 {
        self.transfers.iter().filter(|t| !t.stalled).count() as u16
    }

    fn has_peer(&self, peer: PeerKey) -> bool {
        self.transfers.iter().any(|t| t.peer == peer)
    }
}

/// Per-block request state for one in-progress piece.
pub struct BlockList {
    pub index: u32,
    pub piece_len: u32,
    pub priority: Priority,
    pub by_seeder: bool,
    blocks: Vec<Block>,
    finished: usize,
}

impl BlockList {
    fn new(index: u32, piece_len: u32, priority: Priority, by_seeder: bool) -> Self {
        let num_blocks = ((piece_len + BLOCK_LEN - 1) / BLOCK_LEN).max(1) as usize;
        Self {
            index,
            piece_len,
            priority,
            by_seeder,
            blocks: (0..num_blocks).map(|_| Block::new()).collect(),
            finished: 0,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn finished_blocks(&self) -> usize {
        self.finished
    }

    pub fn is_complete(&self) -> bool {
        self.finished == self.blocks.len()
    }

    /// Length of the given block; only the last may be short.
    pub fn block_len_at(&self, block: usize) -> u32 {
        let begin = block as u32 * BLOCK_LEN;
        debug_assert!(begin < self.piece_len);
        (self.piece_len - begin).min(BLOCK_LEN)
    }

    /// The committed writer of every finished block.
    pub fn writers(&self) -> impl Iterator<Item = (usize, PeerKey)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.finished_by.map(|p| (i, p)))
    }

    fn block_of(&self, begin: u32) -> Option<usize> {
        let idx = (begin / BLOCK_LEN) as usize;
        if begin % BLOCK_LEN != 0 || idx >= self.blocks.len() {
            return None;
        }
        Some(idx)
    }
}

/// What happened when a downloaded block was handed in.
pub struct FinishOutcome {
    /// This peer's bytes are the authoritative content.
    pub accepted: bool,
    pub piece_complete: bool,
    /// Duplicate in-flight requests to cancel on other peers.
    pub cancels: Vec<BlockTransfer>,
}

/// Chooses the next block to request for a peer and tracks block ownership
/// across peers.
pub struct Delegator {
    lists: Vec<BlockList>,
    pub aggressive: bool,
}

impl Delegator {
    pub fn new(aggressive: bool) -> Self {
        Self {
            lists: Vec::new(),
            aggressive,
        }
    }

    pub fn lists(&self) -> &[BlockList] {
        &self.lists
    }

    pub fn list(&self, piece: u32) -> Option<&BlockList> {
        self.lists.iter().find(|l| l.index == piece)
    }

    pub fn has_list(&self, piece: u32) -> bool {
        self.list(piece).is_some()
    }

    /// Pick the next block for this peer. `next_piece` is the selection
    /// oracle: given a priority class it yields a fresh piece the peer has,
    /// as `(index, piece length)`.
    pub fn delegate<F>(
        &mut self,
        peer: PeerKey,
        bitfield: &Bitfield,
        is_seeder: bool,
        affinity: Option<u32>,
        mut next_piece: F,
    ) -> Option<BlockTransfer>
    where
        F: FnMut(Priority) -> Option<(u32, u32)>,
    {
        // Affinity first: stay on the piece this peer already worked.
        if let Some(aff) = affinity {
            if let Some(li) = self.lists.iter().position(|l| l.index == aff) {
                if let Some(block) = delegate_piece(&self.lists[li], peer) {
                    return Some(self.insert(li, block, peer));
                }
            }
        }

        if is_seeder {
            if let Some(t) = self.delegate_seeder(peer, &mut next_piece) {
                return Some(t);
            }
        }

        for priority in [Priority::High, Priority::Normal] {
            let found = self.lists.iter().position(|l| {
                l.priority == priority
                    && bitfield.get_bit(l.index as usize)
                    && delegate_piece(l, peer).is_some()
            });
            if let Some(li) = found {
                let block = delegate_piece(&self.lists[li], peer).unwrap();
                return Some(self.insert(li, block, peer));
            }

            if let Some((index, piece_len)) = next_piece(priority) {
                let li = self.open_list(index, piece_len, priority, is_seeder);
                let block = delegate_piece(&self.lists[li], peer)?;
                return Some(self.insert(li, block, peer));
            }
        }

        if !self.aggressive {
            return None;
        }

        // Aggressive endgame: double up on the least-contended block.
        let mut overlapped = MAX_OVERLAP + 1;
        let mut target: Option<(usize, usize)> = None;
        for (li, list) in self.lists.iter().enumerate() {
            if !bitfield.get_bit(list.index as usize) || list.priority == Priority::Off {
                continue;
            }
            if let Some((block, overlap)) = delegate_aggressive(list, &mut overlapped, peer) {
                target = Some((li, block));
                if overlap == 0 {
                    break;
                }
            }
        }

        target.map(|(li, block)| self.insert(li, block, peer))
    }

    fn delegate_seeder<F>(&mut self, peer: PeerKey, next_piece: &mut F) -> Option<BlockTransfer>
    where
        F: FnMut(Priority) -> Option<(u32, u32)>,
    {
        let found = self
            .lists
            .iter()
            .position(|l| l.by_seeder && delegate_piece(l, peer).is_some());
        if let Some(li) = found {
            let block = delegate_piece(&self.lists[li], peer).unwrap();
            return Some(self.insert(li, block, peer));
        }

        for priority in [Priority::High, Priority::Normal] {
            if let Some((index, piece_len)) = next_piece(priority) {
                let li = self.open_list(index, piece_len, priority, true);
                let block = delegate_piece(&self.lists[li], peer)?;
                return Some(self.insert(li, block, peer));
            }
        }

        None
    }

    fn open_list(&mut self, index: u32, piece_len: u32, priority: Priority, by_seeder: bool) -> usize {
        debug_assert!(!self.has_list(index));
        log::trace!("Opened block list for piece {}", index);
        self.lists
            .push(BlockList::new(index, piece_len, priority, by_seeder));
        self.lists.len() - 1
    }

    fn insert(&mut self, li: usize, block: usize, peer: PeerKey) -> BlockTransfer {
        let list = &mut self.lists[li];
        debug_assert!(!list.blocks[block].has_peer(peer));
        list.blocks[block].transfers.push(Transfer {
            peer,
            stalled: false,
        });

        BlockTransfer {
            peer,
            piece: list.index,
            begin: block as u32 * BLOCK_LEN,
            len: list.block_len_at(block),
        }
    }

    /// Record a delivered block. Returns `None` for coordinates we never
    /// opened (protocol error at the caller's discretion).
    pub fn block_finished(&mut self, peer: PeerKey, piece: u32, begin: u32) -> Option<FinishOutcome> {
        let list = self.lists.iter_mut().find(|l| l.index == piece)?;
        let bi = list.block_of(begin)?;
        let len = list.block_len_at(bi);
        let block = &mut list.blocks[bi];

        if block.is_finished() {
            // Someone else won the race; these bytes are discarded.
            block.transfers.retain(|t| t.peer != peer);
            return Some(FinishOutcome {
                accepted: false,
                piece_complete: list.is_complete(),
                cancels: Vec::new(),
            });
        }

        block.finished_by = Some(peer);
        let cancels = block
            .transfers
            .drain(..)
            .filter(|t| t.peer != peer)
            .map(|t| BlockTransfer {
                peer: t.peer,
                piece,
                begin,
                len,
            })
            .collect();

        list.finished += 1;
        Some(FinishOutcome {
            accepted: true,
            piece_complete: list.is_complete(),
            cancels,
        })
    }

    /// Mark one outstanding request stalled (request timeout).
    pub fn stall(&mut self, peer: PeerKey, piece: u32, begin: u32) {
        if let Some(list) = self.lists.iter_mut().find(|l| l.index == piece) {
            if let Some(bi) = list.block_of(begin) {
                for t in &mut list.blocks[bi].transfers {
                    if t.peer == peer {
                        t.stalled = true;
                    }
                }
            }
        }
    }

    /// Drop every request held by a disconnecting peer. The blocks stay
    /// open for re-delegation; nothing finished is lost.
    pub fn cancel_peer(&mut self, peer: PeerKey) -> usize {
        let mut dropped = 0;
        for list in &mut self.lists {
            for block in &mut list.blocks {
                let before = block.transfers.len();
                block.transfers.retain(|t| t.peer != peer);
                dropped += before - block.transfers.len();
            }
        }
        dropped
    }

    /// Outstanding (unfinished) requests assigned to a peer.
    pub fn requests_of(&self, peer: PeerKey) -> Vec<BlockTransfer> {
        let mut out = Vec::new();
        for list in &self.lists {
            for (bi, block) in list.blocks.iter().enumerate() {
                if !block.is_finished() && block.has_peer(peer) {
                    out.push(BlockTransfer {
                        peer,
                        piece: list.index,
                        begin: bi as u32 * BLOCK_LEN,
                        len: list.block_len_at(bi),
                    });
                }
            }
        }
        out
    }

    /// Reset a piece after a failed hash check; every block becomes
    /// delegatable again.
    pub fn clear_for_retry(&mut self, piece: u32) {
        if let Some(list) = self.lists.iter_mut().find(|l| l.index == piece) {
            for block in &mut list.blocks {
                block.finished_by = None;
                block.transfers.clear();
            }
            list.finished = 0;
            list.by_seeder = false;
        }
    }

    /// Close the list once the piece verified.
    pub fn remove_list(&mut self, piece: u32) -> Option<BlockList> {
        let li = self.lists.iter().position(|l| l.index == piece)?;
        Some(self.lists.swap_remove(li))
    }
}

/// First unfinished, unstalled-free block with no requests; otherwise the
/// first stalled block this peer has not been asked for yet.
fn delegate_piece(list: &BlockList, peer: PeerKey) -> Option<usize> {
    let mut fallback = None;

    for (i, block) in list.blocks.iter().enumerate() {
        if block.is_finished() || !block.is_stalled() {
            continue;
        }

        if block.transfers.is_empty() {
            return Some(i);
        }

        if fallback.is_none() && !block.has_peer(peer) {
            fallback = Some(i);
        }
    }

    fallback
}

/// Track minimum overlap; prefer blocks with the fewest concurrent
/// non-stalled requests.
fn delegate_aggressive(
    list: &BlockList,
    overlapped: &mut u16,
    peer: PeerKey,
) -> Option<(usize, u16)> {
    let mut found = None;

    for (i, block) in list.blocks.iter().enumerate() {
        if *overlapped == 0 {
            break;
        }
        let active = block.active_count();
        if !block.is_finished() && active < *overlapped && !block.has_peer(peer) {
            found = Some((i, active));
            *overlapped = active;
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bitfield(n: usize) -> Bitfield {
        Bitfield::with_value(n, true)
    }

    fn no_new_piece(_: Priority) -> Option<(u32, u32)> {
        None
    }

    #[test]
    fn opens_piece_from_oracle_and_walks_blocks() {
        let mut d = Delegator::new(false);
        let bits = full_bitfield(8);

        let mut served = false;
        let oracle = |p: Priority| {
            if p == Priority::Normal && !served {
                served = true;
                Some((3, 40000))
            } else {
                None
            }
        };

        let t = d.delegate(0, &bits, false, None, oracle).unwrap();
        assert_eq!(t.piece, 3);
        assert_eq!(t.begin, 0);
        assert_eq!(t.len, BLOCK_LEN);

        // Same peer, affinity: next block of the same piece.
        let t2 = d
            .delegate(0, &bits, false, Some(3), no_new_piece)
            .unwrap();
        assert_eq!(t2.piece, 3);
        assert_eq!(t2.begin, BLOCK_LEN);

        // Third block is the short tail.
        let t3 = d
            .delegate(0, &bits, false, Some(3), no_new_piece)
            .unwrap();
        assert_eq!(t3.begin, 2 * BLOCK_LEN);
        assert_eq!(t3.len, 40000 - 2 * BLOCK_LEN);

        // All blocks actively requested: nothing left for this peer.
        assert!(d.delegate(0, &bits, false, Some(3), no_new_piece).is_none());
    }

    #[test]
    fn second_peer_takes_stalled_block() {
        let mut d = Delegator::new(false);
        let bits = full_bitfield(4);

        let mut first = true;
        let t = d
            .delegate(0, &bits, false, None, |_| {
                if first {
                    first = false;
                    Some((0, BLOCK_LEN))
                } else {
                    None
                }
            })
            .unwrap();

        // Active request blocks re-delegation.
        assert!(d.delegate(1, &bits, false, None, no_new_piece).is_none());

        // Once stalled, another peer may pick it up.
        d.stall(0, t.piece, t.begin);
        let t2 = d.delegate(1, &bits, false, None, no_new_piece).unwrap();
        assert_eq!((t2.piece, t2.begin), (t.piece, t.begin));

        // But not the peer already on it.
        d.stall(1, t.piece, t.begin);
        assert!(d.delegate(1, &bits, false, None, no_new_piece).is_none());
    }

    #[test]
    fn high_priority_in_progress_wins_over_new_piece() {
        let mut d = Delegator::new(false);
        let bits = full_bitfield(8);

        // Open a HIGH list via the oracle.
        let t = d
            .delegate(0, &bits, false, None, |p| {
                (p == Priority::High).then_some((5, 2 * BLOCK_LEN))
            })
            .unwrap();
        assert_eq!(t.piece, 5);

        // A second peer joins the HIGH piece instead of opening a new one.
        let t2 = d
            .delegate(1, &bits, false, None, |_| Some((6, BLOCK_LEN)))
            .unwrap();
        assert_eq!(t2.piece, 5);
        assert_eq!(t2.begin, BLOCK_LEN);
    }

    #[test]
    fn seeder_path_prefers_seeder_lists() {
        let mut d = Delegator::new(false);
        let bits = full_bitfield(8);

        let t = d
            .delegate(0, &bits, true, None, |p| {
                (p == Priority::High).then_some((2, 2 * BLOCK_LEN))
            })
            .unwrap();
        assert_eq!(t.piece, 2);
        assert!(d.list(2).unwrap().by_seeder);

        // Another seeder continues the seeder-originated piece.
        let t2 = d.delegate(1, &bits, true, None, no_new_piece).unwrap();
        assert_eq!(t2.piece, 2);
    }

    #[test]
    fn aggressive_picks_least_overlapped() {
        let mut d = Delegator::new(true);
        let bits = full_bitfield(4);

        // Peer 0 requests both blocks of piece 0.
        let mut first = true;
        let give = |_: Priority| {
            if first {
                first = false;
                Some((0, 2 * BLOCK_LEN))
            } else {
                None
            }
        };
        let a = d.delegate(0, &bits, false, None, give).unwrap();
        let b = d.delegate(0, &bits, false, Some(0), no_new_piece).unwrap();
        assert_eq!(a.begin, 0);
        assert_eq!(b.begin, BLOCK_LEN);

        // Peer 1 doubles up on block 0; peer 2 then doubles on block 1,
        // the least-overlapped one.
        let t1 = d.delegate(1, &bits, false, None, no_new_piece).unwrap();
        assert_eq!(t1.begin, 0);
        let t2 = d.delegate(2, &bits, false, None, no_new_piece).unwrap();
        assert_eq!(t2.begin, BLOCK_LEN);
    }

    #[test]
    fn finish_cancels_duplicates_and_completes() {
        let mut d = Delegator::new(true);
        let bits = full_bitfield(4);

        let mut first = true;
        let t = d
            .delegate(0, &bits, false, None, |_| {
                if first {
                    first = false;
                    Some((0, BLOCK_LEN))
                } else {
                    None
                }
            })
            .unwrap();
        let dup = d.delegate(1, &bits, false, None, no_new_piece).unwrap();
        assert_eq!((dup.piece, dup.begin), (t.piece, t.begin));

        let outcome = d.block_finished(1, t.piece, t.begin).unwrap();
        assert!(outcome.accepted);
        assert!(outcome.piece_complete);
        assert_eq!(outcome.cancels.len(), 1);
        assert_eq!(outcome.cancels[0].peer, 0);

        // The loser's late delivery is not accepted.
        let late = d.block_finished(0, t.piece, t.begin).unwrap();
        assert!(!late.accepted);

        // Exactly one committed writer.
        let writers: Vec<_> = d.list(0).unwrap().writers().collect();
        assert_eq!(writers, vec![(0, 1)]);
    }

    #[test]
    fn unknown_block_rejected() {
        let mut d = Delegator::new(false);
        assert!(d.block_finished(0, 9, 0).is_none());

        let bits = full_bitfield(4);
        let mut first = true;
        d.delegate(0, &bits, false, None, |_| {
            if first {
                first = false;
                Some((0, BLOCK_LEN))
            } else {
                None
            }
        })
        .unwrap();

        // Misaligned or out-of-range offsets are rejected.
        assert!(d.block_finished(0, 0, 7).is_none());
        assert!(d.block_finished(0, 0, BLOCK_LEN).is_none());
    }

    #[test]
    fn disconnect_releases_blocks() {
        let mut d = Delegator::new(false);
        let bits = full_bitfield(4);

        let mut first = true;
        let t = d
            .delegate(0, &bits, false, None, |_| {
                if first {
                    first = false;
                    Some((0, BLOCK_LEN))
                } else {
                    None
                }
            })
            .unwrap();

        assert_eq!(d.cancel_peer(0), 1);
        assert!(d.requests_of(0).is_empty());

        // The block is immediately delegatable to someone else.
        let t2 = d.delegate(1, &bits, false, None, no_new_piece).unwrap();
        assert_eq!((t2.piece, t2.begin), (t.piece, t.begin));
    }

    #[test]
    fn retry_after_hash_failure() {
        let mut d = Delegator::new(false);
        let bits = full_bitfield(4);

        let mut first = true;
        let t = d
            .delegate(0, &bits, false, None, |_| {
                if first {
                    first = false;
                    Some((0, BLOCK_LEN))
                } else {
                    None
                }
            })
            .unwrap();
        let outcome = d.block_finished(0, t.piece, t.begin).unwrap();
        assert!(outcome.piece_complete);

        d.clear_for_retry(0);
        assert!(!d.list(0).unwrap().is_complete());

        // Redelegated from scratch.
        let t2 = d.delegate(1, &bits, false, None, no_new_piece).unwrap();
        assert_eq!(t2.begin, 0);
    }
}
