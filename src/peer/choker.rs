use std::time::Duration;

use crate::delegator::PeerKey;

/// Regular unchoke rotation cadence.
pub const ROTATE_EVERY: Duration = Duration::from_secs(10);

/// One optimistic slot turns over every third rotation.
pub const OPTIMISTIC_ROUNDS: u64 = 3;

/// Per-peer facts the choke policy consumes. Pure data in, pure decision
/// out; the torrent loop applies the diff.
#[derive(Debug, Clone, Copy)]
pub struct ChokeInput {
    pub key: PeerKey,
    pub interested: bool,
    pub snubbed: bool,
    /// Bytes/s they send us; the reciprocation signal while leeching.
    pub download_rate: u64,
    /// Bytes/s we send them; the signal while seeding.
    pub upload_rate: u64,
}

/// Pick the set of peers to unchoke.
///
/// The best `slots - 1` interested, unsnubbed peers by transfer rate hold
/// regular slots; one optimistic slot rotates through the rest by round
/// counter so new peers get a chance to prove themselves.
pub fn pick_unchoked(
    peers: &[ChokeInput],
    slots: usize,
    seeding: bool,
    round: u64,
) -> Vec<PeerKey> {
    if slots == 0 {
        return Vec::new();
    }

    let mut ranked: Vec<&ChokeInput> = peers
        .iter()
        .filter(|p| p.interested && !p.snubbed)
        .collect();

    ranked.sort_by_key(|p| {
        std::cmp::Reverse(if seeding {
            p.upload_rate
        } else {
            p.download_rate
        })
    });

    let regular = slots.saturating_sub(1);
    let mut out: Vec<PeerKey> = ranked.iter().take(regular).map(|p| p.key).collect();

    // Optimistic slot: rotate over interested peers not already chosen.
    let mut rest: Vec<PeerKey> = peers
        .iter()
        .filter(|p| p.interested && !out.contains(&p.key))
        .map(|p| p.key)
        .collect();
    rest.sort_unstable();

    if !rest.is_empty() {
        let pick = (round / OPTIMISTIC_ROUNDS) as usize % rest.len();
        out.push(rest[pick]);
    } else if let Some(next) = ranked.get(regular) {
        out.push(next.key);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(key: PeerKey, interested: bool, down: u64) -> ChokeInput {
        ChokeInput {
            key,
            interested,
            snubbed: false,
            download_rate: down,
            upload_rate: 0,
        }
    }

    #[test]
    fn fastest_downloaders_win_slots() {
        let peers = [
            peer(0, true, 100),
            peer(1, true, 900),
            peer(2, true, 500),
            peer(3, false, 9999),
            peer(4, true, 700),
        ];

        let picked = pick_unchoked(&peers, 4, false, 0);
        // Three regular slots by rate; the fourth is optimistic.
        assert!(picked.contains(&1));
        assert!(picked.contains(&4));
        assert!(picked.contains(&2));
        assert!(!picked.contains(&3), "uninterested peers never hold a slot");
        assert_eq!(picked.len(), 4);
    }

    #[test]
    fn optimistic_slot_rotates() {
        let peers: Vec<ChokeInput> = (0..6).map(|i| peer(i, true, 0)).collect();

        let first = *pick_unchoked(&peers, 1, false, 0).last().unwrap();
        let second = *pick_unchoked(&peers, 1, false, OPTIMISTIC_ROUNDS).last().unwrap();
        let third = *pick_unchoked(&peers, 1, false, 2 * OPTIMISTIC_ROUNDS)
            .last()
            .unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);

        // Stable within a rotation period.
        let again = *pick_unchoked(&peers, 1, false, 1).last().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn snubbed_peers_lose_regular_slots() {
        let mut peers = vec![peer(0, true, 1000), peer(1, true, 10)];
        peers[0].snubbed = true;

        let picked = pick_unchoked(&peers, 2, false, 0);
        assert_eq!(picked[0], 1);
    }

    #[test]
    fn seeding_ranks_by_upload() {
        let mut a = peer(0, true, 0);
        a.upload_rate = 10;
        let mut b = peer(1, true, 0);
        b.upload_rate = 1000;

        let picked = pick_unchoked(&[a, b], 2, true, 0);
        assert_eq!(picked[0], 1);
    }

    #[test]
    fn empty_input() {
        assert!(pick_unchoked(&[], 4, false, 0).is_empty());
        assert!(pick_unchoked(&[peer(0, true, 1)], 0, false, 0).is_empty());
    }
}
