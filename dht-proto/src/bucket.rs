use std::time::Instant;

use crate::contact::{Contact, Liveness};

/// One routing-table bucket: up to `MAX_LEN` live nodes plus a replacement
/// cache of the same size.
#[derive(Debug, Default, Clone)]
pub struct Bucket {
    pub live: Vec<Contact>,
    pub extra: Vec<Contact>,
}

impl Bucket {
    /// The `K` constant of the Kademlia paper.
    pub const MAX_LEN: usize = 8;

    pub const fn new() -> Self {
        Self {
            live: Vec::new(),
            extra: Vec::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.live.len() >= Self::MAX_LEN && self.extra.len() >= Self::MAX_LEN
    }

    /// Collect live contacts worth handing out: good and questionable,
    /// never bad.
    pub fn get_contacts<'a>(&'a self, out: &mut Vec<&'a Contact>, now: Instant) {
        self.live
            .iter()
            .filter(|c| c.liveness(now) != Liveness::Bad)
            .for_each(|c| out.push(c));
    }

    /// The questionable node silent the longest, live list and
    /// replacement cache both; the maintenance ping target.
    pub fn questionable_head(&self, now: Instant) -> Option<&Contact> {
        self.live
            .iter()
            .chain(self.extra.iter())
            .filter(|c| c.liveness(now) == Liveness::Questionable)
            .min_by_key(|c| c.last_replied())
    }

    /// Replace the most stale contact (highest fail count, at least one
    /// failure) with the given one.
    pub fn replace_node(&mut self, contact: &Contact) -> bool {
        debug_assert!(self.live.len() >= Bucket::MAX_LEN);

        replace_stale(&mut self.live, contact) || replace_stale(&mut self.extra, contact)
    }
}

fn replace_stale(vec: &mut [Contact], contact: &Contact) -> bool {
    if let Some(most_stale) = vec.iter_mut().max_by_key(|c| c.fail_count()) {
        if most_stale.fail_count() > 0 {
            *most_stale = contact.clone();
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use std::time::Instant;

    fn contact(b: u8) -> Contact {
        Contact::new(NodeId::all(b), ([b, b, b, b], 100).into())
    }

    #[test]
    fn replace_prefers_most_stale() {
        let mut bucket = Bucket::new();
        for i in 0..8 {
            bucket.live.push(contact(i));
        }
        bucket.live[3].timed_out();
        bucket.live[5].timed_out();
        bucket.live[5].timed_out();

        let fresh = contact(100);
        assert!(bucket.replace_node(&fresh));
        assert_eq!(bucket.live[5].id, fresh.id);
    }

    #[test]
    fn contacts_exclude_bad_nodes() {
        let now = Instant::now();
        let mut bucket = Bucket::new();

        let mut good = contact(1);
        good.set_confirmed(now);
        bucket.live.push(good);

        let mut bad = contact(2);
        for _ in 0..5 {
            bad.timed_out();
        }
        bucket.live.push(bad);

        // Heard about, never verified: questionable but still served.
        bucket.live.push(contact(3));

        let mut out = Vec::new();
        bucket.get_contacts(&mut out, now);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.id != NodeId::all(2)));

        // The maintenance ping goes to the questionable one, not the
        // good one.
        assert_eq!(bucket.questionable_head(now).unwrap().id, NodeId::all(3));
    }

    #[test]
    fn replace_fails_without_stale_nodes() {
        let mut bucket = Bucket::new();
        let now = Instant::now();
        for i in 0..8 {
            let mut c = contact(i);
            c.set_confirmed(now);
            bucket.live.push(c);
        }
        assert!(!bucket.replace_node(&contact(100)));
    }
}
