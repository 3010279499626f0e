use std::collections::VecDeque;

/// History of recently evicted tags split into age bands. New victims enter band 0; when a band
/// overflows its oldest tag moves to the next band, and tags falling off the last band are
/// forgotten.
#[derive(Debug, Clone)]
pub struct VictimTagStore {
    bands: Vec<VecDeque<u64>>,
    max_len: usize,
}

impl VictimTagStore {
    pub fn new(history_sets: usize, max_set_length: usize) -> Self {
        Self {
            bands: vec![VecDeque::new(); history_sets.max(1)],
            max_len: max_set_length.max(1),
        }
    }

    pub fn history_sets(&self) -> usize {
        self.bands.len()
    }

    pub fn insert(&mut self, tag: u64) {
        let mut carry = Some(tag);
        for band in self.bands.iter_mut() {
            let Some(tag) = carry.take() else { break };
            band.push_front(tag);
            if band.len() > self.max_len {
                carry = band.pop_back();
            }
        }
    }

    /// Remove `tag` and report the band it was found in.
    pub fn lookup(&mut self, tag: u64) -> Option<usize> {
        for (i, band) in self.bands.iter_mut().enumerate() {
            if let Some(pos) = band.iter().position(|&t| t == tag) {
                band.remove(pos);
                return Some(i);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn victims_age_through_bands() {
        let mut vts = VictimTagStore::new(2, 2);
        for tag in 1..=4 {
            vts.insert(tag);
        }
        // newest two in band 0, older two in band 1
        assert_eq!(Some(0), vts.lookup(4));
        assert_eq!(Some(1), vts.lookup(1));
        assert_eq!(2, vts.len());
    }

    #[test]
    fn oldest_tags_fall_off() {
        let mut vts = VictimTagStore::new(1, 2);
        for tag in 1..=3 {
            vts.insert(tag);
        }
        assert_eq!(None, vts.lookup(1));
        assert_eq!(Some(0), vts.lookup(2));
    }

    #[test]
    fn lookup_removes_the_tag() {
        let mut vts = VictimTagStore::new(2, 4);
        vts.insert(9);
        assert_eq!(Some(0), vts.lookup(9));
        assert_eq!(None, vts.lookup(9));
        assert!(vts.is_empty());
    }
}
