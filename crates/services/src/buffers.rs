//! In-process write buffers flushed to the store by the per-second upkeep.
//!
//! Open post bodies change on every keystroke and spam scores on every
//! request; batching them keeps that traffic off the database.

use dashmap::DashMap;
use domains::PostId;

/// Latest body of each open post that has not reached the store yet.
#[derive(Debug, Default)]
pub struct OpenBodyBuffer {
    bodies: DashMap<PostId, String>,
}

impl OpenBodyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current body of an open post, replacing older edits.
    pub fn set(&self, id: PostId, body: impl Into<String>) {
        self.bodies.insert(id, body.into());
    }

    /// Drops a pending edit, e.g. when the author closes the post.
    pub fn remove(&self, id: PostId) -> Option<String> {
        self.bodies.remove(&id).map(|(_, body)| body)
    }

    /// Takes every pending edit out of the buffer.
    pub fn drain(&self) -> Vec<(PostId, String)> {
        let ids: Vec<PostId> = self.bodies.iter().map(|e| *e.key()).collect();
        let mut drained: Vec<(PostId, String)> =
            ids.into_iter().filter_map(|id| self.bodies.remove(&id)).collect();
        drained.sort_unstable_by_key(|(id, _)| *id);
        drained
    }

    /// Puts back edits whose flush failed, unless a newer edit arrived since.
    pub fn restore(&self, bodies: Vec<(PostId, String)>) {
        for (id, body) in bodies {
            self.bodies.entry(id).or_insert(body);
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

/// Spam score increments per client IP.
#[derive(Debug, Default)]
pub struct SpamScoreBuffer {
    scores: DashMap<String, i64>,
}

impl SpamScoreBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, ip: impl Into<String>, score: i64) {
        *self.scores.entry(ip.into()).or_insert(0) += score;
    }

    pub fn drain(&self) -> Vec<(String, i64)> {
        let ips: Vec<String> = self.scores.iter().map(|e| e.key().clone()).collect();
        ips.into_iter().filter_map(|ip| self.scores.remove(&ip)).collect()
    }

    /// Adds back increments whose flush failed.
    pub fn restore(&self, scores: Vec<(String, i64)>) {
        for (ip, score) in scores {
            self.add(ip, score);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_buffer_keeps_latest_edit() {
        let buf = OpenBodyBuffer::new();
        buf.set(2, "a");
        buf.set(1, "x");
        buf.set(2, "ab");
        assert_eq!(buf.drain(), vec![(1, "x".to_string()), (2, "ab".to_string())]);
        assert!(buf.is_empty());
    }

    #[test]
    fn body_restore_does_not_clobber_newer_edit() {
        let buf = OpenBodyBuffer::new();
        buf.set(1, "old");
        let drained = buf.drain();
        buf.set(1, "new");
        buf.restore(drained);
        assert_eq!(buf.remove(1).as_deref(), Some("new"));
    }

    #[test]
    fn spam_scores_accumulate_and_restore() {
        let buf = SpamScoreBuffer::new();
        buf.add("::1", 5);
        buf.add("::1", 3);
        let drained = buf.drain();
        assert_eq!(drained, vec![("::1".to_string(), 8)]);
        buf.add("::1", 1);
        buf.restore(drained);
        assert_eq!(buf.drain(), vec![("::1".to_string(), 9)]);
    }
}
