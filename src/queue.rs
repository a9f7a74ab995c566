use std::collections::VecDeque;

use crate::models::Track;

/// FIFO of pending tracks for one guild. Mutation goes through the
/// controller only; this type does no locking of its own.
#[derive(Debug, Default)]
pub struct TrackQueue {
    tracks: VecDeque<Track>,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_one(&mut self, track: Track) {
        self.tracks.push_back(track);
    }

    /// Appends all tracks preserving their order. Empty input is a no-op.
    pub fn enqueue_many(&mut self, tracks: Vec<Track>) {
        let mut tracks = VecDeque::from(tracks);
        self.tracks.append(&mut tracks);
    }

    pub fn dequeue_front(&mut self) -> Option<Track> {
        self.tracks.pop_front()
    }

    /// Up to `n` leading titles, for display. Does not mutate.
    pub fn preview(&self, n: usize) -> Vec<Track> {
        self.tracks.iter().take(n).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
