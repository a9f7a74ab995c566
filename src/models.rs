pub const UNKNOWN_TRACK_TITLE: &str = "UNKNOWN TRACK";

/// One playable item: a resolvable URL plus the title shown to users.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub url: String,
    pub title: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Paused,
}

/// What a user query resolved to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolved {
    One(Track),
    Playlist { title: String, tracks: Vec<Track> },
}
