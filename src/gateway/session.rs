//! Session bookkeeping for identify/resume.

/// Sentinel meaning "no sequence seen yet".
pub const NO_SEQUENCE: i64 = -1;

/// What a shard remembers across connections on behalf of one session.
#[derive(Debug, Clone)]
pub struct Session {
    id: Option<String>,
    resume_url: Option<String>,
    sequence: i64,
    /// Sequence snapshot taken when the connection dropped, used for the
    /// heartbeat sent during the resume handshake.
    close_sequence: i64,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: None,
            resume_url: None,
            sequence: NO_SEQUENCE,
            close_sequence: NO_SEQUENCE,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// The sequence to heartbeat with: the live counter once dispatches
    /// flow, otherwise the snapshot from the previous connection.
    pub fn heartbeat_sequence(&self) -> i64 {
        if self.sequence >= 0 {
            self.sequence
        } else {
            self.close_sequence
        }
    }

    /// Record a session start.
    pub fn establish(&mut self, id: String, resume_url: Option<String>) {
        self.id = Some(id);
        self.resume_url = resume_url;
    }

    /// Record the sequence from a dispatch frame. Out-of-order or repeated
    /// sequences never move the counter backwards.
    pub fn record_sequence(&mut self, sequence: i64) {
        if sequence > self.sequence {
            self.sequence = sequence;
        }
    }

    /// Snapshot the sequence as the connection goes down, then clear the
    /// live counter for the next connection.
    pub fn snapshot_on_close(&mut self) {
        if self.sequence >= 0 {
            self.close_sequence = self.sequence;
        }
        self.sequence = NO_SEQUENCE;
    }

    /// Resume credentials, when the session can be resumed.
    pub fn resumable(&self) -> Option<(&str, i64)> {
        match (&self.id, self.sequence.max(self.close_sequence)) {
            (Some(id), seq) if seq >= 0 => Some((id.as_str(), seq)),
            _ => None,
        }
    }

    /// Forget everything; the server rejected resumption.
    pub fn invalidate(&mut self) {
        self.id = None;
        self.resume_url = None;
        self.sequence = NO_SEQUENCE;
        self.close_sequence = NO_SEQUENCE;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_cannot_resume() {
        let session = Session::new();
        assert_eq!(session.resumable(), None);
        assert_eq!(session.heartbeat_sequence(), NO_SEQUENCE);
    }

    #[test]
    fn sequence_never_regresses() {
        let mut session = Session::new();
        session.record_sequence(5);
        session.record_sequence(3);
        assert_eq!(session.sequence(), 5);
        session.record_sequence(6);
        assert_eq!(session.sequence(), 6);
    }

    #[test]
    fn established_session_with_sequence_resumes() {
        let mut session = Session::new();
        session.establish("sess-9".into(), Some("wss://resume.example".into()));
        assert_eq!(session.resumable(), None, "no sequence yet");

        session.record_sequence(12);
        assert_eq!(session.resumable(), Some(("sess-9", 12)));
        assert_eq!(session.resume_url(), Some("wss://resume.example"));
    }

    #[test]
    fn close_snapshot_feeds_handshake_heartbeats() {
        let mut session = Session::new();
        session.establish("sess-1".into(), None);
        session.record_sequence(40);

        session.snapshot_on_close();
        assert_eq!(session.sequence(), NO_SEQUENCE);
        assert_eq!(session.heartbeat_sequence(), 40);
        // Resume still offers the snapshot sequence.
        assert_eq!(session.resumable(), Some(("sess-1", 40)));
    }

    #[test]
    fn invalidate_clears_everything() {
        let mut session = Session::new();
        session.establish("sess-1".into(), Some("wss://x".into()));
        session.record_sequence(7);

        session.invalidate();
        assert_eq!(session.id(), None);
        assert_eq!(session.resume_url(), None);
        assert_eq!(session.resumable(), None);
        assert_eq!(session.sequence(), NO_SEQUENCE);
    }
}
