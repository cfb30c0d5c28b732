/// Resumable session state issued by the remote on READY.
///
/// Survives a resumed reconnect, cleared when the remote says the session can no
/// longer be resumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
    pub resume_url: Option<String>,
}

impl Session {
    /// Record the sequence of a received frame. Frames without a sequence leave
    /// the last value in place.
    pub fn observe(&mut self, sequence: Option<u64>) {
        if let Some(s) = sequence {
            self.sequence = Some(s);
        }
    }

    pub fn establish(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
    }

    pub fn invalidate(&mut self) {
        *self = Self::default();
    }

    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some()
    }
}

/// `(shard_index, shard_count)` sent with Identify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub index: u32,
    pub count: u32,
}

impl ShardDescriptor {
    pub fn new(index: u32, count: u32) -> Self {
        Self { index, count }
    }

    pub fn as_array(self) -> [u32; 2] {
        [self.index, self.count]
    }
}

impl Default for ShardDescriptor {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl std::fmt::Display for ShardDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard {}/{}", self.index, self.count)
    }
}
