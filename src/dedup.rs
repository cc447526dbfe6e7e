//! In-flight AI request deduplication.
//!
//! The widget transport can deliver the same visitor message twice in quick
//! succession (reconnects, double emits). Each AI request registers a coarse
//! key here before doing any work; a second request with the same key within
//! the same time bucket is skipped entirely.

const MAX_ENTRIES: usize = 50;
const KEEP_ON_PRUNE: usize = 25;
const KEY_TEXT_PREFIX: usize = 50;
const TIME_BUCKET_SECS: u64 = 10;

/// Bounded registry of AI requests currently being processed.
///
/// Insertion-ordered; when the registry grows past [`MAX_ENTRIES`] the oldest
/// keys are dropped so only the [`KEEP_ON_PRUNE`] most recent remain. This is
/// a best-effort guard, not a mutual-exclusion primitive.
#[derive(Default)]
pub struct InflightRegistry {
    keys: Vec<String>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the dedup key for one inbound visitor message.
    pub fn key(website_id: &str, visitor_id: &str, message: &str, now_secs: u64) -> String {
        let prefix: String = message.chars().take(KEY_TEXT_PREFIX).collect();
        format!(
            "{website_id}:{visitor_id}:{prefix}:{}",
            now_secs / TIME_BUCKET_SECS
        )
    }

    /// Registers `key` as in flight. Returns false if an identical request is
    /// already being processed.
    pub fn begin(&mut self, key: &str) -> bool {
        if self.keys.iter().any(|k| k == key) {
            return false;
        }
        self.keys.push(key.to_string());
        if self.keys.len() > MAX_ENTRIES {
            let cut = self.keys.len() - KEEP_ON_PRUNE;
            self.keys.drain(..cut);
        }
        true
    }

    pub fn finish(&mut self, key: &str) {
        self.keys.retain(|k| k != key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
