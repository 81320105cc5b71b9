use crate::models::anthropic::{MessagesRequest, SystemPrompt};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The upstream backends report no cache metrics, so the split the client
/// sees is estimated: the first request for a conversation "creates" the
/// cacheable prefix, repeats within the TTL "read" it.
const HOT_TTL: Duration = Duration::from_secs(5 * 60);
const EVICT_TTL: Duration = Duration::from_secs(10 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Cache-token split attached to the final usage record of a stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOutcome {
    pub cache_creation_input_tokens: u32,
    pub cache_read_input_tokens: u32,
}

#[derive(Debug)]
struct CacheEntry {
    cacheable_tokens: u32,
    last_seen: Instant,
    turn_count: u32,
}

/// Process-wide conversation cache state, keyed by model plus session id
/// or first-message fingerprint.
#[derive(Default)]
pub struct ConversationCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide the cache phase for this turn and update the entry.
    pub fn classify(&self, key: &str, cacheable_tokens: u32, now: Instant) -> CacheOutcome {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_seen) < HOT_TTL => {
                // A materially different prefix means the cached content
                // was invalidated; fall back to a create turn.
                let delta = entry.cacheable_tokens.abs_diff(cacheable_tokens);
                let tolerance = (entry.cacheable_tokens / 10).max(50);
                let invalidated = delta > tolerance;

                entry.last_seen = now;
                entry.turn_count += 1;
                if invalidated {
                    debug!(key, delta, "cacheable estimate moved, re-creating");
                    entry.cacheable_tokens = cacheable_tokens;
                    CacheOutcome {
                        cache_creation_input_tokens: cacheable_tokens,
                        cache_read_input_tokens: 0,
                    }
                } else {
                    CacheOutcome {
                        cache_creation_input_tokens: 0,
                        cache_read_input_tokens: entry.cacheable_tokens,
                    }
                }
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        cacheable_tokens,
                        last_seen: now,
                        turn_count: 1,
                    },
                );
                CacheOutcome {
                    cache_creation_input_tokens: cacheable_tokens,
                    cache_read_input_tokens: 0,
                }
            }
        }
    }

    /// Drop entries past the eviction TTL; returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_seen) < EVICT_TTL);
        before - entries.len()
    }

    pub fn turn_count(&self, key: &str) -> Option<u32> {
        self.entries.lock().unwrap().get(key).map(|e| e.turn_count)
    }

    /// Periodic eviction, started once per process.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let removed = cache.sweep(Instant::now());
                if removed > 0 {
                    debug!(removed, "evicted stale conversation cache entries");
                }
            }
        });
    }
}

/// Conversation key: an externally supplied session id when present,
/// otherwise a fingerprint of the first user message.
pub fn conversation_key(request: &MessagesRequest) -> String {
    if let Some(session) = request
        .metadata
        .as_ref()
        .and_then(|m| m.user_id.as_deref())
        .filter(|id| !id.is_empty())
    {
        return format!("{}:{}", request.model, session);
    }

    let first_user = request
        .messages
        .iter()
        .find(|m| m.role == "user")
        .and_then(|m| serde_json::to_string(&m.content).ok())
        .unwrap_or_default();
    let mut truncated = first_user.as_str();
    if truncated.len() > 50 {
        let mut end = 50;
        while !truncated.is_char_boundary(end) {
            end -= 1;
        }
        truncated = &truncated[..end];
    }

    let mut hasher = DefaultHasher::new();
    truncated.hash(&mut hasher);
    format!("{}:{:016x}", request.model, hasher.finish())
}

/// Cacheable prefix estimate: system content plus serialized tool
/// declarations, at 4 chars per token.
pub fn cacheable_tokens(request: &MessagesRequest) -> u32 {
    let system_chars = match &request.system {
        Some(SystemPrompt::Text(text)) => text.len(),
        Some(SystemPrompt::Blocks(blocks)) => blocks.iter().map(|b| b.text.len()).sum(),
        None => 0,
    };
    let tool_chars = request
        .tools
        .as_ref()
        .and_then(|tools| serde_json::to_string(tools).ok())
        .map(|s| s.len())
        .unwrap_or(0);
    ((system_chars + tool_chars) / 4) as u32
}

/// Rough input estimate for the count_tokens endpoint.
pub fn estimate_tokens_from_bytes(len: usize) -> u32 {
    ((len + 3) / 4) as u32
}

/// Snapshot written to the status file the launcher's statusline reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub context_window: u32,
    pub context_left_percent: f64,
    pub updated_at: String,
}

/// Cumulative per-listener token totals, persisted after every turn.
pub struct TokenLedger {
    port: u16,
    state: Mutex<LedgerState>,
}

struct LedgerState {
    input_tokens: u64,
    output_tokens: u64,
    total_cost: f64,
    context_window: u32,
}

impl TokenLedger {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: Mutex::new(LedgerState {
                input_tokens: 0,
                output_tokens: 0,
                total_cost: 0.0,
                context_window: 8192,
            }),
        }
    }

    pub fn status_path(port: u16) -> PathBuf {
        std::env::temp_dir().join(format!("claudish-tokens-{}.json", port))
    }

    pub fn set_context_window(&self, context_window: u32) {
        if context_window > 0 {
            self.state.lock().unwrap().context_window = context_window;
        }
    }

    /// Add one turn's tokens and rewrite the status file. Persistence is
    /// best effort; a write failure only logs.
    pub fn record_turn(&self, input_tokens: u32, output_tokens: u32) {
        let totals = {
            let mut state = self.state.lock().unwrap();
            state.input_tokens += input_tokens as u64;
            state.output_tokens += output_tokens as u64;
            self.snapshot(&state)
        };
        if let Err(err) = self.write_status(&totals) {
            warn!(%err, "failed to write token status file");
        }
    }

    pub fn totals(&self) -> SessionTokenTotals {
        let state = self.state.lock().unwrap();
        self.snapshot(&state)
    }

    fn snapshot(&self, state: &LedgerState) -> SessionTokenTotals {
        let total_tokens = state.input_tokens + state.output_tokens;
        let context_left = if state.context_window > 0 {
            let used = total_tokens.min(state.context_window as u64) as f64;
            ((state.context_window as f64 - used) / state.context_window as f64) * 100.0
        } else {
            0.0
        };
        SessionTokenTotals {
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            total_tokens,
            total_cost: state.total_cost,
            context_window: state.context_window,
            context_left_percent: context_left,
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    fn write_status(&self, totals: &SessionTokenTotals) -> std::io::Result<()> {
        let path = Self::status_path(self.port);
        let content = serde_json::to_vec_pretty(totals)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        atomic_write(&path, &content)
    }

    /// Remove the status file on shutdown.
    pub fn remove_status(&self) {
        let _ = std::fs::remove_file(Self::status_path(self.port));
    }
}

/// Crash-safe replace: write a sibling temp file, then rename over the
/// target.
fn atomic_write(path: &std::path::Path, content: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_file_name(format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::anthropic::{Message, MessageContent, Metadata, Tool};
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn request_with(system: Option<&str>, session: Option<&str>) -> MessagesRequest {
        MessagesRequest {
            model: "m".to_string(),
            max_tokens: 100,
            messages: vec![Message {
                role: "user".to_string(),
                content: MessageContent::Text("hello there".to_string()),
            }],
            system: system.map(|s| SystemPrompt::Text(s.to_string())),
            temperature: None,
            top_p: None,
            stream: Some(true),
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            metadata: session.map(|s| Metadata {
                user_id: Some(s.to_string()),
                extra: StdHashMap::new(),
            }),
            extra: StdHashMap::new(),
        }
    }

    #[test]
    fn first_turn_creates_then_reads() {
        let cache = ConversationCache::new();
        let t0 = Instant::now();

        let first = cache.classify("k", 1000, t0);
        assert_eq!(first.cache_creation_input_tokens, 1000);
        assert_eq!(first.cache_read_input_tokens, 0);

        let second = cache.classify("k", 1000, t0 + Duration::from_secs(30));
        assert_eq!(second.cache_creation_input_tokens, 0);
        assert_eq!(second.cache_read_input_tokens, 1000);
        assert_eq!(cache.turn_count("k"), Some(2));
    }

    #[test]
    fn stale_entry_re_creates() {
        let cache = ConversationCache::new();
        let t0 = Instant::now();
        cache.classify("k", 1000, t0);

        let later = cache.classify("k", 1000, t0 + Duration::from_secs(6 * 60));
        assert_eq!(later.cache_creation_input_tokens, 1000);
        assert_eq!(later.cache_read_input_tokens, 0);
    }

    #[test]
    fn large_estimate_shift_invalidates() {
        let cache = ConversationCache::new();
        let t0 = Instant::now();
        cache.classify("k", 1000, t0);

        let shifted = cache.classify("k", 2000, t0 + Duration::from_secs(10));
        assert_eq!(shifted.cache_creation_input_tokens, 2000);
        assert_eq!(shifted.cache_read_input_tokens, 0);

        // Small drift still reads.
        let drift = cache.classify("k", 2020, t0 + Duration::from_secs(20));
        assert_eq!(drift.cache_read_input_tokens, 2000);
    }

    #[test]
    fn sweep_evicts_only_old_entries() {
        let cache = ConversationCache::new();
        let t0 = Instant::now();
        cache.classify("old", 10, t0);
        cache.classify("fresh", 10, t0 + Duration::from_secs(9 * 60));

        let removed = cache.sweep(t0 + Duration::from_secs(11 * 60));
        assert_eq!(removed, 1);
        assert!(cache.turn_count("old").is_none());
        assert!(cache.turn_count("fresh").is_some());
    }

    #[test]
    fn session_id_beats_fingerprint() {
        let with_session = conversation_key(&request_with(None, Some("session-1")));
        assert_eq!(with_session, "m:session-1");

        let a = conversation_key(&request_with(None, None));
        let b = conversation_key(&request_with(None, None));
        assert_eq!(a, b);
        assert_ne!(a, with_session);
    }

    #[test]
    fn cacheable_counts_system_and_tools() {
        let mut request = request_with(Some("x".repeat(400).as_str()), None);
        assert_eq!(cacheable_tokens(&request), 100);

        request.tools = Some(vec![Tool {
            name: "search".to_string(),
            description: Some("find things".to_string()),
            input_schema: json!({"type": "object"}),
        }]);
        assert!(cacheable_tokens(&request) > 100);
    }

    #[test]
    fn ledger_accumulates_and_persists() {
        let ledger = TokenLedger::new(59123);
        ledger.set_context_window(10_000);
        ledger.record_turn(1000, 500);
        ledger.record_turn(1000, 500);

        let totals = ledger.totals();
        assert_eq!(totals.input_tokens, 2000);
        assert_eq!(totals.output_tokens, 1000);
        assert_eq!(totals.total_tokens, 3000);
        assert_eq!(totals.context_window, 10_000);
        assert!((totals.context_left_percent - 70.0).abs() < 0.01);

        let path = TokenLedger::status_path(59123);
        let on_disk: SessionTokenTotals =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.total_tokens, 3000);
        ledger.remove_status();
        assert!(!path.exists());
    }

    #[test]
    fn byte_estimate_rounds_up() {
        assert_eq!(estimate_tokens_from_bytes(0), 0);
        assert_eq!(estimate_tokens_from_bytes(1), 1);
        assert_eq!(estimate_tokens_from_bytes(8), 2);
        assert_eq!(estimate_tokens_from_bytes(9), 3);
    }
}
