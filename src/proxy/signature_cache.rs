use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

// Signatures shorter than this are sentinels from the upstream validator and
// carry no restorable value.
pub const MIN_SIGNATURE_LENGTH: usize = 50;

const TOOL_CACHE_CAP: usize = 512;
const THINKING_CACHE_CAP: usize = 512;
const FAMILY_CACHE_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Gemini,
}

impl ModelFamily {
    pub fn of_model(model: &str) -> Self {
        if crate::constants::is_claude_model(model) {
            ModelFamily::Claude
        } else {
            ModelFamily::Gemini
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelFamily::Claude => "claude",
            ModelFamily::Gemini => "gemini",
        }
    }
}

#[derive(Clone)]
struct Entry {
    signature: String,
    family: ModelFamily,
    seq: u64,
}

// HashMap with LRU eviction keyed by an access sequence. Eviction walks the
// map, which is fine at these cap sizes.
struct BoundedMap {
    entries: HashMap<String, Entry>,
    cap: usize,
    seq: u64,
}

impl BoundedMap {
    fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            cap,
            seq: 0,
        }
    }

    fn insert(&mut self, key: String, signature: String, family: ModelFamily) {
        self.seq += 1;
        self.entries.insert(
            key,
            Entry {
                signature,
                family,
                seq: self.seq,
            },
        );
        if self.entries.len() > self.cap {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
    }

    fn get(&mut self, key: &str) -> Option<(String, ModelFamily)> {
        self.seq += 1;
        let seq = self.seq;
        self.entries.get_mut(key).map(|entry| {
            entry.seq = seq;
            (entry.signature.clone(), entry.family)
        })
    }
}

// Process-lifetime memory of which signature belonged to which tool_use id or
// thinking block, and which model family minted it. Intermediate clients
// routinely strip signatures; this is how they come back.
pub struct SignatureCache {
    tool_signatures: Mutex<BoundedMap>,
    thinking_signatures: Mutex<BoundedMap>,
    families: Mutex<BoundedMap>,
}

impl SignatureCache {
    fn new() -> Self {
        Self {
            tool_signatures: Mutex::new(BoundedMap::new(TOOL_CACHE_CAP)),
            thinking_signatures: Mutex::new(BoundedMap::new(THINKING_CACHE_CAP)),
            families: Mutex::new(BoundedMap::new(FAMILY_CACHE_CAP)),
        }
    }

    pub fn global() -> &'static SignatureCache {
        static INSTANCE: OnceLock<SignatureCache> = OnceLock::new();
        INSTANCE.get_or_init(SignatureCache::new)
    }

    pub fn record_tool_signature(&self, tool_use_id: &str, signature: &str, family: ModelFamily) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        if let Ok(mut cache) = self.tool_signatures.lock() {
            cache.insert(tool_use_id.to_string(), signature.to_string(), family);
        }
        self.record_family(signature, family);
    }

    pub fn record_thinking_signature(&self, thinking: &str, signature: &str, family: ModelFamily) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        if let Ok(mut cache) = self.thinking_signatures.lock() {
            cache.insert(thinking_hash(thinking), signature.to_string(), family);
        }
        self.record_family(signature, family);
    }

    fn record_family(&self, signature: &str, family: ModelFamily) {
        if let Ok(mut cache) = self.families.lock() {
            cache.insert(signature.to_string(), String::new(), family);
        }
    }

    pub fn tool_signature(&self, tool_use_id: &str) -> Option<(String, ModelFamily)> {
        self.tool_signatures.lock().ok()?.get(tool_use_id)
    }

    // Restores the signature for a thinking block that arrived back unsigned.
    pub fn restore_thinking_signature(&self, thinking: &str) -> Option<(String, ModelFamily)> {
        self.thinking_signatures
            .lock()
            .ok()?
            .get(&thinking_hash(thinking))
    }

    pub fn family_of(&self, signature: &str) -> Option<ModelFamily> {
        self.families
            .lock()
            .ok()?
            .get(signature)
            .map(|(_, family)| family)
    }

    #[cfg(test)]
    pub fn fresh() -> Self {
        Self::new()
    }
}

fn thinking_hash(thinking: &str) -> String {
    let digest = Sha256::digest(thinking.as_bytes());
    format!("{:x}", digest)
}
