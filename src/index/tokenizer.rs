use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use unicode_segmentation::UnicodeSegmentation;

/// Splits a column value into searchable terms. Term position is the index
/// in the returned vector.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;

    fn name(&self) -> &str;
}

/// Unicode word segmentation with case folding.
#[derive(Clone)]
pub struct EnglishTokenizer {
    pub max_token_length: usize,
}

impl Default for EnglishTokenizer {
    fn default() -> Self {
        Self { max_token_length: 255 }
    }
}

impl Tokenizer for EnglishTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .unicode_words()
            .filter(|w| w.len() <= self.max_token_length)
            .map(str::to_string)
            .collect()
    }

    fn name(&self) -> &str {
        "english"
    }
}

/// Whitespace split, case preserved.
#[derive(Clone, Default)]
pub struct RawTokenizer;

impl Tokenizer for RawTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    fn name(&self) -> &str {
        "raw"
    }
}

pub struct TokenizerRegistry {
    tokenizers: RwLock<AHashMap<String, Arc<dyn Tokenizer>>>,
    default: String,
}

impl TokenizerRegistry {
    pub fn new(default: &str) -> Self {
        let mut map: AHashMap<String, Arc<dyn Tokenizer>> = AHashMap::new();
        map.insert("english".into(), Arc::new(EnglishTokenizer::default()));
        map.insert("raw".into(), Arc::new(RawTokenizer));
        Self { tokenizers: RwLock::new(map), default: default.to_string() }
    }

    pub fn register(&self, tokenizer: Arc<dyn Tokenizer>) {
        self.tokenizers.write().insert(tokenizer.name().to_string(), tokenizer);
    }

    /// Empty name picks the configured default.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tokenizer>> {
        let name = if name.is_empty() { self.default.as_str() } else { name };
        self.tokenizers.read().get(name).cloned()
    }
}
