use text_splitter::TextSplitter;

/// C4: splits converted Markdown into retrieval chunks. Four strategies are
/// available; a tenant's (or the deployment's) configured `default_strategy`
/// selects between them via [`chunk_splitter_for_strategy`].
pub trait ChunkSplitter: Send + Sync {
    fn split(&self, markdown: &str) -> Vec<String>;
}

/// Builds the configured splitter (spec §4.4: `chunk_size`,
/// `overlap_percent` ∈ [0,90], and, for `recursive-separator`, a caller-
/// supplied ordered `delimiters` list). An empty `delimiters` falls back to
/// [`RecursiveSeparatorChunker::DEFAULT_SEPARATORS`].
pub fn chunk_splitter_for_strategy(
    strategy: &str,
    chunk_size: usize,
    overlap_percent: u32,
    delimiters: &[String],
) -> Box<dyn ChunkSplitter> {
    match strategy {
        "fixed-char" => Box::new(FixedCharChunker { chunk_size, overlap_percent }),
        "recursive-separator" => Box::new(RecursiveSeparatorChunker {
            chunk_size,
            separators: if delimiters.is_empty() {
                RecursiveSeparatorChunker::DEFAULT_SEPARATORS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            } else {
                delimiters.to_vec()
            },
        }),
        "token-aware" => Box::new(TokenAwareChunker { chunk_size_tokens: chunk_size }),
        _ => Box::new(SemanticParagraphChunker::new(chunk_size)),
    }
}

/// Fixed-width character windows with a trailing overlap carried into the
/// next chunk, the simplest strategy and the fallback when content has no
/// exploitable paragraph/token structure.
pub struct FixedCharChunker {
    pub chunk_size: usize,
    pub overlap_percent: u32,
}

impl ChunkSplitter for FixedCharChunker {
    fn split(&self, markdown: &str) -> Vec<String> {
        let chars: Vec<char> = markdown.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }

        let chunk_size = self.chunk_size.max(1);
        let overlap = (chunk_size * self.overlap_percent as usize / 100).min(chunk_size.saturating_sub(1));
        let stride = chunk_size - overlap;

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + chunk_size).min(chars.len());
            let piece: String = chars[start..end].iter().collect();
            if !piece.trim().is_empty() {
                chunks.push(piece);
            }
            if end == chars.len() {
                break;
            }
            start += stride.max(1);
        }
        chunks
    }
}

/// Recursively splits on a priority-ordered list of separators
/// (paragraph break, line break, sentence, word), merging pieces back
/// together up to `chunk_size` characters so chunks stay close to the
/// target size without ever splitting mid-word when avoidable.
pub struct RecursiveSeparatorChunker {
    pub chunk_size: usize,
    pub separators: Vec<String>,
}

impl RecursiveSeparatorChunker {
    pub const DEFAULT_SEPARATORS: [&'static str; 4] = ["\n\n", "\n", ". ", " "];
}

impl ChunkSplitter for RecursiveSeparatorChunker {
    fn split(&self, markdown: &str) -> Vec<String> {
        let pieces = split_recursive(markdown, &self.separators);
        merge_pieces(pieces, self.chunk_size)
    }
}

fn split_recursive(text: &str, separators: &[String]) -> Vec<String> {
    let Some((separator, rest)) = separators.split_first() else {
        return vec![text.to_string()];
    };

    if text.len() <= 1 {
        return vec![text.to_string()];
    }

    text.split(separator.as_str())
        .filter(|piece| !piece.is_empty())
        .flat_map(|piece| {
            if rest.is_empty() {
                vec![piece.to_string()]
            } else {
                split_recursive(piece, rest)
            }
        })
        .collect()
}

fn merge_pieces(pieces: Vec<String>, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if !current.is_empty() && current.chars().count() + piece.chars().count() > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(piece.trim());
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Token-aware chunking via `cl100k_base` byte-pair encoding, so chunk size
/// tracks what a downstream LLM actually counts against its context window
/// rather than raw character count.
pub struct TokenAwareChunker {
    pub chunk_size_tokens: usize,
}

impl ChunkSplitter for TokenAwareChunker {
    fn split(&self, markdown: &str) -> Vec<String> {
        let Ok(bpe) = tiktoken_rs::cl100k_base() else {
            return RecursiveSeparatorChunker { chunk_size: self.chunk_size_tokens * 4 }.split(markdown);
        };

        let tokens = bpe.encode_with_special_tokens(markdown);
        if tokens.is_empty() {
            return Vec::new();
        }

        let chunk_size = self.chunk_size_tokens.max(1);
        tokens
            .chunks(chunk_size)
            .filter_map(|window| bpe.decode(window.to_vec()).ok())
            .filter(|text| !text.trim().is_empty())
            .collect()
    }
}

/// Semantic-paragraph chunking: splits on paragraph/sentence boundaries
/// while staying under a character budget, the default strategy for prose
/// documents.
pub struct SemanticParagraphChunker {
    splitter: TextSplitter<text_splitter::Characters>,
    chunk_size: usize,
}

impl SemanticParagraphChunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            splitter: TextSplitter::default().with_trim_chunks(true),
            chunk_size: chunk_size.max(1),
        }
    }
}

impl ChunkSplitter for SemanticParagraphChunker {
    fn split(&self, markdown: &str) -> Vec<String> {
        self.splitter
            .chunks(markdown, self.chunk_size)
            .map(|chunk| chunk.to_string())
            .collect()
    }
}
