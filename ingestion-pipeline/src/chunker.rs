use common::{error::AppError, storage::types::job::ChunkingOptions};

/// What ended a chunk, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    /// Blank line between paragraphs.
    Paragraph,
    /// Sentence terminator followed by whitespace and an uppercase start.
    Sentence,
    /// Semicolon, em-dash or ellipsis.
    Pause,
    /// No usable boundary inside the window; cut at `max_words`.
    HardCut,
    /// Input exhausted.
    EndOfText,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    /// Byte offset of the chunk start in the original text, including
    /// the overlap region.
    pub start_offset: usize,
    /// Byte offset one past the chunk end. Doubles as the resume
    /// position for the following chunk.
    pub end_offset: usize,
    pub text: String,
    pub word_count: usize,
    pub boundary_kind: BoundaryKind,
}

#[derive(Debug, Clone, Copy)]
struct WordSpan {
    start: usize,
    end: usize,
}

/// Splits text into chunks at natural boundaries with overlap. Offsets
/// are byte-exact into the original input and the sequence can restart
/// from any previously returned `end_offset`.
#[derive(Debug, Clone)]
pub struct Chunker {
    options: ChunkingOptions,
}

impl Chunker {
    pub fn new(options: ChunkingOptions) -> Result<Self, AppError> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn chunks<'a>(&self, text: &'a str) -> ChunkStream<'a> {
        self.stream(text, 0, 0)
    }

    /// Continues a previous run: `char_position` must be the
    /// `end_offset` of the last committed chunk and `next_index` its
    /// index plus one.
    pub fn resume<'a>(&self, text: &'a str, char_position: usize, next_index: usize) -> ChunkStream<'a> {
        self.stream(text, char_position, next_index)
    }

    fn stream<'a>(&self, text: &'a str, position: usize, next_index: usize) -> ChunkStream<'a> {
        let words = split_words(text);
        let cursor_word = words.partition_point(|w| w.start < position);

        ChunkStream {
            text,
            words,
            options: self.options,
            cursor_word,
            region_start: position,
            index: next_index,
        }
    }
}

pub struct ChunkStream<'a> {
    text: &'a str,
    words: Vec<WordSpan>,
    options: ChunkingOptions,
    /// First word not yet covered by an emitted chunk's non-overlap
    /// region.
    cursor_word: usize,
    /// Byte position the next chunk's non-overlap region starts at.
    region_start: usize,
    index: usize,
}

impl ChunkStream<'_> {
    fn emit(&mut self, first_word: usize, cut_word: usize, boundary_kind: BoundaryKind) -> Chunk {
        let end_offset = match self.words.get(cut_word + 1) {
            Some(next) => next.start,
            None => self.text.len(),
        };
        let start_offset = self
            .words
            .get(first_word)
            .map_or(self.region_start, |w| w.start.min(self.region_start));

        let chunk = Chunk {
            index: self.index,
            start_offset,
            end_offset,
            text: self.text[start_offset..end_offset].to_string(),
            word_count: cut_word + 1 - first_word,
            boundary_kind,
        };

        self.index += 1;
        self.cursor_word = cut_word + 1;
        self.region_start = end_offset;

        chunk
    }

    /// Classifies a cut after `word` against the boundary preference
    /// order. `None` means mid-sentence.
    fn boundary_at(&self, word: usize) -> Option<BoundaryKind> {
        let span = self.words[word];
        let token = &self.text[span.start..span.end];
        let gap = match self.words.get(word + 1) {
            Some(next) => &self.text[span.end..next.start],
            None => return Some(BoundaryKind::EndOfText),
        };

        if gap.contains("\n\n") {
            return Some(BoundaryKind::Paragraph);
        }

        let trimmed = token.trim_end_matches(['"', '\u{2019}', '\'', ')', ']']);
        if trimmed.ends_with(['.', '!', '?']) {
            let next = self.words[word + 1];
            let next_starts_upper = self.text[next.start..next.end]
                .chars()
                .next()
                .is_some_and(char::is_uppercase);
            if next_starts_upper || gap.contains('\n') {
                return Some(BoundaryKind::Sentence);
            }
        }

        if token.ends_with(';')
            || token.ends_with('\u{2014}')
            || token.ends_with('\u{2026}')
            || token.ends_with("...")
        {
            return Some(BoundaryKind::Pause);
        }

        None
    }
}

impl Iterator for ChunkStream<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.cursor_word >= self.words.len() {
            return None;
        }

        let ChunkingOptions {
            target_words,
            min_words,
            max_words,
            overlap_words,
        } = self.options;

        // Rewind by the overlap, never past the input start.
        let first_word = if self.index == 0 {
            self.cursor_word
        } else {
            self.cursor_word.saturating_sub(overlap_words)
        };
        let remaining = self.words.len() - first_word;

        // The tail fits in one chunk; it may undershoot min_words.
        if remaining <= max_words {
            return Some(self.emit(first_word, self.words.len() - 1, BoundaryKind::EndOfText));
        }

        // Word indexes are 0-based offsets from first_word below; a cut
        // "at" index w keeps w+1-first_word words.
        let target_cut = first_word + target_words - 1;
        let window = max_words - target_words;
        let lowest_cut = target_cut
            .saturating_sub(window)
            .max(first_word + min_words - 1);
        let highest_cut = (target_cut + window).min(first_word + max_words - 1);

        let mut best: Option<(BoundaryKind, usize)> = None;
        for cut in lowest_cut..=highest_cut {
            let Some(kind) = self.boundary_at(cut) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((best_kind, best_cut)) => {
                    let rank = boundary_rank(kind);
                    let best_rank = boundary_rank(best_kind);
                    rank < best_rank
                        || (rank == best_rank
                            && cut.abs_diff(target_cut) < best_cut.abs_diff(target_cut))
                }
            };
            if better {
                best = Some((kind, cut));
            }
        }

        let (kind, cut) = best.unwrap_or((BoundaryKind::HardCut, first_word + max_words - 1));
        Some(self.emit(first_word, cut, kind))
    }
}

fn boundary_rank(kind: BoundaryKind) -> u8 {
    match kind {
        BoundaryKind::Paragraph => 0,
        BoundaryKind::Sentence | BoundaryKind::EndOfText => 1,
        BoundaryKind::Pause => 2,
        BoundaryKind::HardCut => 3,
    }
}

fn split_words(text: &str) -> Vec<WordSpan> {
    let mut words = Vec::new();
    let mut start: Option<usize> = None;

    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                words.push(WordSpan { start: s, end: idx });
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        words.push(WordSpan {
            start: s,
            end: text.len(),
        });
    }

    words
}
