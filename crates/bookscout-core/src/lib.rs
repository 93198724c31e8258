use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Request(String),
}

/// Sentinel assigned to already-recommended rows so they sort below every
/// attainable cosine score without being removed from the ranking.
pub const HISTORY_SENTINEL_SCORE: f32 = -1.0;

/// Minimum token-set ratio a title must reach to count as a fuzzy candidate.
pub const FUZZY_SCORE_FLOOR: u32 = 80;

/// Fuzzy candidates generated before history exclusion, per requested slot.
const FUZZY_CANDIDATE_HEADROOM: usize = 3;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "it", "in", "on", "of", "to", "and", "or", "for", "with", "this",
    "that", "be", "are", "was", "were", "been", "being", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "can", "shall", "not", "no",
    "but", "if", "at", "by", "from", "as", "into", "about", "up", "out", "so", "its", "you",
    "your", "i", "my", "we", "our", "they", "them", "their", "he", "she", "his", "her",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Content,
    Query,
    Fuzzy,
}

impl Strategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Query => "query",
            Self::Fuzzy => "fuzzy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "content" => Some(Self::Content),
            "query" => Some(Self::Query),
            "fuzzy" => Some(Self::Fuzzy),
            _ => None,
        }
    }
}

/// One catalog entry. Text fields default to empty when absent upstream;
/// an item is never rejected for missing text.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub topic: String,
}

impl Item {
    /// The document fed to the vectorizer: title, author, topic.
    #[must_use]
    pub fn document(&self) -> String {
        format!("{} {} {}", self.title, self.author, self.topic)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecommendRequest {
    pub strategy: Strategy,
    pub query: Option<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedItem {
    pub rank: usize,
    pub item_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub requested_strategy: Strategy,
    pub effective_strategy: Strategy,
    pub fell_back: bool,
    pub selected: Vec<RankedItem>,
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FuzzyMatch {
    pub index: usize,
    pub ratio: u32,
}

fn usize_to_f32(value: usize) -> f32 {
    f32::from(u16::try_from(value).unwrap_or(u16::MAX))
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| term.len() > 1)
        .filter(|term| !STOP_WORDS.contains(term))
        .map(str::to_string)
        .collect()
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Cosine of the angle between two vectors; 0.0 whenever either is zero.
#[must_use]
pub fn cosine_similarity(lhs: &[f32], rhs: &[f32]) -> f32 {
    let mut dot = 0.0_f32;
    let mut lhs_norm = 0.0_f32;
    let mut rhs_norm = 0.0_f32;
    for (left, right) in lhs.iter().zip(rhs) {
        dot += left * right;
        lhs_norm += left * left;
        rhs_norm += right * right;
    }

    if lhs_norm == 0.0 || rhs_norm == 0.0 {
        return 0.0;
    }

    dot / (lhs_norm.sqrt() * rhs_norm.sqrt())
}

/// TF-IDF weighting over one corpus snapshot.
///
/// Built fresh for every scoring request: the vocabulary is derived from the
/// corpus handed in and carries no state across calls. Rows are
/// L2-normalized; a document with no surviving terms keeps an all-zero row.
#[derive(Debug, Clone)]
pub struct CorpusVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f32>,
    rows: Vec<Vec<f32>>,
}

impl CorpusVectorizer {
    #[must_use]
    pub fn fit(corpus: &[Item]) -> Self {
        let tokenized: Vec<Vec<String>> =
            corpus.iter().map(|item| tokenize(&item.document())).collect();

        let mut vocabulary: HashMap<String, usize> = HashMap::new();
        let mut document_frequency: Vec<usize> = Vec::new();
        for tokens in &tokenized {
            // BTreeSet keeps column assignment deterministic for a given corpus order.
            let unique: BTreeSet<&str> = tokens.iter().map(String::as_str).collect();
            for term in unique {
                if let Some(&column) = vocabulary.get(term) {
                    document_frequency[column] += 1;
                } else {
                    vocabulary.insert(term.to_string(), vocabulary.len());
                    document_frequency.push(1);
                }
            }
        }

        let corpus_size = usize_to_f32(corpus.len());
        let idf: Vec<f32> = document_frequency
            .iter()
            .map(|&df| ((1.0 + corpus_size) / (1.0 + usize_to_f32(df))).ln() + 1.0)
            .collect();

        let rows: Vec<Vec<f32>> = tokenized
            .iter()
            .map(|tokens| {
                let mut row = vec![0.0_f32; idf.len()];
                for term in tokens {
                    if let Some(&column) = vocabulary.get(term) {
                        row[column] += idf[column];
                    }
                }
                normalize(&mut row);
                row
            })
            .collect();

        Self { vocabulary, idf, rows }
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    #[must_use]
    pub fn vocabulary_size(&self) -> usize {
        self.idf.len()
    }

    /// Project free text into this corpus's vocabulary space. Terms outside
    /// the vocabulary contribute zero weight.
    #[must_use]
    pub fn project(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.idf.len()];
        for term in tokenize(text) {
            if let Some(&column) = self.vocabulary.get(&term) {
                vector[column] += self.idf[column];
            }
        }
        normalize(&mut vector);
        vector
    }

    /// Element-wise mean of the given rows. An empty row set yields a zero
    /// target, which scores 0.0 against everything.
    #[must_use]
    pub fn mean_of_rows(&self, rows: &[usize]) -> Vec<f32> {
        let mut target = vec![0.0_f32; self.idf.len()];
        if rows.is_empty() {
            return target;
        }

        for &row in rows {
            if let Some(values) = self.rows.get(row) {
                for (slot, value) in target.iter_mut().zip(values) {
                    *slot += value;
                }
            }
        }

        let count = usize_to_f32(rows.len());
        for slot in &mut target {
            *slot /= count;
        }
        target
    }
}

fn sorted_ranking(mut scored: Vec<ScoredItem>) -> Vec<ScoredItem> {
    // Stable sort: equal scores keep corpus order.
    scored.sort_by(|lhs, rhs| rhs.score.partial_cmp(&lhs.score).unwrap_or(Ordering::Equal));
    scored
}

fn score_against_target(
    vectorizer: &CorpusVectorizer,
    target: &[f32],
    excluded: &HashSet<usize>,
) -> Vec<ScoredItem> {
    let scored = vectorizer
        .rows()
        .iter()
        .enumerate()
        .map(|(index, row)| ScoredItem {
            index,
            score: if excluded.contains(&index) {
                HISTORY_SENTINEL_SCORE
            } else {
                cosine_similarity(row, target)
            },
        })
        .collect();
    sorted_ranking(scored)
}

/// Rank every row by cosine similarity to the mean vector of `profile_rows`.
/// Excluded rows are pinned to the sentinel score, not removed, so the
/// ranking still names every item.
#[must_use]
pub fn rank_against_profile(
    vectorizer: &CorpusVectorizer,
    profile_rows: &[usize],
    excluded: &HashSet<usize>,
) -> Vec<ScoredItem> {
    let target = vectorizer.mean_of_rows(profile_rows);
    score_against_target(vectorizer, &target, excluded)
}

/// Rank every row by cosine similarity to the projected query text.
#[must_use]
pub fn rank_against_query(
    vectorizer: &CorpusVectorizer,
    query: &str,
    excluded: &HashSet<usize>,
) -> Vec<ScoredItem> {
    let target = vectorizer.project(query);
    score_against_target(vectorizer, &target, excluded)
}

/// Rank every row by its own squared L2 norm. Deterministic default when
/// there is no history and no query to rank against.
#[must_use]
pub fn rank_by_self_weight(
    vectorizer: &CorpusVectorizer,
    excluded: &HashSet<usize>,
) -> Vec<ScoredItem> {
    let scored = vectorizer
        .rows()
        .iter()
        .enumerate()
        .map(|(index, row)| ScoredItem {
            index,
            score: if excluded.contains(&index) {
                HISTORY_SENTINEL_SCORE
            } else {
                row.iter().map(|value| value * value).sum()
            },
        })
        .collect();
    sorted_ranking(scored)
}

fn fuzzy_tokens(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// Word-set overlap ratio in [0, 100]: shared tokens over the union of both
/// token sets, irrespective of order. Either side empty compares to 0.
#[must_use]
pub fn token_set_ratio(lhs: &str, rhs: &str) -> u32 {
    let left = fuzzy_tokens(lhs);
    let right = fuzzy_tokens(rhs);
    if left.is_empty() || right.is_empty() {
        return 0;
    }

    let mut i = 0_usize;
    let mut j = 0_usize;
    let mut shared = 0_usize;
    while i < left.len() && j < right.len() {
        match left[i].cmp(&right[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                shared += 1;
                i += 1;
                j += 1;
            }
        }
    }

    let union = left.len() + right.len() - shared;
    let ratio = (shared * 100 + union / 2) / union;
    u32::try_from(ratio).unwrap_or(100)
}

/// Score every item's title against the query, descending, ties by corpus
/// order. No floor is applied here; callers filter.
#[must_use]
pub fn rank_titles(corpus: &[Item], query: &str) -> Vec<FuzzyMatch> {
    let mut matches: Vec<FuzzyMatch> = corpus
        .iter()
        .enumerate()
        .map(|(index, item)| FuzzyMatch { index, ratio: token_set_ratio(query, &item.title) })
        .collect();
    matches.sort_by(|lhs, rhs| rhs.ratio.cmp(&lhs.ratio));
    matches
}

fn select_top(
    corpus: &[Item],
    ranking: Vec<ScoredItem>,
    excluded: &HashSet<usize>,
    count: usize,
) -> Vec<RankedItem> {
    ranking
        .into_iter()
        .filter(|scored| !excluded.contains(&scored.index))
        .take(count)
        .enumerate()
        .map(|(position, scored)| RankedItem {
            rank: position + 1,
            item_id: corpus[scored.index].id.clone(),
            score: scored.score,
        })
        .collect()
}

fn run_content(
    corpus: &[Item],
    excluded: &HashSet<usize>,
    count: usize,
    trace: &mut Vec<String>,
) -> Vec<RankedItem> {
    let vectorizer = CorpusVectorizer::fit(corpus);
    let profile_rows: Vec<usize> = (0..corpus.len()).filter(|row| excluded.contains(row)).collect();

    let ranking = if profile_rows.is_empty() {
        trace.push("no recommendation history; ranking by document self-weight".to_string());
        rank_by_self_weight(&vectorizer, excluded)
    } else {
        trace.push(format!(
            "profile averaged from {} previously recommended items",
            profile_rows.len()
        ));
        rank_against_profile(&vectorizer, &profile_rows, excluded)
    };

    select_top(corpus, ranking, excluded, count)
}

fn run_query(
    corpus: &[Item],
    query: &str,
    excluded: &HashSet<usize>,
    count: usize,
    trace: &mut Vec<String>,
) -> Vec<RankedItem> {
    let vectorizer = CorpusVectorizer::fit(corpus);
    trace.push(format!("ranking by cosine similarity to query \"{query}\""));
    let ranking = rank_against_query(&vectorizer, query, excluded);
    select_top(corpus, ranking, excluded, count)
}

fn select_fuzzy(
    corpus: &[Item],
    query: &str,
    excluded: &HashSet<usize>,
    count: usize,
    trace: &mut Vec<String>,
) -> Vec<RankedItem> {
    let candidates: Vec<FuzzyMatch> = rank_titles(corpus, query)
        .into_iter()
        .filter(|candidate| candidate.ratio >= FUZZY_SCORE_FLOOR)
        .take(count.saturating_mul(FUZZY_CANDIDATE_HEADROOM))
        .collect();
    trace.push(format!(
        "{} fuzzy title candidates at or above floor {FUZZY_SCORE_FLOOR}",
        candidates.len()
    ));

    candidates
        .into_iter()
        .filter(|candidate| !excluded.contains(&candidate.index))
        .take(count)
        .enumerate()
        .map(|(position, candidate)| RankedItem {
            rank: position + 1,
            item_id: corpus[candidate.index].id.clone(),
            score: f32::from(u16::try_from(candidate.ratio).unwrap_or(u16::MAX)),
        })
        .collect()
}

/// Recommend up to `request.count` items from `corpus`, never repeating an
/// ID in `history`.
///
/// Strategy selection:
/// - `content` ranks against a profile averaged from already-recommended
///   items, or by document self-weight when the history is empty.
/// - `query` ranks against the supplied text, degrading to `content` when
///   no text is supplied.
/// - `fuzzy` matches titles by token-set ratio with a precision floor, and
///   falls back to `query` ranking over the same text when nothing clears
///   the floor after history exclusion. The fallback is recorded in the
///   outcome trace and logged.
///
/// An empty corpus yields an empty recommendation, not an error.
///
/// # Errors
/// Returns [`EngineError::Request`] when `request.count` is zero.
pub fn recommend(
    corpus: &[Item],
    history: &BTreeSet<String>,
    request: &RecommendRequest,
) -> Result<Recommendation, EngineError> {
    if request.count == 0 {
        return Err(EngineError::Request("count MUST be >= 1".to_string()));
    }

    let mut trace = vec![format!("strategy: {}", request.strategy.as_str())];

    if corpus.is_empty() {
        trace.push("corpus is empty; nothing to rank".to_string());
        return Ok(Recommendation {
            requested_strategy: request.strategy,
            effective_strategy: request.strategy,
            fell_back: false,
            selected: Vec::new(),
            trace,
        });
    }

    let index_by_id: HashMap<&str, usize> =
        corpus.iter().enumerate().map(|(index, item)| (item.id.as_str(), index)).collect();
    let excluded: HashSet<usize> =
        history.iter().filter_map(|id| index_by_id.get(id.as_str()).copied()).collect();
    trace.push(format!(
        "excluding {} of {} catalog items already recommended",
        excluded.len(),
        corpus.len()
    ));

    let query_text = request.query.as_deref().map(str::trim).filter(|text| !text.is_empty());
    tracing::debug!(
        strategy = request.strategy.as_str(),
        count = request.count,
        corpus = corpus.len(),
        excluded = excluded.len(),
        "scoring corpus"
    );

    let (effective_strategy, fell_back, selected) = match request.strategy {
        Strategy::Content => {
            (Strategy::Content, false, run_content(corpus, &excluded, request.count, &mut trace))
        }
        Strategy::Query => match query_text {
            Some(text) => (
                Strategy::Query,
                false,
                run_query(corpus, text, &excluded, request.count, &mut trace),
            ),
            None => {
                trace.push("no query text supplied; degrading to content strategy".to_string());
                (
                    Strategy::Content,
                    false,
                    run_content(corpus, &excluded, request.count, &mut trace),
                )
            }
        },
        Strategy::Fuzzy => {
            let text = request.query.as_deref().unwrap_or("").trim();
            let picked = select_fuzzy(corpus, text, &excluded, request.count, &mut trace);
            if picked.is_empty() {
                tracing::warn!(
                    query = text,
                    floor = FUZZY_SCORE_FLOOR,
                    "no fuzzy candidates cleared the floor; falling back to query ranking"
                );
                trace.push(format!(
                    "no fuzzy candidates survived floor {FUZZY_SCORE_FLOOR} and history exclusion; falling back to query strategy"
                ));
                (
                    Strategy::Query,
                    true,
                    run_query(corpus, text, &excluded, request.count, &mut trace),
                )
            } else {
                (Strategy::Fuzzy, false, picked)
            }
        }
    };

    trace.push(format!("selected {} of {} requested", selected.len(), request.count));

    Ok(Recommendation {
        requested_strategy: request.strategy,
        effective_strategy,
        fell_back,
        selected,
        trace,
    })
}
