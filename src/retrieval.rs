//! Recuperación por palabras clave: puntúa documentos contra la pregunta y
//! selecciona los que se inyectan como contexto.
//!
//! El emparejamiento es literal y deliberadamente ingenuo: minúsculas, sin
//! stemming ni sinónimos. La puntuación de cada término es
//! `ocurrencias * longitud`, de modo que los términos largos pesan más.

use std::collections::HashSet;

use tracing::debug;

use crate::models::{Document, ScoredDocument};

/// Número de documentos que devuelve la recuperación por defecto.
pub const DEFAULT_TOP_K: usize = 3;
/// Documentos recientes que se usan como contexto cuando no hay coincidencias.
pub const FALLBACK_DOCS: usize = 5;

/// Símbolos (ASCII y puntuación japonesa) que se sustituyen por espacios.
const STRIPPED_CHARS: &[char] = &[
    '.', ',', '/', '#', '!', '$', '%', '^', '&', '*', ';', ':', '{', '}', '=', '-', '_', '`',
    '~', '(', ')', '？', '。', '、', '！', '「', '」', '【', '】',
];

/// Devuelve los `top_k` documentos con puntuación > 0, ordenados de mayor a
/// menor. A igual puntuación se conserva el orden de entrada.
pub fn find_relevant_docs(query: &str, docs: &[Document], top_k: usize) -> Vec<ScoredDocument> {
    if docs.is_empty() {
        return Vec::new();
    }

    let terms = search_terms(query);
    if terms.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<ScoredDocument> = docs
        .iter()
        .map(|doc| ScoredDocument::from_document(doc, score_content(&doc.content, &terms)))
        .filter(|doc| doc.score > 0)
        .collect();

    // `sort_by` es estable: los empates mantienen el orden original.
    scored.sort_by(|a, b| b.score.cmp(&a.score));
    scored.truncate(top_k);
    scored
}

/// Términos de búsqueda sin duplicados. Incluye la pregunta completa en
/// minúsculas para premiar la coincidencia exacta de la frase.
pub fn search_terms(query: &str) -> HashSet<String> {
    let lowered = query.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if STRIPPED_CHARS.contains(&c) { ' ' } else { c })
        .collect();

    let mut terms: HashSet<String> = cleaned
        .split_whitespace()
        .filter(|t| is_meaningful(t))
        .map(str::to_string)
        .collect();

    if !query.trim().is_empty() {
        terms.insert(lowered);
    }
    terms
}

/// Los términos alfanuméricos ASCII necesitan al menos dos caracteres; el resto
/// (CJK, símbolos no eliminados) cuenta aunque tenga uno solo.
fn is_meaningful(term: &str) -> bool {
    if term.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        term.chars().count() > 1
    } else {
        true
    }
}

fn score_content(content: &str, terms: &HashSet<String>) -> usize {
    let content = content.to_lowercase();
    terms
        .iter()
        .map(|term| content.matches(term.as_str()).count() * term.chars().count())
        .sum()
}

/// Contexto elegido para una pregunta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSelection {
    pub documents: Vec<ScoredDocument>,
    /// `true` si no hubo coincidencias y se usaron los documentos más recientes.
    pub fallback: bool,
}

/// Aplica la recuperación y, si no hay resultados pero sí documentos, usa los
/// `FALLBACK_DOCS` más recientes (orden cronológico inverso, puntuación 0).
pub fn select_context(query: &str, docs: &[Document], top_k: usize) -> ContextSelection {
    let documents = find_relevant_docs(query, docs, top_k);
    if !documents.is_empty() || docs.is_empty() {
        debug!("Recuperación: {} documentos relevantes.", documents.len());
        return ContextSelection {
            documents,
            fallback: false,
        };
    }

    debug!("Sin coincidencias por palabras clave; se usan los documentos más recientes.");
    ContextSelection {
        documents: docs
            .iter()
            .rev()
            .take(FALLBACK_DOCS)
            .map(|doc| ScoredDocument::from_document(doc, 0))
            .collect(),
        fallback: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(items: &[(&str, &str)]) -> Vec<Document> {
        items.iter().map(|(n, c)| Document::new(*n, *c)).collect()
    }

    fn names(results: &[ScoredDocument]) -> Vec<&str> {
        results.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn single_term_scores_occurrences_times_length() {
        let corpus = docs(&[("a", "a cat sat"), ("b", "no match here")]);
        let results = find_relevant_docs("cat", &corpus, 3);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "a");
        assert_eq!(results[0].score, 3);
    }

    #[test]
    fn empty_corpus_returns_nothing() {
        assert!(find_relevant_docs("cat", &[], 3).is_empty());
        let selection = select_context("cat", &[], 3);
        assert!(selection.documents.is_empty());
        assert!(!selection.fallback);
    }

    #[test]
    fn blank_query_returns_nothing() {
        let corpus = docs(&[("a", "  spaces  ")]);
        assert!(find_relevant_docs("", &corpus, 3).is_empty());
        assert!(find_relevant_docs("   \t ", &corpus, 3).is_empty());
    }

    #[test]
    fn punctuation_only_query_keeps_whole_query_term() {
        let terms = search_terms("?!");
        // '!' se elimina, '?' (ASCII) no; el término completo también se añade.
        assert!(terms.contains("?!"));
        assert!(terms.contains("?"));

        let terms = search_terms("...");
        assert_eq!(terms.len(), 1);
        assert!(terms.contains("..."));

        let corpus = docs(&[("a", "wait... what"), ("b", "nothing")]);
        let results = find_relevant_docs("...", &corpus, 3);
        assert_eq!(names(&results), vec!["a"]);
        assert_eq!(results[0].score, 3);
    }

    #[test]
    fn short_ascii_terms_are_dropped_but_cjk_single_chars_kept() {
        let terms = search_terms("a 猫 is cute");
        assert!(!terms.contains("a"));
        assert!(terms.contains("猫"));
        assert!(terms.contains("is"));
        assert!(terms.contains("cute"));
        assert!(terms.contains("a 猫 is cute"));
    }

    #[test]
    fn japanese_punctuation_splits_terms() {
        let terms = search_terms("東京の天気は？「晴れ」");
        assert!(terms.contains("東京の天気は"));
        assert!(terms.contains("晴れ"));
        assert!(terms.contains("東京の天気は？「晴れ」"));
    }

    #[test]
    fn matching_is_case_insensitive_and_literal() {
        let corpus = docs(&[("a", "Rust RUST rust"), ("b", "ru?st")]);
        let results = find_relevant_docs("RUST", &corpus, 3);
        assert_eq!(names(&results), vec!["a"]);
        assert_eq!(results[0].score, 12);

        // Los metacaracteres no actúan como expresión regular.
        let results = find_relevant_docs("ru?st", &corpus, 3);
        assert_eq!(names(&results), vec!["b"]);
        assert_eq!(results[0].score, 5);
    }

    #[test]
    fn longer_terms_weigh_more_than_frequency() {
        let corpus = docs(&[
            ("freq", "go go go go"),
            ("long", "golang"),
        ]);
        let results = find_relevant_docs("go golang", &corpus, 3);
        // freq: "go" 4*2 = 8; long: "go" 1*2 + "golang" 1*6 = 8 -> empate, orden original.
        assert_eq!(names(&results), vec!["freq", "long"]);
        assert_eq!(results[0].score, 8);
        assert_eq!(results[1].score, 8);
    }

    #[test]
    fn whole_query_phrase_adds_bonus() {
        let corpus = docs(&[
            ("split", "machine and learning"),
            ("phrase", "machine learning"),
        ]);
        let results = find_relevant_docs("machine learning", &corpus, 3);
        assert_eq!(names(&results), vec!["phrase", "split"]);
        assert_eq!(results[0].score, 7 + 8 + 16);
        assert_eq!(results[1].score, 7 + 8);
    }

    #[test]
    fn ties_keep_input_order_and_top_k_limits() {
        let corpus = docs(&[
            ("1", "apple"),
            ("2", "apple"),
            ("3", "apple apple"),
            ("4", "apple"),
            ("5", "pear"),
        ]);
        let results = find_relevant_docs("apple", &corpus, 3);
        assert_eq!(names(&results), vec!["3", "1", "2"]);
        assert!(results.iter().all(|d| d.score > 0));

        let all = find_relevant_docs("apple", &corpus, 10);
        assert_eq!(names(&all), vec!["3", "1", "2", "4"]);
    }

    #[test]
    fn fallback_uses_latest_five_newest_first() {
        let corpus = docs(&[
            ("1", "x"),
            ("2", "x"),
            ("3", "x"),
            ("4", "x"),
            ("5", "x"),
            ("6", "x"),
        ]);
        let selection = select_context("unrelated", &corpus, 3);
        assert!(selection.fallback);
        assert_eq!(names(&selection.documents), vec!["6", "5", "4", "3", "2"]);
        assert!(selection.documents.iter().all(|d| d.score == 0));
    }

    #[test]
    fn matches_skip_fallback() {
        let corpus = docs(&[("1", "tokio runtime"), ("2", "other")]);
        let selection = select_context("tokio", &corpus, 3);
        assert!(!selection.fallback);
        assert_eq!(names(&selection.documents), vec!["1"]);
    }
}
