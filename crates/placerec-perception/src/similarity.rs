//! Word-histogram similarity.
//!
//! A place is compared by its word histogram (word id -> number of
//! keypoints citing that word). Each bin is weighted by its inverse
//! document frequency so that words seen everywhere contribute little.

use std::collections::BTreeMap;

use placerec_types::WordId;

/// Smoothed inverse document frequency: `ln(1 + population / df)`.
///
/// `df` is clamped to at least 1 so words unknown to the population still
/// get the maximum weight.
pub fn inverse_document_frequency(df: usize, population: usize) -> f32 {
    (1.0 + population as f32 / df.max(1) as f32).ln()
}

/// Cosine similarity between two IDF-weighted word histograms.
///
/// Returns a value in `[0.0, 1.0]`, or `0.0` if either histogram is empty.
pub fn tfidf_cosine(
    a: &BTreeMap<WordId, usize>,
    b: &BTreeMap<WordId, usize>,
    idf: impl Fn(WordId) -> f32,
) -> f32 {
    let weight = |id: WordId, tf: usize| tf as f32 * idf(id);

    let dot: f32 = a
        .iter()
        .filter_map(|(id, &ta)| b.get(id).map(|&tb| weight(*id, ta) * weight(*id, tb)))
        .sum();
    let norm_a: f32 = a.iter().map(|(id, &t)| weight(*id, t).powi(2)).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|(id, &t)| weight(*id, t).powi(2)).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
    }
}
