//! ASR segmentation and overlap de-duplication (§4.6 `asr` phase, §8
//! scenario 4). The actual ASR model runtime and audio extraction are
//! external collaborators (§1); this module only implements the pure
//! chunk-boundary and merge math the engine needs around them.

use subtitler_subtitle::Cue;

/// Splits `[0, duration_ms)` into chunks no longer than `threshold_ms`,
/// each overlapping the next by `overlap_ms`, so a single chunk never holds
/// more than `threshold_ms` of audio in memory at once. A duration exactly
/// at the threshold stays a single chunk; one millisecond over starts
/// segmenting (§8 boundary behavior).
pub fn segment_chunks(duration_ms: u64, threshold_ms: u64, overlap_ms: u64) -> Vec<(u64, u64)> {
    if duration_ms <= threshold_ms {
        return vec![(0, duration_ms)];
    }

    let mut chunks = Vec::new();
    let mut start = 0u64;
    let step = threshold_ms.saturating_sub(overlap_ms).max(1);
    loop {
        let end = (start + threshold_ms).min(duration_ms);
        chunks.push((start, end));
        if end >= duration_ms {
            break;
        }
        start += step;
    }
    chunks
}

fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let set_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

const DEDUP_SIMILARITY_THRESHOLD: f64 = 0.7;

/// Merges per-chunk cues (already re-anchored to the chunk's offset in the
/// full timeline) into one sequence, dropping a trailing cue from chunk `k`
/// when its midpoint falls inside the leading `overlap_ms` of chunk `k+1`
/// and the two texts are near-duplicates by Jaccard similarity (§4.6).
pub fn merge_chunks(chunk_cues: Vec<Vec<Cue>>, chunk_bounds: &[(u64, u64)], overlap_ms: u64) -> Vec<Cue> {
    let mut merged: Vec<Cue> = Vec::new();

    for (idx, mut cues) in chunk_cues.into_iter().enumerate() {
        if idx > 0 {
            let next_chunk_start = chunk_bounds[idx].0;
            let overlap_window_end = next_chunk_start + overlap_ms;

            if let Some(last) = merged.last() {
                let midpoint = (last.start_ms + last.end_ms) as u64 / 2;
                if midpoint >= next_chunk_start && midpoint <= overlap_window_end
                    && let Some(first_new) = cues.first()
                        && jaccard_similarity(&last.text, &first_new.text) >= DEDUP_SIMILARITY_THRESHOLD {
                            merged.pop();
                        }
            }
        }
        merged.append(&mut cues);
    }

    for (i, cue) in merged.iter_mut().enumerate() {
        cue.index = i + 1;
    }
    merged
}
