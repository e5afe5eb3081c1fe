use sha2::{Digest, Sha256};

pub const EMBEDDING_DIMS: usize = 384;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Signed feature hashing of word tokens and character trigrams, L2-normalized.
/// Texts sharing most of their wording land close together in cosine space,
/// and the output depends only on `(text, model_id, dims)`.
pub fn deterministic_embedding(text: &str, model_id: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);
    let mut out = vec![0.0f32; dims];
    let normalized = normalize_text(text);

    for token in normalized.split_whitespace() {
        accumulate(&mut out, model_id, b"w", token, WORD_WEIGHT);
    }

    let chars: Vec<char> = normalized.chars().collect();
    for window in chars.windows(3) {
        let gram: String = window.iter().collect();
        accumulate(&mut out, model_id, b"c", &gram, TRIGRAM_WEIGHT);
    }

    l2_normalize(&mut out);
    out
}

fn normalize_text(text: &str) -> String {
    let lowered: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn accumulate(out: &mut [f32], model_id: &str, namespace: &[u8], feature: &str, weight: f32) {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(namespace);
    hasher.update(feature.as_bytes());
    let digest = hasher.finalize();

    let bucket = u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]) as usize
        % out.len();
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    out[bucket] += sign * weight;
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}
