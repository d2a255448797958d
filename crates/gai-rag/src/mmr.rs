//! 最大边际相关性（MMR）重排
//!
//! 每一步选出 `λ·sim(query, d) - (1-λ)·max sim(d, selected)` 最大的候选，
//! λ 为 1 时退化为纯相关性排序，为 0 时只看多样性。

/// 多样性检索参数
#[derive(Debug, Clone, Copy)]
pub struct MmrConfig {
    pub lambda: f32,
    /// 候选池大小相对 k 的倍数
    pub fetch_multiplier: f32,
}

impl Default for MmrConfig {
    fn default() -> Self {
        Self {
            lambda: 0.5,
            fetch_multiplier: 2.0,
        }
    }
}

impl MmrConfig {
    pub fn new(lambda: f32, fetch_multiplier: f32) -> Self {
        Self {
            lambda: lambda.clamp(0.0, 1.0),
            fetch_multiplier: fetch_multiplier.max(1.0),
        }
    }

    /// 给定最终条数时的候选池大小
    pub fn fetch_k(&self, k: usize) -> usize {
        ((k as f32) * self.fetch_multiplier).ceil() as usize
    }
}

/// 带向量的待重排候选
#[derive(Debug, Clone)]
pub struct MmrCandidate<T> {
    pub item: T,
    pub vector: Vec<f32>,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// 按 MMR 从候选中依次挑出至多 k 个，返回顺序即选择顺序
pub fn mmr_rerank<T>(query: &[f32], candidates: Vec<MmrCandidate<T>>, k: usize, lambda: f32) -> Vec<T> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    let k = k.min(candidates.len());
    let mut selected: Vec<MmrCandidate<T>> = Vec::with_capacity(k);
    let mut remaining = candidates;

    while selected.len() < k && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (idx, candidate) in remaining.iter().enumerate() {
            let score = mmr_score(query, candidate, &selected, lambda);
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        selected.push(remaining.remove(best_idx));
    }

    selected.into_iter().map(|c| c.item).collect()
}

fn mmr_score<T>(
    query: &[f32],
    candidate: &MmrCandidate<T>,
    selected: &[MmrCandidate<T>],
    lambda: f32,
) -> f32 {
    let relevance = cosine_similarity(query, &candidate.vector);
    let redundancy = selected
        .iter()
        .map(|s| cosine_similarity(&candidate.vector, &s.vector))
        .fold(0.0_f32, f32::max);
    lambda * relevance - (1.0 - lambda) * redundancy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u32, vector: Vec<f32>) -> MmrCandidate<u32> {
        MmrCandidate { item: id, vector }
    }

    #[test]
    fn near_duplicates_are_pushed_down() {
        let query = vec![1.0, 0.0, 0.0];
        let candidates = vec![
            candidate(1, vec![0.99, 0.01, 0.0]),
            candidate(2, vec![0.98, 0.02, 0.0]),
            candidate(3, vec![0.0, 0.0, 1.0]),
        ];
        let picked = mmr_rerank(&query, candidates, 2, 0.5);
        assert_eq!(picked, vec![1, 3]);
    }

    #[test]
    fn pure_relevance_keeps_similarity_order() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            candidate(3, vec![0.5, 0.5]),
            candidate(1, vec![0.9, 0.1]),
            candidate(2, vec![0.88, 0.12]),
        ];
        let picked = mmr_rerank(&query, candidates, 3, 1.0);
        assert_eq!(picked, vec![1, 2, 3]);
    }

    #[test]
    fn k_is_bounded_by_candidates() {
        let query = vec![1.0, 0.0];
        assert!(mmr_rerank::<u32>(&query, Vec::new(), 5, 0.5).is_empty());
        let picked = mmr_rerank(&query, vec![candidate(1, vec![1.0, 0.0])], 10, 0.5);
        assert_eq!(picked.len(), 1);
        assert!(mmr_rerank(&query, vec![candidate(1, vec![1.0, 0.0])], 0, 0.5).is_empty());
    }

    #[test]
    fn fetch_k_rounds_up() {
        let cfg = MmrConfig::new(0.5, 1.5);
        assert_eq!(cfg.fetch_k(5), 8);
        assert_eq!(MmrConfig::default().fetch_k(10), 20);
        assert!((MmrConfig::new(2.0, 0.1).lambda - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vectors_have_no_similarity() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
