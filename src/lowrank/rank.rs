//! Singular-value rank selection

/// Pick the rank to keep from descending singular values
///
/// Returns the smallest `r` whose discarded tail energy `Σ_{i≥r} σᵢ² / Σ σᵢ²`
/// is below `epsilon`, clamped into `[1, min(len, max_rank)]`. A
/// non-positive `epsilon` keeps every value; an all-zero spectrum keeps one.
pub fn select_rank(singular_values: &[f32], epsilon: f32, max_rank: usize) -> usize {
    let upper = singular_values.len().min(max_rank).max(1);
    let energy: f32 = singular_values.iter().map(|s| s * s).sum();

    let rank = if epsilon <= 0.0 {
        singular_values.len()
    } else if energy <= 0.0 {
        1
    } else {
        let mut tail = energy;
        let mut rank = singular_values.len();
        for (i, s) in singular_values.iter().enumerate() {
            if tail / energy < epsilon {
                rank = i;
                break;
            }
            tail -= s * s;
        }
        rank
    };

    rank.clamp(1, upper)
}
