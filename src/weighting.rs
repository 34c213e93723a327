//! Pure weighting kernel (spec.md §4.1). Every function here is stateless and
//! safe to call concurrently from any number of threads — no `Arc`, no lock,
//! just numbers in and numbers out.

use crate::types::{Location, VenueGeometry, WeightingConfig};

const EPSILON: f64 = 1e-9;

/// Spatial influence multiplier: zone base multiplier (if the input carries a
/// zone) applied first, then exponential distance attenuation from the stage.
/// An input with no location attached gets a neutral 0.5.
pub fn spatial_weight(
    location: Option<&Location>,
    venue: &VenueGeometry,
    decay_rate: f64,
) -> f64 {
    let Some(loc) = location else { return 0.5 };
    let (sx, sy) = venue.stage_position;
    let d = ((loc.x - sx).powi(2) + (loc.y - sy).powi(2)).sqrt();
    let diag = venue.diagonal();
    let attenuation = if diag > 0.0 {
        (-decay_rate * d / diag).exp()
    } else {
        1.0
    };
    let zone_mult = venue.zone_multiplier(loc.zone.as_deref());
    zone_mult * attenuation
}

/// Temporal influence multiplier: 1.0 at age 0, decaying exponentially toward
/// 0 as the input ages past `temporal_window_ms`.
pub fn temporal_weight(timestamp: u64, now: u64, window_ms: u64, decay_rate: f64) -> f64 {
    let age = now.saturating_sub(timestamp) as f64;
    let window = window_ms.max(1) as f64;
    (-decay_rate * age / window).exp()
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.5;
    }
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        (v[mid - 1] + v[mid]) / 2.0
    } else {
        v[mid]
    }
}

/// Influence multiplier derived from proximity to the batch's median value:
/// full weight within `cluster_threshold` of the median, decaying outside it.
/// A single-input batch always gets full weight.
pub fn consensus_weight(value: f64, values: &[f64], cluster_threshold: f64) -> f64 {
    if values.len() <= 1 {
        return 1.0;
    }
    let m = median(values);
    let diff = (value - m).abs();
    if diff <= cluster_threshold {
        1.0
    } else {
        1.0 - (diff / (cluster_threshold + EPSILON)).min(1.0)
    }
}

/// One input's three raw weight components before normalization.
#[derive(Clone, Copy, Debug)]
pub struct RawWeight {
    pub spatial: f64,
    pub temporal: f64,
    pub consensus: f64,
}

impl RawWeight {
    pub fn composite(&self, cfg: &WeightingConfig) -> f64 {
        cfg.spatial_alpha * self.spatial
            + cfg.temporal_beta * self.temporal
            + cfg.consensus_gamma * self.consensus
    }
}

/// Normalizes a batch of composite weights so they sum to 1. An all-zero
/// batch is treated as uniform.
pub fn normalize_weights(weights: &[f64]) -> Vec<f64> {
    let sum: f64 = weights.iter().sum();
    if sum <= EPSILON || weights.is_empty() {
        let n = weights.len().max(1) as f64;
        return vec![1.0 / n; weights.len()];
    }
    weights.iter().map(|w| w / sum).collect()
}

/// Weighted mean of `(value, weight)` pairs. An empty set defaults to the
/// midpoint of the parameter range, 0.5.
pub fn weighted_mean(pairs: &[(f64, f64)]) -> f64 {
    if pairs.is_empty() {
        return 0.5;
    }
    let weight_sum: f64 = pairs.iter().map(|(_, w)| w).sum();
    if weight_sum <= EPSILON {
        let n = pairs.len() as f64;
        return pairs.iter().map(|(v, _)| v).sum::<f64>() / n;
    }
    pairs.iter().map(|(v, w)| v * w).sum::<f64>() / weight_sum
}

/// Population standard deviation over equally-weighted values. Used only for
/// outlier detection and confidence, per spec.md.
pub fn standard_deviation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}

/// Removes values whose z-score against the plain mean/stddev of `values`
/// exceeds `outlier_threshold`. Returns the surviving indices into `values`.
/// If stddev is 0, nothing is filtered.
pub fn outlier_filter_indices(values: &[f64], outlier_threshold: f64) -> Vec<usize> {
    if values.is_empty() {
        return Vec::new();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let stddev = standard_deviation(values);
    if stddev <= EPSILON {
        return (0..values.len()).collect();
    }
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| ((*v - mean) / stddev).abs() <= outlier_threshold)
        .map(|(i, _)| i)
        .collect()
}

/// `result = previous + factor * (new - previous)`. A `None` previous value
/// disables smoothing and returns `new` unchanged.
pub fn exponential_smoothing(previous: Option<f64>, new: f64, factor: f64) -> f64 {
    match previous {
        None => new,
        Some(prev) => prev + factor * (new - prev),
    }
}

#[derive(Clone, Debug)]
pub struct Cluster {
    pub centroid: f64,
    pub density: usize,
}

#[derive(Clone, Debug)]
pub struct ClusterAnalysis {
    pub clusters: Vec<Cluster>,
    pub bimodal: bool,
    pub dominant_index: Option<usize>,
    pub entropy: f64,
}

/// Bins `[0,1]` into `cluster_threshold`-wide bins (at least two), groups
/// contiguous non-empty bins into clusters, and reports bimodality when two or
/// more clusters each hold at least 30% of the inputs.
pub fn cluster_analysis(
    values: &[f64],
    cluster_threshold: f64,
    previous_consensus: Option<f64>,
) -> ClusterAnalysis {
    if values.is_empty() {
        return ClusterAnalysis {
            clusters: Vec::new(),
            bimodal: false,
            dominant_index: None,
            entropy: 0.0,
        };
    }

    let bin_width = cluster_threshold.max(EPSILON);
    let bin_count = (1.0 / bin_width).ceil() as usize;
    let bin_count = bin_count.max(2);
    let mut bins: Vec<Vec<f64>> = vec![Vec::new(); bin_count];
    for &v in values {
        let idx = ((v.clamp(0.0, 1.0)) / bin_width).floor() as usize;
        let idx = idx.min(bin_count - 1);
        bins[idx].push(v);
    }

    let mut clusters = Vec::new();
    let mut i = 0;
    while i < bins.len() {
        if bins[i].is_empty() {
            i += 1;
            continue;
        }
        let mut group: Vec<f64> = Vec::new();
        while i < bins.len() && !bins[i].is_empty() {
            group.extend(bins[i].iter().copied());
            i += 1;
        }
        let density = group.len();
        let centroid = group.iter().sum::<f64>() / density as f64;
        clusters.push(Cluster { centroid, density });
    }

    let total = values.len() as f64;
    let major_clusters = clusters.iter().filter(|c| c.density as f64 / total >= 0.3).count();
    let bimodal = major_clusters >= 2;

    let dominant_index = clusters
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            a.density.cmp(&b.density).then_with(|| {
                // Tie-break: prefer proximity to the previous consensus value.
                match previous_consensus {
                    None => std::cmp::Ordering::Equal,
                    Some(p) => {
                        let da = (clusters[*ia].centroid - p).abs();
                        let db = (clusters[*ib].centroid - p).abs();
                        db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
                    }
                }
            })
        })
        .map(|(i, _)| i);

    let entropy = shannon_entropy(&clusters);

    ClusterAnalysis {
        clusters,
        bimodal,
        dominant_index,
        entropy,
    }
}

fn shannon_entropy(clusters: &[Cluster]) -> f64 {
    if clusters.len() <= 1 {
        return 0.0;
    }
    let total: usize = clusters.iter().map(|c| c.density).sum();
    if total == 0 {
        return 0.0;
    }
    let raw: f64 = clusters
        .iter()
        .map(|c| {
            let p = c.density as f64 / total as f64;
            if p > 0.0 {
                -p * p.log2()
            } else {
                0.0
            }
        })
        .sum();
    let max_entropy = (clusters.len() as f64).log2();
    if max_entropy > 0.0 {
        raw / max_entropy
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Zone;

    fn venue() -> VenueGeometry {
        VenueGeometry {
            width: 100.0,
            height: 100.0,
            stage_position: (50.0, 0.0),
            zones: vec![Zone {
                name: "front".into(),
                bounds: crate::types::BoundingBox {
                    x_min: 0.0,
                    y_min: 0.0,
                    x_max: 100.0,
                    y_max: 20.0,
                },
                base_multiplier: 1.5,
            }],
            max_capacity: 1000,
        }
    }

    #[test]
    fn spatial_weight_no_location_is_neutral() {
        assert_eq!(spatial_weight(None, &venue(), 0.5), 0.5);
    }

    #[test]
    fn spatial_weight_at_stage_is_full_before_zone() {
        let loc = Location { x: 50.0, y: 0.0, zone: None };
        let w = spatial_weight(Some(&loc), &venue(), 0.5);
        assert!((w - 1.0).abs() < 1e-9);
    }

    #[test]
    fn spatial_weight_decays_with_distance() {
        let near = Location { x: 50.0, y: 10.0, zone: None };
        let far = Location { x: 0.0, y: 100.0, zone: None };
        let wn = spatial_weight(Some(&near), &venue(), 0.5);
        let wf = spatial_weight(Some(&far), &venue(), 0.5);
        assert!(wn > wf);
    }

    #[test]
    fn temporal_weight_age_zero_is_one() {
        assert_eq!(temporal_weight(1000, 1000, 5000, 0.5), 1.0);
    }

    #[test]
    fn temporal_weight_at_window_matches_decay_law() {
        let w = temporal_weight(0, 5000, 5000, 0.5);
        assert!((w - (-0.5f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn temporal_weight_far_in_past_is_near_zero() {
        let w = temporal_weight(0, 10_000, 5000, 0.5);
        assert!(w < 0.02);
    }

    #[test]
    fn consensus_weight_single_input_is_one() {
        assert_eq!(consensus_weight(0.9, &[0.9], 0.1), 1.0);
    }

    #[test]
    fn consensus_weight_within_threshold_is_one() {
        let values = [0.5, 0.52, 0.48, 0.9];
        assert_eq!(consensus_weight(0.52, &values, 0.1), 1.0);
    }

    #[test]
    fn consensus_weight_far_from_median_is_reduced() {
        let values = [0.1, 0.1, 0.1, 0.9];
        let w = consensus_weight(0.9, &values, 0.05);
        assert!(w < 1.0);
    }

    #[test]
    fn weighted_mean_empty_defaults_to_half() {
        assert_eq!(weighted_mean(&[]), 0.5);
    }

    #[test]
    fn weighted_mean_basic() {
        let pairs = [(0.0, 1.0), (1.0, 1.0)];
        assert!((weighted_mean(&pairs) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn outlier_filter_keeps_all_when_stddev_zero() {
        let values = [0.5, 0.5, 0.5];
        assert_eq!(outlier_filter_indices(&values, 2.5).len(), 3);
    }

    #[test]
    fn outlier_filter_removes_far_value() {
        let values = [0.5, 0.51, 0.49, 0.52, 10.0];
        let kept = outlier_filter_indices(&values, 1.0);
        assert!(!kept.contains(&4));
    }

    #[test]
    fn smoothing_zero_factor_returns_previous() {
        assert_eq!(exponential_smoothing(Some(0.3), 0.9, 0.0), 0.3);
    }

    #[test]
    fn smoothing_one_factor_returns_new() {
        assert_eq!(exponential_smoothing(Some(0.3), 0.9, 1.0), 0.9);
    }

    #[test]
    fn smoothing_none_previous_disables_smoothing() {
        assert_eq!(exponential_smoothing(None, 0.9, 0.3), 0.9);
    }

    #[test]
    fn bimodal_detection() {
        let mut values = vec![0.1; 6];
        values.extend(vec![0.9; 6]);
        let analysis = cluster_analysis(&values, 0.1, None);
        assert!(analysis.bimodal);
        assert_eq!(analysis.clusters.len(), 2);
        for c in &analysis.clusters {
            assert_eq!(c.density, 6);
        }
    }

    #[test]
    fn unimodal_is_not_bimodal() {
        let values = vec![0.5, 0.51, 0.49, 0.52, 0.48];
        let analysis = cluster_analysis(&values, 0.1, None);
        assert!(!analysis.bimodal);
    }

    #[test]
    fn dominant_cluster_is_highest_density() {
        let mut values = vec![0.1; 2];
        values.extend(vec![0.9; 8]);
        let analysis = cluster_analysis(&values, 0.1, None);
        let dom = analysis.dominant_index.unwrap();
        assert_eq!(analysis.clusters[dom].density, 8);
    }
}
