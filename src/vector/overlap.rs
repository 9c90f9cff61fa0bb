use crate::annotations::bounding_box::BoundingBoxGeometry;
use crate::object_detection::object_detection_utils::non_maximum_suppression;
use crate::vector::layer::{DetectionFeature, VectorLayer};
use geo::{BooleanOps, Intersects};
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How overlapping detections, typically duplicates along tile seams, are reconciled.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlapStrategy {
    /// Union every connected group of intersecting or touching polygons into one feature.
    Union,
    /// Keep a polygon only if it does not intersect any polygon kept before it.
    FirstWins,
    /// Drop low scores, then greedy non maximum suppression on envelopes.
    Nms {
        score_threshold: f32,
        iou_threshold: f32,
        class_aware: bool,
    },
    /// Leave the layer untouched.
    Keep,
}

impl Default for OverlapStrategy {
    fn default() -> Self {
        OverlapStrategy::Nms {
            score_threshold: 0.2,
            iou_threshold: 0.65,
            class_aware: false,
        }
    }
}

/// Applies `strategy` to a merged layer.
pub fn resolve(layer: VectorLayer, strategy: &OverlapStrategy) -> VectorLayer {
    let VectorLayer {
        crs,
        space,
        features,
    } = layer;
    let before = features.len();
    let features = match *strategy {
        OverlapStrategy::Union => union_merge(features),
        OverlapStrategy::FirstWins => first_wins(features),
        OverlapStrategy::Nms {
            score_threshold,
            iou_threshold,
            class_aware,
        } => score_nms(features, score_threshold, iou_threshold, class_aware),
        OverlapStrategy::Keep => features,
    };
    info!(
        "Overlap resolution {:?}: {} -> {} features",
        strategy,
        before,
        features.len()
    );
    VectorLayer {
        crs,
        space,
        features,
    }
}

fn overlaps(a: &DetectionFeature, b: &DetectionFeature) -> bool {
    a.envelope.touches_or_overlaps(&b.envelope) && a.geometry.intersects(&b.geometry)
}

/// Order by envelope, then by descending confidence.
fn canonical_order(a: &DetectionFeature, b: &DetectionFeature) -> Ordering {
    let (al, at, ar, ab) = a.envelope.as_xyxy();
    let (bl, bt, br, bb) = b.envelope.as_xyxy();
    al.total_cmp(&bl)
        .then(at.total_cmp(&bt))
        .then(ar.total_cmp(&br))
        .then(ab.total_cmp(&bb))
        .then(b.confidence.total_cmp(&a.confidence))
        .then(a.envelope.class_id().cmp(&b.envelope.class_id()))
}

fn find(parents: &mut [usize], mut i: usize) -> usize {
    while parents[i] != i {
        parents[i] = parents[parents[i]];
        i = parents[i];
    }
    i
}

/// Unions every cluster of transitively intersecting polygons.
///
/// Members are folded in canonical order and the output is sorted canonically, so the result
/// depends neither on input order nor on how many times it is applied.
pub fn union_merge(mut features: Vec<DetectionFeature>) -> Vec<DetectionFeature> {
    features.sort_by(canonical_order);
    let mut parents: Vec<usize> = (0..features.len()).collect();
    for (i, j) in (0..features.len()).tuple_combinations() {
        if overlaps(&features[i], &features[j]) {
            let (root_i, root_j) = (find(&mut parents, i), find(&mut parents, j));
            if root_i != root_j {
                parents[root_j.max(root_i)] = root_i.min(root_j);
            }
        }
    }

    let roots: Vec<usize> = (0..features.len())
        .map(|i| find(&mut parents, i))
        .collect();
    let clusters = (0..features.len()).into_group_map_by(|&i| roots[i]);
    let mut merged: Vec<DetectionFeature> = clusters
        .into_values()
        .map(|members| {
            if let [single] = members.as_slice() {
                return features[*single].clone();
            }
            let members: Vec<&DetectionFeature> = members.iter().map(|&i| &features[i]).collect();
            fold_cluster(&members)
        })
        .collect();
    merged.sort_by(canonical_order);
    merged
}

fn fold_cluster(members: &[&DetectionFeature]) -> DetectionFeature {
    let best = members
        .iter()
        .copied()
        .reduce(|best, m| if m.confidence > best.confidence { m } else { best })
        .unwrap_or(members[0]);
    let mut geometry = members[0].geometry.clone();
    let mut envelope = best.envelope.clone();
    for member in &members[1..] {
        geometry = geometry.union(&member.geometry);
    }
    for member in members {
        envelope = envelope.union_envelope(&member.envelope);
    }
    DetectionFeature {
        geometry,
        envelope,
        confidence: best.confidence,
        tile: best.tile,
        merged_count: members.iter().map(|m| m.merged_count).sum(),
    }
}

/// Keeps each polygon that intersects none of the polygons kept before it.
pub fn first_wins(features: Vec<DetectionFeature>) -> Vec<DetectionFeature> {
    let mut kept: Vec<DetectionFeature> = Vec::with_capacity(features.len());
    for feature in features {
        if !kept.iter().any(|k| overlaps(k, &feature)) {
            kept.push(feature);
        }
    }
    kept
}

/// Score filter followed by greedy non maximum suppression.
pub fn score_nms(
    features: Vec<DetectionFeature>,
    score_threshold: f32,
    iou_threshold: f32,
    class_aware: bool,
) -> Vec<DetectionFeature> {
    let candidates: Vec<DetectionFeature> = features
        .into_iter()
        .filter(|f| f.confidence >= score_threshold)
        .collect();
    non_maximum_suppression(candidates, iou_threshold, class_aware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::bounding_box::BoundingBox;
    use crate::image_utils::tiling::TileId;
    use crate::vector::geometry::{rectangle_polygon, CoordinateSpace};
    use crate::vector::layer::CoordinateReference;
    use approx::assert_relative_eq;
    use geo::{Area, MultiPolygon};

    fn feature(
        bounds: (f64, f64, f64, f64),
        class_id: usize,
        confidence: f32,
        col: u32,
    ) -> DetectionFeature {
        let (l, t, r, b) = bounds;
        let envelope = BoundingBox::new(l, t, r, b, class_id, "weed".to_string()).unwrap();
        DetectionFeature {
            geometry: MultiPolygon::new(vec![rectangle_polygon(envelope.corners())]),
            envelope,
            confidence,
            tile: TileId { row: 0, col },
            merged_count: 1,
        }
    }

    fn layer(features: Vec<DetectionFeature>) -> VectorLayer {
        VectorLayer {
            crs: CoordinateReference::default(),
            space: CoordinateSpace::SourcePixel,
            features,
        }
    }

    fn scattered() -> Vec<DetectionFeature> {
        vec![
            feature((0.0, 0.0, 2.0, 2.0), 0, 0.6, 0),
            feature((1.0, 1.0, 3.0, 3.0), 1, 0.9, 1),
            feature((10.0, 10.0, 11.0, 11.0), 0, 0.5, 2),
            feature((2.5, 2.5, 4.0, 4.0), 0, 0.3, 1),
            feature((20.0, 0.0, 21.0, 1.0), 0, 0.4, 3),
        ]
    }

    #[test]
    fn seam_duplicate_keeps_higher_score() {
        // Same plant seen by two neighbouring tiles; envelopes have IoU 0.8.
        let left_tile = feature((95.0, 0.0, 105.0, 10.0), 0, 0.7, 0);
        let right_tile = feature((95.0, 0.0, 105.0, 8.0), 0, 0.9, 1);
        assert_relative_eq!(
            left_tile
                .envelope
                .intersection_over_union(&right_tile.envelope),
            0.8,
            epsilon = 1e-12
        );
        let resolved = resolve(
            layer(vec![left_tile, right_tile.clone()]),
            &OverlapStrategy::default(),
        );
        assert_eq!(resolved.features, vec![right_tile]);
    }

    #[test]
    fn nms_filters_low_scores_and_is_idempotent() {
        let strategy = OverlapStrategy::Nms {
            score_threshold: 0.35,
            iou_threshold: 0.1,
            class_aware: false,
        };
        let once = resolve(layer(scattered()), &strategy);
        let scores: Vec<f32> = once.features.iter().map(|f| f.confidence).collect();
        assert_eq!(scores, vec![0.9, 0.5, 0.4]);
        let twice = resolve(once.clone(), &strategy);
        assert_eq!(once, twice);
    }

    #[test]
    fn class_aware_nms_keeps_other_classes() {
        let features = vec![
            feature((0.0, 0.0, 10.0, 10.0), 0, 0.9, 0),
            feature((0.0, 0.0, 10.0, 9.0), 1, 0.8, 1),
        ];
        let aware = OverlapStrategy::Nms {
            score_threshold: 0.0,
            iou_threshold: 0.65,
            class_aware: true,
        };
        assert_eq!(resolve(layer(features.clone()), &aware).len(), 2);
        assert_eq!(resolve(layer(features), &OverlapStrategy::default()).len(), 1);
    }

    #[test]
    fn union_merges_connected_clusters() {
        let resolved = resolve(layer(scattered()), &OverlapStrategy::Union);
        assert_eq!(resolved.len(), 3);
        let cluster = &resolved.features[0];
        assert_eq!(cluster.merged_count, 3);
        assert_eq!(cluster.confidence, 0.9);
        assert_eq!(cluster.envelope.class_id(), 1);
        assert_eq!(cluster.envelope.as_xyxy(), (0.0, 0.0, 4.0, 4.0));
        // 4 + 4 - 1 for the first two squares, plus 2.25 - 0.25 for the third.
        assert_relative_eq!(cluster.geometry.unsigned_area(), 9.0, epsilon = 1e-9);
        assert_eq!(resolved.features[1].merged_count, 1);
        assert_eq!(resolved.features[2].tile.col, 3);
    }

    #[test]
    fn touching_polygons_are_merged() {
        let resolved = union_merge(vec![
            feature((0.0, 0.0, 1.0, 1.0), 0, 0.5, 0),
            feature((1.0, 0.0, 2.0, 1.0), 0, 0.6, 1),
        ]);
        assert_eq!(resolved.len(), 1);
        assert_relative_eq!(resolved[0].geometry.unsigned_area(), 2.0, epsilon = 1e-9);
        assert_eq!(resolved[0].tile.col, 1);
    }

    #[test]
    fn union_is_order_independent_and_idempotent() {
        let forward = union_merge(scattered());
        let mut reversed_input = scattered();
        reversed_input.reverse();
        let reversed = union_merge(reversed_input);
        assert_eq!(forward.len(), reversed.len());
        for (a, b) in forward.iter().zip(&reversed) {
            assert_eq!(a.envelope, b.envelope);
            assert_eq!(a.confidence, b.confidence);
            assert_eq!(a.merged_count, b.merged_count);
            assert_relative_eq!(
                a.geometry.unsigned_area(),
                b.geometry.unsigned_area(),
                epsilon = 1e-9
            );
        }
        let again = union_merge(forward.clone());
        assert_eq!(again.len(), forward.len());
        for (a, b) in forward.iter().zip(&again) {
            assert_eq!(a.envelope, b.envelope);
            assert_eq!(a.merged_count, b.merged_count);
            assert_relative_eq!(
                a.geometry.unsigned_area(),
                b.geometry.unsigned_area(),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn first_wins_keeps_earliest_non_overlapping() {
        let kept = first_wins(vec![
            feature((0.0, 0.0, 2.0, 2.0), 0, 0.2, 0),
            feature((1.0, 1.0, 3.0, 3.0), 0, 0.9, 1),
            feature((2.5, 2.5, 4.0, 4.0), 0, 0.5, 2),
        ]);
        let cols: Vec<u32> = kept.iter().map(|f| f.tile.col).collect();
        assert_eq!(cols, vec![0, 2]);
    }

    #[test]
    fn keep_passes_everything_through() {
        let resolved = resolve(layer(scattered()), &OverlapStrategy::Keep);
        assert_eq!(resolved.features, scattered());
    }
}
