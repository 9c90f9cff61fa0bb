use crate::annotations::bounding_box::BoundingBoxGeometry;
use crate::annotations::detection::Detection;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Reads a file with the class names into a vector so that the number ids
/// which come directly from the ORT inference session can be given meaning.
pub fn read_classes_txt_file(filepath: &Path) -> io::Result<Vec<String>> {
    BufReader::new(File::open(filepath)?)
        .lines()
        .map(|line| line.map(|name| name.trim().to_string()))
        .filter(|line| !matches!(line, Ok(name) if name.is_empty()))
        .collect()
}

/// Anything carrying a box and a confidence score can go through NMS.
pub trait Scored {
    type Annotation: BoundingBoxGeometry;

    fn annotation(&self) -> &Self::Annotation;
    fn score(&self) -> f32;
}

impl<T: BoundingBoxGeometry> Scored for Detection<T> {
    type Annotation = T;

    fn annotation(&self) -> &T {
        &self.annotation
    }

    fn score(&self) -> f32 {
        self.confidence
    }
}

/// Non maxmimum suppression is a way of removing duplicate detections.
///
/// Detections are visited by descending score; each kept detection suppresses every later one
/// whose IoU with it exceeds `iou_threshold`. With `class_aware` only detections of the same
/// class suppress each other. Equal scores keep their input order.
pub fn non_maximum_suppression<D: Scored>(
    mut detections: Vec<D>,
    iou_threshold: f32,
    class_aware: bool,
) -> Vec<D> {
    detections.sort_by(|a, b| b.score().total_cmp(&a.score()));
    let mut detections_to_remove: Vec<bool> = vec![false; detections.len()];
    for (current_index, current_det) in detections.iter().enumerate() {
        if detections_to_remove[current_index] {
            continue;
        }
        for (other_index, other_det) in detections[current_index + 1..].iter().enumerate() {
            let other_index = current_index + other_index + 1;
            if detections_to_remove[other_index] {
                continue;
            }
            if class_aware
                && current_det.annotation().class_id() != other_det.annotation().class_id()
            {
                continue;
            }
            let iou = current_det
                .annotation()
                .intersection_over_union(other_det.annotation());
            if iou > iou_threshold as f64 {
                detections_to_remove[other_index] = true;
            }
        }
    }
    let mut drop_iter = detections_to_remove.into_iter();
    detections.retain(|_| !drop_iter.next().unwrap_or(false));
    detections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::bounding_box::BoundingBox;

    fn det(
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
        class_id: usize,
        confidence: f32,
    ) -> Detection<BoundingBox> {
        Detection {
            annotation: BoundingBox::new(left, top, right, bottom, class_id, "weed".to_string())
                .unwrap(),
            confidence,
        }
    }

    #[test]
    fn nms_no_overlap() {
        let dets = vec![
            det(0.0, 0.0, 1.0, 1.0, 0, 0.6),
            det(2.0, 2.0, 3.0, 3.0, 0, 0.6),
        ];
        let nms_result = non_maximum_suppression(dets.clone(), 0.5, false);
        assert_eq!(dets, nms_result);
    }

    #[test]
    fn nms_standard_usage() {
        let dets = vec![
            det(0.0, 0.0, 4.0, 4.0, 0, 0.6),
            det(0.0, 0.0, 5.0, 5.0, 0, 0.55),
            det(6.0, 6.0, 10.0, 10.0, 0, 0.75),
        ];
        let nms_result = non_maximum_suppression(dets, 0.5, false);
        let true_dets = vec![
            det(6.0, 6.0, 10.0, 10.0, 0, 0.75),
            det(0.0, 0.0, 4.0, 4.0, 0, 0.6),
        ];
        assert_eq!(true_dets, nms_result);
    }

    #[test]
    fn nms_overlap_but_different_classes() {
        let dets = vec![
            det(0.0, 0.0, 4.5, 4.5, 0, 0.6),
            det(0.0, 0.0, 4.5, 4.5, 1, 0.55),
            det(0.5, 0.5, 4.0, 4.0, 0, 0.8),
            det(6.0, 6.0, 10.0, 10.0, 0, 0.75),
        ];
        let class_aware = non_maximum_suppression(dets.clone(), 0.5, true);
        assert_eq!(
            class_aware,
            vec![
                det(0.5, 0.5, 4.0, 4.0, 0, 0.8),
                det(6.0, 6.0, 10.0, 10.0, 0, 0.75),
                det(0.0, 0.0, 4.5, 4.5, 1, 0.55),
            ]
        );
        let agnostic = non_maximum_suppression(dets, 0.5, false);
        assert_eq!(
            agnostic,
            vec![
                det(0.5, 0.5, 4.0, 4.0, 0, 0.8),
                det(6.0, 6.0, 10.0, 10.0, 0, 0.75),
            ]
        );
    }

    #[test]
    fn suppressed_boxes_do_not_suppress_others() {
        // a suppresses b; c only overlaps a below the threshold and would have lost to b.
        let dets = vec![
            det(0.0, 0.0, 2.0, 2.0, 0, 0.9),
            det(0.5, 0.0, 2.5, 2.0, 0, 0.8),
            det(1.0, 0.0, 3.0, 2.0, 0, 0.7),
        ];
        let kept = non_maximum_suppression(dets, 0.4, false);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn nms_is_idempotent() {
        let dets = vec![
            det(0.0, 0.0, 10.0, 10.0, 0, 0.9),
            det(1.0, 1.0, 11.0, 11.0, 0, 0.85),
            det(8.0, 8.0, 18.0, 18.0, 1, 0.5),
            det(30.0, 0.0, 40.0, 10.0, 0, 0.4),
            det(31.0, 0.0, 41.0, 10.0, 1, 0.45),
        ];
        let once = non_maximum_suppression(dets, 0.65, false);
        let twice = non_maximum_suppression(once.clone(), 0.65, false);
        assert_eq!(once, twice);
        for (i, a) in once.iter().enumerate() {
            for b in &once[i + 1..] {
                assert!(a.annotation.intersection_over_union(&b.annotation) <= 0.65);
            }
        }
    }

    #[test]
    fn reads_class_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.txt");
        std::fs::write(&path, "weed\ncrop\n\n").unwrap();
        assert_eq!(
            read_classes_txt_file(&path).unwrap(),
            vec!["weed".to_string(), "crop".to_string()]
        );
    }
}
