use crate::annotations::bounding_box::BoundingBox;
use crate::annotations::detection::Detection;
use crate::object_detection::object_detection_model::{DetectionError, ObjectDetectionModel};
use crate::object_detection::ort_inference_session::OrtInferenceSession;
use log::warn;
use ndarray::{ArrayView4, Axis};
use ort::inputs;
use ort::value::TensorRef;
use std::path::Path;

/// A YOLOv11 detection model exported to ONNX.
///
/// The model takes an `images` tensor of shape (1, 3, height, width) and produces `output0` of
/// shape (1, 4 + classes, anchors): per anchor the box centre, size and one score per class.
pub struct Yolov11BoundingBox {
    ort_session: OrtInferenceSession,
    class_names: Vec<String>,
    input_width: u32,
    input_height: u32,
    model_name: String,
}

impl Yolov11BoundingBox {
    pub fn new(
        model_path: &Path,
        class_names: Vec<String>,
        input_width: u32,
        input_height: u32,
        model_name: String,
    ) -> ort::Result<Self> {
        let ort_session = OrtInferenceSession::new(model_path)?;
        Ok(Yolov11BoundingBox {
            ort_session,
            class_names,
            input_width,
            input_height,
            model_name,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    fn label(&self, class_id: usize) -> String {
        match self.class_names.get(class_id) {
            Some(v) => v.clone(),
            None => class_id.to_string(),
        }
    }
}

impl ObjectDetectionModel for Yolov11BoundingBox {
    fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    fn run_inference(
        &self,
        input_array: ArrayView4<f32>,
        confidence: f32,
    ) -> Result<Vec<Detection<BoundingBox>>, DetectionError> {
        let mut session = self
            .ort_session
            .session
            .lock()
            .map_err(|_| DetectionError::SessionPoisoned)?;
        let outputs = session.run(inputs!["images" => TensorRef::from_array_view(input_array)?])?;
        let output = outputs["output0"].try_extract_array::<f32>()?;
        let shape = output.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(DetectionError::OutputShape { shape });
        }
        let output = output.index_axis(Axis(0), 0);
        let output = output.t();

        let mut detections: Vec<Detection<BoundingBox>> = Vec::new();
        for row in output.axis_iter(Axis(0)) {
            let row: Vec<_> = row.iter().copied().collect();
            let Some((class_id, prob)) = row
                .iter()
                .skip(4) // skips bounding box coords.
                .enumerate()
                .map(|(index, value)| (index, *value))
                .reduce(|accum, row| if row.1 > accum.1 { row } else { accum })
            else {
                continue;
            };
            if prob < confidence {
                continue;
            }
            let (x, y, w, h) = (row[0] as f64, row[1] as f64, row[2] as f64, row[3] as f64);
            match BoundingBox::from_xywh(x, y, w, h, class_id, self.label(class_id)) {
                Ok(annotation) => detections.push(Detection {
                    annotation,
                    confidence: prob,
                }),
                Err(err) => warn!("{}: dropping malformed box: {err}", self.model_name),
            }
        }
        Ok(detections)
    }
}
