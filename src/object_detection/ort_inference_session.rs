use ort::session::Session;
use std::path::Path;
use std::sync::Mutex;

/// An onnxruntime inference session.
///
/// All of the object detection classes in this project are just wrappers
/// around an ONNX inference session that handles running the model on
/// hardware. Running a session needs exclusive access, so tile workers take
/// turns through the mutex; the model itself is loaded once.
pub struct OrtInferenceSession {
    pub session: Mutex<Session>,
}

impl OrtInferenceSession {
    pub fn new(model_path: &Path) -> ort::Result<Self> {
        let session = Session::builder()?.commit_from_file(model_path)?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }
}
