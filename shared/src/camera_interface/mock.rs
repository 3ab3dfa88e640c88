use super::{CameraError, CameraInterface, CameraResult, CameraSettings, Frame};

/// Camera that replays a fixed list of frames.
///
/// A single frame is repeated forever; a longer list is played once and then
/// reports a capture error, which lets tests bound the number of frames fed
/// into the pipeline.
pub struct MockCameraInterface {
    frames: Vec<Frame>,
    frame_index: usize,
    frame_count: u64,
    connected: bool,
    streaming: bool,
    settings: CameraSettings,
}

impl MockCameraInterface {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            frame_index: 0,
            frame_count: 0,
            connected: false,
            streaming: false,
            settings: CameraSettings::default(),
        }
    }

    pub fn new_repeating(frame: Frame) -> Self {
        Self::new(vec![frame])
    }

    /// Number of frames handed out so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Last settings pushed through `configure`
    pub fn settings(&self) -> CameraSettings {
        self.settings
    }

    pub fn reset(&mut self) {
        self.frame_index = 0;
        self.frame_count = 0;
    }
}

impl CameraInterface for MockCameraInterface {
    fn connect(&mut self) -> CameraResult<()> {
        self.connected = true;
        Ok(())
    }

    fn configure(&mut self, settings: &CameraSettings) -> CameraResult<()> {
        if !self.connected {
            return Err(CameraError::NotConnected);
        }
        self.settings = *settings;
        Ok(())
    }

    fn start(&mut self) -> CameraResult<()> {
        if !self.connected {
            return Err(CameraError::NotConnected);
        }
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> CameraResult<()> {
        self.streaming = false;
        Ok(())
    }

    fn disconnect(&mut self) -> CameraResult<()> {
        self.streaming = false;
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn resolution(&self) -> (usize, usize) {
        self.frames
            .first()
            .map(|f| (f.width(), f.height()))
            .unwrap_or((0, 0))
    }

    fn next_frame(&mut self) -> CameraResult<Frame> {
        if !self.streaming {
            return Err(CameraError::CaptureError("camera is not streaming".into()));
        }

        let frame = if self.frames.len() == 1 {
            self.frames[0].clone()
        } else {
            let frame = self
                .frames
                .get(self.frame_index)
                .cloned()
                .ok_or_else(|| CameraError::CaptureError("No more frames".to_string()))?;
            self.frame_index += 1;
            frame
        };

        self.frame_count += 1;
        Ok(frame)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
