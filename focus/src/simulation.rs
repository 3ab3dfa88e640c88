//! Simulated beamline: two emulated Genesys supplies and a camera whose beam
//! spot responds to the currents programmed into them.
//!
//! The spot is a 2-D Gaussian. Its width along x grows with the distance of
//! the Q1 current from its optimum, and its width along y with the distance of
//! Q2, as `sigma = base * (1 + ((q - optimum) / scale)^2)`. The smallest round
//! spot therefore sits at the optimum currents.

use std::time::Duration;

use hardware::genesys::mock::MockGenesysBus;
use hardware::GenesysBus;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use shared::camera_interface::{CameraError, CameraInterface, CameraResult, CameraSettings, Frame};
use shared::settings::PowerSupplySettings;
use tracing::debug;

/// Geometry and photometry of the simulated spot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamModel {
    pub width: usize,
    pub height: usize,
    /// Currents (Q1, Q2) giving the tightest spot
    pub optimum: [f64; 2],
    /// Spot sigma in pixels at the optimum
    pub base_sigma: f64,
    /// Current offset doubling the sigma along each axis
    pub scale: [f64; 2],
    pub background: f64,
    pub peak: f64,
    /// Standard deviation of additive read noise, 0 for none
    pub noise_sigma: f64,
}

impl Default for BeamModel {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            optimum: [42.0, 57.0],
            base_sigma: 6.0,
            scale: [25.0, 25.0],
            background: 10.0,
            peak: 200.0,
            noise_sigma: 3.0,
        }
    }
}

impl BeamModel {
    /// Spot sigmas (x, y) in pixels for the given currents.
    pub fn sigmas(&self, currents: [f64; 2]) -> (f64, f64) {
        let widen = |axis: usize| {
            let offset = (currents[axis] - self.optimum[axis]) / self.scale[axis];
            self.base_sigma * (1.0 + offset * offset)
        };
        (widen(0), widen(1))
    }

    /// Render the noiseless spot centered in the frame.
    pub fn render(&self, currents: [f64; 2]) -> Array2<f64> {
        let (sigma_x, sigma_y) = self.sigmas(currents);
        let profile = |n: usize, sigma: f64| {
            let center = (n as f64 - 1.0) / 2.0;
            Array1::from_shape_fn(n, |i| {
                let d = i as f64 - center;
                (-d * d / (2.0 * sigma * sigma)).exp()
            })
        };
        let gx = profile(self.width, sigma_x);
        let gy = profile(self.height, sigma_y);

        Array2::from_shape_fn((self.height, self.width), |(row, col)| {
            self.background + self.peak * gy[row] * gx[col]
        })
    }
}

/// Camera producing frames of a [`BeamModel`] under the bus currents.
pub struct SimulatedBeamCamera {
    model: BeamModel,
    bus: MockGenesysBus,
    addresses: [u8; 2],
    noise: Option<Normal<f64>>,
    rng: StdRng,
    frame_interval: Duration,
    settings: CameraSettings,
    connected: bool,
    streaming: bool,
}

impl SimulatedBeamCamera {
    pub fn new(model: BeamModel, bus: MockGenesysBus, addresses: [u8; 2], seed: u64) -> Self {
        let noise = (model.noise_sigma > 0.0)
            .then(|| Normal::new(0.0, model.noise_sigma).ok())
            .flatten();
        Self {
            model,
            bus,
            addresses,
            noise,
            rng: StdRng::seed_from_u64(seed),
            frame_interval: Duration::ZERO,
            settings: CameraSettings::default(),
            connected: false,
            streaming: false,
        }
    }

    /// Pace frame delivery like a real sensor.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Currents the emulated supplies are programmed to; a supply with its
    /// output off contributes zero.
    pub fn applied_currents(&self) -> [f64; 2] {
        self.addresses.map(|address| {
            if self.bus.output_on(address).unwrap_or(false) {
                self.bus.programmed_current(address).unwrap_or(0.0)
            } else {
                0.0
            }
        })
    }
}

impl CameraInterface for SimulatedBeamCamera {
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
        (self.model.width, self.model.height)
    }

    fn next_frame(&mut self) -> CameraResult<Frame> {
        if !self.streaming {
            return Err(CameraError::CaptureError("camera is not streaming".into()));
        }
        if !self.frame_interval.is_zero() {
            std::thread::sleep(self.frame_interval);
        }

        let currents = self.applied_currents();
        let mut image = self.model.render(currents);
        if let Some(noise) = &self.noise {
            let rng = &mut self.rng;
            image.mapv_inplace(|v| v + noise.sample(rng));
        }
        debug!(q1 = currents[0], q2 = currents[1], "Rendered frame");

        Ok(Frame::from_gray(
            image.mapv(|v| v.round().clamp(0.0, 255.0) as u8),
        ))
    }

    fn name(&self) -> &str {
        "Simulated beam camera"
    }
}

/// Emulated supplies plus a camera looking at them.
#[derive(Clone)]
pub struct SimulatedBeamline {
    pub model: BeamModel,
    pub bus: MockGenesysBus,
    addresses: [u8; 2],
}

impl SimulatedBeamline {
    pub fn new(model: BeamModel, settings: &PowerSupplySettings) -> Self {
        let addresses = [settings.q1_address, settings.q2_address];
        Self {
            model,
            bus: MockGenesysBus::new(&addresses),
            addresses,
        }
    }

    /// Driver-side view of the emulated line.
    pub fn genesys_bus(&self) -> GenesysBus {
        GenesysBus::new(Box::new(self.bus.clone())).with_select_settle(Duration::ZERO)
    }

    pub fn camera(&self, seed: u64) -> SimulatedBeamCamera {
        SimulatedBeamCamera::new(self.model, self.bus.clone(), self.addresses, seed)
    }
}
