//! Full session against the simulated beamline.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use focus::accumulation::PipelineEvent;
use focus::minimizer::MinimizerEvent;
use focus::nelder_mead::OptimizeResult;
use focus::session::FocusSession;
use focus::simulation::{BeamModel, SimulatedBeamline};
use hardware::ps_controller::{PowerSupplyControl, PsController};
use shared::camera_interface::{Frame, MockCameraInterface};
use shared::settings::{FocusSettings, PowerSupplySettings};
use tempfile::TempDir;

fn settings(images: usize) -> FocusSettings {
    let mut settings = FocusSettings::default();
    settings.accumulation.images_to_accumulate = images;
    settings.optimizer.initial = [30.0, 45.0];
    settings.optimizer.maxiter = 0;
    settings.optimizer.maxfev = 150;
    settings.power_supply = PowerSupplySettings {
        refresh_interval_ms: 50,
        call_timeout_ms: 2000,
        ..Default::default()
    };
    settings
}

fn model() -> BeamModel {
    BeamModel {
        width: 160,
        height: 120,
        optimum: [42.0, 57.0],
        base_sigma: 4.0,
        scale: [20.0, 20.0],
        noise_sigma: 0.0,
        ..Default::default()
    }
}

fn finished_result(events: &Mutex<Vec<MinimizerEvent>>) -> Option<OptimizeResult<2>> {
    events.lock().unwrap().iter().find_map(|event| match event {
        MinimizerEvent::Finished(result) => Some(*result),
        _ => None,
    })
}

#[test]
fn test_simulated_run_finds_optimum() {
    let dir = TempDir::new().unwrap();
    let settings = settings(3);
    let beamline = SimulatedBeamline::new(model(), &settings.power_supply);
    let supplies = PsController::connect(beamline.genesys_bus(), &settings.power_supply).unwrap();
    let camera = beamline.camera(7);

    let mut session =
        FocusSession::start(settings.clone(), Box::new(camera), supplies, dir.path()).unwrap();
    session.start_minimization().unwrap();
    let result = session.wait_for_minimization().unwrap();

    assert!(!result.is_cancelled());
    assert!(result.nfev <= 150);
    assert!((result.x[0] - 42.0).abs() < 6.0, "Q1 = {}", result.x[0]);
    assert!((result.x[1] - 57.0).abs() < 6.0, "Q2 = {}", result.x[1]);

    // best currents left programmed
    let q1 = beamline.bus.programmed_current(settings.power_supply.q1_address).unwrap();
    let q2 = beamline.bus.programmed_current(settings.power_supply.q2_address).unwrap();
    assert!((q1 - result.x[0]).abs() < 1e-3);
    assert!((q2 - result.x[1]).abs() < 1e-3);

    let summary = session.summary();
    assert_eq!(summary.cost.len(), result.nfev);
    assert!(summary.x_c.len() >= result.nfev);
    let path = session.save_summary().unwrap();
    assert!(path.starts_with(dir.path()));

    session.shutdown();
    assert_eq!(
        beamline.bus.output_on(settings.power_supply.q1_address),
        Some(false)
    );
}

#[test]
fn test_blank_frames_cancel_the_run() {
    let dir = TempDir::new().unwrap();
    let settings = settings(2);
    let beamline = SimulatedBeamline::new(model(), &settings.power_supply);
    let supplies = PsController::connect(beamline.genesys_bus(), &settings.power_supply).unwrap();
    let camera = MockCameraInterface::new_repeating(Frame::from_gray(ndarray::Array2::zeros((
        120, 160,
    ))));

    let session = FocusSession::start(settings, Box::new(camera), supplies, dir.path()).unwrap();
    session.start_minimization().unwrap();
    let result = session.wait_for_minimization().unwrap();

    assert_eq!(result.status.code(), 99);
    assert_eq!(result.nfev, 1);
    assert!(result.fun.is_nan());
}

#[test]
fn test_shutdown_releases_blocked_evaluation() {
    let dir = TempDir::new().unwrap();
    // a measurement would take far longer than the test
    let settings = settings(10_000);
    let beamline = SimulatedBeamline::new(model(), &settings.power_supply);
    let supplies = PsController::connect(beamline.genesys_bus(), &settings.power_supply).unwrap();
    let camera = beamline
        .camera(1)
        .with_frame_interval(Duration::from_millis(5));

    let mut session = FocusSession::start(settings, Box::new(camera), supplies, dir.path()).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.register_minimizer_callback(move |event| sink.lock().unwrap().push(event.clone()));

    session.start_minimization().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, MinimizerEvent::Accumulating(true)))
    {
        assert!(Instant::now() < deadline, "evaluation never started");
        std::thread::sleep(Duration::from_millis(5));
    }
    beamline.bus.clear_written();

    let start = Instant::now();
    session.shutdown();
    assert!(start.elapsed() < Duration::from_secs(3));

    let result = finished_result(&events).expect("run did not finish");
    assert_eq!(result.status.code(), 99);
    assert!(!session.is_minimizing());

    // only the outputs were switched off, no currents re-applied
    let written = beamline.bus.written();
    assert!(written.iter().all(|line| !line.starts_with("PC ")));
    assert!(written.iter().any(|line| line == "OUT OFF"));
}

#[test]
fn test_idle_session_processes_frames_for_display() {
    let dir = TempDir::new().unwrap();
    let settings = settings(3);
    assert!(settings.accumulation.image_processing);
    let beamline = SimulatedBeamline::new(model(), &settings.power_supply);
    let supplies = PsController::connect(beamline.genesys_bus(), &settings.power_supply).unwrap();
    let camera = beamline
        .camera(3)
        .with_frame_interval(Duration::from_millis(2));

    let mut session = FocusSession::start(settings, Box::new(camera), supplies, dir.path()).unwrap();
    session.power_supplies().set_currents([42.0, 57.0]).unwrap();
    let ellipses = Arc::new(Mutex::new(0usize));
    let counter = ellipses.clone();
    session.register_pipeline_callback(move |event| {
        if let PipelineEvent::Ellipse(ellipse) = event {
            if !ellipse.is_null() {
                *counter.lock().unwrap() += 1;
            }
        }
    });

    // no run was started
    let deadline = Instant::now() + Duration::from_secs(5);
    while *ellipses.lock().unwrap() == 0 {
        assert!(Instant::now() < deadline, "no batch while idle");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!session.is_minimizing());
    assert!(session.is_image_processing());

    session.set_image_processing(false);
    assert!(!session.is_image_processing());
    // let a batch already in flight finish
    std::thread::sleep(Duration::from_millis(50));
    let settled = *ellipses.lock().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*ellipses.lock().unwrap(), settled);

    session.shutdown();
}
