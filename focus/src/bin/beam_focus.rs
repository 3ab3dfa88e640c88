//! Command line front end for the beam focusing loop.
//!
//! - `simulate`: closed-loop run against the built-in simulated beamline
//! - `detect`: accumulate PNG frames offline and print the fitted ellipse
//! - `ps`: query or program the Genesys supplies on a serial port

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use focus::accumulation::{AccumulationPipeline, FrameOutcome};
use focus::minimizer::MinimizerEvent;
use focus::rendezvous::Rendezvous;
use focus::session::FocusSession;
use focus::simulation::{BeamModel, SimulatedBeamline};
use hardware::ps_controller::PsController;
use hardware::{GenesysBus, GenesysCommand, PsStatus, SerialPortChannel};
use shared::camera_interface::Frame;
use shared::config_storage::ConfigStorage;
use shared::image_proc::gray_image_to_array2;
use shared::settings::FocusSettings;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "beam_focus")]
#[command(about = "Minimize the beam spot by tuning two quadrupole currents")]
#[command(version)]
struct Args {
    /// Settings and data root (defaults to ~/Documents/uFocus)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Also write logs to a dated file in the logs directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the optimizer against a simulated beamline
    Simulate {
        /// Frames per measurement (overrides the settings)
        #[arg(long)]
        images: Option<usize>,

        /// Noise seed for the simulated camera
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Delay between simulated frames in milliseconds
        #[arg(long, default_value = "0")]
        frame_interval_ms: u64,

        /// Q1 current giving the tightest spot, in amperes
        #[arg(long, default_value = "42.0")]
        q1_optimum: f64,

        /// Q2 current giving the tightest spot, in amperes
        #[arg(long, default_value = "57.0")]
        q2_optimum: f64,

        /// Write the run summary CSV to the data directory
        #[arg(long)]
        save_summary: bool,
    },

    /// Detect the beam ellipse in a set of PNG frames
    Detect {
        /// Frames to accumulate into one measurement
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Fixed threshold, -1 for automatic
        #[arg(long, default_value = "-1", allow_negative_numbers = true)]
        threshold: i32,

        /// Gaussian smoothing kernel size (odd)
        #[arg(long)]
        gaussian: Option<usize>,
    },

    /// Talk to the Genesys supplies directly
    Ps {
        /// Serial port device, e.g. /dev/ttyUSB0
        #[arg(long)]
        port: String,

        #[arg(long, default_value = "9600")]
        baud: u32,

        #[command(subcommand)]
        action: PsAction,
    },
}

#[derive(Subcommand, Debug)]
enum PsAction {
    /// Print measured and programmed values of both supplies
    Status,
    /// Print the identity string of both supplies
    Identify,
    /// Program both currents
    SetCurrent {
        /// Q1 current in amperes
        q1: f64,
        /// Q2 current in amperes
        q2: f64,
        /// Switch the outputs on or off as well
        #[arg(long)]
        output: Option<OutputState>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputState {
    On,
    Off,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing(log_dir: Option<&Path>) -> Result<()> {
    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let path = dir.join(format!(
                "beam_focus_{}.log",
                Local::now().format("%Y-%m-%d_%H-%M-%S")
            ));
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(env_filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter()))
        .with(file_layer)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let storage = match &args.root {
        Some(root) => ConfigStorage::with_path(root.clone()),
        None => ConfigStorage::new().context("Failed to locate the settings directory")?,
    };
    init_tracing(args.log_file.then(|| storage.logs_dir()).as_deref())?;

    match args.command {
        Command::Simulate {
            images,
            seed,
            frame_interval_ms,
            q1_optimum,
            q2_optimum,
            save_summary,
        } => {
            let mut settings = storage.load_settings().context("Failed to load settings")?;
            if let Some(images) = images {
                settings.accumulation.images_to_accumulate = images;
            }
            let model = BeamModel {
                optimum: [q1_optimum, q2_optimum],
                ..Default::default()
            };
            simulate(
                settings,
                model,
                seed,
                Duration::from_millis(frame_interval_ms),
                &storage.data_dir(),
                save_summary,
            )
        }
        Command::Detect {
            images,
            threshold,
            gaussian,
        } => detect(&images, threshold, gaussian),
        Command::Ps { port, baud, action } => {
            let settings = storage.load_settings().context("Failed to load settings")?;
            let channel =
                SerialPortChannel::open(&port, baud, settings.power_supply.read_timeout())?;
            let bus = GenesysBus::new(Box::new(channel));
            let addresses = [
                settings.power_supply.q1_address,
                settings.power_supply.q2_address,
            ];
            power_supply(bus, addresses, action)
        }
    }
}

fn simulate(
    settings: FocusSettings,
    model: BeamModel,
    seed: u64,
    frame_interval: Duration,
    data_dir: &Path,
    save_summary: bool,
) -> Result<()> {
    let beamline = SimulatedBeamline::new(model, &settings.power_supply);
    let supplies = PsController::connect(beamline.genesys_bus(), &settings.power_supply)?;
    let camera = beamline.camera(seed).with_frame_interval(frame_interval);

    let mut session = FocusSession::start(settings, Box::new(camera), supplies, data_dir)?;
    session.register_minimizer_callback(|event| {
        if let MinimizerEvent::StatsUpdated(stats) = event {
            info!(
                min_value = stats.objective.min_value,
                q1 = stats.currents.min[0],
                q2 = stats.currents.min[1],
                "Best so far"
            );
        }
    });

    session.start_minimization()?;
    let outcome = session.wait_for_minimization();
    if save_summary {
        session.save_summary()?;
    }
    session.shutdown();

    let result = outcome?;
    println!("status:      {} ({})", result.status.code(), result.status);
    println!("Q1, Q2 [A]:  {:.4}, {:.4}", result.x[0], result.x[1]);
    println!("cost:        {:.4}", result.fun);
    println!("iterations:  {}", result.nit);
    println!("evaluations: {}", result.nfev);
    println!(
        "expected:    {:.4}, {:.4}",
        model.optimum[0], model.optimum[1]
    );
    Ok(())
}

fn detect(paths: &[PathBuf], threshold: i32, gaussian: Option<usize>) -> Result<()> {
    let mut settings = FocusSettings::default().accumulation;
    settings.images_to_accumulate = paths.len();
    settings.threshold = threshold;
    if let Some(size) = gaussian {
        settings.gaussian_filter = true;
        settings.gaussian_kernel = size;
    }
    settings.validate()?;

    let rendezvous = Arc::new(Rendezvous::new());
    rendezvous.set_processing(true);
    let mut pipeline = AccumulationPipeline::new(&settings, rendezvous);

    for path in paths {
        let image = image::open(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
            .to_luma8();
        let frame = Frame::from_gray(gray_image_to_array2(&image));
        match pipeline.submit_frame(&frame)? {
            FrameOutcome::Batch(batch) => {
                println!(
                    "ellipse: {} (threshold {})",
                    batch.ellipse, batch.applied_threshold
                );
                if !batch.ellipse.is_null() {
                    println!("area:          {:.2}", batch.ellipse.area());
                    println!("circularity:   {:.4}", batch.ellipse.circularity());
                    println!("eccentricity:  {:.4}", batch.ellipse.eccentricity());
                }
                return Ok(());
            }
            FrameOutcome::Discarded => warn!("{} does not match the frame size", path.display()),
            _ => {}
        }
    }
    bail!("No batch was completed")
}

fn print_status(label: &str, status: &PsStatus) {
    let show = |value: Option<f64>| value.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
    println!(
        "{label}: MV {} V, PV {} V, MC {} A, PC {} A",
        show(status.measured_voltage),
        show(status.programmed_voltage),
        show(status.measured_current),
        show(status.programmed_current)
    );
}

fn power_supply(mut bus: GenesysBus, addresses: [u8; 2], action: PsAction) -> Result<()> {
    let labels = ["PS1", "PS2"];
    match action {
        PsAction::Status => {
            for (label, address) in labels.into_iter().zip(addresses) {
                let reply = bus.execute(address, &GenesysCommand::Status)?;
                print_status(label, &PsStatus::parse(&reply));
            }
        }
        PsAction::Identify => {
            for (label, address) in labels.into_iter().zip(addresses) {
                let identity = bus.execute(address, &GenesysCommand::Identity)?;
                println!("{label} (address {address}): {identity}");
            }
        }
        PsAction::SetCurrent { q1, q2, output } => {
            for (address, amps) in addresses.into_iter().zip([q1, q2]) {
                if let Some(state) = output {
                    let on = matches!(state, OutputState::On);
                    bus.execute(address, &GenesysCommand::SetOutput(on))?;
                }
                bus.execute(address, &GenesysCommand::SetCurrent(amps))?;
                info!(address, "Current set to {amps:.3} A");
            }
        }
    }
    Ok(())
}
