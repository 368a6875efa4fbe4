use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use luminia::calibration::CameraIntrinsics;
use luminia::camera::capture::ReadFailures;
use luminia::camera::{
    draw_face_box, draw_lines, ArucoDetector, HaarFaceDetector, OnnxFaceEmbedder, OpenCvCamera, OpenCvPoseSolver,
};
use luminia::catalog::Catalog;
use luminia::config::Config;
use luminia::dialogue::{DialogueSettings, DialogueStateMachine};
use luminia::face::FaceObserver;
use luminia::marker::MarkerTracker;
use luminia::pipeline::FramePipeline;
use luminia::render::{MinifbRenderer, PrimitiveModelFactory};
use luminia::store::JsonUserStore;
use luminia::voice::{ConsoleRecognizer, LogAnnouncer, VoiceIngestService, VoiceLink};

/// これを超えて連続で読めなければカメラは切断されたとみなす
const MAX_READ_FAILURES: u32 = 50;

/// Mundo de Luminia: AR learning game
#[derive(Parser, Debug)]
#[command(version = env!("GIT_VERSION"))]
struct Args {
    /// Path to the TOML configuration
    #[arg(long, default_value = "config.toml")]
    config: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("luminia=info")))
        .init();

    let args = Args::parse();
    info!("luminia {}", env!("GIT_VERSION"));
    let config = Config::load_or_default(&args.config);

    let mut camera = OpenCvCamera::open(&config.camera).context("Camera is required")?;
    let (width, height) = camera.resolution();
    let intrinsics = CameraIntrinsics::load_or_fallback(
        &config.camera.calibration_path,
        config.camera.calibration_camera,
        width,
        height,
    );

    let catalog = Catalog::from_entries(&config.catalog);
    let detector = ArucoDetector::new(&config.markers.dictionary)?;
    let tracker = MarkerTracker::new(
        Box::new(detector),
        intrinsics,
        config.markers.marker_length,
        config.markers.erase_margin,
    )
    .with_solver(Box::new(OpenCvPoseSolver));
    let factory = PrimitiveModelFactory::new(catalog.clone(), config.render.model_scale);
    let mut pipeline = FramePipeline::new(tracker, Box::new(factory), config.render.ambient, config.markers.erase);

    let mut faces = FaceObserver::new(
        Box::new(HaarFaceDetector::new(&config.face.cascade_path)?),
        Box::new(OnnxFaceEmbedder::new(&config.face)?),
    );

    let store = JsonUserStore::open(&config.store.path).context("Failed to open user store")?;
    let link = Arc::new(VoiceLink::new());
    let recognizer = ConsoleRecognizer::new()?;
    let mut voice = VoiceIngestService::spawn(Box::new(recognizer), Arc::clone(&link), config.voice.clone())?;
    info!("type utterances on stdin and press Enter");

    let mut machine = DialogueStateMachine::new(
        DialogueSettings::from_config(&config),
        Arc::new(catalog),
        Box::new(store),
        Box::new(LogAnnouncer::new(Arc::clone(&link))),
        Arc::clone(&link),
        StdRng::from_entropy(),
        Instant::now(),
    );

    let mut window = MinifbRenderer::new(&config.render.window_title, width as usize, height as usize)?;

    let mut failures = ReadFailures::new(MAX_READ_FAILURES, Duration::from_millis(50));

    while window.is_open() && !machine.is_finished() {
        let frame = match camera.read_frame() {
            Ok(f) => {
                failures.reset();
                f
            }
            Err(e) => {
                if !failures.record() {
                    voice.stop();
                    return Err(e.context(format!("camera lost after {} failed reads", failures.consecutive())));
                }
                debug!("camera read failed ({}): {:#}", failures.consecutive(), e);
                thread::sleep(failures.backoff());
                continue;
            }
        };
        let now = Instant::now();

        let tracked = pipeline.track(&frame);
        let visible = FramePipeline::visible(&tracked);
        // 顔は必要なフェーズでだけ検出する
        let sample = if machine.wants_face() { faces.observe(&frame) } else { None };

        machine.tick(now, &visible, sample.as_ref());

        let render = machine.markers_to_render(&visible);
        let mut display = pipeline.compose(&tracked, &render);
        if let Some(s) = &sample {
            draw_face_box(&mut display, s.face)?;
        }
        draw_lines(&mut display, &machine.display_lines(now), machine.error_message().is_some())?;

        window.draw_frame(&display);
        window.update()?;
    }

    info!("shutting down");
    voice.stop();
    if let Err(e) = camera.release() {
        warn!("{:#}", e);
    }
    pipeline.clear_scenes();
    Ok(())
}
