mod scene;

use crate::scene::*;
use pathtrace::prelude::*;
use pathtrace::recording::RecordingBackend;
use pathtrace::vulkan::{try_version_from_str, ContextParams, VulkanBackend};
use spark::vk;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use strum::VariantNames;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(no_version)]
struct AppParams {
    /// Core Vulkan version to load
    #[structopt(short, long, parse(try_from_str=try_version_from_str), default_value="1.2")]
    version: vk::Version,

    /// Forward validation messages to the log
    #[structopt(short, long)]
    debug: bool,

    /// Where acceleration structures are built
    #[structopt(long, possible_values=&BuildPreference::VARIANTS, default_value="auto")]
    build: BuildPreference,

    /// Width of the output image
    #[structopt(long, default_value = "1024")]
    width: u32,

    /// Height of the output image
    #[structopt(long, default_value = "768")]
    height: u32,

    /// Number of frames to render, stopping early once converged
    #[structopt(short, long, default_value = "64")]
    frames: u32,

    /// Directory holding the compiled ray tracing shaders
    #[structopt(long, parse(from_os_str), default_value = "spv/bin")]
    shader_dir: PathBuf,

    /// Record backend calls instead of rendering on a device
    #[structopt(long)]
    dry_run: bool,

    #[structopt(flatten)]
    render: RenderOptions,
}

fn run<B: Backend>(backend: Arc<B>, params: &AppParams) -> Result<()> {
    let size = UVec2::new(params.width, params.height);

    // declared first so that geometry outlives every structure built from it
    let scene = CornellBox::new(&backend)?;
    let mut tracer = PathTracer::new(
        backend,
        PathTracerParams {
            shaders: ShaderPaths::in_dir(&params.shader_dir),
            build_preference: params.build,
            size,
            options: params.render.clone(),
        },
    )?;
    tracer.prepare_scene(scene.meshes(), &[])?;

    let camera = CornellBox::<B>::camera(size);
    let mut failed_frames = 0;
    for frame_index in 0..params.frames {
        let frame = FrameInput {
            camera,
            size,
            camera_changed: false,
            resized: false,
        };
        match tracer.render_frame(&frame) {
            Ok(stats) => {
                info!(frame_index, sample_count = stats.sample_count, "rendered frame");
                if stats.converged {
                    info!(sample_count = stats.sample_count, "converged");
                    break;
                }
            }
            Err(err) => {
                warn!(frame_index, %err, "frame failed");
                failed_frames += 1;
            }
        }
    }

    info!(
        sample_count = tracer.accumulation().sample_count(),
        failed_frames, "finished"
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let params = AppParams::from_args();
    if params.dry_run {
        run(Arc::new(RecordingBackend::new()), &params)
    } else {
        let backend = VulkanBackend::new(&ContextParams {
            version: params.version,
            is_debug: params.debug,
        })?;
        run(Arc::new(backend), &params)
    }
}
