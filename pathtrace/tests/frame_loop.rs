mod common;

use common::*;
use pathtrace::prelude::*;
use pathtrace::recording::{Event, RecordingBackend};
use std::sync::Arc;

const SIZE: UVec2 = UVec2 { x: 64, y: 32 };

fn cornell_like_scene(backend: &Arc<RecordingBackend>) -> TestScene {
    TestScene::new()
        .with_mesh(backend, 4, &["Wall", "RedWall"])
        .with_mesh(backend, 2, &["Light"])
}

#[test]
fn sixteen_frames_reach_max_samples() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(64, 4));

    let counts: Vec<u32> = (0..16)
        .map(|_| tracer.render_frame(&frame(SIZE)).unwrap().sample_count)
        .collect();
    assert_eq!(counts, (1..=16).map(|k| 4 * k).collect::<Vec<u32>>());

    let stats = tracer.render_frame(&frame(SIZE)).unwrap();
    assert_eq!(stats.sample_count, 64);
    assert!(stats.converged);
}

#[test]
fn converged_frames_leave_the_count_alone() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(10, 3));

    for _ in 0..4 {
        tracer.render_frame(&frame(SIZE)).unwrap();
    }
    for _ in 0..5 {
        let stats = tracer.render_frame(&frame(SIZE)).unwrap();
        assert_eq!(stats.sample_count, 10);
        assert!(stats.converged);
    }
    assert_eq!(tracer.accumulation().state(), AccumulationState::Accumulating(10));
}

#[test]
fn camera_change_restarts_accumulation() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(64, 4));

    for _ in 0..5 {
        tracer.render_frame(&frame(SIZE)).unwrap();
    }
    let moved = FrameInput {
        camera_changed: true,
        ..frame(SIZE)
    };
    assert_eq!(tracer.render_frame(&moved).unwrap().sample_count, 4);
    assert_eq!(tracer.render_frame(&frame(SIZE)).unwrap().sample_count, 8);
}

#[test]
fn dispatch_sees_the_returned_sample_count() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(12, 4));
    backend.clear_events();

    let counts: Vec<u32> = (0..4)
        .map(|_| tracer.render_frame(&frame(SIZE)).unwrap().sample_count)
        .collect();

    let dispatched: Vec<(u32, bool)> = backend
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::TraceRays {
                size,
                uniforms,
                top_level_built,
                ..
            } => {
                assert_eq!(*size, SIZE);
                Some((uniforms.unwrap().current_sample_count, *top_level_built))
            }
            _ => None,
        })
        .collect();
    assert_eq!(dispatched.len(), counts.len());
    for ((sample_count, top_level_built), expected) in dispatched.into_iter().zip(counts) {
        assert_eq!(sample_count, expected);
        assert!(top_level_built);
    }
}

#[test]
fn each_frame_retires_before_the_next_uniform_write() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(64, 4));
    backend.clear_events();

    for _ in 0..3 {
        tracer.render_frame(&frame(SIZE)).unwrap();
    }
    let events = backend.events();
    assert_eq!(events.len(), 6);
    for pair in events.chunks(2) {
        assert!(matches!(pair[0], Event::Submit { command_count: 1 }));
        assert!(matches!(pair[1], Event::TraceRays { .. }));
    }
}

#[test]
fn dispatch_uses_table_regions() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(8, 4));
    let expected = tracer.scene().unwrap().shader_binding_table().trace_regions();
    backend.clear_events();

    tracer.render_frame(&frame(SIZE)).unwrap();
    let regions = backend
        .events()
        .iter()
        .find_map(|e| match e {
            Event::TraceRays { regions, .. } => Some(*regions),
            _ => None,
        })
        .unwrap();
    assert_eq!(regions, expected);
    assert_eq!(regions.miss.device_address - regions.raygen.device_address, 64);
    assert_eq!(regions.hit.device_address - regions.raygen.device_address, 128);
    assert_eq!(regions.callable.size, 0);
}

#[test]
fn resize_rebinds_only_the_images() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(64, 4));
    for _ in 0..3 {
        tracer.render_frame(&frame(SIZE)).unwrap();
    }
    backend.clear_events();

    let new_size = UVec2::new(128, 96);
    let stats = tracer
        .render_frame(&FrameInput {
            resized: true,
            ..frame(new_size)
        })
        .unwrap();
    assert_eq!(stats.sample_count, 4);

    let events = backend.events();
    let updates: Vec<Vec<u32>> = events
        .iter()
        .filter_map(|e| match e {
            Event::UpdateBindingSet { bindings, .. } => Some(bindings.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![vec![1, 2]]);

    let created: Vec<UVec2> = events
        .iter()
        .filter_map(|e| match e {
            Event::CreateImage { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(created, vec![new_size, new_size]);
    assert_eq!(
        events.iter().filter(|e| matches!(e, Event::DestroyImage { .. })).count(),
        2
    );
    assert_eq!(backend.live_image_count(), 2);
    assert!(events
        .iter()
        .all(|e| !matches!(e, Event::Build { .. } | Event::CreatePipeline { .. })));
}

#[test]
fn unchanged_size_keeps_the_images() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(64, 4));
    backend.clear_events();

    tracer.render_frame(&frame(SIZE)).unwrap();
    assert!(backend
        .events()
        .iter()
        .all(|e| !matches!(e, Event::CreateImage { .. } | Event::UpdateBindingSet { .. })));
}

#[test]
fn failed_frame_resets_accumulation() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(64, 4));
    for _ in 0..3 {
        tracer.render_frame(&frame(SIZE)).unwrap();
    }

    backend.set_fail_submissions(true);
    let err = tracer.render_frame(&frame(SIZE)).unwrap_err();
    assert!(matches!(err, Error::Backend { .. }));
    assert_eq!(tracer.accumulation().state(), AccumulationState::Reset);

    backend.set_fail_submissions(false);
    assert_eq!(tracer.render_frame(&frame(SIZE)).unwrap().sample_count, 4);
}

#[test]
fn rendering_before_preparation_is_rejected() {
    let backend = Arc::new(RecordingBackend::new());
    let mut tracer = PathTracer::new(Arc::clone(&backend), params(SIZE, RenderOptions::default())).unwrap();

    let err = tracer.render_frame(&frame(SIZE)).unwrap_err();
    assert!(matches!(err, Error::BuildOrderViolation(_)));
    assert!(backend
        .events()
        .iter()
        .all(|e| !matches!(e, Event::TraceRays { .. })));
}

#[test]
fn disabled_accumulation_renders_single_batches() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let options = RenderOptions {
        accumulate: false,
        ..options(64, 4)
    };
    let mut tracer = prepared_tracer(&backend, &scene, options);

    for _ in 0..3 {
        assert_eq!(tracer.render_frame(&frame(SIZE)).unwrap().sample_count, 4);
    }
}

#[test]
fn option_changes_reset_unless_only_the_ceiling_moves() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(64, 4));
    for _ in 0..3 {
        tracer.render_frame(&frame(SIZE)).unwrap();
    }

    tracer.set_options(options(128, 4)).unwrap();
    assert_eq!(tracer.render_frame(&frame(SIZE)).unwrap().sample_count, 16);

    tracer
        .set_options(RenderOptions {
            ray_bounces: 2,
            ..options(128, 4)
        })
        .unwrap();
    assert_eq!(tracer.render_frame(&frame(SIZE)).unwrap().sample_count, 4);
}

#[test]
fn invalid_options_are_rejected() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = cornell_like_scene(&backend);
    let mut tracer = prepared_tracer(&backend, &scene, options(64, 4));

    let err = tracer.set_options(options(64, 0)).unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
    assert_eq!(tracer.accumulation().options().samples_per_frame, 4);
}
