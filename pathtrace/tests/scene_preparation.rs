mod common;

use common::*;
use pathtrace::prelude::*;
use pathtrace::recording::{Event, RecordingBackend};
use std::sync::Arc;

fn position(events: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    events.iter().position(pred).expect("event not recorded")
}

#[test]
fn build_sizes_are_queried_before_storage_is_allocated() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new().with_mesh(&backend, 2, &["Wall"]);
    backend.clear_events();

    let _tracer = prepared_tracer(&backend, &scene, RenderOptions::default());
    let events = backend.events();
    let expected = RecordingBackend::build_sizes_for(AccelerationStructureLevel::Bottom, 2);

    let query = position(&events, |e| {
        matches!(e, Event::QueryBuildSizes { level: AccelerationStructureLevel::Bottom, primitive_count: 2, .. })
    });
    let storage = position(&events, |e| {
        matches!(e, Event::CreateBuffer { usage, .. } if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE))
    });
    assert!(query < storage);
    match &events[storage] {
        Event::CreateBuffer { size, .. } => assert_eq!(*size, expected.acceleration_structure_size),
        _ => unreachable!(),
    }

    let build = position(&events, |e| {
        matches!(e, Event::Build { level: AccelerationStructureLevel::Bottom, .. })
    });
    match &events[build] {
        Event::Build {
            scratch_size,
            on_host,
            primitive_count,
            ..
        } => {
            assert_eq!(*scratch_size, Some(expected.build_scratch_size));
            assert!(!on_host);
            assert_eq!(*primitive_count, 2);
        }
        _ => unreachable!(),
    }
}

#[test]
fn bottom_level_geometry_allows_any_hit_once() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new()
        .with_mesh(&backend, 2, &["Wall"])
        .with_mesh(&backend, 1, &["Light"]);
    backend.clear_events();

    let _tracer = prepared_tracer(&backend, &scene, RenderOptions::default());
    let flags: Vec<GeometryFlags> = backend
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::QueryBuildSizes {
                level: AccelerationStructureLevel::Bottom,
                flags,
                ..
            } => Some(*flags),
            _ => None,
        })
        .collect();
    assert_eq!(flags.len(), 2);
    for flags in flags {
        assert!(flags.contains(GeometryFlags::NO_DUPLICATE_ANY_HIT_INVOCATION));
        assert!(!flags.contains(GeometryFlags::OPAQUE));
    }
}

#[test]
fn scratch_is_released_after_its_build() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new().with_mesh(&backend, 4, &["Wall"]);
    backend.clear_events();

    let _tracer = prepared_tracer(&backend, &scene, RenderOptions::default());
    let events = backend.events();
    let scratch_size = RecordingBackend::build_sizes_for(AccelerationStructureLevel::Bottom, 4).build_scratch_size;

    let scratch = events
        .iter()
        .find_map(|e| match e {
            Event::CreateBuffer { buffer, size, usage, .. }
                if *size == scratch_size && *usage == BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS =>
            {
                Some(*buffer)
            }
            _ => None,
        })
        .expect("scratch buffer not created");
    let build = position(&events, |e| {
        matches!(e, Event::Build { level: AccelerationStructureLevel::Bottom, .. })
    });
    let release = position(&events, |e| matches!(e, Event::DestroyBuffer { buffer } if *buffer == scratch));
    assert!(build < release);
}

#[test]
fn top_level_references_only_completed_bottom_levels() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new()
        .with_mesh(&backend, 1, &["Wall"])
        .with_mesh(&backend, 2, &["Wall"])
        .with_mesh(&backend, 3, &["Light"]);
    backend.clear_events();

    let tracer = prepared_tracer(&backend, &scene, RenderOptions::default());
    let events = backend.events();

    let top = position(&events, |e| matches!(e, Event::Build { level: AccelerationStructureLevel::Top, .. }));
    let bottom_builds: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, Event::Build { level: AccelerationStructureLevel::Bottom, .. }))
        .map(|(index, _)| index)
        .collect();
    assert_eq!(bottom_builds.len(), 3);
    assert!(bottom_builds.iter().all(|&index| index < top));

    match &events[top] {
        Event::Build { referenced_blas, .. } => {
            assert_eq!(referenced_blas.len(), 3);
            assert!(referenced_blas.iter().all(|blas| blas.built));
            let custom_indices: Vec<u32> = referenced_blas.iter().map(|blas| blas.custom_index).collect();
            assert_eq!(custom_indices, vec![0, 1, 2]);

            let prepared = tracer.scene().unwrap();
            let addresses: Vec<DeviceAddress> = prepared.bottom_levels().iter().map(|b| b.device_address()).collect();
            let referenced: Vec<DeviceAddress> = referenced_blas.iter().map(|blas| blas.address).collect();
            assert_eq!(referenced, addresses);
        }
        _ => unreachable!(),
    }

    // addresses are only read once a build has completed
    assert!(events
        .iter()
        .all(|e| !matches!(e, Event::AccelerationStructureAddress { built: false, .. })));
}

#[test]
fn material_pointers_follow_material_counts() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new()
        .with_mesh(&backend, 1, &["Wall", "Floor"])
        .with_mesh(&backend, 1, &["Wall", "Floor", "Ceiling"])
        .with_mesh(&backend, 1, &["Light"]);

    let tracer = prepared_tracer(&backend, &scene, RenderOptions::default());
    let prepared = tracer.scene().unwrap();
    let base = prepared.material_base_address().unwrap();

    let offsets: Vec<u64> = prepared
        .scene_descriptors()
        .records()
        .iter()
        .map(|record| record.material_address - base)
        .collect();
    assert_eq!(
        offsets,
        vec![0, 2 * MaterialRecord::SIZE, 5 * MaterialRecord::SIZE]
    );

    let uploaded = backend.buffer_contents(prepared.scene_descriptors().buffer()).unwrap();
    let expected: &[u8] = bytemuck::cast_slice(prepared.scene_descriptors().records());
    assert_eq!(&uploaded[..expected.len()], expected);
}

#[test]
fn light_materials_are_tagged_by_name() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new()
        .with_mesh(&backend, 1, &["Wall"])
        .with_mesh(&backend, 1, &["Light"]);

    let tracer = prepared_tracer(&backend, &scene, RenderOptions::default());
    let kinds: Vec<MaterialKind> = tracer
        .scene()
        .unwrap()
        .material_table()
        .records()
        .iter()
        .map(|record| record.kind())
        .collect();
    assert_eq!(kinds, vec![MaterialKind::Lambertian, MaterialKind::Light]);
}

#[test]
fn empty_scene_prepares_and_renders() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new();
    backend.clear_events();

    let mut tracer = prepared_tracer(&backend, &scene, options(8, 4));
    let events = backend.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Build { level: AccelerationStructureLevel::Top, primitive_count: 0, .. })));
    assert!(tracer.scene().unwrap().bottom_levels().is_empty());

    let stats = tracer.render_frame(&frame(UVec2::new(64, 32))).unwrap();
    assert_eq!(stats.sample_count, 4);
}

#[test]
fn mismatched_vertex_strides_are_rejected() {
    let backend = Arc::new(RecordingBackend::new());
    let mut scene = TestScene::new()
        .with_mesh(&backend, 1, &["Wall"])
        .with_mesh(&backend, 1, &["Wall"]);
    scene.meshes[1].mesh.vertex_stride = 2 * VERTEX_STRIDE;

    let mut tracer = PathTracer::new(Arc::clone(&backend), params(UVec2::new(8, 8), RenderOptions::default())).unwrap();
    let err = tracer.prepare_scene(&scene.meshes, &[]).unwrap_err();
    assert!(matches!(err, Error::InvalidMesh(_)));
    assert!(tracer.scene().is_none());
}

#[test]
fn allocation_failure_keeps_no_partial_scene() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new().with_mesh(&backend, 2, &["Wall"]);
    let scene_buffers = backend.live_buffer_count();

    let mut tracer = PathTracer::new(Arc::clone(&backend), params(UVec2::new(8, 8), RenderOptions::default())).unwrap();
    backend.set_allocation_limit(Some(1000));
    let err = tracer.prepare_scene(&scene.meshes, &[]).unwrap_err();
    assert!(matches!(err, Error::Allocation { .. }));

    assert!(tracer.scene().is_none());
    assert_eq!(backend.live_buffer_count(), scene_buffers);
    assert_eq!(backend.live_acceleration_structure_count(), 0);
    assert!(matches!(
        tracer.render_frame(&frame(UVec2::new(8, 8))),
        Err(Error::BuildOrderViolation(_))
    ));
}

#[test]
fn host_builds_run_without_submission() {
    let properties = RecordingBackend::new().ray_tracing_properties();
    let backend = Arc::new(RecordingBackend::with_properties(properties, true));
    let scene = TestScene::new()
        .with_mesh(&backend, 2, &["Wall"])
        .with_mesh(&backend, 1, &["Light"]);
    backend.clear_events();

    let tracer = prepared_tracer(&backend, &scene, RenderOptions::default());
    assert_eq!(tracer.build_mode(), BuildMode::Host);

    let builds: Vec<(AccelerationStructureLevel, bool)> = backend
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::Build { level, on_host, .. } => Some((*level, *on_host)),
            _ => None,
        })
        .collect();
    assert_eq!(builds.len(), 3);
    assert!(builds.iter().all(|&(_, on_host)| on_host));
    assert_eq!(builds[2].0, AccelerationStructureLevel::Top);
}

#[test]
fn device_preference_overrides_host_support() {
    let properties = RecordingBackend::new().ray_tracing_properties();
    let backend = Arc::new(RecordingBackend::with_properties(properties, true));
    let scene = TestScene::new().with_mesh(&backend, 1, &["Wall"]);
    backend.clear_events();

    let mut tracer = PathTracer::new(
        Arc::clone(&backend),
        PathTracerParams {
            build_preference: BuildPreference::Device,
            ..params(UVec2::new(8, 8), RenderOptions::default())
        },
    )
    .unwrap();
    tracer.prepare_scene(&scene.meshes, &[]).unwrap();

    assert_eq!(tracer.build_mode(), BuildMode::Device);
    assert!(backend
        .events()
        .iter()
        .all(|e| !matches!(e, Event::Build { on_host: true, .. })));
}

#[test]
fn host_preference_falls_back_to_device() {
    let backend = Arc::new(RecordingBackend::new());
    let tracer = PathTracer::new(
        Arc::clone(&backend),
        PathTracerParams {
            build_preference: BuildPreference::Host,
            ..params(UVec2::new(8, 8), RenderOptions::default())
        },
    )
    .unwrap();
    assert_eq!(tracer.build_mode(), BuildMode::Device);
}

#[test]
fn textures_are_bound_after_scene_slots() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new().with_mesh(&backend, 1, &["Wall"]);
    let textures = [backend.create_sampled_image(), backend.create_sampled_image()];
    backend.clear_events();

    let mut tracer = PathTracer::new(Arc::clone(&backend), params(UVec2::new(8, 8), RenderOptions::default())).unwrap();
    tracer.prepare_scene(&scene.meshes, &textures).unwrap();

    let events = backend.events();
    let layout = events
        .iter()
        .find_map(|e| match e {
            Event::CreateBindingSet { layout, .. } => Some(layout.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(layout.len(), 6);
    assert_eq!(layout[5], BindingKind::SampledImageArray { count: 2 });

    let bindings = events
        .iter()
        .find_map(|e| match e {
            Event::UpdateBindingSet { bindings, .. } => Some(bindings.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(bindings, vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn dropping_the_tracer_releases_scene_resources() {
    let backend = Arc::new(RecordingBackend::new());
    let scene = TestScene::new()
        .with_mesh(&backend, 2, &["Wall"])
        .with_mesh(&backend, 1, &["Light"]);
    let scene_buffers = backend.live_buffer_count();

    let mut tracer = prepared_tracer(&backend, &scene, options(16, 4));
    tracer.render_frame(&frame(UVec2::new(64, 32))).unwrap();
    assert_eq!(backend.live_acceleration_structure_count(), 3);
    assert_eq!(backend.live_image_count(), 2);

    drop(tracer);
    assert_eq!(backend.live_acceleration_structure_count(), 0);
    assert_eq!(backend.live_image_count(), 0);
    assert_eq!(backend.live_buffer_count(), scene_buffers);

    drop(scene);
    assert_eq!(backend.live_buffer_count(), 0);
}
