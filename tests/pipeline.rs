//! Path-tracing driver end to end on the host device.

use std::collections::HashSet;
use std::sync::Arc;

use wavefront_pt::compute::{BufferType, Device, DeviceExt, HostDevice, ParallelPrimitives};
use wavefront_pt::ray::{Intersection, PathState};
use wavefront_pt::renderer::{Output, OutputType, PtRenderer};
use wavefront_pt::scene::{demo, Scene};
use wavefront_pt::util::Vec3;

const SEED: u64 = 0x5eed;

fn renderer(device: &Arc<HostDevice>, bounces: u32) -> PtRenderer {
    PtRenderer::with_seed(device.clone(), bounces, SEED).unwrap()
}

fn colour_output(r: &mut PtRenderer, w: u32, h: u32) -> Output {
    let out = r.create_output(w, h).unwrap();
    r.set_output(OutputType::Color, out.clone()).unwrap();
    r.clear(Vec3::ZERO, &out).unwrap();
    out
}

fn count(log: &[String], name: &str) -> usize {
    log.iter().filter(|n| n.as_str() == name).count()
}

#[test]
fn test_empty_scene_is_background() {
    let device = Arc::new(HostDevice::new());
    let mut r = renderer(&device, 4);
    let out = colour_output(&mut r, 8, 8);
    let scene = demo::empty(Vec3::new(0.25, 0.5, 0.75)).unwrap();

    r.render(&scene).unwrap();

    assert_eq!(r.scene_controller().bvh_stats().unwrap().height, 0);
    for px in out.read(device.as_ref()).unwrap() {
        assert_eq!(px, [0.25, 0.5, 0.75, 1.0]);
    }

    let ws = r.working_set().unwrap();
    let isects: Vec<Intersection> = device.read_pod(&ws.intersections, 64).unwrap();
    assert!(isects.iter().all(|i| !i.is_hit()));
    assert_eq!(device.read_pod::<i32>(&ws.hitcount, 1).unwrap(), vec![0]);
}

#[test]
fn test_compaction_of_example_predicate() {
    let device: Arc<dyn Device> = Arc::new(HostDevice::new());
    let pp = ParallelPrimitives::new(device.clone()).unwrap();
    let hits = [1, 0, 1, 1, 0, 1, 0, 0];
    let iota: Vec<i32> = (0..8).collect();

    let predicate = device.create_buffer_from(BufferType::ReadWrite, &hits).unwrap();
    let input = device.create_buffer_from(BufferType::ReadWrite, &iota).unwrap();
    let output = device.create_buffer(32, BufferType::ReadWrite, None).unwrap();
    let hitcount = device.create_buffer(4, BufferType::ReadWrite, None).unwrap();
    pp.compact(0, &predicate, &input, &output, &hitcount).unwrap();

    assert_eq!(device.read_pod::<i32>(&hitcount, 1).unwrap(), vec![4]);
    assert_eq!(device.read_pod::<i32>(&output, 4).unwrap(), vec![0, 2, 3, 5]);
}

#[test]
fn test_fixed_seed_is_deterministic() {
    let scene = demo::cornell_box().unwrap();
    let frames: Vec<Vec<[f32; 4]>> = (0..2)
        .map(|_| {
            let device = Arc::new(HostDevice::new());
            let mut r = renderer(&device, 4);
            let out = colour_output(&mut r, 16, 16);
            r.render(&scene).unwrap();
            r.render(&scene).unwrap();
            out.read(device.as_ref()).unwrap()
        })
        .collect();

    assert_eq!(frames[0], frames[1]);
    // Two samples per pixel, some light reached the camera
    assert!(frames[0].iter().all(|p| p[3] == 2.0));
    assert!(frames[0].iter().any(|p| p[0] > 0.0));
}

#[test]
fn test_background_shaded_once_per_frame() {
    let device = Arc::new(HostDevice::new());
    let mut r = renderer(&device, 4);
    colour_output(&mut r, 16, 16);
    let scene = demo::instances(4).unwrap();

    device.clear_dispatch_log();
    r.render(&scene).unwrap();
    let log = device.dispatch_log();

    assert_eq!(count(&log, "ShadeBackgroundEnvMap"), 1);
    assert_eq!(count(&log, "ShadeMiss"), 3);
    assert_eq!(count(&log, "ShadeSurface"), 4);
    assert_eq!(count(&log, "intersect_main"), 4);
    assert_eq!(count(&log, "occluded_main"), 4);
    assert_eq!(count(&log, "compact_int"), 4);
    assert_eq!(count(&log, "PerspectiveCamera_GeneratePaths"), 1);
    assert_eq!(count(&log, "FillAOVs"), 0);
}

#[test]
fn test_pixel_indices_stay_a_subset() {
    let device = Arc::new(HostDevice::new());
    let mut r = renderer(&device, 2);
    colour_output(&mut r, 16, 16);
    r.render(&demo::cornell_box().unwrap()).unwrap();

    let n = 256;
    let ws = r.working_set().unwrap();
    let hitcount = device.read_pod::<i32>(&ws.hitcount, 1).unwrap()[0] as usize;
    assert!(hitcount > 0 && hitcount <= n);

    // Last pass was 1: the post-compaction view lives in pixelindices[1]
    let pixels = device.read_pod::<i32>(&ws.pixelindices[1], hitcount).unwrap();
    let unique: HashSet<i32> = pixels.iter().copied().collect();
    assert_eq!(unique.len(), hitcount);
    assert!(pixels.iter().all(|&p| (0..n as i32).contains(&p)));

    let compacted = device.read_pod::<i32>(&ws.compacted_indices, hitcount).unwrap();
    assert!(compacted.windows(2).all(|w| w[0] < w[1]));

    let paths: Vec<PathState> = device.read_pod(&ws.paths, n).unwrap();
    let alive = paths.iter().filter(|p| p.is_alive()).count();
    assert!(alive <= hitcount);
}

#[test]
fn test_resize_up_then_down() {
    let device = Arc::new(HostDevice::new());
    let mut r = renderer(&device, 1);

    let small = r.create_output(256, 256).unwrap();
    r.set_output(OutputType::Color, small).unwrap();
    let first = r.vidmemws();
    assert!(first > 0);

    let large = r.create_output(512, 512).unwrap();
    r.set_output(OutputType::Color, large).unwrap();
    assert_eq!(r.vidmemws(), first * 4);

    let tiny = r.create_output(128, 128).unwrap();
    let before = device.buffers_created();
    r.set_output(OutputType::Color, tiny.clone()).unwrap();
    assert_eq!(device.buffers_created(), before);
    assert_eq!(r.vidmemws(), first * 4);

    let ws = r.working_set().unwrap();
    assert_eq!((ws.width, ws.height), (512, 512));

    r.clear(Vec3::ZERO, &tiny).unwrap();
    r.render(&demo::empty(Vec3::ONE).unwrap()).unwrap();
    assert!(tiny.read(device.as_ref()).unwrap().iter().all(|p| p[3] == 1.0));
}

#[test]
fn test_aov_pass_without_colour() {
    let device = Arc::new(HostDevice::new());
    let mut r = renderer(&device, 3);
    let albedo = r.create_output(8, 8).unwrap();
    let depth = r.create_output(8, 8).unwrap();
    r.set_output(OutputType::Albedo, albedo.clone()).unwrap();
    r.set_output(OutputType::Depth, depth.clone()).unwrap();

    let scene: Scene = demo::cornell_box().unwrap();
    device.clear_dispatch_log();
    r.render(&scene).unwrap();
    let log = device.dispatch_log();
    assert_eq!(count(&log, "FillAOVs"), 1);
    assert_eq!(count(&log, "ShadeSurface"), 0);
    assert_eq!(r.framecnt(), 1);

    // Every pixel counts a sample, hit or not
    let albedo = albedo.read(device.as_ref()).unwrap();
    assert!(albedo.iter().all(|p| p[3] == 1.0));
    assert!(albedo.iter().any(|p| p[0] > p[1]), "red wall visible");

    // Centre of the image looks into the box
    let depth = depth.read(device.as_ref()).unwrap();
    for i in [27, 28, 35, 36] {
        assert!(depth[i][0] > 2.0 && depth[i][0] < 6.0, "depth {:?}", depth[i]);
    }
}
