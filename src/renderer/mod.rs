//! Wavefront path-tracing driver.
//!
//! A frame is a fixed number of bounces over ray streams held in device
//! memory. Each bounce intersects the current stream, drops dead paths by
//! stream compaction and shades the survivors into a dense next stream plus
//! one shadow ray per path:
//!
//! ```text
//! camera -> rays[0]
//! for pass: intersect rays[pass&1] -> filter -> compact -> restore pixels
//!           -> shade (writes rays[(pass+1)&1], shadowrays) -> occlude -> gather
//! ```
//!
//! `pixelindices[(pass+1)&1]` maps dense slots to pixels before compaction,
//! `pixelindices[pass&1]` after it.
//!
//! ## Usage
//! ```ignore
//! let mut renderer = PtRenderer::new(device.clone(), 5)?;
//! let out = renderer.create_output(640, 480)?;
//! renderer.set_output(OutputType::Color, out.clone())?;
//! renderer.clear(Vec3::ZERO, &out)?;
//! for _ in 0..64 {
//!     renderer.render(&scene)?;
//! }
//! let pixels = renderer.resolve_rgba8(&out, 2.2)?;
//! ```

pub mod kernels;
pub mod output;
pub mod working_set;

use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::api::IntersectionApi;
use crate::compute::{
    select_source, Buffer, BufferType, BuildOptions, Device, DeviceExt, Function,
    ParallelPrimitives, WorkSize,
};
use crate::scene::{CompiledScene, Scene, SceneController};
use crate::util::{align_up, Error, Result, Vec3};

pub use kernels::PT_LIBRARY;
pub use output::{Output, OutputType};
pub use working_set::{WorkingSet, MAX_LIGHT_SAMPLES};

/// Local size of 1-D launches.
const GROUP_SIZE: usize = 64;
/// Tile edge of 2-D launches.
const TILE_SIZE: usize = 8;

#[cfg(feature = "embed-kernels")]
const EMBEDDED: Option<&str> = Some(crate::embedded::PATH_TRACING);
#[cfg(not(feature = "embed-kernels"))]
const EMBEDDED: Option<&str> = None;

const KERNEL_NAMES: [&str; 13] = [
    "PerspectiveCamera_GeneratePaths",
    "PerspectiveCameraDof_GeneratePaths",
    "EvaluateVolume",
    "FilterPathStream",
    "RestorePixelIndices",
    "ShadeVolume",
    "ShadeSurface",
    "ShadeBackgroundEnvMap",
    "ShadeMiss",
    "GatherLightSamples",
    "FillAOVs",
    "ApplyGammaAndCopyData",
    "AccumulateData",
];

/// Bind positional arguments starting at 0.
macro_rules! set_args {
    ($f:expr; $($arg:expr),+ $(,)?) => {{
        let f: &Function = $f;
        let mut i = 0usize;
        $(
            f.set_arg(i, $arg);
            i += 1;
        )+
        let _ = i;
    }};
}

/// Build options of the integrator program: the host platform define.
pub fn default_build_options() -> BuildOptions {
    let options = BuildOptions::new();
    if cfg!(target_os = "macos") {
        options.define("APPLE")
    } else if cfg!(target_os = "windows") {
        options.define("WIN32")
    } else if cfg!(target_os = "linux") {
        options.define("__linux__")
    } else {
        options
    }
}

/// Ray throughput timings from [`PtRenderer::run_benchmark`], averaged per pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BenchmarkStats {
    pub num_passes: u32,
    pub resolution: (u32, u32),
    pub primary_rays_time_in_ms: f64,
    pub shadow_rays_time_in_ms: f64,
    pub secondary_rays_time_in_ms: f64,
}

impl BenchmarkStats {
    /// Millions of rays per second for a stage timing.
    pub fn mrays_per_second(&self, time_in_ms: f64) -> f64 {
        let rays = self.resolution.0 as f64 * self.resolution.1 as f64;
        if time_in_ms > 0.0 {
            rays / (time_in_ms * 1e3)
        } else {
            0.0
        }
    }
}

/// Wavefront path tracer bound to one device.
pub struct PtRenderer {
    device: Arc<dyn Device>,
    controller: SceneController,
    functions: HashMap<&'static str, Function>,
    pp: ParallelPrimitives,
    sobolmat: Buffer,
    /// Bound in place of disabled AOV slots.
    dummy: Buffer,
    ws: Option<WorkingSet>,
    outputs: [Option<Output>; OutputType::COUNT],
    num_bounces: u32,
    framecnt: i32,
    rng: Mutex<SmallRng>,
}

impl std::fmt::Debug for PtRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtRenderer")
            .field("num_bounces", &self.num_bounces)
            .field("framecnt", &self.framecnt)
            .field("vidmemws", &self.vidmemws())
            .finish()
    }
}

impl PtRenderer {
    /// Renderer with `num_bounces` bounces per frame and an entropy seed.
    pub fn new(device: Arc<dyn Device>, num_bounces: u32) -> Result<Self> {
        Self::with_seed(device, num_bounces, rand::random())
    }

    /// Renderer whose host seeds come from `seed`; two renderers with the
    /// same seed produce identical frames.
    pub fn with_seed(device: Arc<dyn Device>, num_bounces: u32, seed: u64) -> Result<Self> {
        let source = select_source(device.platform(), &PT_LIBRARY, "integrator_pt.wgsl", EMBEDDED);
        let exe = device.compile_executable(&source, &default_build_options())?;
        let functions = KERNEL_NAMES
            .iter()
            .map(|&name| Ok((name, exe.create_function(name)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        let sobolmat = device.create_buffer_from(BufferType::Read, &sobol::matrices32())?;
        let dummy = device.create_buffer(16, BufferType::ReadWrite, None)?;

        Ok(Self {
            controller: SceneController::new(device.clone())?,
            pp: ParallelPrimitives::new(device.clone())?,
            device,
            functions,
            sobolmat,
            dummy,
            ws: None,
            outputs: Default::default(),
            num_bounces,
            framecnt: 0,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn scene_controller(&self) -> &SceneController {
        &self.controller
    }

    /// Accelerator options set here apply at the next geometry rebuild.
    pub fn scene_controller_mut(&mut self) -> &mut SceneController {
        &mut self.controller
    }

    pub fn intersection_api(&self) -> &IntersectionApi {
        self.controller.intersection_api()
    }

    pub fn num_bounces(&self) -> u32 {
        self.num_bounces
    }

    pub fn set_num_bounces(&mut self, num_bounces: u32) {
        self.num_bounces = num_bounces;
    }

    /// Frames accumulated since the last [`clear`](Self::clear).
    pub fn framecnt(&self) -> i32 {
        self.framecnt
    }

    /// Bytes held by the working set.
    pub fn vidmemws(&self) -> usize {
        self.ws.as_ref().map_or(0, |ws| ws.vidmemws)
    }

    pub fn working_set(&self) -> Option<&WorkingSet> {
        self.ws.as_ref()
    }

    pub fn create_output(&self, width: u32, height: u32) -> Result<Output> {
        Output::new(self.device.as_ref(), width, height)
    }

    pub fn output(&self, kind: OutputType) -> Option<&Output> {
        self.outputs[kind.index()].as_ref()
    }

    /// Bind `output` to a slot. The working set grows when the slot was empty
    /// or held a smaller image and the new size does not fit; it never
    /// shrinks.
    pub fn set_output(&mut self, kind: OutputType, output: Output) -> Result<()> {
        let (w, h) = (output.width(), output.height());
        let grows = match &self.outputs[kind.index()] {
            None => true,
            Some(old) => old.width() < w || old.height() < h,
        };
        let fits = self.ws.as_ref().is_some_and(|ws| ws.fits(w, h));

        if grows && !fits {
            let (ws_w, ws_h) = self.ws.as_ref().map_or((0, 0), |ws| (ws.width, ws.height));
            // The old set stays bound if this allocation fails
            let ws = WorkingSet::new(
                self.device.as_ref(),
                self.controller.intersection_api(),
                ws_w.max(w),
                ws_h.max(h),
                &mut *self.rng.lock(),
            )?;
            self.ws = Some(ws);
        }

        self.outputs[kind.index()] = Some(output);
        Ok(())
    }

    pub fn remove_output(&mut self, kind: OutputType) -> Option<Output> {
        self.outputs[kind.index()].take()
    }

    /// Reset `output` to `value` and restart accumulation.
    pub fn clear(&mut self, value: Vec3, output: &Output) -> Result<()> {
        output.clear(self.device.as_ref(), value)?;
        self.framecnt = 0;
        Ok(())
    }

    /// `ApplyGammaAndCopyData`: (data, width, height, gamma, out_rgba8).
    pub fn copy_kernel(&self) -> Result<&Function> {
        self.function("ApplyGammaAndCopyData")
    }

    /// `AccumulateData`: (in, num_elements, inout).
    pub fn accumulate_kernel(&self) -> Result<&Function> {
        self.function("AccumulateData")
    }

    /// Render one frame of `scene` into the bound outputs.
    #[tracing::instrument(skip_all, fields(frame = self.framecnt))]
    pub fn render(&mut self, scene: &Scene) -> Result<()> {
        let colour = self.outputs[OutputType::Color.index()].clone();
        let aovs_bound = OutputType::aovs().any(|t| self.outputs[t.index()].is_some());
        if colour.is_none() && !aovs_bound {
            return Ok(());
        }

        let compiled = self.controller.compile_scene(scene)?;
        let ws = self
            .ws
            .as_ref()
            .ok_or_else(|| Error::state("render without a working set"))?;

        if let Some(out) = &colour {
            self.render_colour(&compiled, ws, out)?;
        }
        if aovs_bound {
            self.fill_aovs(&compiled, ws)?;
        }

        self.framecnt += 1;
        Ok(())
    }

    fn render_colour(&self, scene: &CompiledScene, ws: &WorkingSet, out: &Output) -> Result<()> {
        let n = out.pixel_count();
        check_capacity(ws, n)?;

        self.generate_primary_rays(scene, ws, out.width(), out.height())?;
        self.reset_pixel_indices(ws, n)?;

        let api = self.controller.intersection_api();
        for pass in 0..self.num_bounces as usize {
            self.device
                .fill_buffer(&ws.hits, 0, &0i32.to_ne_bytes(), 0, ws.hits.size())?;

            api.query_intersection(&ws.fr_rays[pass & 1], &ws.fr_hitcount, n as u32, &ws.fr_intersections, None)?;

            self.evaluate_volume(scene, ws, pass, out)?;

            if pass > 0 && scene.envmapidx >= 0 {
                self.shade_miss(scene, ws, pass, out)?;
            }

            self.filter_path_stream(ws, pass)?;
            self.pp
                .compact(0, &ws.hits, &ws.iota, &ws.compacted_indices, &ws.hitcount)?;
            self.restore_pixel_indices(ws, pass)?;

            self.shade_surface_kind("ShadeVolume", scene, ws, pass, out)?;
            self.shade_surface_kind("ShadeSurface", scene, ws, pass, out)?;

            if pass == 0 {
                self.shade_background(scene, ws, pass, out, n)?;
            }

            api.query_occlusion(&ws.fr_shadowrays, &ws.fr_hitcount, n as u32, &ws.fr_shadowhits, None)?;
            self.gather_light_samples(ws, pass, out)?;

            self.device.flush(0)?;
        }
        Ok(())
    }

    /// One primary intersection plus `FillAOVs`, sized from the colour
    /// output when bound, else from the first bound AOV.
    fn fill_aovs(&self, scene: &CompiledScene, ws: &WorkingSet) -> Result<()> {
        let Some(size) = OutputType::ALL.iter().find_map(|t| self.outputs[t.index()].as_ref()) else {
            return Ok(());
        };
        let (w, h) = (size.width(), size.height());
        let n = size.pixel_count();
        check_capacity(ws, n)?;

        self.generate_primary_rays(scene, ws, w, h)?;
        self.controller.intersection_api().query_intersection_count(
            &ws.fr_rays[0],
            n as u32,
            &ws.fr_intersections,
            None,
        )?;

        let f = self.function("FillAOVs")?;
        set_args!(f; &ws.rays[0], &ws.intersections, n as i32);
        self.bind_scene(f, 3, scene);
        set_args_from(f, 15, [
            self.seed().into(),
            (&ws.random).into(),
            (&self.sobolmat).into(),
            self.framecnt.into(),
        ]);
        for (slot, kind) in OutputType::aovs().enumerate() {
            let base = 19 + 2 * slot;
            match &self.outputs[kind.index()] {
                Some(out) => {
                    f.set_arg(base, 1i32);
                    f.set_arg(base + 1, out.data());
                }
                None => {
                    f.set_arg(base, 0i32);
                    f.set_arg(base + 1, &self.dummy);
                }
            }
        }
        self.launch_1d(f, n)?;
        self.device.flush(0)
    }

    /// Time primary, shadow and secondary intersection over `num_passes`
    /// repetitions each, shading once in between so the later streams hold
    /// real rays.
    #[tracing::instrument(skip_all, fields(num_passes = num_passes))]
    pub fn run_benchmark(&mut self, scene: &Scene, num_passes: u32) -> Result<BenchmarkStats> {
        let out = self.outputs[OutputType::Color.index()]
            .clone()
            .ok_or_else(|| Error::state("benchmark needs a colour output"))?;
        let compiled = self.controller.compile_scene(scene)?;
        let ws = self
            .ws
            .as_ref()
            .ok_or_else(|| Error::state("benchmark without a working set"))?;

        let n = out.pixel_count();
        check_capacity(ws, n)?;
        let passes = num_passes.max(1);
        let mut stats = BenchmarkStats {
            num_passes,
            resolution: (out.width(), out.height()),
            ..Default::default()
        };

        out.clear(self.device.as_ref(), Vec3::ZERO)?;
        self.generate_primary_rays(&compiled, ws, out.width(), out.height())?;
        self.reset_pixel_indices(ws, n)?;

        let api = self.controller.intersection_api();

        let start = Instant::now();
        for _ in 0..passes {
            api.query_intersection_count(&ws.fr_rays[0], n as u32, &ws.fr_intersections, None)?;
        }
        self.device.finish(0)?;
        stats.primary_rays_time_in_ms = elapsed_ms(start) / passes as f64;

        self.device
            .fill_buffer(&ws.hits, 0, &0i32.to_ne_bytes(), 0, ws.hits.size())?;
        self.filter_path_stream(ws, 0)?;
        self.pp
            .compact(0, &ws.hits, &ws.iota, &ws.compacted_indices, &ws.hitcount)?;
        self.restore_pixel_indices(ws, 0)?;
        self.shade_surface_kind("ShadeSurface", &compiled, ws, 0, &out)?;
        self.shade_background(&compiled, ws, 0, &out, n)?;

        let start = Instant::now();
        for _ in 0..passes {
            api.query_occlusion(&ws.fr_shadowrays, &ws.fr_hitcount, n as u32, &ws.fr_shadowhits, None)?;
        }
        self.device.finish(0)?;
        stats.shadow_rays_time_in_ms = elapsed_ms(start) / passes as f64;

        self.gather_light_samples(ws, 0, &out)?;
        self.device.flush(0)?;

        let start = Instant::now();
        for _ in 0..passes {
            api.query_intersection(&ws.fr_rays[1], &ws.fr_hitcount, n as u32, &ws.fr_intersections, None)?;
        }
        self.device.finish(0)?;
        stats.secondary_rays_time_in_ms = elapsed_ms(start) / passes as f64;

        tracing::info!(
            primary_ms = stats.primary_rays_time_in_ms,
            shadow_ms = stats.shadow_rays_time_in_ms,
            secondary_ms = stats.secondary_rays_time_in_ms,
            "benchmark finished"
        );
        Ok(stats)
    }

    /// Tone-map `output` into packed RGBA8 words (`r | g << 8 | b << 16 | a << 24`).
    pub fn resolve_rgba8(&self, output: &Output, gamma: f32) -> Result<Vec<u32>> {
        let n = output.pixel_count();
        let packed = self
            .device
            .create_buffer(n * std::mem::size_of::<u32>(), BufferType::Write, None)?;
        let f = self.copy_kernel()?;
        set_args!(f;
            output.data(),
            output.width() as i32,
            output.height() as i32,
            gamma,
            &packed,
        );
        self.launch_2d(f, output.width(), output.height())?;
        self.device.read_pod(&packed, n)
    }

    /// Add `input` into `accum` pixel by pixel.
    pub fn accumulate(&self, input: &Output, accum: &Output) -> Result<()> {
        let n = input.pixel_count().min(accum.pixel_count());
        let f = self.accumulate_kernel()?;
        set_args!(f; input.data(), n as i32, accum.data());
        self.launch_1d(f, n)
    }

    fn function(&self, name: &str) -> Result<&Function> {
        self.functions
            .get(name)
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))
    }

    fn seed(&self) -> u32 {
        self.rng.lock().gen()
    }

    fn launch_1d(&self, f: &Function, n: usize) -> Result<()> {
        self.device.execute(
            f,
            0,
            WorkSize::d1(align_up(n.max(1), GROUP_SIZE)),
            WorkSize::d1(GROUP_SIZE),
            None,
        )?;
        Ok(())
    }

    fn launch_2d(&self, f: &Function, w: u32, h: u32) -> Result<()> {
        self.device.execute(
            f,
            0,
            WorkSize::d2(align_up(w as usize, TILE_SIZE), align_up(h as usize, TILE_SIZE)),
            WorkSize::d2(TILE_SIZE, TILE_SIZE),
            None,
        )?;
        Ok(())
    }

    /// vertices, normals, uvs, indices, shapes, materialids, materials,
    /// textures, texturedata, envmapidx, lights, num_lights.
    fn bind_scene(&self, f: &Function, base: usize, scene: &CompiledScene) {
        set_args_from(f, base, [
            (&scene.vertices).into(),
            (&scene.normals).into(),
            (&scene.uvs).into(),
            (&scene.indices).into(),
            (&scene.shapes).into(),
            (&scene.materialids).into(),
            (&scene.materials).into(),
            (&scene.textures).into(),
            (&scene.texturedata).into(),
            scene.envmapidx.into(),
            (&scene.lights).into(),
            scene.num_lights.into(),
        ]);
    }

    fn generate_primary_rays(&self, scene: &CompiledScene, ws: &WorkingSet, w: u32, h: u32) -> Result<()> {
        let f = self.function(scene.camera_type.kernel_name())?;
        set_args!(f;
            &scene.camera,
            w as i32,
            h as i32,
            self.seed(),
            self.framecnt,
            &ws.rays[0],
            &ws.random,
            &self.sobolmat,
            &ws.paths,
        );
        self.launch_2d(f, w, h)
    }

    fn reset_pixel_indices(&self, ws: &WorkingSet, n: usize) -> Result<()> {
        let bytes = n * std::mem::size_of::<i32>();
        self.device.copy_buffer(&ws.iota, &ws.pixelindices[0], 0, 0, 0, bytes)?;
        self.device.copy_buffer(&ws.iota, &ws.pixelindices[1], 0, 0, 0, bytes)?;
        self.device.write_pod(&ws.hitcount, &[n as i32])?;
        Ok(())
    }

    fn evaluate_volume(&self, scene: &CompiledScene, ws: &WorkingSet, pass: usize, out: &Output) -> Result<()> {
        let f = self.function("EvaluateVolume")?;
        set_args!(f;
            &ws.rays[pass & 1],
            &ws.pixelindices[(pass + 1) & 1],
            &ws.hitcount,
            &scene.volumes,
            &scene.textures,
            &scene.texturedata,
            self.seed(),
            &ws.random,
            &self.sobolmat,
            pass as i32,
            self.framecnt,
            &ws.intersections,
            &ws.paths,
            out.data(),
        );
        self.launch_1d(f, out.pixel_count())
    }

    fn shade_miss(&self, scene: &CompiledScene, ws: &WorkingSet, pass: usize, out: &Output) -> Result<()> {
        let f = self.function("ShadeMiss")?;
        set_args!(f;
            &ws.rays[pass & 1],
            &ws.intersections,
            &ws.pixelindices[(pass + 1) & 1],
            &ws.hitcount,
            &scene.lights,
            scene.envmapidx,
            &scene.textures,
            &scene.texturedata,
            &ws.paths,
            &scene.volumes,
            out.data(),
        );
        self.launch_1d(f, out.pixel_count())
    }

    fn shade_background(
        &self,
        scene: &CompiledScene,
        ws: &WorkingSet,
        pass: usize,
        out: &Output,
        num_rays: usize,
    ) -> Result<()> {
        let f = self.function("ShadeBackgroundEnvMap")?;
        set_args!(f;
            &ws.rays[pass & 1],
            &ws.intersections,
            &ws.pixelindices[(pass + 1) & 1],
            num_rays as i32,
            &scene.lights,
            scene.envmapidx,
            &scene.textures,
            &scene.texturedata,
            &ws.paths,
            &scene.volumes,
            out.data(),
        );
        self.launch_1d(f, num_rays)
    }

    fn filter_path_stream(&self, ws: &WorkingSet, pass: usize) -> Result<()> {
        let f = self.function("FilterPathStream")?;
        set_args!(f;
            &ws.intersections,
            &ws.hitcount,
            &ws.pixelindices[(pass + 1) & 1],
            &ws.paths,
            &ws.hits,
        );
        self.launch_1d(f, ws.capacity())
    }

    fn restore_pixel_indices(&self, ws: &WorkingSet, pass: usize) -> Result<()> {
        let f = self.function("RestorePixelIndices")?;
        set_args!(f;
            &ws.compacted_indices,
            &ws.hitcount,
            &ws.pixelindices[(pass + 1) & 1],
            &ws.pixelindices[pass & 1],
        );
        self.launch_1d(f, ws.capacity())
    }

    /// `ShadeVolume` and `ShadeSurface` share one 28-argument layout.
    fn shade_surface_kind(
        &self,
        name: &str,
        scene: &CompiledScene,
        ws: &WorkingSet,
        pass: usize,
        out: &Output,
    ) -> Result<()> {
        let f = self.function(name)?;
        set_args!(f;
            &ws.rays[pass & 1],
            &ws.intersections,
            &ws.compacted_indices,
            &ws.pixelindices[pass & 1],
            &ws.hitcount,
        );
        self.bind_scene(f, 5, scene);
        set_args_from(f, 17, [
            self.seed().into(),
            (&ws.random).into(),
            (&self.sobolmat).into(),
            (pass as i32).into(),
            self.framecnt.into(),
            (&scene.volumes).into(),
            (&ws.shadowrays).into(),
            (&ws.lightsamples).into(),
            (&ws.paths).into(),
            (&ws.rays[(pass + 1) & 1]).into(),
            out.data().into(),
        ]);
        self.launch_1d(f, out.pixel_count())
    }

    fn gather_light_samples(&self, ws: &WorkingSet, pass: usize, out: &Output) -> Result<()> {
        let f = self.function("GatherLightSamples")?;
        set_args!(f;
            &ws.pixelindices[pass & 1],
            &ws.hitcount,
            &ws.shadowhits,
            &ws.lightsamples,
            &ws.paths,
            out.data(),
        );
        self.launch_1d(f, out.pixel_count())
    }
}

/// Bind `args` at consecutive indices from `base`.
fn set_args_from<const N: usize>(f: &Function, base: usize, args: [crate::compute::KernelArg; N]) {
    for (i, arg) in args.into_iter().enumerate() {
        f.set_arg(base + i, arg);
    }
}

fn check_capacity(ws: &WorkingSet, n: usize) -> Result<()> {
    if n > ws.capacity() {
        return Err(Error::state(format!(
            "{} pixels exceed the working set of {}",
            n,
            ws.capacity()
        )));
    }
    Ok(())
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1e3
}
