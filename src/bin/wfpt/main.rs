//! wfpt - command-line front end of the wavefront path tracer.

mod settings;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use settings::RenderSettings;
use wavefront_pt::prelude::*;

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Render,
    Bench,
    Bvh,
    Help,
}

#[derive(Debug)]
struct Cli {
    command: Command,
    level: &'static str,
    settings: RenderSettings,
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            print_help();
            std::process::exit(2);
        }
    };

    let _trace_guard = init_tracing(cli.level);

    let result = match cli.command {
        Command::Render => cmd_render(&cli.settings),
        Command::Bench => cmd_bench(&cli.settings),
        Command::Bvh => cmd_bvh(&cli.settings),
        Command::Help => {
            print_help();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_help() {
    println!(
        "wfpt {} (built {} {})",
        env!("CARGO_PKG_VERSION"),
        wavefront_pt::BUILD_DATE,
        wavefront_pt::BUILD_TIME
    );
    println!();
    println!("Usage: wfpt <command> [options]");
    println!();
    println!("Commands:");
    println!("  render    Render a built-in scene to PNG");
    println!("  bench     Time primary, shadow and secondary rays");
    println!("  bvh       Build the acceleration structure and print its statistics");
    println!("  help      Show this message");
    println!();
    println!("Options:");
    println!("  --config <file.json>   Load settings (flags below override it)");
    println!("  --scene <name>         cornell | instances | empty");
    println!("  --size <W>x<H>         Image size");
    println!("  --spp <n>              Frames to accumulate");
    println!("  --bounces <n>          Bounces per frame");
    println!("  --aov <name>           Also write an AOV (repeatable)");
    println!("  --platform <name>      host | wgpu");
    println!("  --seed <n>             Fixed host seed");
    println!("  --splits               Spatial splits in the BVH builder");
    println!("  --passes <n>           Benchmark repetitions");
    println!("  -o <file.png>          Output image");
    println!("  -v, -vv, -q            Verbose, trace, quiet");
    println!();
    println!("RUST_LOG overrides the log filter. With the `trace` feature, WFPT_TRACE=1");
    println!("writes a Chrome trace to trace.json.");
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut level = "info";
    let mut command = None;
    let mut settings = RenderSettings::default();
    let mut overrides: Vec<(&str, &str)> = Vec::new();
    let mut splits = false;

    let mut it = args.iter().map(String::as_str);
    while let Some(arg) = it.next() {
        match arg {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "warn",
            "--splits" => splits = true,
            "--config" => {
                let path = it.next().context("--config needs a file")?;
                settings = RenderSettings::load(path.as_ref())?;
            }
            "--scene" | "--size" | "--spp" | "--bounces" | "--aov" | "--platform" | "--seed"
            | "--passes" | "-o" | "--output" => {
                let value = it.next().with_context(|| format!("{} needs a value", arg))?;
                overrides.push((arg, value));
            }
            "render" | "bench" | "bvh" | "help" if command.is_none() => {
                command = Some(match arg {
                    "render" => Command::Render,
                    "bench" => Command::Bench,
                    "bvh" => Command::Bvh,
                    _ => Command::Help,
                });
            }
            "-h" | "--help" => command = Some(Command::Help),
            other => bail!("unexpected argument '{}'", other),
        }
    }

    // Flags win over the config file regardless of order
    for (flag, value) in overrides {
        match flag {
            "--scene" => settings.scene = value.to_string(),
            "--size" => {
                let (w, h) = value
                    .split_once('x')
                    .with_context(|| format!("size '{}' is not WxH", value))?;
                settings.width = w.parse().context("image width")?;
                settings.height = h.parse().context("image height")?;
            }
            "--spp" => settings.samples = value.parse().context("--spp")?,
            "--bounces" => settings.bounces = value.parse().context("--bounces")?,
            "--aov" => settings.aovs.push(value.to_string()),
            "--platform" => settings.platform = value.to_string(),
            "--seed" => settings.seed = Some(value.parse().context("--seed")?),
            "--passes" => settings.bench_passes = value.parse().context("--passes")?,
            _ => settings.output = PathBuf::from(value),
        }
    }
    if splits {
        settings.use_splits = true;
    }

    Ok(Cli {
        command: command.unwrap_or(Command::Help),
        level,
        settings,
    })
}

#[cfg(feature = "trace")]
type TraceGuard = Option<tracing_chrome::FlushGuard>;
#[cfg(not(feature = "trace"))]
type TraceGuard = ();

/// fmt subscriber filtered by `RUST_LOG` or `level`, plus a Chrome trace
/// layer when built with `trace` and `WFPT_TRACE=1`.
fn init_tracing(level: &str) -> TraceGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);

    #[cfg(feature = "trace")]
    {
        if std::env::var("WFPT_TRACE").ok().as_deref() == Some("1") {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file("trace.json")
                .build();
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt)
                .with(chrome_layer);
            if tracing::subscriber::set_global_default(subscriber).is_err() {
                return None;
            }
            return Some(guard);
        }
        let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
        None
    }

    #[cfg(not(feature = "trace"))]
    {
        let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
    }
}

fn platform(name: &str) -> Result<Platform> {
    match name {
        "host" | "cpu" => Ok(Platform::Host),
        "wgpu" | "gpu" => Ok(Platform::Wgpu),
        other => bail!("unknown platform '{}'", other),
    }
}

fn build_scene(settings: &RenderSettings) -> Result<Scene> {
    let [r, g, b] = settings.background;
    let scene = match settings.scene.as_str() {
        "cornell" => demo::cornell_box()?,
        "instances" => demo::instances(settings.instances)?,
        "empty" => demo::empty(Vec3::new(r, g, b))?,
        other => bail!("unknown scene '{}'", other),
    };
    Ok(scene)
}

fn build_renderer(settings: &RenderSettings) -> Result<PtRenderer> {
    let device = create_device(platform(&settings.platform)?)?;
    let spec = device.spec();
    tracing::info!(device = %spec.name, vendor = %spec.vendor, "device opened");

    let mut renderer = match settings.seed {
        Some(seed) => PtRenderer::with_seed(device, settings.bounces, seed)?,
        None => PtRenderer::new(device, settings.bounces)?,
    };
    let api = renderer.scene_controller_mut().intersection_api_mut();
    api.set_option_string("bvh.builder", &settings.builder);
    api.set_option("bvh.sah.use_splits", if settings.use_splits { 1.0 } else { 0.0 });
    Ok(renderer)
}

fn cmd_render(settings: &RenderSettings) -> Result<()> {
    let scene = build_scene(settings)?;
    let mut renderer = build_renderer(settings)?;

    let colour = renderer.create_output(settings.width, settings.height)?;
    renderer.set_output(OutputType::Color, colour.clone())?;
    renderer.clear(Vec3::ZERO, &colour)?;

    let mut aovs = Vec::new();
    for name in &settings.aovs {
        let kind: OutputType = name.parse()?;
        if !kind.is_aov() {
            continue;
        }
        let out = renderer.create_output(settings.width, settings.height)?;
        renderer.set_output(kind, out.clone())?;
        renderer.clear(Vec3::ZERO, &out)?;
        aovs.push((kind, out));
    }

    let start = std::time::Instant::now();
    for _ in 0..settings.samples {
        renderer.render(&scene)?;
    }
    renderer.device().finish(0)?;
    tracing::info!(
        frames = renderer.framecnt(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        vidmemws_mb = renderer.vidmemws() / (1024 * 1024),
        "render finished"
    );

    write_png(&renderer, &colour, settings.gamma, &settings.output)?;
    for (kind, out) in &aovs {
        write_png(&renderer, out, 1.0, &settings.aov_path(kind.name()))?;
    }
    Ok(())
}

/// Tone-map `output` and save it top row first.
fn write_png(renderer: &PtRenderer, output: &Output, gamma: f32, path: &std::path::Path) -> Result<()> {
    let packed = renderer.resolve_rgba8(output, gamma)?;
    let bytes: Vec<u8> = packed.iter().flat_map(|p| p.to_le_bytes()).collect();
    let mut image = image::RgbaImage::from_raw(output.width(), output.height(), bytes)
        .context("image buffer size")?;
    image::imageops::flip_vertical_in_place(&mut image);
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn cmd_bench(settings: &RenderSettings) -> Result<()> {
    let scene = build_scene(settings)?;
    let mut renderer = build_renderer(settings)?;
    let out = renderer.create_output(settings.width, settings.height)?;
    renderer.set_output(OutputType::Color, out)?;

    let stats = renderer.run_benchmark(&scene, settings.bench_passes)?;
    println!(
        "Resolution {}x{}, {} passes",
        stats.resolution.0, stats.resolution.1, stats.num_passes
    );
    for (name, ms) in [
        ("primary", stats.primary_rays_time_in_ms),
        ("shadow", stats.shadow_rays_time_in_ms),
        ("secondary", stats.secondary_rays_time_in_ms),
    ] {
        println!(
            "  {:<10} {:>9.3} ms  {:>8.2} Mrays/s",
            name,
            ms,
            stats.mrays_per_second(ms)
        );
    }
    Ok(())
}

fn cmd_bvh(settings: &RenderSettings) -> Result<()> {
    let scene = build_scene(settings)?;
    let mut renderer = build_renderer(settings)?;
    let controller = renderer.scene_controller_mut();
    let compiled = controller.compile_scene(&scene)?;

    println!("Shapes:   {}", compiled.num_shapes);
    println!("Faces:    {}", compiled.num_faces);
    match controller.bvh_stats() {
        Some(stats) => {
            println!("Nodes:    {}", stats.node_count);
            println!("Leaves:   {}", stats.leaf_count);
            println!("Height:   {}", stats.height);
            println!("Indices:  {} ({} from splits)", stats.index_count, stats.duplicates);
            println!("SAH cost: {:.3}", stats.sah_cost);
        }
        None => println!("No acceleration structure"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_parse_render() {
        let cli = parse_args(&args("render --size 64x32 --spp 4 --aov albedo --aov depth -v -o x.png")).unwrap();
        assert_eq!(cli.command, Command::Render);
        assert_eq!(cli.level, "debug");
        assert_eq!((cli.settings.width, cli.settings.height), (64, 32));
        assert_eq!(cli.settings.samples, 4);
        assert_eq!(cli.settings.aovs, vec!["albedo", "depth"]);
        assert_eq!(cli.settings.output, PathBuf::from("x.png"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args("render --size 64")).is_err());
        assert!(parse_args(&args("render --spp")).is_err());
        assert!(parse_args(&args("frobnicate")).is_err());
        assert_eq!(parse_args(&[]).unwrap().command, Command::Help);
    }

    #[test]
    fn test_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{ "bounces": 2, "scene": "empty" }"#).unwrap();
        let line = format!("bench --bounces 7 --config {}", path.display());
        let cli = parse_args(&args(&line)).unwrap();
        assert_eq!(cli.command, Command::Bench);
        assert_eq!(cli.settings.bounces, 7);
        assert_eq!(cli.settings.scene, "empty");
    }

    #[test]
    fn test_unknown_names() {
        assert!(platform("opencl").is_err());
        let settings = RenderSettings {
            scene: "teapot".into(),
            ..Default::default()
        };
        assert!(build_scene(&settings).is_err());
    }
}
