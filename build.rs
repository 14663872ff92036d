use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Program sources baked into the binary with `embed-kernels`.
const KERNEL_SOURCES: &[(&str, &str)] = &[
    ("INTERSECT_SHORT_STACK", "intersect_bvh2_short_stack.wgsl"),
    ("PATH_TRACING", "integrator_pt.wgsl"),
    ("PARALLEL_PRIMITIVES", "parallel_primitives.wgsl"),
];

fn main() {
    let now = time::OffsetDateTime::now_utc();
    let date_fmt = time::format_description::parse("[month repr:short] [day padding:space] [year]")
        .expect("valid date format");
    let time_fmt = time::format_description::parse("[hour]:[minute]:[second]")
        .expect("valid time format");

    let date = std::env::var("WFPT_BUILD_DATE")
        .unwrap_or_else(|_| now.format(&date_fmt).unwrap_or_else(|_| "unknown".to_string()));
    let time = std::env::var("WFPT_BUILD_TIME")
        .unwrap_or_else(|_| now.format(&time_fmt).unwrap_or_else(|_| "unknown".to_string()));

    println!("cargo:rustc-env=WFPT_BUILD_DATE={}", date);
    println!("cargo:rustc-env=WFPT_BUILD_TIME={}", time);
    println!("cargo:rerun-if-env-changed=WFPT_KERNEL_DIR");

    if std::env::var_os("CARGO_FEATURE_EMBED_KERNELS").is_some() {
        embed_kernels();
    }
}

fn embed_kernels() {
    let dir = std::env::var("WFPT_KERNEL_DIR").unwrap_or_else(|_| "kernels".to_string());
    let dir = PathBuf::from(dir);
    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR set by cargo"));

    let mut generated = String::new();
    for (name, file) in KERNEL_SOURCES {
        let source = read_kernel(&dir, file);
        writeln!(generated, "pub const {}: &str = {:?};", name, source).expect("write to string");
    }

    std::fs::write(out_dir.join("kernels.rs"), generated).expect("write kernels.rs");
}

fn read_kernel(dir: &Path, file: &str) -> String {
    let path = dir.join(file);
    println!("cargo:rerun-if-changed={}", path.display());
    match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(_) => {
            println!("cargo:warning=kernel source {} not found, embedding empty program", path.display());
            String::new()
        }
    }
}
