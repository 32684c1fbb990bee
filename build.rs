use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

// PTX names must match the include_str! paths in src/cuda/mod.rs.
const KERNELS: &[(&str, &str)] = &[("kernels/cuda/harness_kernels.cu", "harness_kernels.ptx")];

const DEFAULT_ARCH: &str = "compute_89";
const FALLBACK_ARCH: &str = "compute_80";

fn main() {
    // Cargo exposes active features to build.rs as CARGO_FEATURE_<NAME>.
    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        compile_cuda_kernels();
    } else {
        println!("cargo:warning=feature `cuda` not enabled; skipping PTX build");
    }
}

fn compile_cuda_kernels() {
    println!("cargo:rerun-if-changed=kernels/cuda");
    for var in [
        "CUDA_PATH",
        "CUDA_HOME",
        "CUDA_ARCH",
        "CUDA_ARCHS",
        "CUDA_KERNEL_DIR",
        "NVCC",
        "NVCC_ARGS",
        "CUDA_DEBUG",
        "CUDA_FAST_MATH",
    ] {
        println!("cargo:rerun-if-env-changed={var}");
    }

    // PTX is JIT-loaded at runtime; nothing links against cudart.
    let cuda_path = find_cuda_path();
    for (rel_src, ptx_name) in KERNELS {
        compile_kernel(&cuda_path, rel_src, ptx_name);
    }
}

fn find_cuda_path() -> String {
    env::var("CUDA_PATH")
        .or_else(|_| env::var("CUDA_HOME"))
        .unwrap_or_else(|_| {
            if cfg!(target_os = "windows") {
                newest_windows_toolkit().unwrap_or_else(|| {
                    "C:/Program Files/NVIDIA GPU Computing Toolkit/CUDA/v13.0".to_string()
                })
            } else {
                "/usr/local/cuda".to_string()
            }
        })
}

/// Highest `vMAJOR.MINOR` directory under the default toolkit root.
fn newest_windows_toolkit() -> Option<String> {
    let base = "C:/Program Files/NVIDIA GPU Computing Toolkit/CUDA";
    let entries = std::fs::read_dir(base).ok()?;
    let best = entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|name| {
            let stripped = name.strip_prefix('v')?;
            let mut it = stripped.split('.');
            let major = it.next()?.parse::<u32>().ok()?;
            let minor = it.next().and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);
            Some((major, minor, format!("{base}/{name}")))
        })
        .max_by_key(|(major, minor, _)| (*major, *minor))?;
    eprintln!("Found CUDA at: {}", best.2);
    Some(best.2)
}

/// Accepts `89`, `8.9`, `sm_89` and `compute_89`; returns a `compute_XX` target.
fn normalize_arch(s: &str) -> String {
    let t = s.trim();
    if t.is_empty() {
        return String::new();
    }
    if let Some(rest) = t.strip_prefix("sm_") {
        return format!("compute_{rest}");
    }
    if t.starts_with("compute_") {
        return t.to_string();
    }
    let digits: String = t.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 2 {
        return format!("compute_{}", &digits[0..2]);
    }
    t.to_string()
}

/// First non-empty entry of CUDA_ARCHS, else CUDA_ARCH, else the default.
fn select_arch() -> String {
    let requested = if let Ok(list) = env::var("CUDA_ARCHS") {
        list.split(|c: char| c == ',' || c.is_ascii_whitespace())
            .map(normalize_arch)
            .find(|s| !s.is_empty())
    } else {
        env::var("CUDA_ARCH").ok().map(|a| normalize_arch(&a))
    };
    requested
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_ARCH.to_string())
}

fn nvcc_command(nvcc: &str, arch: &str, ptx_path: &Path, src_path: &str) -> Command {
    let mut cmd = Command::new(nvcc);
    cmd.args(["-std=c++17", "--expt-relaxed-constexpr", "-ptx", "-O3"]);

    // CUDA_FAST_MATH=0 disables fast math
    if env::var("CUDA_FAST_MATH").ok().as_deref() != Some("0") {
        cmd.arg("--use_fast_math");
    }
    if env::var("CUDA_DEBUG").ok().as_deref() == Some("1") {
        cmd.arg("-lineinfo");
    }

    cmd.arg("-arch").arg(arch).arg("-o").arg(ptx_path).arg(src_path);

    if let Ok(extra) = env::var("NVCC_ARGS") {
        cmd.args(extra.split_whitespace());
    }

    if cfg!(target_os = "windows") {
        cmd.arg("-D_ALLOW_COMPILER_AND_STL_VERSION_MISMATCH");
        cmd.arg("-allow-unsupported-compiler");
        if let Ok(vs_path) = find_vs_installation() {
            cmd.arg("-ccbin").arg(vs_path);
        }
    }
    cmd
}

fn run_nvcc(mut cmd: Command) -> Output {
    eprintln!("Running nvcc command: {:?}", cmd);
    cmd.output().expect("Failed to execute nvcc")
}

fn arch_unsupported(output: &Output) -> bool {
    let out_s = String::from_utf8_lossy(&output.stdout);
    let err_s = String::from_utf8_lossy(&output.stderr);
    err_s.contains("unsupported gpu architecture")
        || err_s.contains("Value 'compute_")
        || out_s.contains("unsupported gpu architecture")
}

fn compile_kernel(cuda_path: &str, rel_src: &str, ptx_name: &str) {
    // CUDA_KERNEL_DIR replaces the `kernels/cuda/` prefix
    let src_path = match env::var("CUDA_KERNEL_DIR") {
        Ok(root) => match rel_src.strip_prefix("kernels/cuda/") {
            Some(rest) => format!("{}/{}", root.trim_end_matches(['/', '\\']), rest),
            None => rel_src.to_string(),
        },
        Err(_) => rel_src.to_string(),
    };
    println!("cargo:rerun-if-changed={}", src_path);

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
    let ptx_path = out_dir.join(ptx_name);

    if cfg!(target_os = "windows") && env::var("VCINSTALLDIR").is_err() {
        eprintln!(
            "Warning: VCINSTALLDIR not set. CUDA compilation may require running inside a Visual Studio Developer Command Prompt."
        );
    }

    // NVCC wins; else cuda_path/bin/nvcc
    let nvcc = env::var("NVCC").unwrap_or_else(|_| {
        if cfg!(target_os = "windows") {
            format!("{}/bin/nvcc.exe", cuda_path)
        } else {
            format!("{}/bin/nvcc", cuda_path)
        }
    });

    let arch = select_arch();
    let mut output = run_nvcc(nvcc_command(&nvcc, &arch, &ptx_path, &src_path));

    if !output.status.success() && arch != FALLBACK_ARCH && arch_unsupported(&output) {
        eprintln!(
            "Falling back to -arch={FALLBACK_ARCH} for {rel_src} (nvcc doesn't support {arch})"
        );
        output = run_nvcc(nvcc_command(&nvcc, FALLBACK_ARCH, &ptx_path, &src_path));
    }

    if !output.status.success() {
        eprintln!("CUDA compilation failed for {rel_src}!");
        eprintln!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        eprintln!("stderr: {}", String::from_utf8_lossy(&output.stderr));
        if cfg!(target_os = "windows")
            && String::from_utf8_lossy(&output.stderr).contains("Cannot find compiler 'cl.exe'")
        {
            eprintln!("\n=== CUDA Build Error: Missing Visual Studio C++ Compiler ===");
            eprintln!("nvcc requires the Microsoft Visual C++ compiler (cl.exe) to be available.");
            eprintln!("Install Visual Studio Build Tools 2022 or run cargo from a Developer Command Prompt.");
            eprintln!("===========================================================\n");
        }
        panic!("nvcc compilation failed");
    }

    eprintln!("Compiled {} to {}", src_path, ptx_path.display());
}

#[cfg(target_os = "windows")]
fn find_vs_installation() -> Result<String, ()> {
    let vs_paths = [
        "C:/Program Files/Microsoft Visual Studio/2022/Community/VC/Tools/MSVC",
        "C:/Program Files/Microsoft Visual Studio/2022/Professional/VC/Tools/MSVC",
        "C:/Program Files/Microsoft Visual Studio/2022/Enterprise/VC/Tools/MSVC",
        "C:/Program Files (x86)/Microsoft Visual Studio/2022/BuildTools/VC/Tools/MSVC",
    ];

    for vs_base in &vs_paths {
        let Ok(entries) = std::fs::read_dir(vs_base) else {
            continue;
        };
        let newest = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with("14."))
            .max();
        if let Some(msvc_version) = newest {
            let cl_path = format!("{}/{}/bin/Hostx64/x64", vs_base, msvc_version);
            if Path::new(&format!("{}/cl.exe", cl_path)).exists() {
                eprintln!("Found cl.exe at: {}", cl_path);
                return Ok(cl_path);
            }
        }
    }
    Err(())
}

#[cfg(not(target_os = "windows"))]
fn find_vs_installation() -> Result<String, ()> {
    Err(())
}
