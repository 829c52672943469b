// Build script to compile GLSL shaders to SPIR-V
//
// Outputs land in assets/shaders/, which is where the viewer reads them
// from at startup.

use std::path::Path;
use std::process::Command;

const SHADERS: &[(&str, &str)] = &[
    ("shaders/mesh.vert", "assets/shaders/mesh.vert.spv"),
    ("shaders/mesh.frag", "assets/shaders/mesh.frag.spv"),
    ("shaders/overlay.vert", "assets/shaders/overlay.vert.spv"),
    ("shaders/overlay.frag", "assets/shaders/overlay.frag.spv"),
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    if let Err(e) = std::fs::create_dir_all("assets/shaders") {
        eprintln!("Warning: could not create assets/shaders ({})", e);
    }

    for (input, output) in SHADERS {
        compile_shader(input, output);
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // glslc ships with the Vulkan SDK
    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} was not compiled", e, input);
            eprintln!("Install the Vulkan SDK or compile manually:");
            eprintln!("  glslc {} -o {}", input, output);
        }
    }
}
