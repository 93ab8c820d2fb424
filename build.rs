// Compile our GLSL shaders to SPIR-V
//
// The resulting binaries land in OUT_DIR and are pulled into the
// pipeline setup code with include_bytes!.
use std::path::PathBuf;

fn main() {
    let shaders = [
        ("src/shaders/quad.vert", shaderc::ShaderKind::Vertex),
        ("src/shaders/texture.frag", shaderc::ShaderKind::Fragment),
        ("src/shaders/quad.frag", shaderc::ShaderKind::Fragment),
    ];

    let compiler = shaderc::Compiler::new().expect("Could not create shaderc compiler");
    let mut options =
        shaderc::CompileOptions::new().expect("Could not create shaderc compile options");
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_2 as u32);

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").unwrap());
    for (path, kind) in shaders.iter() {
        println!("cargo:rerun-if-changed={}", path);

        let src = std::fs::read_to_string(path).expect("Could not read shader source");
        let binary = compiler
            .compile_into_spirv(&src, *kind, path, "main", Some(&options))
            .expect("Shader compilation failed");

        let name = PathBuf::from(path);
        let name = name.file_name().unwrap().to_str().unwrap();
        std::fs::write(out_dir.join(format!("{}.spv", name)), binary.as_binary_u8())
            .expect("Could not write compiled shader");
    }
}
