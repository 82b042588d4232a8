use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=kernels/fused_moe_fp8.cu");

    // Only compile CUDA kernels when the feature is enabled
    if std::env::var("CARGO_FEATURE_CUDA_KERNELS").is_err() {
        return;
    }

    // bf16 stores need sm_80+; default to Ada Lovelace
    let arch = std::env::var("CUDA_ARCH").unwrap_or_else(|_| "sm_89".to_string());

    let kernels: Vec<(&str, &str)> = vec![("kernels/fused_moe_fp8.cu", "kernels/fused_moe_fp8.ptx")];

    for (src_path, out_path) in kernels {
        let args = [
            "--ptx".to_string(),
            format!("-arch={arch}"),
            "-O3".to_string(),
            "-o".to_string(),
            out_path.to_string(),
            src_path.to_string(),
        ];

        let status = Command::new("nvcc").args(&args).status();

        match status {
            Ok(s) if s.success() => {
                println!("cargo:warning=Compiled {src_path} -> {out_path}");
            }
            Ok(s) => {
                panic!(
                    "nvcc failed for {src_path} with exit code: {s}. \
                     Ensure CUDA toolkit is installed."
                );
            }
            Err(e) => {
                panic!(
                    "Failed to run nvcc for {src_path}: {e}. \
                     Ensure CUDA toolkit is installed and nvcc is in PATH."
                );
            }
        }
    }
}
