//! Compiles the C++ fixtures under `fixtures/` into shared objects.
//!
//! The resulting paths are exported to the crate as `MODCHECK_<NAME>_MODULE`.
//! A missing C++ compiler is not fatal: the variable is set to an empty string
//! and fixture-backed tests skip themselves.

use std::path::{Path, PathBuf};

const FIXTURES: &[&str] = &["mod_hello"];

fn main() {
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap());
    let out_dir = PathBuf::from(std::env::var("OUT_DIR").unwrap());
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let extension = if target_os == "macos" { "dylib" } else { "so" };

    for name in FIXTURES {
        let source = manifest_dir.join("fixtures").join(format!("{name}.cpp"));
        let target = out_dir.join(format!("lib{name}.{extension}"));
        println!("cargo:rerun-if-changed=fixtures/{name}.cpp");

        let built = match build_shared_object(&source, &target) {
            Ok(()) => target.display().to_string(),
            Err(reason) => {
                println!("cargo:warning=fixture {name} not built: {reason}");
                String::new()
            }
        };
        let var = name.trim_start_matches("mod_").to_ascii_uppercase();
        println!("cargo:rustc-env=MODCHECK_{var}_MODULE={built}");
    }
}

fn build_shared_object(source: &Path, target: &Path) -> Result<(), String> {
    let compiler = cc::Build::new()
        .cpp(true)
        .cargo_metadata(false)
        .try_get_compiler()
        .map_err(|err| err.to_string())?;
    let status = compiler
        .to_command()
        .arg("-shared")
        .arg("-fPIC")
        .arg("-o")
        .arg(target)
        .arg(source)
        .status()
        .map_err(|err| err.to_string())?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("compiler exited with {status}"))
    }
}
