fn main() {
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let emulated = std::env::var_os("CARGO_FEATURE_SOFTWARE_EMULATION").is_some();
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let script_path = std::path::Path::new(&manifest_dir).join(format!("linker-{}.ld", arch));
    println!("cargo:rerun-if-changed={}", script_path.display());
    println!("cargo::rustc-check-cfg=cfg(ringlet_hardware)");

    // Host builds link as an ordinary program and run against the software machine.
    if arch == "x86" && os == "none" {
        println!("cargo:rustc-link-arg-bins=-T{}", script_path.display());
        if !emulated {
            println!("cargo::rustc-cfg=ringlet_hardware");
        }
    }
}
