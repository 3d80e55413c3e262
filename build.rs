//! Build script for llm-session.
//!
//! With the `native` feature enabled, links the llama shim library: a thin C
//! wrapper over llama.cpp exporting the `ls_*` symbols declared in
//! `src/engine/ffi.rs`. Without the feature nothing is linked and the crate
//! runs on the simulated engine.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LLAMA_SHIM_DIR");

    #[cfg(feature = "native")]
    {
        if let Ok(dir) = std::env::var("LLAMA_SHIM_DIR") {
            println!("cargo:rustc-link-search=native={dir}");
        } else {
            println!("cargo:warning=LLAMA_SHIM_DIR not set; relying on the default linker search path");
        }
        println!("cargo:rustc-link-lib=dylib=llama_shim");
    }
}
