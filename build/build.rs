use std::env;
use std::fs;
use std::path::PathBuf;

// STM32F411xE: 512 KiB of flash in 8 sectors, 128 KiB of SRAM
const MEMORY: &str = "MEMORY
{
  FLASH : ORIGIN = 0x08000000, LENGTH = 512K
  RAM : ORIGIN = 0x20000000, LENGTH = 128K
}
";

fn main() {
    let out = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo"));
    fs::write(out.join("memory.x"), MEMORY).expect("failed to write memory.x");
    println!("cargo:rustc-link-search={}", out.display());

    let target = env::var("TARGET").unwrap_or_default();
    if target.starts_with("thumbv") {
        for script in ["-Tlink.x", "-Tdefmt.x"] {
            println!("cargo:rustc-link-arg-bins={}", script);
            println!("cargo:rustc-link-arg-examples={}", script);
        }
        println!("cargo:rustc-link-arg-bins=--nmagic");
        println!("cargo:rustc-link-arg-examples=--nmagic");
    }

    println!("cargo:rerun-if-changed=build/build.rs");
}
