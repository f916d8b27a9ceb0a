use std::path::PathBuf;

fn main() {
    // The kernel is a Multiboot1-compliant ELF; QEMU's `-kernel` loads it
    // directly, so there is no disk image to assemble here (unlike a UEFI
    // boot path, which would need one).
    let kernel = PathBuf::from(std::env::var_os("CARGO_BIN_FILE_KERNEL_kernel").unwrap());
    println!("cargo:rustc-env=KERNEL_PATH={}", kernel.display());
}
