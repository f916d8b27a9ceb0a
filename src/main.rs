use std::env;

fn main() {
    // read env variables that were set in build script
    let kernel_path = env!("KERNEL_PATH");

    println!("kernel image: {:?}", kernel_path);

    let mut cmd = std::process::Command::new("qemu-system-i386");
    if let Some(x) = env::args().nth(1) {
        if x == "DEBUG" {
            cmd.arg("-s");
            cmd.arg("-S");
        };
    };
    // cmd.arg("-d").arg("int");
    cmd.arg("-debugcon").arg("stdio");
    cmd.arg("-m").arg("256");
    cmd.arg("-kernel").arg(kernel_path);

    let mut child = cmd.spawn().unwrap();
    child.wait().unwrap();
}
