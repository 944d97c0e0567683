use prost::Message;
use std::path::PathBuf;

fn main() {
    let out_dir = std::env::var("OUT_DIR").unwrap();
    let out_dir = PathBuf::from(out_dir);

    let ifiles = ["proto/repman.proto"];
    let include_dirs = ["proto"];
    let fd_path = out_dir.join("repman_descriptor.bin");

    // protox parses the protos so that no protoc binary is needed.
    let fds = protox::compile(ifiles, include_dirs).unwrap();
    std::fs::write(&fd_path, fds.encode_to_vec()).unwrap();

    let config = prost_build::Config::new();
    tonic_build::configure()
        .out_dir(out_dir)
        .file_descriptor_set_path(fd_path)
        .skip_protoc_run()
        .compile_protos_with_config(config, &ifiles, &include_dirs)
        .unwrap();

    println!("cargo:rerun-if-changed=proto/repman.proto");
}
