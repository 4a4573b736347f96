use std::{env, path::PathBuf};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);

    let proto_root = manifest_dir.join("proto");
    let proto_file = proto_root.join("csi.proto");

    println!("cargo:rerun-if-changed={}", proto_file.display());

    if env::var_os("PROTOC").is_none() {
        let protoc_path = protoc_bin_vendored::protoc_bin_path()?;
        env::set_var("PROTOC", protoc_path);
    }

    tonic_prost_build::configure().compile_protos(&[proto_file], &[proto_root])?;

    Ok(())
}
