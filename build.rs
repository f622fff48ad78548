fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::compile_protos("proto/fleet.proto")?;
    println!("cargo:rerun-if-changed=proto/fleet.proto");
    Ok(())
}
