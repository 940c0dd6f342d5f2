fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only rerun if proto files change
    println!("cargo:rerun-if-changed=proto/packetbroker/routing.proto");
    println!("cargo:rerun-if-changed=proto/pba/pba.proto");

    // Use a vendored protoc when none is provided by the environment.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/packetbroker/routing.proto", "proto/pba/pba.proto"],
            &["proto"],
        )?;
    Ok(())
}
