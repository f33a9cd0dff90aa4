fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Pod payloads are carried as `bytes::Bytes` so relayed frames can be
    // re-sliced without copying the pod body.
    let mut config = prost_build::Config::new();
    config.bytes(["."]);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos_with_config(config, &["proto/podrelay.proto"], &["proto"])?;
    Ok(())
}
