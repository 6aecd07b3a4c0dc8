fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The `Connect` rpc would collide with the generated transport helper
    // `RepeaterBusClient::connect(dst)`; clients are built from a Channel instead.
    tonic_prost_build::configure()
        .build_transport(false)
        .compile_protos(&["proto/bus.proto"], &["proto"])?;
    Ok(())
}
