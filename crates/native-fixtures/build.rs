fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    tonic_build::compile_protos("proto/echo.proto")?;
    prost_build::compile_protos(&["proto/task_service_config.proto"], &["proto"])?;
    Ok(())
}
