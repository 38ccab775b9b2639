fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto = "proto/logstore.proto";

    // Use the vendored protoc unless the environment already provides one.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single-threaded; nothing else reads the
        // environment concurrently.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }

    println!("cargo:rerun-if-changed={proto}");
    tonic_build::compile_protos(proto)?;
    Ok(())
}
