//! Build script to generate gRPC bindings from the protobuf definition.

/// Regenerates tonic gRPC code when the protobuf changes.
///
/// Inputs: `proto/tessella.proto`
/// Output: generated Rust code under Cargo's `OUT_DIR`.
fn main() {
    // Ensure a `protoc` binary is available even when none is installed on the system.
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().unwrap(),
    );

    // Tell Cargo to rerun this build script when the proto file changes.
    println!("cargo:rerun-if-changed=proto/tessella.proto");

    // Invoke the codegen pipeline for the gRPC service definitions.
    tonic_build::configure()
        .compile_protos(&["proto/tessella.proto"], &["proto"])
        .unwrap();
}
