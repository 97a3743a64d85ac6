fn main() {
    println!("cargo:rerun-if-changed=proto/csi.proto");
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }
    if let Err(err) = tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/csi.proto"], &["proto"])
    {
        panic!("failed to compile csi proto: {err}");
    }
}
