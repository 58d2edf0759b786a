use std::env::{self, consts};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Libraries the communicator links against.
const LIBS: [&str; 2] = ["ibverbs", "rdmacm"];

/// Try to link to an `rdma-core` installation registered to `pkg-config`.
///
/// Both MLNX_OFED v5.x and upstream `rdma-core` packages register the two
/// libraries, so this covers most deployments.
fn link_rdma_core() -> Result<Vec<PathBuf>, ()> {
    let mut include_dirs = Vec::new();
    for lib in LIBS {
        let lib = pkg_config::Config::new()
            .statik(false)
            .probe(&format!("lib{}", lib))
            .map_err(|_| ())?;
        include_dirs.extend(lib.include_paths);
    }
    include_dirs.dedup();
    Ok(include_dirs)
}

/// Try to link to existing `MLNX_OFED` installation that does not register its
/// libraries to `pkg-config` (MLNX_OFED v4.9-x LTS).
fn link_mlnx_ofed() -> Result<Vec<PathBuf>, ()> {
    let output = Command::new("ofed_info")
        .arg("-n")
        .output()
        .map_err(|_| ())?;
    if output.stdout.first() != Some(&b'4') {
        return Err(());
    }

    // We assume the default installation path as `/usr`.
    let lib_dir = if let Ok(lib_dir) = env::var("MLNX_OFED_LIB_DIR") {
        Path::new(&lib_dir).to_owned()
    } else {
        Path::new("/usr/lib").to_owned()
    };

    let found = LIBS.iter().all(|lib| {
        let dylib_name = format!("{}{}{}", consts::DLL_PREFIX, lib, consts::DLL_SUFFIX);
        lib_dir.join(dylib_name).exists() || lib_dir.join(format!("lib{}.a", lib)).exists()
    });
    if !found {
        return Err(());
    }

    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    for lib in LIBS {
        println!("cargo:rustc-link-lib={}", lib);
    }
    Ok(env::var("MLNX_OFED_INCLUDE_DIR")
        .map(|dir| vec![PathBuf::from(dir)])
        .unwrap_or_default())
}

/// Build flow:
///
/// 1. Try to link to `rdma-core` through `pkg-config`.
/// 2. If failed, try to link to an existing `MLNX_OFED` v4 installation.
/// 3. If failed, build without the RDMA CM backend; only the loopback
///    transport is available then.
fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rrcomm` currently only supports 64-bit platforms");
    }

    println!("cargo:rerun-if-changed=src/bindings/rdma.h");
    println!("cargo:rerun-if-env-changed=MLNX_OFED_INCLUDE_DIR");
    println!("cargo:rerun-if-env-changed=MLNX_OFED_LIB_DIR");

    let include_dirs = match link_rdma_core().or_else(|_| link_mlnx_ofed()) {
        Ok(dirs) => dirs,
        Err(_) => {
            println!(
                "cargo:warning=libibverbs/librdmacm not found, building rrcomm without the RDMA CM backend"
            );
            return;
        }
    };

    println!("cargo:rustc-cfg=rdma_core");
    gen_rdma_bindings(include_dirs);
}

fn gen_rdma_bindings(include_dirs: Vec<PathBuf>) {
    let include_args = include_dirs.iter().map(|p| format!("-I{}", p.display()));
    let bindings = bindgen::builder()
        .clang_args(include_args)
        .header("src/bindings/rdma.h")
        .allowlist_function("ibv_.*")
        .allowlist_function("rdma_.*")
        .allowlist_type("ibv_.*")
        .allowlist_type("rdma_.*")
        .allowlist_var("RAI_.*")
        .opaque_type("pthread_.*")
        .bitfield_enum("ibv_access_flags")
        .bitfield_enum("ibv_send_flags")
        .bitfield_enum("ibv_qp_attr_mask")
        .bitfield_enum("ibv_qp_init_attr_mask")
        .constified_enum_module("ibv_wc_status")
        .constified_enum_module("ibv_wc_opcode")
        .constified_enum_module("ibv_wr_opcode")
        .constified_enum_module("ibv_qp_type")
        .constified_enum_module("ibv_qp_state")
        .constified_enum_module("rdma_port_space")
        .constified_enum_module("rdma_cm_event_type")
        .derive_copy(true)
        .derive_debug(false)
        .derive_default(true)
        .generate_comments(true)
        .layout_tests(false)
        .prepend_enum_name(false)
        .size_t_is_usize(true)
        .generate()
        .expect("failed to generate bindings");

    let out_dir = env::var_os("OUT_DIR").unwrap();
    let dest = Path::new(&out_dir).join("rdma_bindings.rs");
    bindings
        .write_to_file(dest)
        .expect("failed to write bindings");
}
