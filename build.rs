//! Build script for collbench
//!
//! Without the `mpi` feature there is nothing to build. With it, the C shim
//! in `csrc/` is compiled against the first MPI installation found through,
//! in order: `MPI_PKG_CONFIG`, the usual pkg-config names, `mpicc -show`.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    #[cfg(feature = "mpi")]
    shim::build();
}

#[cfg(feature = "mpi")]
mod shim {
    use std::env;
    use std::path::PathBuf;
    use std::process::Command;

    #[derive(Default)]
    struct Toolchain {
        include_paths: Vec<PathBuf>,
        link_paths: Vec<PathBuf>,
        libs: Vec<String>,
    }

    pub fn build() {
        println!("cargo:rerun-if-changed=csrc/collbench.c");
        println!("cargo:rerun-if-changed=csrc/collbench.h");
        println!("cargo:rerun-if-env-changed=MPI_PKG_CONFIG");
        println!("cargo:rerun-if-env-changed=MPICC");

        let Some(mpi) = locate() else {
            panic!(
                "Could not find an MPI installation. Set MPI_PKG_CONFIG to its \
                 pkg-config name, or put mpicc (or $MPICC) on PATH."
            );
        };

        let mut build = cc::Build::new();
        build.file("csrc/collbench.c").include("csrc").warnings(true);
        for path in &mpi.include_paths {
            build.include(path);
        }
        if env::var("PROFILE").as_deref() == Ok("release") {
            build.opt_level(3);
        }
        build.compile("collbench");

        for path in &mpi.link_paths {
            println!("cargo:rustc-link-search=native={}", path.display());
            println!("cargo:rustc-link-arg=-Wl,-rpath,{}", path.display());
        }
        for lib in &mpi.libs {
            println!("cargo:rustc-link-lib={lib}");
        }
    }

    fn locate() -> Option<Toolchain> {
        let explicit = env::var("MPI_PKG_CONFIG").ok();
        explicit
            .iter()
            .map(String::as_str)
            .chain(["mpich", "ompi", "mpi"])
            .find_map(probe)
            .or_else(mpicc_show)
    }

    fn probe(name: &str) -> Option<Toolchain> {
        let lib = pkg_config::Config::new()
            .cargo_metadata(false)
            .probe(name)
            .ok()?;
        Some(Toolchain {
            include_paths: lib.include_paths,
            link_paths: lib.link_paths,
            libs: lib.libs,
        })
    }

    fn mpicc_show() -> Option<Toolchain> {
        let mpicc = env::var("MPICC").unwrap_or_else(|_| "mpicc".to_string());
        let output = Command::new(mpicc).arg("-show").output().ok()?;
        if !output.status.success() {
            return None;
        }
        let mut mpi = Toolchain::default();
        for flag in String::from_utf8_lossy(&output.stdout).split_whitespace() {
            if let Some(path) = flag.strip_prefix("-I") {
                mpi.include_paths.push(PathBuf::from(path));
            } else if let Some(path) = flag.strip_prefix("-L") {
                mpi.link_paths.push(PathBuf::from(path));
            } else if let Some(lib) = flag.strip_prefix("-l") {
                mpi.libs.push(lib.to_string());
            }
        }
        if mpi.libs.is_empty() {
            mpi.libs.push("mpi".to_string());
        }
        Some(mpi)
    }
}
