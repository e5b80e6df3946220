//! Build script for hostplane.
//!
//! The wire protocol is encoded by hand in `src/protocol/` so there is no
//! code generation step.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
}
