// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Environment variables read by driftd, with their doc lines.
const ENV_VARS: &[(&str, &str)] = &[
    ("DRIFT_STATE_DIR", "override the driftd state directory."),
    ("DRIFT_CONFIG", "path to the config file when --config is not given."),
    ("XDG_STATE_HOME", "XDG base directory for state data."),
    ("RUST_LOG", "controls log level filtering (used by tracing-subscriber)."),
];

fn main() {
    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("cargo:warning=OUT_DIR not set: {e}");
            std::process::exit(1);
        }
    };
    let dest_path = Path::new(&out_dir).join("env_names.rs");

    let mut contents = String::new();
    for (name, doc) in ENV_VARS {
        let _ = writeln!(contents, "/// Environment variable: {doc}");
        let _ = writeln!(contents, "pub const {name}: &str = \"{name}\";\n");
    }

    if let Err(e) = fs::write(&dest_path, contents) {
        eprintln!("cargo:warning=failed to write env_names.rs: {e}");
        std::process::exit(1);
    }
    println!("cargo:rerun-if-changed=build.rs");
}
