// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    if let Some(output) = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
    {
        if let Ok(git_hash) = String::from_utf8(output.stdout) {
            println!("cargo:rustc-env=GIT_HASH={}", git_hash.trim());
        }
    }
    println!("cargo:rerun-if-changed=src/backend/render/shaders");
}
