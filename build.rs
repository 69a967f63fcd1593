//! Stamps the build with the source revision the daemon reports at startup

use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn main() {
    // Tag or short hash, marked when built from uncommitted changes
    let revision = git(&["describe", "--tags", "--always", "--dirty=-modified"])
        .unwrap_or_else(|| "unversioned".to_string());
    println!("cargo:rustc-env=RIDE_CONTROLLER_REVISION={revision}");

    // Branch switches move HEAD, new commits move the ref it points at
    println!("cargo:rerun-if-changed=.git/HEAD");
    if let Some(head_ref) = git(&["symbolic-ref", "-q", "HEAD"]) {
        println!("cargo:rerun-if-changed=.git/{head_ref}");
    }
}
