use std::env;
use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|text| text.trim().to_string())
}

/// Stamps `FLEET_BUILD_ID` as `<version>+<utc timestamp>-<sha>[-dirty]`.
/// Packaging pipelines can pin the id by exporting `FLEET_BUILD_ID` themselves.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=FLEET_BUILD_ID");

    if let Some(pinned) = env::var("FLEET_BUILD_ID")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
    {
        println!("cargo:rustc-env=FLEET_BUILD_ID={pinned}");
        return;
    }

    let source = match git(&["rev-parse", "--short", "HEAD"]).filter(|sha| !sha.is_empty()) {
        Some(sha) => {
            let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
                .map(|changes| !changes.is_empty())
                .unwrap_or(false);
            if dirty {
                format!("{sha}-dirty")
            } else {
                sha
            }
        }
        None => "nogit".to_string(),
    };
    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let version = env!("CARGO_PKG_VERSION");
    println!("cargo:rustc-env=FLEET_BUILD_ID={version}+{timestamp}-{source}");
}
