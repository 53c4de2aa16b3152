use std::path::{Path, PathBuf};

#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) models/onnxruntime*/lib/<lib> or models/<lib> near cwd / exe ancestors
/// 3) system library directories
///
/// Must run before the first model is loaded.
pub fn configure_ort_dylib() {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return;
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    let roots = search_roots();
    if let Some(found) = ort_candidates(&roots).into_iter().find(|c| c.is_file()) {
        // SAFETY: called once from the main thread before any ORT session or
        // worker thread exists, so nothing reads the environment concurrently.
        unsafe {
            std::env::set_var("ORT_DYLIB_PATH", &found);
        }
        tracing::info!(path = %found.display(), "configured ORT_DYLIB_PATH");
        return;
    }

    tracing::warn!(
        library = ORT_LIB_NAME,
        "could not locate ONNX Runtime; set ORT_DYLIB_PATH to the shared library"
    );
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    roots
}

fn ort_candidates(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIB_NAME));
        candidates.push(root.join("models").join(ORT_LIB_NAME));
    }

    for dir in ["/usr/local/lib", "/usr/lib", "/opt/homebrew/lib"] {
        candidates.push(Path::new(dir).join(ORT_LIB_NAME));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_local_candidates_come_before_system_ones() {
        let roots = vec![PathBuf::from("/srv/app")];
        let candidates = ort_candidates(&roots);
        assert_eq!(
            candidates[0],
            PathBuf::from("/srv/app/models/onnxruntime/lib").join(ORT_LIB_NAME)
        );
        assert_eq!(candidates[1], PathBuf::from("/srv/app/models").join(ORT_LIB_NAME));
        assert!(candidates.last().unwrap().starts_with("/opt/homebrew/lib"));
    }
}
