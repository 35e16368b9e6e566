//! Worker command-line assembly.
//!
//! Each configured option maps 1:1 to a worker flag; an option left unset
//! produces no flag and the worker falls back to its own default.

use super::NodeSpec;

/// Build the argv (after the program name) for one worker.
pub fn worker_args(spec: &NodeSpec) -> Vec<String> {
    let mut args = vec![
        "-ip".to_string(),
        spec.addr.clone(),
        "-port".to_string(),
        spec.port.to_string(),
        "-name".to_string(),
        spec.cluster_name.clone(),
        "-flatfile".to_string(),
        spec.flatfile.display().to_string(),
        "-ice_root".to_string(),
        spec.scratch_dir.display().to_string(),
    ];

    if let Some(mb) = spec.heap_min_mb {
        args.push("-heap_min_mb".to_string());
        args.push(mb.to_string());
    }
    if let Some(mb) = spec.heap_max_mb {
        args.push("-heap_max_mb".to_string());
        args.push(mb.to_string());
    }
    if spec.assertions {
        args.push("-ea".to_string());
    }
    if let Some(path) = &spec.credentials_path {
        args.push("-credentials".to_string());
        args.push(path.display().to_string());
    }

    args.extend(spec.extra_flags.iter().cloned());
    args
}
