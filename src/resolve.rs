use crate::config::ServerConfig;

/// Canonicalize a path, falling back to the input when the target does not
/// exist or cannot be resolved.
fn canonicalize_or(path: &str) -> String {
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved.to_string_lossy().into_owned(),
        Err(_) => path.to_string(),
    }
}

/// Resolve `relative` under `base` and guarantee the result stays inside the
/// canonical base. Returns None when the resolution must be rejected.
///
/// Absolute request paths are first routed through the location table: a
/// matched location with a root override swaps the base and strips the
/// matched prefix. A location key that names a file exactly (no trailing
/// slash) resolves to that file under the override root.
///
/// Targets that do not exist yet (upload destinations) are accepted as long
/// as the raw join still starts with the canonical base.
pub fn resolve_path(config: &ServerConfig, base: &str, relative: &str) -> Option<String> {
    if relative.contains("..") {
        return None;
    }
    let mut canonical_base = canonicalize_or(base);
    let mut join_path = relative.to_string();
    if relative.starts_with('/') {
        let (best_path, best_location) = config.match_location(relative);
        if !best_path.is_empty() && !best_location.root.is_empty() {
            canonical_base = canonicalize_or(&best_location.root);
            let sub = if relative.len() < best_path.len() {
                ""
            } else {
                &relative[best_path.len()..]
            };
            join_path = sub.trim_start_matches('/').to_string();
        }
        // An exact match against a location key without a trailing slash is a
        // direct file reference.
        if join_path.is_empty() && best_path == relative && !best_path.ends_with('/') {
            join_path = relative[1..].to_string();
        }
    }

    let mut full_path = canonical_base.clone();
    if !full_path.ends_with('/') && !join_path.starts_with('/') {
        full_path.push('/');
    }
    full_path.push_str(&join_path);

    match std::fs::canonicalize(&full_path) {
        Ok(resolved) => {
            let resolved = resolved.to_string_lossy().into_owned();
            if resolved.starts_with(&canonical_base) {
                Some(resolved)
            } else {
                eprintln!(
                    "warning: resolved path {} escaped base {}",
                    resolved, canonical_base
                );
                None
            }
        }
        Err(_) => {
            if full_path.starts_with(&canonical_base) {
                Some(full_path)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;

    use crate::config::LocationConfig;

    fn canonical(path: &std::path::Path) -> String {
        fs::canonicalize(path).unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn resolves_file_under_base() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), "hello").unwrap();
        let config = ServerConfig::default();
        let resolved =
            resolve_path(&config, root.path().to_str().unwrap(), "/index.html").unwrap();
        assert_eq!(resolved, format!("{}/index.html", canonical(root.path())));
    }

    #[test]
    fn rejects_dot_dot_anywhere() {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig::default();
        let base = root.path().to_str().unwrap();
        assert_eq!(resolve_path(&config, base, "/../etc/passwd"), None);
        assert_eq!(resolve_path(&config, base, "/a/../b"), None);
        assert_eq!(resolve_path(&config, base, "a..b"), None);
    }

    #[test]
    fn rejects_symlink_escape() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        let config = ServerConfig::default();
        assert_eq!(
            resolve_path(&config, root.path().to_str().unwrap(), "/link/secret"),
            None
        );
    }

    #[test]
    fn accepts_missing_target_inside_base() {
        // Upload destinations do not exist yet; the raw join is accepted when
        // it stays under the canonical base.
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig::default();
        let resolved =
            resolve_path(&config, root.path().to_str().unwrap(), "/new-file.bin").unwrap();
        assert_eq!(resolved, format!("{}/new-file.bin", canonical(root.path())));
    }

    #[test]
    fn location_root_override_strips_prefix() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        fs::write(other.path().join("a.txt"), "x").unwrap();
        let mut config = ServerConfig::default();
        let mut location = LocationConfig::default();
        location.path = "/static/".to_string();
        location.root = other.path().to_string_lossy().into_owned();
        config.locations.insert("/static/".to_string(), location);
        let resolved =
            resolve_path(&config, root.path().to_str().unwrap(), "/static/a.txt").unwrap();
        assert_eq!(resolved, format!("{}/a.txt", canonical(other.path())));
    }

    #[test]
    fn exact_file_location_resolves_to_file() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("conf")).unwrap();
        fs::write(root.path().join("conf/app.conf"), "x").unwrap();
        let mut config = ServerConfig::default();
        let mut location = LocationConfig::default();
        location.path = "/conf/app.conf".to_string();
        location.root = root.path().to_string_lossy().into_owned();
        config
            .locations
            .insert("/conf/app.conf".to_string(), location);
        let resolved =
            resolve_path(&config, root.path().to_str().unwrap(), "/conf/app.conf").unwrap();
        assert_eq!(
            resolved,
            format!("{}/conf/app.conf", canonical(root.path()))
        );
    }

    #[test]
    fn relative_paths_join_directly() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("store")).unwrap();
        let config = ServerConfig::default();
        let resolved =
            resolve_path(&config, root.path().to_str().unwrap(), "store").unwrap();
        assert_eq!(resolved, format!("{}/store", canonical(root.path())));
    }
}
