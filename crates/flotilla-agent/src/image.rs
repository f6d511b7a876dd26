//! Agent image reference rewriting for private registries.

/// Resolves the image to pull: a configured global registry prefix is
/// stripped before the private repository prefix is applied, so mirrored
/// images end up under one root.
pub fn resolve(global_registry: Option<&str>, repo_prefix: Option<&str>, image: &str) -> String {
    let mut image = image.to_string();

    if let (Some(global), Some(_)) = (global_registry, repo_prefix) {
        if let Some(stripped) = image
            .strip_prefix(global)
            .map(|rest| rest.trim_start_matches('/'))
        {
            image = stripped.to_string();
        }
    }

    match repo_prefix {
        Some(prefix) if !image.starts_with(prefix) => format!("{prefix}/{image}"),
        _ => image,
    }
}
