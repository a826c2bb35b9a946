//! Deterministic names for execution branches and worktree directories.

use std::path::{Path, PathBuf};

/// Longest title slug embedded in a branch name.
pub const MAX_SLUG_LEN: usize = 50;

/// Lowercase, ASCII alphanumerics only, runs of anything else collapsed
/// into a single `-`, truncated to `max_len` without a trailing `-`.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// First eight hex digits of an execution id.
pub fn short_id(execution_id: &str) -> String {
    execution_id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(8)
        .collect::<String>()
        .to_lowercase()
}

/// `<prefix>/<short id>-<slug>`, or `<prefix>/<short id>` without a title.
pub fn branch_name(prefix: &str, execution_id: &str, title: Option<&str>) -> String {
    let prefix = prefix.trim_end_matches('/');
    let slug = title.map(|t| slugify(t, MAX_SLUG_LEN)).unwrap_or_default();
    if slug.is_empty() {
        format!("{}/{}", prefix, short_id(execution_id))
    } else {
        format!("{}/{}-{}", prefix, short_id(execution_id), slug)
    }
}

/// Worktree directory for an execution. A pure function of the id, so a
/// follow-up can find or recreate its parent's worktree.
pub fn worktree_path(worktree_dir: &Path, execution_id: &str) -> PathBuf {
    worktree_dir.join(execution_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_collapses_and_strips() {
        assert_eq!(slugify("Fix: the  Login/Logout bug!", 50), "fix-the-login-logout-bug");
        assert_eq!(slugify("Ünïcode & émoji 🚀 ok", 50), "n-code-moji-ok");
        assert_eq!(slugify("---", 50), "");
    }

    #[test]
    fn test_slugify_truncates_without_trailing_dash() {
        let slug = slugify("aaaa bbbb", 5);
        assert_eq!(slug, "aaaa");
        let long = slugify(&"word ".repeat(40), MAX_SLUG_LEN);
        assert!(long.len() <= MAX_SLUG_LEN);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn test_branch_name_shapes() {
        let id = "3f2a9c1e-0000-4000-8000-000000000000";
        assert_eq!(
            branch_name("foreman/", id, Some("Add OAuth")),
            "foreman/3f2a9c1e-add-oauth"
        );
        assert_eq!(branch_name("foreman", id, None), "foreman/3f2a9c1e");
        assert_eq!(branch_name("foreman", id, Some("!!!")), "foreman/3f2a9c1e");
    }

    #[test]
    fn test_worktree_path_is_deterministic() {
        let base = Path::new("/repo/.foreman/worktrees");
        assert_eq!(worktree_path(base, "abc"), worktree_path(base, "abc"));
        assert_eq!(worktree_path(base, "abc"), base.join("abc"));
    }
}
