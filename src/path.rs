//! Path helpers shared by the tree, the lock manager and the caches.
//!
//! All paths handled by the core are absolute, `/`-separated and normalized:
//! no repeated slashes, no trailing slash except for the root itself.

/// Normalize a path: ensure a leading slash, collapse repeated slashes and
/// remove the trailing slash (except root).
pub fn normalize(path: &str) -> String {
    let mut result = String::with_capacity(path.len() + 1);
    result.push('/');
    let mut prev_slash = true;

    for ch in path.chars() {
        if ch == '/' {
            if !prev_slash {
                result.push('/');
            }
            prev_slash = true;
        } else {
            result.push(ch);
            prev_slash = false;
        }
    }

    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Parent of a normalized path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" || path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(pos) => Some(&path[..pos]),
        None => Some("/"),
    }
}

/// Last component of a normalized path (empty for the root).
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Join a parent path with a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Collect the *strict* ancestors of `path`, nearest first.
///
/// Example: `"/a/b/c"` → `["/a/b", "/a", "/"]`
pub fn ancestors(path: &str) -> Vec<&str> {
    if path == "/" || path.is_empty() {
        return Vec::new();
    }
    let mut result = Vec::new();
    let mut end = path.len();
    while let Some(pos) = path[..end].rfind('/') {
        if pos == 0 {
            result.push("/");
            break;
        }
        result.push(&path[..pos]);
        end = pos;
    }
    result
}

/// Every prefix of `path` below the root, outermost first.
///
/// Example: `"/a/b/c"` → `["/a", "/a/b", "/a/b/c"]`
pub fn prefixes(path: &str) -> Vec<&str> {
    let mut result: Vec<&str> = ancestors(path)
        .into_iter()
        .filter(|p| *p != "/")
        .collect();
    result.reverse();
    if path != "/" && !path.is_empty() {
        result.push(path);
    }
    result
}

/// Prefix that every strict descendant of `root` starts with.
pub fn descendant_prefix(root: &str) -> String {
    if root == "/" {
        "/".to_string()
    } else {
        format!("{}/", root)
    }
}

/// True if `path` equals `root` or lies below it.
pub fn is_within(path: &str, root: &str) -> bool {
    if root == "/" {
        return true;
    }
    path == root
        || (path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'/')
}

/// Replace the `from` prefix of `path` with `to`. `path` must be within `from`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        return to.to_string();
    }
    let rest = if from == "/" {
        &path[1..]
    } else {
        &path[from.len() + 1..]
    };
    join(to, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/b/"), "/a/b");
        assert_eq!(normalize("/a//b"), "/a/b");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b.txt"), Some("/a"));
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn test_ancestors_and_prefixes() {
        assert_eq!(ancestors("/"), Vec::<&str>::new());
        assert_eq!(ancestors("/a"), vec!["/"]);
        assert_eq!(ancestors("/a/b/c"), vec!["/a/b", "/a", "/"]);
        assert_eq!(prefixes("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert!(prefixes("/").is_empty());
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_rebase() {
        assert_eq!(rebase("/x/y/z", "/x", "/q"), "/q/y/z");
        assert_eq!(rebase("/x", "/x", "/q"), "/q");
        assert_eq!(rebase("/x/y", "/", "/r"), "/r/x/y");
    }
}
