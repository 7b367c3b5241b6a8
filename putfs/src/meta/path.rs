//! Path string helpers. Every path handled by the cache is normalized:
//! absolute, single `/` separators, no trailing separator, root is `/`.

pub fn normalize(p: &str) -> String {
    let parts: Vec<&str> = p.split('/').filter(|s| !s.is_empty() && *s != ".").collect();
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Join a normalized directory path and a leaf name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Split a normalized path into (parent, leaf). `None` for the root.
pub fn split(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let n = path.rfind('/')?;
    if n == 0 {
        Some(("/", &path[1..]))
    } else {
        Some((&path[..n], &path[n + 1..]))
    }
}

pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Every prefix of `path` from the root down to `path` itself.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = vec![String::from("/")];
    let mut cur = String::from("/");
    for part in components(path) {
        cur = join(&cur, part);
        out.push(cur.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_separators() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("//Movies///a.mkv/"), "/Movies/a.mkv");
        assert_eq!(normalize("Movies/./x"), "/Movies/x");
    }

    #[test]
    fn split_and_join() {
        assert_eq!(split("/"), None);
        assert_eq!(split("/a"), Some(("/", "a")));
        assert_eq!(split("/a/b/c"), Some(("/a/b", "c")));
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a/b", "c"), "/a/b/c");
    }

    #[test]
    fn ancestors_include_root_and_self() {
        assert_eq!(ancestors("/"), vec!["/"]);
        assert_eq!(ancestors("/a/b"), vec!["/", "/a", "/a/b"]);
    }
}
