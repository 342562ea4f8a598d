//! Slash-separated path handling over the in-memory tree.

use super::tree::{NodeId, NodeKind, Tree};
use crate::error::VolumeError;

/// Split a path into components. A leading `/` becomes a `"/"` component;
/// empty components are dropped.
pub fn split_path(path: &str) -> Vec<String> {
    let mut components = Vec::new();
    if path.starts_with('/') {
        components.push("/".to_string());
    }
    components.extend(
        path.split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string),
    );
    components
}

/// Split a path into its parent components and final name.
///
/// Returns `None` when there is no final name (empty path or `/`).
pub fn split_parent(path: &str) -> Option<(Vec<String>, String)> {
    let mut components = split_path(path);
    let name = components.pop()?;
    if name == "/" {
        return None;
    }
    Some((components, name))
}

impl Tree {
    /// Walk `components` starting from the directory `start`.
    pub fn resolve(&self, start: NodeId, components: &[String]) -> Result<NodeId, VolumeError> {
        if components.is_empty() {
            return Err(VolumeError::NotFound(String::new()));
        }

        let mut current = self.target_of(start);
        let last = components.len() - 1;
        for (i, component) in components.iter().enumerate() {
            if i == 0 && component == "/" {
                current = self.root();
                continue;
            }
            if component == "." && current == self.root() {
                continue;
            }

            let child = self
                .find_child(current, component)
                .ok_or_else(|| VolumeError::NotFound(component.clone()))?;
            match self.get(child).kind {
                NodeKind::Directory => current = child,
                NodeKind::DotAlias { target } => current = target,
                NodeKind::File if i == last => return Ok(child),
                NodeKind::File => {
                    return Err(VolumeError::NotFound(format!(
                        "{component} is not a directory"
                    )))
                }
            }
        }
        Ok(current)
    }

    /// Render the absolute path of a node (`/` for the root).
    pub fn absolute_path(&self, node: NodeId) -> String {
        let mut names = Vec::new();
        let mut cur = self.target_of(node);
        while let Some(parent) = self.get(cur).parent {
            names.push(self.get(cur).name.as_str());
            cur = parent;
        }
        if names.is_empty() {
            return "/".into();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::dirent::{alias_short_name, FatTimestamp, ShortRecord, ATTR_ARCHIVE, ATTR_DIRECTORY};
    use crate::fs::tree::Node;

    /// / -> a -> b, / -> f.txt
    fn sample_tree() -> (Tree, NodeId, NodeId, NodeId) {
        let now = FatTimestamp::now();
        let mut tree = Tree::new(2, vec![2]);
        let root = tree.root();

        let a_rec = ShortRecord::new(alias_short_name(1), ATTR_DIRECTORY, 3, now);
        let a = tree.add(Node::from_record("a".into(), &a_rec, vec![3]));
        tree.attach(root, a);
        tree.add_dot_aliases(a);

        let b_rec = ShortRecord::new(alias_short_name(1), ATTR_DIRECTORY, 4, now);
        let b = tree.add(Node::from_record("b".into(), &b_rec, vec![4]));
        tree.attach(a, b);
        tree.add_dot_aliases(b);

        let f_rec = ShortRecord::new(alias_short_name(2), ATTR_ARCHIVE, 0, now);
        let f = tree.add(Node::from_record("f.txt".into(), &f_rec, vec![]));
        tree.attach(root, f);
        (tree, a, b, f)
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a//b/"), vec!["/", "a", "b"]);
        assert_eq!(split_path("a/b"), vec!["a", "b"]);
        assert_eq!(split_path("/"), vec!["/"]);
        assert!(split_path("").is_empty());
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(
            split_parent("/a/b"),
            Some((vec!["/".to_string(), "a".to_string()], "b".to_string()))
        );
        assert_eq!(split_parent("x"), Some((vec![], "x".to_string())));
        assert_eq!(split_parent("/"), None);
        assert_eq!(split_parent(""), None);
    }

    #[test]
    fn test_resolve_absolute_and_relative() {
        let (tree, a, b, f) = sample_tree();
        let root = tree.root();
        assert_eq!(tree.resolve(root, &split_path("/a/b")).unwrap(), b);
        assert_eq!(tree.resolve(a, &split_path("b")).unwrap(), b);
        assert_eq!(tree.resolve(b, &split_path("..")).unwrap(), a);
        assert_eq!(tree.resolve(b, &split_path("../..")).unwrap(), root);
        assert_eq!(tree.resolve(b, &split_path("./.")).unwrap(), b);
        assert_eq!(tree.resolve(b, &split_path("/f.txt")).unwrap(), f);
        assert_eq!(tree.resolve(root, &split_path("/")).unwrap(), root);
    }

    #[test]
    fn test_resolve_edge_cases() {
        let (tree, _, _, _) = sample_tree();
        let root = tree.root();
        assert!(matches!(tree.resolve(root, &[]), Err(VolumeError::NotFound(_))));
        assert_eq!(tree.resolve(root, &split_path(".")).unwrap(), root);
        assert!(matches!(
            tree.resolve(root, &split_path("..")),
            Err(VolumeError::NotFound(_))
        ));
        assert!(matches!(
            tree.resolve(root, &split_path("f.txt/x")),
            Err(VolumeError::NotFound(_))
        ));
        assert!(matches!(
            tree.resolve(root, &split_path("missing")),
            Err(VolumeError::NotFound(_))
        ));
    }

    #[test]
    fn test_absolute_path() {
        let (tree, a, b, f) = sample_tree();
        assert_eq!(tree.absolute_path(tree.root()), "/");
        assert_eq!(tree.absolute_path(a), "/a");
        assert_eq!(tree.absolute_path(b), "/a/b");
        assert_eq!(tree.absolute_path(f), "/f.txt");
    }
}
