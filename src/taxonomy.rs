use std::fs;
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::KiraError;

const BUILTIN_TREE: &str = include_str!("../data/bile_acid_tree.json");

/// Node names from a top-level category down to a leaf, category included.
pub type ClassificationPath = Vec<String>;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    children: Vec<usize>,
}

/// Static classification taxonomy stored as an arena. Children keep the order
/// of the source document.
#[derive(Debug, Clone)]
pub struct ClassificationTree {
    nodes: Vec<Node>,
    roots: Vec<usize>,
}

impl ClassificationTree {
    pub fn builtin() -> Result<Self, KiraError> {
        Self::from_json_str(BUILTIN_TREE)
    }

    pub fn load(path: &Path) -> Result<Self, KiraError> {
        let content = fs::read_to_string(path)
            .map_err(|err| KiraError::TaxonomyParse(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, KiraError> {
        let value: Value = serde_json::from_str(content)
            .map_err(|err| KiraError::TaxonomyParse(err.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, KiraError> {
        let root = match value {
            Value::Object(map) if !map.is_empty() => map,
            _ => {
                return Err(KiraError::TaxonomyParse(
                    "taxonomy must be a non-empty object".to_string(),
                ));
            }
        };

        let mut nodes: Vec<Node> = Vec::new();
        let mut roots = Vec::new();
        let mut pending: Vec<(Option<usize>, &Map<String, Value>)> = vec![(None, root)];
        while let Some((parent, map)) = pending.pop() {
            for (name, child) in map {
                let index = nodes.len();
                nodes.push(Node {
                    name: name.clone(),
                    children: Vec::new(),
                });
                match parent {
                    Some(parent) => nodes[parent].children.push(index),
                    None => roots.push(index),
                }
                match child {
                    Value::Object(children) if !children.is_empty() => {
                        pending.push((Some(index), children));
                    }
                    Value::Object(_) | Value::Null => {}
                    other => {
                        return Err(KiraError::TaxonomyParse(format!(
                            "node {name} must map to an object or null, got {other}"
                        )));
                    }
                }
            }
        }

        Ok(Self { nodes, roots })
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.roots.iter().map(|&index| self.nodes[index].name.as_str())
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.children.is_empty())
            .count()
    }

    /// Every root-to-leaf path in document order.
    pub fn paths(&self) -> Vec<ClassificationPath> {
        let mut paths = Vec::new();
        let mut stack: Vec<(usize, ClassificationPath)> = self
            .roots
            .iter()
            .rev()
            .map(|&index| (index, Vec::new()))
            .collect();
        while let Some((index, mut path)) = stack.pop() {
            let node = &self.nodes[index];
            path.push(node.name.clone());
            if node.children.is_empty() {
                paths.push(path);
                continue;
            }
            for &child in node.children.iter().rev() {
                stack.push((child, path.clone()));
            }
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const FIXTURE: &str = r#"{
        "A": {"A1": {"A1x": {}, "A1y": null}, "A2": {}},
        "B": {}
    }"#;

    #[test]
    fn enumerates_paths_in_document_order() {
        let tree = ClassificationTree::from_json_str(FIXTURE).unwrap();
        let paths = tree.paths();
        assert_eq!(
            paths,
            vec![
                vec!["A", "A1", "A1x"],
                vec!["A", "A1", "A1y"],
                vec!["A", "A2"],
                vec!["B"],
            ]
        );
        assert_eq!(paths.len(), tree.leaf_count());
        assert_eq!(tree.categories().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn builtin_tree_has_one_path_per_leaf() {
        let tree = ClassificationTree::builtin().unwrap();
        assert_eq!(tree.leaf_count(), 9);
        assert_eq!(tree.paths().len(), 9);
        assert_eq!(
            tree.categories().collect::<Vec<_>>(),
            vec!["Monohydroxy", "Dihydroxy", "Trihydroxy"]
        );
    }

    #[test]
    fn deep_chain_is_a_single_path() {
        let mut content = String::from("{}");
        // serde_json caps nesting at 128 levels.
        for level in (0..100).rev() {
            content = format!("{{\"n{level}\": {content}}}");
        }
        let tree = ClassificationTree::from_json_str(&content).unwrap();
        let paths = tree.paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 100);
        assert_eq!(paths[0][99], "n99");
    }

    #[test]
    fn rejects_scalar_nodes() {
        let err = ClassificationTree::from_json_str(r#"{"A": {"A1": 3}}"#).unwrap_err();
        assert_matches!(err, KiraError::TaxonomyParse(_));
        let err = ClassificationTree::from_json_str("{}").unwrap_err();
        assert_matches!(err, KiraError::TaxonomyParse(_));
    }
}
