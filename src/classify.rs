//! Maps the set of queries a scan satisfied onto the classification tree.
//!
//! For every category the matcher finds the longest leading run of a path
//! (category excluded) whose node names all matched. When several categories
//! match, they are all kept only if every one of them stops at a stage-2
//! node (a chimeric spectrum); otherwise the longest path wins.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::taxonomy::{ClassificationPath, ClassificationTree};

pub const STAGE2_SUFFIX: &str = "stage2";
pub const MATCH_DELIMITER: char = ';';

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    pub satisfied_paths: Vec<ClassificationPath>,
    pub most_specific_path: Option<ClassificationPath>,
    /// Category of the last satisfied path. A chimeric result spans several
    /// categories; read `satisfied_paths` for all of them.
    pub bile_acid_category: Option<String>,
    pub path_length: usize,
}

impl ClassificationResult {
    pub fn is_classified(&self) -> bool {
        !self.satisfied_paths.is_empty()
    }

    pub fn is_chimeric(&self) -> bool {
        self.satisfied_paths.len() > 1
    }
}

#[derive(Debug, Clone)]
pub struct TreeMatcher {
    categories: Vec<(String, Vec<ClassificationPath>)>,
    total_paths: usize,
}

impl TreeMatcher {
    pub fn new(tree: &ClassificationTree) -> Self {
        let mut categories: Vec<(String, Vec<ClassificationPath>)> = Vec::new();
        let paths = tree.paths();
        let total_paths = paths.len();
        for path in paths {
            let Some(category) = path.first().cloned() else {
                continue;
            };
            match categories.iter_mut().find(|(name, _)| *name == category) {
                Some((_, grouped)) => grouped.push(path),
                None => categories.push((category, vec![path])),
            }
        }
        Self {
            categories,
            total_paths,
        }
    }

    pub fn total_paths(&self) -> usize {
        self.total_paths
    }

    /// Best path per category before cross-category resolution, in category
    /// order.
    pub fn category_matches(&self, matches: &BTreeSet<String>) -> Vec<ClassificationPath> {
        let mut found = Vec::new();
        for (category, paths) in &self.categories {
            let mut best: Option<&[String]> = None;
            for path in paths {
                let tail = &path[1..];
                let depth = tail
                    .iter()
                    .take_while(|name| matches.contains(name.as_str()))
                    .count();
                if depth > 0 && best.is_none_or(|current| depth > current.len()) {
                    best = Some(&tail[..depth]);
                }
            }
            if let Some(best) = best {
                let mut path = Vec::with_capacity(best.len() + 1);
                path.push(category.clone());
                path.extend(best.iter().cloned());
                found.push(path);
            }
        }
        found
    }

    pub fn classify(&self, matches: &BTreeSet<String>) -> ClassificationResult {
        if matches.is_empty() {
            return ClassificationResult::default();
        }
        let mut satisfied = self.category_matches(matches);
        if satisfied.len() > 1 && !satisfied.iter().all(|path| ends_in_stage2(path)) {
            satisfied = longest(satisfied).into_iter().collect();
        }

        let most_specific_path = longest(satisfied.iter().cloned());
        let bile_acid_category = satisfied.last().and_then(|path| path.first().cloned());
        let path_length = most_specific_path.as_ref().map_or(0, Vec::len);
        ClassificationResult {
            satisfied_paths: satisfied,
            most_specific_path,
            bile_acid_category,
            path_length,
        }
    }

    /// Classifies a `;`-joined list of matched query names.
    pub fn classify_validation(&self, validation: &str) -> ClassificationResult {
        self.classify(&split_validation(validation))
    }
}

pub fn split_validation(validation: &str) -> BTreeSet<String> {
    validation
        .split(MATCH_DELIMITER)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn ends_in_stage2(path: &ClassificationPath) -> bool {
    path.last()
        .is_some_and(|name| name.ends_with(STAGE2_SUFFIX))
}

/// First of the longest paths.
fn longest<I>(paths: I) -> Option<ClassificationPath>
where
    I: IntoIterator<Item = ClassificationPath>,
{
    paths
        .into_iter()
        .reduce(|best, path| if path.len() > best.len() { path } else { best })
}
