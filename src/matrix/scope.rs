//! Scope trees and the selections they resolve to

use crate::config::{Config, ScopeDoc};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// A node of restrictions; `None` means "inherit from the parent"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeNode {
    pub experiments: Option<BTreeSet<String>>,
    pub revisions: Option<BTreeSet<String>>,
    pub axes: Option<BTreeSet<String>>,
    pub variants: Option<BTreeSet<String>>,
    pub instsets: Option<BTreeSet<String>>,
    pub repeat: Option<u32>,
    pub children: Vec<ScopeNode>,
}

fn to_set<I, S>(items: I) -> Option<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Some(items.into_iter().map(Into::into).collect())
}

impl From<&ScopeDoc> for ScopeNode {
    fn from(doc: &ScopeDoc) -> Self {
        let set = |v: &Option<Vec<String>>| v.as_ref().and_then(|v| to_set(v.iter().cloned()));
        Self {
            experiments: set(&doc.experiments),
            revisions: set(&doc.revisions),
            axes: set(&doc.axes),
            variants: set(&doc.variants),
            instsets: set(&doc.instsets),
            repeat: doc.repeat,
            children: doc.include.iter().map(ScopeNode::from).collect(),
        }
    }
}

impl ScopeNode {
    /// Unrestricted node
    pub fn all() -> Self {
        Self::default()
    }

    /// Root of the configured matrix; without a matrix everything is selected
    pub fn from_config(cfg: &Config) -> Self {
        match cfg.matrix() {
            Some(matrix) => Self {
                children: matrix.include.iter().map(ScopeNode::from).collect(),
                ..Self::default()
            },
            None => Self::all(),
        }
    }

    pub fn experiments<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.experiments = to_set(names);
        self
    }

    pub fn revisions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.revisions = to_set(names);
        self
    }

    pub fn axes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.axes = to_set(names);
        self
    }

    pub fn variants<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variants = to_set(names);
        self
    }

    pub fn instsets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instsets = to_set(names);
        self
    }

    pub fn repeat(mut self, n: u32) -> Self {
        self.repeat = Some(n);
        self
    }

    pub fn child(mut self, node: ScopeNode) -> Self {
        self.children.push(node);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Intersect a parent's free set with a child's restriction
fn intersect(parent: &Option<BTreeSet<String>>, child: &Option<BTreeSet<String>>) -> Option<BTreeSet<String>> {
    match (parent, child) {
        (_, None) => parent.clone(),
        (None, Some(c)) => Some(c.clone()),
        (Some(p), Some(c)) => Some(p.intersection(c).cloned().collect()),
    }
}

/// Fully resolved restrictions at one node of a scope tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub experiments: Option<BTreeSet<String>>,
    pub revisions: Option<BTreeSet<String>>,
    pub axes: Option<BTreeSet<String>>,
    /// Variant restrictions grouped by axis; axes without an entry are free
    pub variants: BTreeMap<String, BTreeSet<String>>,
    pub instsets: Option<BTreeSet<String>>,
    pub repeat: Option<u32>,
}

impl Selection {
    /// Apply a node's restrictions; every name must exist in the configuration
    pub fn restrict(&self, cfg: &Config, node: &ScopeNode) -> Result<Self> {
        for name in node.experiments.iter().flatten() {
            cfg.get_experiment_info(name)?;
        }
        for name in node.revisions.iter().flatten() {
            cfg.get_revision(name)?;
        }
        for name in node.axes.iter().flatten() {
            cfg.axis_variants(name)?;
        }
        if let Some(instsets) = &node.instsets {
            let known = cfg.all_instsets();
            for name in instsets {
                if !known.contains(&Some(name.clone())) {
                    return Err(Error::lookup("Instance set", name));
                }
            }
        }

        let mut variants = self.variants.clone();
        if let Some(names) = &node.variants {
            let mut by_axis: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for name in names {
                let variant = cfg.get_variant(name)?;
                by_axis
                    .entry(variant.axis.clone())
                    .or_default()
                    .insert(variant.name.clone());
            }
            for (axis, child) in by_axis {
                let merged = match variants.get(&axis) {
                    Some(parent) => parent.intersection(&child).cloned().collect(),
                    None => child,
                };
                variants.insert(axis, merged);
            }
        }

        Ok(Self {
            experiments: intersect(&self.experiments, &node.experiments),
            revisions: intersect(&self.revisions, &node.revisions),
            axes: intersect(&self.axes, &node.axes),
            variants,
            instsets: intersect(&self.instsets, &node.instsets),
            repeat: node.repeat.or(self.repeat),
        })
    }

    pub fn selects_experiment(&self, name: &str) -> bool {
        self.experiments.as_ref().map_or(true, |s| s.contains(name))
    }

    pub fn selects_revision(&self, name: &str) -> bool {
        self.revisions.as_ref().map_or(true, |s| s.contains(name))
    }

    /// An instance is selected if one of its sets is selected
    pub fn selects_instsets(&self, sets: &BTreeSet<Option<String>>) -> bool {
        match &self.instsets {
            None => true,
            Some(selected) => sets
                .iter()
                .flatten()
                .any(|s| selected.contains(s)),
        }
    }

    /// All canonical variations in scope
    ///
    /// Axes outside the scope contribute a placeholder that is dropped, so a
    /// variation lists at most one variant per axis, sorted by variant name.
    pub fn variations(&self, cfg: &Config) -> Result<Vec<Vec<String>>> {
        let mut bundle: Vec<Vec<Option<String>>> = Vec::new();
        for axis in cfg.axes() {
            let in_scope = self.axes.as_ref().map_or(true, |s| s.contains(axis));
            if !in_scope {
                bundle.push(vec![None]);
                continue;
            }
            let all = cfg.axis_variants(axis)?;
            let candidates: Vec<Option<String>> = match self.variants.get(axis) {
                Some(restricted) => all
                    .iter()
                    .filter(|v| restricted.contains(*v))
                    .cloned()
                    .map(Some)
                    .collect(),
                None => all.iter().cloned().map(Some).collect(),
            };
            bundle.push(candidates);
        }

        let mut product: Vec<Vec<Option<String>>> = vec![Vec::new()];
        for candidates in &bundle {
            let mut next = Vec::with_capacity(product.len() * candidates.len());
            for prefix in &product {
                for candidate in candidates {
                    let mut tuple = prefix.clone();
                    tuple.push(candidate.clone());
                    next.push(tuple);
                }
            }
            product = next;
        }

        Ok(product
            .into_iter()
            .map(|tuple| {
                let mut names: Vec<String> = tuple.into_iter().flatten().collect();
                names.sort();
                names
            })
            .collect())
    }
}

/// Walk a scope tree, run `extract` on every leaf, merge and canonicalize
///
/// The merged output is sorted; of every group of equal items only the first
/// is kept, so overlapping branches yield an entity exactly once.
pub fn walk<T, F>(cfg: &Config, root: &ScopeNode, mut extract: F) -> Result<Vec<T>>
where
    T: Ord,
    F: FnMut(&Selection) -> Result<Vec<T>>,
{
    let mut out = Vec::new();
    let mut stack = vec![(root, Selection::default().restrict(cfg, root)?)];
    while let Some((node, selection)) = stack.pop() {
        if node.is_leaf() {
            out.extend(extract(&selection)?);
            continue;
        }
        for child in node.children.iter().rev() {
            let restricted = selection.restrict(cfg, child)?;
            stack.push((child, restricted));
        }
    }

    out.sort();
    out.dedup_by(|later, first| later == first);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use std::path::Path;

    fn config() -> Config {
        let doc: ConfigDocument = serde_yaml::from_str(
            r#"
variants:
  - axis: size
    items:
      - name: size50
      - name: size10
  - axis: algo
    items:
      - name: insertion
      - name: bubble
experiments:
  - name: sort
"#,
        )
        .unwrap();
        Config::new(Path::new("/exp"), doc).unwrap()
    }

    #[test]
    fn test_intersection() {
        let cfg = config();
        let root = ScopeNode::all().experiments(["sort"]);
        let sel = Selection::default().restrict(&cfg, &root).unwrap();
        let nested = sel
            .restrict(&cfg, &ScopeNode::all().variants(["size10", "size50"]))
            .unwrap()
            .restrict(&cfg, &ScopeNode::all().variants(["size10"]))
            .unwrap();
        assert_eq!(nested.variants["size"], BTreeSet::from(["size10".to_string()]));
        assert!(nested.selects_experiment("sort"));
    }

    #[test]
    fn test_variations_are_canonical() {
        let cfg = config();
        let variations = Selection::default().variations(&cfg).unwrap();
        assert_eq!(variations.len(), 4);
        for v in &variations {
            let mut sorted = v.clone();
            sorted.sort();
            assert_eq!(v, &sorted);
            assert_eq!(v.len(), 2);
        }
        assert!(variations.contains(&vec!["bubble".to_string(), "size50".to_string()]));
    }

    #[test]
    fn test_axis_out_of_scope() {
        let cfg = config();
        let sel = Selection::default()
            .restrict(&cfg, &ScopeNode::all().axes(["algo"]))
            .unwrap();
        let variations = sel.variations(&cfg).unwrap();
        assert_eq!(variations, vec![vec!["bubble".to_string()], vec!["insertion".to_string()]]);
    }

    #[test]
    fn test_unknown_names() {
        let cfg = config();
        for node in [
            ScopeNode::all().experiments(["nope"]),
            ScopeNode::all().revisions(["nope"]),
            ScopeNode::all().axes(["nope"]),
            ScopeNode::all().variants(["nope"]),
            ScopeNode::all().instsets(["nope"]),
        ] {
            let err = Selection::default().restrict(&cfg, &node).unwrap_err();
            assert!(matches!(err, Error::Lookup { .. }), "{err}");
        }
    }

    #[test]
    fn test_walk_dedups() {
        let cfg = config();
        let root = ScopeNode::all()
            .child(ScopeNode::all().variants(["size10"]))
            .child(ScopeNode::all().variants(["size10", "size50"]));
        let out = walk(&cfg, &root, |sel| sel.variations(&cfg)).unwrap();
        assert_eq!(out.len(), 4);
        let again = walk(&cfg, &root, |sel| sel.variations(&cfg)).unwrap();
        assert_eq!(out, again);
    }
}
