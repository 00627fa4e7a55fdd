//! Expansion of scope trees into experiments and runs

use super::scope::{walk, ScopeNode, Selection};
use crate::config::{Config, Experiment, Run};
use crate::error::Result;
use crate::layout::RunIdentity;

/// Canonical identity of an experiment: name, revision, sorted variation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExperimentKey {
    pub experiment: String,
    pub revision: Option<String>,
    pub variation: Vec<String>,
}

/// Experiments selected by a single leaf
fn experiment_keys(cfg: &Config, sel: &Selection) -> Result<Vec<ExperimentKey>> {
    let variations = sel.variations(cfg)?;
    let mut keys = Vec::new();
    for info in cfg.all_experiment_infos() {
        if !sel.selects_experiment(&info.name) {
            continue;
        }
        let revisions: Vec<Option<String>> = if info.uses_builds() {
            cfg.all_revisions()
                .filter(|r| sel.selects_revision(&r.name))
                .map(|r| Some(r.name.clone()))
                .collect()
        } else {
            vec![None]
        };
        for revision in &revisions {
            for variation in &variations {
                keys.push(ExperimentKey {
                    experiment: info.name.clone(),
                    revision: revision.clone(),
                    variation: variation.clone(),
                });
            }
        }
    }
    Ok(keys)
}

fn materialize<'a>(cfg: &'a Config, key: &ExperimentKey) -> Result<Experiment<'a>> {
    let info = cfg.get_experiment_info(&key.experiment)?;
    let revision = key
        .revision
        .as_deref()
        .map(|name| cfg.get_revision(name))
        .transpose()?;
    let variation = key
        .variation
        .iter()
        .map(|name| cfg.get_variant(name))
        .collect::<Result<Vec<_>>>()?;
    Ok(Experiment {
        info,
        revision,
        variation,
    })
}

/// All experiments selected by a scope tree, in canonical order
pub fn expand_experiments<'a>(cfg: &'a Config, root: &ScopeNode) -> Result<Vec<Experiment<'a>>> {
    walk(cfg, root, |sel| experiment_keys(cfg, sel))?
        .iter()
        .map(|key| materialize(cfg, key))
        .collect()
}

/// All runs selected by a scope tree, in canonical order
pub fn expand_runs<'a>(cfg: &'a Config, root: &ScopeNode) -> Result<Vec<Run<'a>>> {
    let identities = walk(cfg, root, |sel| {
        let mut ids = Vec::new();
        for key in experiment_keys(cfg, sel)? {
            let info = cfg.get_experiment_info(&key.experiment)?;
            let repetitions = sel.repeat.or(info.repeat).unwrap_or(1);
            for instance in cfg.all_instances() {
                if !sel.selects_instsets(&instance.instsets) {
                    continue;
                }
                for repetition in 0..repetitions {
                    ids.push(RunIdentity {
                        experiment: key.experiment.clone(),
                        variation: key.variation.clone(),
                        revision: key.revision.clone(),
                        instance: instance.short_name.clone(),
                        repetition,
                    });
                }
            }
        }
        Ok(ids)
    })?;

    identities
        .iter()
        .map(|id| {
            let key = ExperimentKey {
                experiment: id.experiment.clone(),
                revision: id.revision.clone(),
                variation: id.variation.clone(),
            };
            Ok(Run {
                experiment: materialize(cfg, &key)?,
                instance: cfg.get_instance(&id.instance)?,
                repetition: id.repetition,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use std::path::Path;

    fn load(yml: &str) -> Config {
        let doc: ConfigDocument = serde_yaml::from_str(yml).unwrap();
        Config::new(Path::new("/exp"), doc).unwrap()
    }

    #[test]
    fn test_two_experiments_two_runs() {
        let cfg = load(
            r#"
instances:
  - repo: local
    items: [uniform-n1000-s1]
experiments:
  - name: bubble-sort
    args: ['./sort.py', '--algo=bubble-sort', '@INSTANCE@']
  - name: insertion-sort
    args: ['./sort.py', '--algo=insertion-sort', '@INSTANCE@']
"#,
        );
        let runs = expand_runs(&cfg, &ScopeNode::from_config(&cfg)).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].experiment.name(), "bubble-sort");
        assert_eq!(runs[1].experiment.name(), "insertion-sort");
    }

    #[test]
    fn test_overlapping_leaves() {
        let cfg = load(
            r#"
builds:
  - name: sorter
revisions:
  - name: r1
    build_version: {sorter: v1}
  - name: r2
    build_version: {sorter: v2}
experiments:
  - name: e1
    use_builds: [sorter]
  - name: e2
    use_builds: [sorter]
matrix:
  include:
    - experiments: [e1]
      revisions: [r1]
    - revisions: [r1]
"#,
        );
        let exps = expand_experiments(&cfg, &ScopeNode::from_config(&cfg)).unwrap();
        let names: Vec<String> = exps.iter().map(|e| e.display_name()).collect();
        assert_eq!(names, vec!["e1 @ r1", "e2 @ r1"]);
    }

    #[test]
    fn test_nested_scopes_and_idempotence() {
        let cfg = load(
            r#"
variants:
  - axis: size
    items:
      - name: size10
      - name: size50
  - axis: algo
    items:
      - name: insertion
      - name: bubble
experiments:
  - name: sort
matrix:
  include:
    - variants: [size50]
      include:
        - variants: [bubble]
        - variants: [insertion, bubble]
    - axes: [algo]
"#,
        );
        let root = ScopeNode::from_config(&cfg);
        let first: Vec<Vec<String>> = expand_experiments(&cfg, &root)
            .unwrap()
            .iter()
            .map(|e| e.variation_names())
            .collect();
        let second: Vec<Vec<String>> = expand_experiments(&cfg, &root)
            .unwrap()
            .iter()
            .map(|e| e.variation_names())
            .collect();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                vec!["bubble".to_string()],
                vec!["bubble".to_string(), "size50".to_string()],
                vec!["insertion".to_string()],
                vec!["insertion".to_string(), "size50".to_string()],
            ]
        );
    }

    #[test]
    fn test_instsets_and_repeat() {
        let cfg = load(
            r#"
instances:
  - repo: local
    set: small
    items: [a, b]
  - repo: local
    set: [small, large]
    items: [c]
  - repo: local
    items: [d]
experiments:
  - name: sort
    repeat: 2
matrix:
  include:
    - instsets: [large]
    - instsets: [small]
      repeat: 1
"#,
        );
        let runs = expand_runs(&cfg, &ScopeNode::from_config(&cfg)).unwrap();
        let ids: Vec<String> = runs.iter().map(|r| r.display_name()).collect();
        assert_eq!(ids, vec!["sort/a", "sort/b", "sort/c", "sort/c[1]"]);

        let all = expand_runs(&cfg, &ScopeNode::all()).unwrap();
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn test_experiment_without_builds_has_no_revision() {
        let cfg = load(
            r#"
builds:
  - name: sorter
revisions:
  - name: r1
    build_version: {sorter: v1}
experiments:
  - name: plain
  - name: built
    use_builds: [sorter]
"#,
        );
        let exps = expand_experiments(&cfg, &ScopeNode::all().revisions(["r1"])).unwrap();
        let names: Vec<String> = exps.iter().map(|e| e.display_name()).collect();
        assert_eq!(names, vec!["built @ r1", "plain"]);
    }
}
