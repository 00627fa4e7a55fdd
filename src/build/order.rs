//! Dependency ordering of builds

use crate::config::{BuildInfo, Config};
use crate::error::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Expanding,
    Ordered,
}

/// Order `desired` so that every build comes after everything it requires
///
/// Iterative depth-first search with an explicit stack; re-entering a node
/// that is still expanding is a cycle and is reported with its chain.
pub fn compute_order<'a>(cfg: &'a Config, desired: &[&'a BuildInfo]) -> Result<Vec<&'a BuildInfo>> {
    let mut order = Vec::new();
    let mut marks: HashMap<&'a str, Mark> = HashMap::new();
    let mut stack: Vec<(&'a BuildInfo, Vec<&'a BuildInfo>)> = Vec::new();

    let visit = |info: &'a BuildInfo,
                     stack: &mut Vec<(&'a BuildInfo, Vec<&'a BuildInfo>)>,
                     marks: &mut HashMap<&'a str, Mark>|
     -> Result<()> {
        match marks.get(info.name.as_str()) {
            None => {
                let links = info
                    .requires
                    .iter()
                    .rev()
                    .map(|name| cfg.get_build_info(name))
                    .collect::<Result<Vec<_>>>()?;
                marks.insert(&info.name, Mark::Expanding);
                stack.push((info, links));
                Ok(())
            }
            Some(Mark::Expanding) => {
                let start = stack
                    .iter()
                    .position(|(s, _)| s.name == info.name)
                    .unwrap_or(0);
                let mut chain: Vec<String> = stack[start..].iter().map(|(s, _)| s.name.clone()).collect();
                chain.push(info.name.clone());
                Err(Error::CyclicDependency { chain })
            }
            Some(Mark::Ordered) => Ok(()),
        }
    };

    for &info in desired {
        visit(info, &mut stack, &mut marks)?;

        while let Some((top, links)) = stack.last_mut() {
            match links.pop() {
                Some(next) => visit(next, &mut stack, &mut marks)?,
                None => {
                    let done = *top;
                    marks.insert(&done.name, Mark::Ordered);
                    stack.pop();
                    order.push(done);
                }
            }
        }
    }

    Ok(order)
}

/// Transitive requirements of a build in dependency order, without the build itself
pub fn traverse_requirements<'a>(cfg: &'a Config, info: &'a BuildInfo) -> Result<Vec<&'a BuildInfo>> {
    let direct = info
        .requires
        .iter()
        .map(|name| cfg.get_build_info(name))
        .collect::<Result<Vec<_>>>()?;
    compute_order(cfg, &direct)
}
