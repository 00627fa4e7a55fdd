//! @-parameter templates used by run commands and build steps
//!
//! A template embeds parameters as `@NAME@` or `@NAME:argument@`. An argument
//! list may additionally contain items that consist of a single `@NAME@`
//! parameter which expands into zero or more whole arguments (`@EXTRA_ARGS@`).

use crate::error::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .ok_or_else(|| Error::placeholder(pattern, "invalid parameter pattern"))
}

fn param_re() -> Result<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"@(\w+)(?::([^@]+))?@")
}

fn whole_item_re() -> Result<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"^@(\w+)@$")
}

/// A parameter occurrence inside a template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param<'a> {
    pub name: &'a str,
    pub arg: Option<&'a str>,
}

impl<'a> Param<'a> {
    /// The argument after the colon, or an error naming the parameter
    pub fn required_arg(&self) -> Result<&'a str> {
        self.arg.ok_or_else(|| {
            Error::placeholder(self.name, format!("@{}@ requires an argument", self.name))
        })
    }
}

/// Expand all parameters of a single string.
///
/// `lookup` returns `Ok(None)` for parameters it does not know; those are a
/// hard error.
pub fn expand<F>(template: &str, mut lookup: F) -> Result<String>
where
    F: FnMut(&Param<'_>) -> Result<Option<String>>,
{
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in param_re()?.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let param = Param {
            name: caps.get(1).map(|m| m.as_str()).unwrap_or_default(),
            arg: caps.get(2).map(|m| m.as_str()),
        };

        let value = lookup(&param)?.ok_or_else(|| {
            Error::placeholder(template, format!("unexpected parameter @{}@", param.name))
        })?;

        out.push_str(&template[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Expand an argument list.
///
/// Items that consist of exactly one parameter are first offered to
/// `list_lookup`, which may splice in any number of arguments.
pub fn expand_args<F, L>(items: &[String], mut lookup: F, mut list_lookup: L) -> Result<Vec<String>>
where
    F: FnMut(&Param<'_>) -> Result<Option<String>>,
    L: FnMut(&str, &mut F) -> Result<Option<Vec<String>>>,
{
    let mut args = Vec::with_capacity(items.len());

    for item in items {
        if let Some(caps) = whole_item_re()?.captures(item) {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if let Some(spliced) = list_lookup(name, &mut lookup)? {
                args.extend(spliced);
                continue;
            }
        }
        args.push(expand(item, &mut lookup)?);
    }

    Ok(args)
}

/// `list_lookup` for templates that have no list parameters
pub fn no_lists<F>(_name: &str, _lookup: &mut F) -> Result<Option<Vec<String>>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(p: &Param<'_>) -> Result<Option<String>> {
        Ok(match (p.name, p.arg) {
            ("INSTANCE", None) => Some("/inst/a.graph".to_string()),
            ("PREFIX_DIR_FOR", Some(build)) => Some(format!("/builds/{}", build)),
            ("REPETITION", None) => Some("2".to_string()),
            _ => None,
        })
    }

    #[test]
    fn test_expand_simple_and_qualified() {
        let out = expand("@PREFIX_DIR_FOR:sorter@/bin/sort", lookup).unwrap();
        assert_eq!(out, "/builds/sorter/bin/sort");

        let out = expand("--in=@INSTANCE@ --rep=@REPETITION@", lookup).unwrap();
        assert_eq!(out, "--in=/inst/a.graph --rep=2");
    }

    #[test]
    fn test_expand_leaves_plain_text() {
        assert_eq!(expand("user@example", lookup).unwrap(), "user@example");
    }

    #[test]
    fn test_unknown_parameter_is_error() {
        let err = expand("@NOPE@", lookup).unwrap_err();
        assert!(matches!(err, Error::Placeholder { .. }));
    }

    #[test]
    fn test_expand_args_splices_lists() {
        let items: Vec<String> = ["prog", "@EXTRA_ARGS@", "@INSTANCE@"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let args = expand_args(&items, lookup, |name, inner| {
            if name != "EXTRA_ARGS" {
                return Ok(None);
            }
            let extra = vec!["-r".to_string(), "@REPETITION@".to_string()];
            let expanded: Result<Vec<String>> = extra.iter().map(|a| expand(a, &mut *inner)).collect();
            expanded.map(Some)
        })
        .unwrap();

        assert_eq!(args, vec!["prog", "-r", "2", "/inst/a.graph"]);
    }
}
