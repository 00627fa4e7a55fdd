//! Materializing instance files

use crate::config::{Config, Instance};
use crate::error::{Error, Result};
use crate::template;
use std::fs::File;
use std::process::{Command, Stdio};

/// Something that can produce the backing files of an instance
pub trait InstanceProvider {
    /// Whether this provider knows how to produce `instance`
    fn provides(&self, instance: &Instance) -> bool;

    /// Produce the files of `instance` inside the instance directory
    fn materialize(&self, cfg: &Config, instance: &Instance) -> Result<()>;
}

/// Runs the `generator` command of an instance and keeps its standard output
#[derive(Debug, Default, Clone, Copy)]
pub struct GeneratorProvider;

impl InstanceProvider for GeneratorProvider {
    fn provides(&self, instance: &Instance) -> bool {
        instance.generator.is_some()
    }

    fn materialize(&self, cfg: &Config, instance: &Instance) -> Result<()> {
        let Some(generator) = &instance.generator else {
            return Err(Error::InvalidConfig(format!(
                "Instance '{}' has no generator",
                instance.yml_name
            )));
        };
        let filename = instance.unique_filename()?;
        let args = template::expand_args(
            generator,
            |p| Ok((p.name == "INSTANCE_FILENAME").then(|| filename.clone())),
            template::no_lists,
        )?;
        let Some((program, rest)) = args.split_first() else {
            return Err(Error::InvalidConfig(format!(
                "Generator of instance '{}' is empty",
                instance.yml_name
            )));
        };

        let target = cfg.instance_dir().join(&filename);
        let partial = cfg.instance_dir().join(format!("{}.gen", filename));
        log::info!("Generating instance '{}'", filename);

        let status = Command::new(program)
            .args(rest)
            .current_dir(cfg.base_dir())
            .stdin(Stdio::null())
            .stdout(File::create(&partial)?)
            .status()?;
        if !status.success() {
            let _ = std::fs::remove_file(&partial);
            return Err(Error::CommandFailed {
                command: args.join(" "),
                status: status.to_string(),
            });
        }
        std::fs::rename(&partial, &target)?;
        Ok(())
    }
}

/// Make all instances available; returns the names that were materialized
///
/// Instances that are already present, fileless or `repo: local` are left
/// alone. An instance no provider can produce is reported and skipped.
pub fn install_instances(cfg: &Config, providers: &[&dyn InstanceProvider]) -> Result<Vec<String>> {
    let instance_dir = cfg.instance_dir();
    std::fs::create_dir_all(&instance_dir)?;

    let mut installed = Vec::new();
    for instance in cfg.all_instances() {
        if instance.is_fileless() || instance.check_available(&instance_dir) {
            continue;
        }
        if instance.repo.as_deref() == Some("local") {
            log::warn!("Local instance '{}' is missing", instance.yml_name);
            continue;
        }
        match providers.iter().find(|p| p.provides(instance)) {
            Some(provider) => {
                provider.materialize(cfg, instance)?;
                installed.push(instance.yml_name.clone());
            }
            None => log::warn!(
                "No provider for instance '{}' (repo: {})",
                instance.yml_name,
                instance.repo.as_deref().unwrap_or("none")
            ),
        }
    }
    Ok(installed)
}
