//! Built-in rule types.

use super::{RuleAction, RuleTypeRegistry};
use crate::context::RuleContext;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

pub fn register_builtins(registry: &mut RuleTypeRegistry) {
    registry.register("file_set", Arc::new(FileSetRule));
    registry.register("copy_files", Arc::new(CopyFilesRule));
    registry.register("concat_files", Arc::new(ConcatFilesRule));
    registry.register("template_files", Arc::new(TemplateFilesRule));
    registry.register("shell_execute", Arc::new(ShellExecuteRule));
    registry.register("shell_test", Arc::new(ShellTestRule));
}

/// Passes its (globbed, filtered, de-duplicated) inputs through as outputs.
pub struct FileSetRule;

impl RuleAction for FileSetRule {
    fn compute_outputs(&self, ctx: &RuleContext) -> Result<Vec<PathBuf>> {
        Ok(ctx.inputs.clone())
    }

    fn execute(&self, _ctx: &RuleContext) -> Result<()> {
        Ok(())
    }
}

/// Copies every input to the mirrored location under `build-out`.
pub struct CopyFilesRule;

impl RuleAction for CopyFilesRule {
    fn compute_outputs(&self, ctx: &RuleContext) -> Result<Vec<PathBuf>> {
        Ok(ctx
            .inputs
            .iter()
            .map(|src| ctx.out_path_for_src(src))
            .collect())
    }

    fn execute(&self, ctx: &RuleContext) -> Result<()> {
        for (src, dst) in ctx.inputs.iter().zip(&ctx.outputs) {
            RuleContext::ensure_parent_exists(dst)?;
            std::fs::copy(src, dst).with_context(|| {
                format!("Failed to copy {} to {}", src.display(), dst.display())
            })?;
        }
        ctx.log.info(format!("copied {} file(s)", ctx.inputs.len()));
        Ok(())
    }
}

/// Concatenates all inputs, in order, into `out` (default: the rule name).
pub struct ConcatFilesRule;

impl RuleAction for ConcatFilesRule {
    fn compute_outputs(&self, ctx: &RuleContext) -> Result<Vec<PathBuf>> {
        Ok(vec![ctx.out_path(ctx.rule.param_str("out"))])
    }

    fn execute(&self, ctx: &RuleContext) -> Result<()> {
        let output = ctx
            .outputs
            .first()
            .context("concat_files has no output path")?;
        RuleContext::ensure_parent_exists(output)?;
        let mut file = std::fs::File::create(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        for (i, src) in ctx.inputs.iter().enumerate() {
            let data =
                std::fs::read(src).with_context(|| format!("Failed to read {}", src.display()))?;
            file.write_all(&data)?;
            ctx.log.set_work_unit(i as u64 + 1, ctx.inputs.len() as u64);
        }
        Ok(())
    }
}

/// Replaces `${key}` placeholders with the values of the `params` object and
/// writes each result under `build-out`, optionally with `new_extension`.
pub struct TemplateFilesRule;

impl TemplateFilesRule {
    fn render(ctx: &RuleContext, template: &str) -> String {
        let mut rendered = template.to_string();
        if let Some(serde_json::Value::Object(params)) = ctx.rule.params.get("params") {
            for (key, value) in params {
                let replacement = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                rendered = rendered.replace(&format!("${{{}}}", key), &replacement);
            }
        }
        rendered
    }
}

impl RuleAction for TemplateFilesRule {
    fn compute_outputs(&self, ctx: &RuleContext) -> Result<Vec<PathBuf>> {
        let extension = ctx.rule.param_str("new_extension");
        Ok(ctx
            .inputs
            .iter()
            .map(|src| {
                let out = ctx.out_path_for_src(src);
                match extension {
                    Some(ext) => out.with_extension(ext.trim_start_matches('.')),
                    None => out,
                }
            })
            .collect())
    }

    fn execute(&self, ctx: &RuleContext) -> Result<()> {
        for (src, dst) in ctx.inputs.iter().zip(&ctx.outputs) {
            let template = std::fs::read_to_string(src)
                .with_context(|| format!("Failed to read template {}", src.display()))?;
            RuleContext::ensure_parent_exists(dst)?;
            std::fs::write(dst, Self::render(ctx, &template))
                .with_context(|| format!("Failed to write {}", dst.display()))?;
        }
        Ok(())
    }
}

/// Runs `command` with the inputs appended as arguments. Declares the
/// optional `outputs` names, relative to the rule's output directory.
pub struct ShellExecuteRule;

impl RuleAction for ShellExecuteRule {
    fn compute_outputs(&self, ctx: &RuleContext) -> Result<Vec<PathBuf>> {
        Ok(ctx
            .rule
            .param_list("outputs")
            .unwrap_or_default()
            .iter()
            .map(|name| ctx.out_path(Some(name)))
            .collect())
    }

    fn execute(&self, ctx: &RuleContext) -> Result<()> {
        for output in &ctx.outputs {
            RuleContext::ensure_parent_exists(output)?;
        }
        run_command(ctx)
    }
}

/// Test rule: runs `command` over its inputs during the test stage.
pub struct ShellTestRule;

impl RuleAction for ShellTestRule {
    fn compute_outputs(&self, _ctx: &RuleContext) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn execute(&self, _ctx: &RuleContext) -> Result<()> {
        Ok(())
    }

    fn is_test(&self) -> bool {
        true
    }

    fn test(&self, ctx: &RuleContext) -> Result<()> {
        run_command(ctx)
    }
}

fn run_command(ctx: &RuleContext) -> Result<()> {
    let command = ctx
        .rule
        .param_list("command")
        .filter(|c| !c.is_empty())
        .with_context(|| format!("{} needs a non-empty \"command\"", ctx.rule.rule_type))?;

    ctx.log.debug(format!("running {}", command.join(" ")));
    let output = Command::new(&command[0])
        .args(&command[1..])
        .args(&ctx.inputs)
        .current_dir(ctx.module_dir())
        .output()
        .with_context(|| format!("Failed to spawn {}", command[0]))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        ctx.log.info(line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        ctx.log.warning(line);
    }

    if !output.status.success() {
        anyhow::bail!(
            "{} exited with {}",
            command[0],
            output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "a signal".to_string())
        );
    }
    Ok(())
}
