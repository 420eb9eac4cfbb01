//! Follow-up instruction rendered from a problem report.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::types::ProblemReport;

const FIX_PROBLEMS_TEMPLATE: &str = include_str!("prompts/fix_problems.md");

/// Appended to the offending line in a snippet.
pub const ERROR_MARKER: &str = "// <-- TypeScript compiler error here";

static ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("fix_problems", FIX_PROBLEMS_TEMPLATE)
        .expect("fix_problems template should be valid");
    env
});

/// Render the instruction asking the model to fix every problem in `report`.
pub fn render_fix_prompt(report: &ProblemReport) -> Result<String> {
    let template = ENV.get_template("fix_problems")?;
    let rendered = template.render(context! { problems => &report.problems })?;
    Ok(rendered.trim().to_string())
}

/// Three-line excerpt around 1-based `line`, with the offending line marked.
pub fn snippet_for(source: &str, line: u32) -> Option<String> {
    let idx = usize::try_from(line).ok()?.checked_sub(1)?;
    let lines: Vec<&str> = source.lines().collect();
    let target = lines.get(idx)?;
    let mut out = Vec::with_capacity(3);
    if let Some(before) = idx.checked_sub(1).and_then(|i| lines.get(i)) {
        out.push((*before).to_string());
    }
    out.push(format!("{target} {ERROR_MARKER}"));
    if let Some(after) = lines.get(idx + 1) {
        out.push((*after).to_string());
    }
    Some(out.join("\n"))
}
