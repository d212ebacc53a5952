//! Text rendering for command output.

use crate::{CliError, ConfigFormat};
use deploy_keeper_core::{DeployConfig, DeployError, DeploymentReport, RepositoryConfig, WorkingCopyStatus};
use std::{collections::BTreeMap, fmt::Write, time::Duration};

const REDACTED: &str = "<REDACTED>";

/// Whole seconds, e.g. `42s` or `3m5s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = (elapsed.as_millis() + 500) / 1000;
    if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

pub fn render_repository_list(repositories: &[RepositoryConfig]) -> String {
    if repositories.is_empty() {
        return "No repositories configured\n".to_string();
    }

    let mut out = format!("Repositories ({}):\n", repositories.len());
    for repo in repositories {
        let _ = writeln!(
            out,
            "  - {} (branches: {}, auto-deploy: {})",
            repo.name,
            repo.branches.join(", "),
            if repo.auto_deploy { "on" } else { "off" }
        );
    }
    out
}

pub fn render_repository_info(
    repo: &RepositoryConfig,
    work_dir: &std::path::Path,
    statuses: &BTreeMap<String, WorkingCopyStatus>,
    commits: &BTreeMap<String, String>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Repository: {}", repo.name);
    let _ = writeln!(out, "  URL:          {}", repo.git_url);
    let _ = writeln!(out, "  Compose file: {}", repo.compose_file);
    let _ = writeln!(out, "  Auto-deploy:  {}", repo.auto_deploy);
    let _ = writeln!(out, "  Branches:");
    for branch in &repo.branches {
        let status = statuses
            .get(branch)
            .map(ToString::to_string)
            .unwrap_or_else(|| WorkingCopyStatus::NotCloned.to_string());
        let _ = write!(
            out,
            "    - {} [{}] project={} path={}",
            branch,
            status,
            repo.project_name(branch),
            repo.working_copy_path(work_dir, branch).display()
        );
        if let Some(commit) = commits.get(branch) {
            let short: String = commit.chars().take(7).collect();
            let _ = write!(out, " commit={}", short);
        }
        out.push('\n');
    }
    out
}

pub fn render_deploy_result(
    repository: &str,
    branch: &str,
    result: &Result<DeploymentReport, DeployError>,
    elapsed: Duration,
) -> String {
    match result {
        Ok(report) => {
            let mut out = format!(
                "Deployment completed successfully for {}:{} (took {})\n",
                repository,
                branch,
                format_elapsed(elapsed)
            );
            if let Some(commit) = &report.commit {
                let _ = writeln!(out, "  Commit:   {}", commit);
            }
            let _ = writeln!(out, "  Services: {}", report.services.join(", "));
            out
        }
        Err(e) => format!("Deployment failed after {}: {}\n", format_elapsed(elapsed), e),
    }
}

/// Serialize the configuration with secrets masked.
pub fn render_config(config: &DeployConfig, format: ConfigFormat) -> Result<String, CliError> {
    let mut shown = config.clone();
    if shown.webhook.secret.is_some() {
        shown.webhook.secret = Some(REDACTED.to_string());
    }

    let rendered = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(&shown).map_err(|e| e.to_string()),
        ConfigFormat::Yaml => serde_yaml::to_string(&shown).map_err(|e| e.to_string()),
    };
    rendered.map_err(|message| CliError::CommandFailed {
        message: format!("failed to render configuration: {}", message),
    })
}

#[cfg(test)]
#[path = "output_tests.rs"]
mod tests;
