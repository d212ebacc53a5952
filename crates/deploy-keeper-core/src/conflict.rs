//! Reading container-runtime error output for name and resource conflicts.
//!
//! The runtime's error text is the only conflict signal available, so these
//! helpers are pure functions over captured output. The container runtime
//! adapter decides what to remove based on their answers.

/// Substrings that mark a failure as a name/resource collision.
pub const CONFLICT_MARKERS: [&str; 4] = [
    "already in use",
    "Conflict",
    "container name",
    "is already in use by container",
];

/// Returns `true` if the output reports a name or resource conflict.
pub fn is_conflict(output: &str) -> bool {
    CONFLICT_MARKERS.iter().any(|marker| output.contains(marker))
}

/// The container blocking a start, as far as the error text reveals it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictTarget {
    /// A container name that can be removed directly.
    Name(String),
    /// A bare container id that must be resolved to a name first.
    Id(String),
    /// Nothing recognisable; fall back to sweeping.
    Unknown,
}

/// Identify the conflicting container.
///
/// Names are tried first using [`extract_container_name`]; failing that, an id
/// quoted after "already in use by container" is returned for resolution.
pub fn extract_conflicting_container(output: &str) -> ConflictTarget {
    if let Some(name) = extract_container_name(output) {
        return ConflictTarget::Name(name);
    }
    if let Some(id) = conflicting_container_id(output) {
        return ConflictTarget::Id(id);
    }
    ConflictTarget::Unknown
}

/// Extract a container name using three heuristics in priority order:
///
/// 1. the quoted `"/name"` following `The container name`
/// 2. the token after `Container` on a line that also says `Creating` or `Error`
/// 3. the first quoted token beginning with `/` anywhere in the output
pub fn extract_container_name(output: &str) -> Option<String> {
    name_after_container_name_phrase(output)
        .or_else(|| name_from_progress_line(output))
        .or_else(|| first_slash_quoted(output))
}

fn name_after_container_name_phrase(output: &str) -> Option<String> {
    let start = output.find("The container name")?;
    first_slash_quoted(&output[start..])
}

fn name_from_progress_line(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.contains("Container"))
        .filter(|line| line.contains("Creating") || line.contains("Error"))
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            fields.find(|field| *field == "Container")?;
            let name = fields.next()?.trim_matches('"').trim_start_matches('/');
            (!name.is_empty()).then(|| name.to_string())
        })
}

fn first_slash_quoted(text: &str) -> Option<String> {
    let start = text.find("\"/")? + 2;
    let length = text[start..].find('"')?;
    let name = &text[start..start + length];
    (!name.is_empty()).then(|| name.to_string())
}

fn conflicting_container_id(output: &str) -> Option<String> {
    let pattern = regex::Regex::new(r#"already in use by container "([0-9A-Za-z]+)""#).ok()?;
    pattern
        .captures(output)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// Hyphen-delimited tokens of a project name, used by the broad similarity sweep.
pub fn similarity_tokens(project: &str) -> Vec<&str> {
    project.split('-').filter(|part| !part.is_empty()).collect()
}

/// Returns `true` if `container` belongs to `project` by the substring rule.
pub fn matches_project(container: &str, project: &str) -> bool {
    !project.is_empty() && container.contains(project)
}

/// Returns `true` if `container` shares any hyphen-delimited token with `project`.
pub fn is_similar(container: &str, project: &str) -> bool {
    similarity_tokens(project)
        .iter()
        .any(|token| container.contains(token))
}

#[cfg(test)]
#[path = "conflict_tests.rs"]
mod tests;
