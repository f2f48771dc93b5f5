//! Terminal rendering for sessions and configuration

use console::{StyledObject, style};

use relay_core::config::RepositoryConfig;
use relay_core::config_diff::RepositoryDiff;
use relay_core::session::{AgentSession, EntryType, SessionRegistry, SessionStatus, SessionType};

const PREVIEW_WIDTH: usize = 72;

pub fn session_table(registry: &SessionRegistry, sessions: &[&AgentSession]) {
    if sessions.is_empty() {
        println!("  {}", style("No sessions").dim());
        return;
    }

    println!("{}", style(format!("Sessions ({}):", sessions.len())).bold());
    println!();
    for session in sessions {
        println!(
            "  {} {} [{}] {}",
            style("•").cyan(),
            style(&session.id).bold(),
            status_label(session.status),
            style(session_type_label(session.session_type)).dim()
        );
        let mut details = vec![
            format!("backend {}", session.backend),
            format!("{} entries", registry.get_entries(&session.id).len()),
            format!("updated {}", session.updated_at.format("%Y-%m-%d %H:%M")),
        ];
        if let Some(thread_key) = &session.thread_key {
            details.insert(0, format!("thread {}", thread_key));
        }
        if let Some(repository_id) = &session.repository_id {
            details.insert(0, format!("repo {}", repository_id));
        }
        println!("    {}", style(details.join(", ")).dim());
    }
}

pub fn session_detail(registry: &SessionRegistry, session: &AgentSession) {
    println!("{}", style(format!("Session: {}", session.id)).bold());
    println!();
    println!("  Status:    {}", status_label(session.status));
    println!("  Type:      {}", session_type_label(session.session_type));
    println!("  Backend:   {}", style(session.backend).cyan());
    println!("  Workspace: {}", style(session.workspace.path.display()).green());
    if let Some(thread_key) = &session.thread_key {
        println!("  Thread:    {}", thread_key);
    }
    if let Some(repository_id) = &session.repository_id {
        println!("  Repo:      {}", repository_id);
    }
    if let Some(issue) = &session.issue_context {
        println!(
            "  Issue:     {} ({})",
            issue.work_item_identifier, issue.tracker_id
        );
    }
    if let Some(token) = session.resume_token() {
        println!("  Resume:    {}", style(token).dim());
    }
    if let Some(parent_id) = registry.get_parent_session_id(&session.id) {
        println!("  Parent:    {}", parent_id);
    }
    let children = registry.get_child_session_ids(&session.id);
    if !children.is_empty() {
        println!("  Children:  {}", children.join(", "));
    }
    println!(
        "  Created:   {}",
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Updated:   {}",
        session.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let entries = registry.get_entries(&session.id);
    println!();
    println!("{}", style(format!("Entries ({}):", entries.len())).bold());
    for entry in entries {
        println!(
            "  {} {}",
            entry_label(entry.entry_type),
            preview(&entry.content, PREVIEW_WIDTH)
        );
    }
}

pub fn repository_list(repositories: &[RepositoryConfig]) {
    println!();
    if repositories.is_empty() {
        println!("  {}", style("No repositories configured").dim());
        return;
    }
    println!("{}", style(format!("Repositories ({}):", repositories.len())).bold());
    for repository in repositories {
        let state = if repository.is_active {
            style("active").green()
        } else {
            style("inactive").red()
        };
        println!(
            "  {} {} - {} [{}]",
            style("•").cyan(),
            style(&repository.id).bold(),
            repository.name,
            state
        );
        println!(
            "    {} @ {}",
            style(repository.repository_path.display()).dim(),
            style(&repository.base_branch).dim()
        );
    }
}

pub fn repository_diff(diff: &RepositoryDiff) {
    if diff.is_empty() {
        println!("{}", style("Repositories are identical").green());
        return;
    }
    for repository in &diff.added {
        println!("  {} {}", style("+").green(), repository.id);
    }
    for repository in &diff.removed {
        println!("  {} {}", style("-").red(), repository.id);
    }
    for repository in &diff.modified {
        println!("  {} {}", style("~").yellow(), repository.id);
    }
}

fn status_label(status: SessionStatus) -> StyledObject<&'static str> {
    let label = style(status.as_str());
    match status {
        SessionStatus::Active => label.cyan(),
        SessionStatus::Running => label.yellow(),
        SessionStatus::Complete => label.green(),
        SessionStatus::Error => label.red(),
    }
}

fn session_type_label(session_type: SessionType) -> &'static str {
    match session_type {
        SessionType::Delegated => "delegated",
        SessionType::Chat => "chat",
    }
}

fn entry_label(entry_type: EntryType) -> StyledObject<String> {
    let label = style(format!("{:>11}", entry_type.as_str()));
    match entry_type {
        EntryType::User => label.cyan(),
        EntryType::Response => label.green(),
        EntryType::Error => label.red(),
        EntryType::Elicitation => label.yellow(),
        EntryType::Thought | EntryType::Action => label.dim(),
    }
}

/// First line of `text`, cut to `width` characters
fn preview(text: &str, width: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    let multiline = text.lines().nth(1).is_some();
    if line.chars().count() > width {
        let cut: String = line.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else if multiline {
        format!("{} ...", line)
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_text_unchanged() {
        assert_eq!(preview("hello", 10), "hello");
    }

    #[test]
    fn test_preview_truncates_long_line() {
        assert_eq!(preview("abcdefghijkl", 8), "abcde...");
    }

    #[test]
    fn test_preview_marks_more_lines() {
        assert_eq!(preview("first\nsecond", 20), "first ...");
        assert_eq!(preview("", 20), "");
    }
}
